//! Propagation rules and the rule table keyed by trigger tag.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::Tags;

/// Where on a way a rule places its derived tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Placement {
    /// Every node of the way.
    All,
    /// Midpoint of the first segment.
    Start,
    /// Midpoint of the last segment.
    End,
    /// The middle node, or the midpoint of a two-node way.
    Center,
    /// Midpoints of the first and last segments, anchored at the endpoints.
    Border,
    /// Matches without placing anything.
    None,
}

/// Conditions on further way tags that gate a rule.
///
/// Each entry names a tag and a list of accepted values. An empty list
/// accepts any value, and a value written `~v` rejects the whole rule when
/// the way's tag equals `v`. Entries are alternatives: the predicate holds
/// when at least one entry accepts and no negation fires. An empty predicate
/// always holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Predicate {
    entries: BTreeMap<String, Vec<String>>,
}

impl Predicate {
    /// Predicate that always holds.
    pub fn always() -> Self {
        Self::default()
    }

    /// Add an entry for `tag` accepting `values`.
    #[must_use]
    pub fn with<I, S>(mut self, tag: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .entry(tag.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Whether the predicate has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate against a way's tags.
    pub fn holds(&self, tags: &Tags) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let mut accepted = false;
        for (tag, values) in &self.entries {
            let Some(actual) = tags.get(tag) else {
                continue;
            };
            let mut positives = values.iter().filter(|v| !v.starts_with('~')).peekable();
            let negated = values
                .iter()
                .filter_map(|v| v.strip_prefix('~'))
                .any(|v| v == actual);
            if negated {
                return false;
            }
            if positives.peek().is_none() || positives.any(|v| v == actual) {
                accepted = true;
            }
        }
        accepted
    }
}

/// A single propagation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct PropagateRule {
    /// Way tag that triggers the rule.
    pub tag: String,
    /// Value the trigger tag must carry.
    pub value: String,
    /// Placement of the derived tag.
    pub placement: Placement,
    /// Key to set; the trigger tag when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub set_key: Option<String>,
    /// Value to set; the trigger value when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub set_value: Option<String>,
    /// Prefix prepended to the key that is set.
    #[cfg_attr(feature = "serde", serde(default))]
    pub prefix: Option<String>,
    /// Further conditions on the way's tags.
    #[cfg_attr(feature = "serde", serde(default, rename = "when"))]
    pub predicate: Predicate,
}

impl PropagateRule {
    /// Rule copying `tag=value` onto the nodes selected by `placement`.
    pub fn new(tag: impl Into<String>, value: impl Into<String>, placement: Placement) -> Self {
        Self {
            tag: tag.into(),
            value: value.into(),
            placement,
            set_key: None,
            set_value: None,
            prefix: None,
            predicate: Predicate::always(),
        }
    }

    /// Set `key=value` instead of copying the trigger.
    #[must_use]
    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_key = Some(key.into());
        self.set_value = Some(value.into());
        self
    }

    /// Prefix the key that is set.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Gate the rule on a predicate.
    #[must_use]
    pub fn when(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// The `(key, value)` pair this rule places on nodes.
    pub fn derived_tag(&self) -> (String, String) {
        let key = self.set_key.as_deref().unwrap_or(&self.tag);
        let key = match &self.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_owned(),
        };
        let value = self.set_value.clone().unwrap_or_else(|| self.value.clone());
        (key, value)
    }

    /// Whether the rule fires for a way with these tags.
    pub fn matches(&self, tags: &Tags) -> bool {
        tags.get(&self.tag).is_some_and(|v| *v == self.value) && self.predicate.holds(tags)
    }
}

/// Errors raised while building a rule table.
#[derive(Debug, Error)]
pub enum RuleTableError {
    /// A required rule field was blank.
    #[error("rule {index} has an empty {field}")]
    EmptyField {
        /// Position of the rule in the input.
        index: usize,
        /// Offending field.
        field: &'static str,
    },
    /// The JSON rule list could not be parsed.
    #[cfg(feature = "serde")]
    #[error("failed to parse propagation rules")]
    Parse {
        /// Source error from `serde_json`.
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable rule set indexed by trigger tag.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    by_tag: HashMap<String, Vec<PropagateRule>>,
    len: usize,
}

impl RuleTable {
    /// Validate and index rules.
    pub fn new(rules: impl IntoIterator<Item = PropagateRule>) -> Result<Self, RuleTableError> {
        let mut by_tag: HashMap<String, Vec<PropagateRule>> = HashMap::new();
        let mut len = 0;
        for (index, rule) in rules.into_iter().enumerate() {
            let blank = [
                ("trigger tag", Some(rule.tag.as_str())),
                ("trigger value", Some(rule.value.as_str())),
                ("set key", rule.set_key.as_deref()),
            ]
            .into_iter()
            .find(|(_, value)| value.is_some_and(|v| v.trim().is_empty()));
            if let Some((field, _)) = blank {
                return Err(RuleTableError::EmptyField { index, field });
            }
            by_tag.entry(rule.tag.clone()).or_default().push(rule);
            len += 1;
        }
        Ok(Self { by_tag, len })
    }

    /// Parse a JSON array of rules.
    ///
    /// # Examples
    /// ```
    /// use waystage_core::propagate::{Placement, RuleTable};
    ///
    /// let json = r#"[
    ///     {"tag": "barrier", "value": "gate", "placement": "border",
    ///      "set_key": "access", "set_value": "no"}
    /// ]"#;
    /// let table = RuleTable::from_json_reader(json.as_bytes()).expect("rules parse");
    /// assert_eq!(table.len(), 1);
    /// assert!(table.rules().all(|rule| rule.placement == Placement::Border));
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_json_reader<R: std::io::Read>(reader: R) -> Result<Self, RuleTableError> {
        let rules: Vec<PropagateRule> =
            serde_json::from_reader(reader).map_err(|source| RuleTableError::Parse { source })?;
        Self::new(rules)
    }

    /// Number of rules.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the table holds no rules.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every rule, grouped by trigger tag.
    pub fn rules(&self) -> impl Iterator<Item = &PropagateRule> {
        self.by_tag.values().flatten()
    }

    /// Rules that fire for a way's tags, in tag order then table order.
    pub fn rules_for<'a>(&'a self, tags: &Tags) -> Vec<&'a PropagateRule> {
        let mut matched: Vec<&PropagateRule> = Vec::new();
        for key in tags.keys() {
            let Some(candidates) = self.by_tag.get(key) else {
                continue;
            };
            for rule in candidates {
                if rule.matches(tags) && !matched.iter().any(|m| std::ptr::eq(*m, rule)) {
                    matched.push(rule);
                }
            }
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[rstest]
    #[case(&[("access", "no")], true)]
    #[case(&[("access", "private")], false)]
    #[case(&[("motor_vehicle", "yes")], true)]
    #[case(&[("motor_vehicle", "no")], false)]
    #[case(&[("foot", "yes")], false)]
    fn evaluates_predicates(#[case] pairs: &[(&str, &str)], #[case] expected: bool) {
        let predicate = Predicate::always()
            .with("access", ["no", "destination"])
            .with("motor_vehicle", ["~no"]);
        assert_eq!(predicate.holds(&tags(pairs)), expected);
    }

    #[rstest]
    fn negation_aborts_even_when_another_entry_accepts() {
        let predicate = Predicate::always()
            .with("access", Vec::<String>::new())
            .with("motor_vehicle", ["~no"]);
        let way = tags(&[("access", "yes"), ("motor_vehicle", "no")]);
        assert!(!predicate.holds(&way));
    }

    #[rstest]
    fn derived_tag_defaults_to_trigger() {
        let rule = PropagateRule::new("railway", "level_crossing", Placement::All);
        assert_eq!(
            rule.derived_tag(),
            ("railway".to_owned(), "level_crossing".to_owned())
        );
        let prefixed = rule.with_prefix("way_");
        assert_eq!(prefixed.derived_tag().0, "way_railway");
    }

    #[rstest]
    fn rules_for_filters_by_value_and_predicate() {
        let table = RuleTable::new([
            PropagateRule::new("barrier", "gate", Placement::Border).setting("access", "no"),
            PropagateRule::new("barrier", "fence", Placement::All),
            PropagateRule::new("highway", "steps", Placement::Center)
                .when(Predicate::always().with("incline", ["up", "down"])),
        ])
        .expect("valid rules");

        let gate = tags(&[("barrier", "gate"), ("highway", "steps")]);
        let matched: Vec<_> = table.rules_for(&gate).iter().map(|r| r.value.as_str()).collect();
        assert_eq!(matched, vec!["gate"]);

        let inclined = tags(&[("highway", "steps"), ("incline", "up")]);
        assert_eq!(table.rules_for(&inclined).len(), 1);
    }

    #[rstest]
    #[case(PropagateRule::new("", "gate", Placement::All), "trigger tag")]
    #[case(PropagateRule::new("barrier", " ", Placement::All), "trigger value")]
    #[case(PropagateRule::new("barrier", "gate", Placement::All).setting("", "no"), "set key")]
    fn rejects_blank_fields(#[case] rule: PropagateRule, #[case] expected: &str) {
        let err = RuleTable::new([rule]).expect_err("blank field");
        assert!(matches!(err, RuleTableError::EmptyField { index: 0, field } if field == expected));
    }

    #[cfg(feature = "serde")]
    #[rstest]
    fn parses_predicates_from_json() {
        let json = r#"[{"tag": "highway", "value": "crossing", "placement": "all",
                        "prefix": "crossing_", "when": {"crossing": ["~no"]}}]"#;
        let table = RuleTable::from_json_reader(json.as_bytes()).expect("parse");
        let rule = table.rules().next().expect("one rule");
        assert_eq!(rule.prefix.as_deref(), Some("crossing_"));
        assert!(!rule.matches(&tags(&[("highway", "crossing"), ("crossing", "no")])));
        assert!(rule.matches(&tags(&[("highway", "crossing"), ("crossing", "zebra")])));
        assert!(
            !rule.matches(&tags(&[("highway", "crossing")])),
            "a predicate needs one of its tags to be present"
        );
    }

    #[cfg(feature = "serde")]
    #[rstest]
    fn malformed_json_is_fatal() {
        let err = RuleTable::from_json_reader("[{\"tag\": 1}]".as_bytes()).expect_err("bad");
        assert!(matches!(err, RuleTableError::Parse { .. }));
    }
}

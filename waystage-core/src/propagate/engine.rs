//! Span planning and synthetic node creation for a single way.

use std::collections::HashSet;

use geo::Coord;
use thiserror::Error;

use super::rules::{Placement, RuleTable};
use crate::config::SyntheticIds;
use crate::{Node, Tags, Way};

/// Errors that abandon propagation for one way.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropagationError {
    /// The way needs more synthetic nodes than the per-way cap allows.
    #[error("way {way_id} needs more than {cap} synthetic nodes")]
    SyntheticOverflow {
        /// Way being propagated.
        way_id: i64,
        /// Configured per-way cap.
        cap: u32,
    },
    /// The way id cannot be embedded in the synthetic id range.
    #[error("way {way_id} is outside the synthetic id range")]
    SyntheticIdRange {
        /// Way being propagated.
        way_id: i64,
    },
    /// A node bounding a synthetic span has no known location.
    #[error("way {way_id} references node {node_id} without a location")]
    MissingLocation {
        /// Way being propagated.
        way_id: i64,
        /// Node whose location is unknown.
        node_id: i64,
    },
}

/// A real or synthetic node carrying tags derived from a way.
///
/// `start` and `end` are ordinals in the way's original node list. Equal
/// ordinals denote an existing node; otherwise the span is a synthetic node
/// between two adjacent nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagatedSpan {
    /// Node id: the existing node, or an allocated synthetic id.
    pub id: i64,
    /// Node at ordinal `start`.
    pub anchor: i64,
    /// Owning way.
    pub way_id: i64,
    /// First ordinal of the span.
    pub start: usize,
    /// Last ordinal of the span.
    pub end: usize,
    /// Derived tags.
    pub tags: Tags,
    /// Placement of the most recent rule that wrote to the span.
    pub placement: Placement,
    /// Whether a border rule contributed to the span.
    pub border: bool,
}

impl PropagatedSpan {
    fn new(way: &Way, start: usize, end: usize) -> Option<Self> {
        let anchor = *way.node_ids.get(start)?;
        way.node_ids.get(end)?;
        Some(Self {
            id: anchor,
            anchor,
            way_id: way.id,
            start,
            end,
            tags: Tags::new(),
            placement: Placement::None,
            border: false,
        })
    }

    /// Whether the span is a synthetic midpoint.
    pub const fn is_synthetic(&self) -> bool {
        self.start != self.end
    }

    fn add_tag(&mut self, key: &str, value: &str, placement: Placement) {
        self.tags
            .entry(key.to_owned())
            .or_insert_with(|| value.to_owned());
        self.placement = placement;
        self.border |= placement == Placement::Border;
    }
}

/// Outcome of propagating one way.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagatedWay {
    /// Way id.
    pub way_id: i64,
    /// Node list with synthetic ids spliced between their bounding nodes.
    pub node_ids: Vec<i64>,
    /// Every span, in creation order.
    pub spans: Vec<PropagatedSpan>,
    /// Synthetic nodes to persist, carrying their span's tags.
    pub synthetic: Vec<Node>,
}

impl PropagatedWay {
    /// Existing nodes that anchor at least one span, in first-seen order.
    ///
    /// Synthetic spans report the node at their start ordinal, so the anchor
    /// of a border midpoint is flagged too.
    pub fn targets(&self) -> impl Iterator<Item = i64> + '_ {
        let mut seen = HashSet::with_capacity(self.spans.len());
        self.spans
            .iter()
            .map(|span| span.anchor)
            .filter(move |anchor| seen.insert(*anchor))
    }
}

/// Applies a rule table to ways.
#[derive(Debug, Clone)]
pub struct PropagationEngine {
    rules: RuleTable,
    synthetic: SyntheticIds,
}

impl PropagationEngine {
    /// Create an engine over a rule table.
    pub const fn new(rules: RuleTable, synthetic: SyntheticIds) -> Self {
        Self { rules, synthetic }
    }

    /// Rule table in use.
    pub const fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Synthetic id layout in use.
    pub const fn synthetic_ids(&self) -> SyntheticIds {
        self.synthetic
    }

    /// Whether any rule fires for these way tags.
    pub fn applies_to(&self, tags: &Tags) -> bool {
        !self.rules.rules_for(tags).is_empty()
    }

    /// Plan the spans for a way without allocating synthetic ids.
    ///
    /// Spans that do not fit the way (for example a start span on a
    /// single-node way) are skipped.
    pub fn plan(&self, way: &Way) -> Vec<PropagatedSpan> {
        let n = way.node_ids.len();
        let mut spans: Vec<PropagatedSpan> = Vec::new();
        if n == 0 {
            return spans;
        }
        for rule in self.rules.rules_for(&way.tags) {
            let (key, value) = rule.derived_tag();
            let positions: Vec<(usize, usize)> = match rule.placement {
                Placement::All => (0..n).map(|i| (i, i)).collect(),
                Placement::Start if n >= 2 => vec![(0, 1)],
                Placement::End if n >= 2 => vec![(n - 2, n - 1)],
                Placement::Center if n == 2 => vec![(0, 1)],
                Placement::Center => vec![(n / 2, n / 2)],
                Placement::Border if n >= 2 => vec![(0, 1), (n - 1, n - 2)],
                Placement::Start | Placement::End | Placement::Border | Placement::None => {
                    Vec::new()
                }
            };
            for (start, end) in positions {
                let existing = spans
                    .iter()
                    .position(|span| span.start == start && span.end == end);
                let index = match existing {
                    Some(index) => index,
                    None => match PropagatedSpan::new(way, start, end) {
                        Some(span) => {
                            spans.push(span);
                            spans.len() - 1
                        }
                        None => continue,
                    },
                };
                if let Some(span) = spans.get_mut(index) {
                    span.add_tag(&key, &value, rule.placement);
                }
            }
        }
        spans
    }

    /// Propagate a way, allocating synthetic nodes at span midpoints.
    ///
    /// `location` resolves node ids of the way to coordinates. Returns
    /// `Ok(None)` when no rule places anything on the way. An error means
    /// the way must be staged with its original node list.
    pub fn apply<F>(
        &self,
        way: &Way,
        mut location: F,
    ) -> Result<Option<PropagatedWay>, PropagationError>
    where
        F: FnMut(i64) -> Option<Coord<f64>>,
    {
        let mut spans = self.plan(way);
        if spans.is_empty() {
            return Ok(None);
        }

        let mut synthetic = Vec::new();
        let mut counter: u32 = 0;
        for span in spans.iter_mut().filter(|span| span.is_synthetic()) {
            if counter >= self.synthetic.max_per_way {
                return Err(PropagationError::SyntheticOverflow {
                    way_id: way.id,
                    cap: self.synthetic.max_per_way,
                });
            }
            let id = self
                .synthetic
                .allocate(way.id, counter)
                .ok_or(PropagationError::SyntheticIdRange { way_id: way.id })?;
            counter += 1;

            let missing = |node_id| PropagationError::MissingLocation {
                way_id: way.id,
                node_id,
            };
            let to = way
                .node_ids
                .get(span.end)
                .copied()
                .ok_or_else(|| missing(span.anchor))?;
            let a = location(span.anchor).ok_or_else(|| missing(span.anchor))?;
            let b = location(to).ok_or_else(|| missing(to))?;
            let midpoint = Coord {
                x: a.x / 2.0 + b.x / 2.0,
                y: a.y / 2.0 + b.y / 2.0,
            };
            span.id = id;
            synthetic.push(Node {
                id,
                location: midpoint,
                tags: span.tags.clone(),
            });
        }

        let node_ids = splice(&way.node_ids, &spans);
        Ok(Some(PropagatedWay {
            way_id: way.id,
            node_ids,
            spans,
            synthetic,
        }))
    }
}

/// Insert synthetic ids after the lower ordinal of their span.
fn splice(original: &[i64], spans: &[PropagatedSpan]) -> Vec<i64> {
    let extra = spans.iter().filter(|span| span.is_synthetic()).count();
    let mut node_ids = Vec::with_capacity(original.len() + extra);
    for (ordinal, id) in original.iter().enumerate() {
        node_ids.push(*id);
        node_ids.extend(
            spans
                .iter()
                .filter(|span| span.is_synthetic() && span.start.min(span.end) == ordinal)
                .map(|span| span.id),
        );
    }
    node_ids
}

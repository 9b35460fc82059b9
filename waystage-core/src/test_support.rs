//! Builders shared by unit and behaviour tests.

use crate::propagate::{Placement, PropagateRule, RuleTable};
use crate::{EntityId, EntityKind, Node, Relation, RelationMember, Tags, Way};

/// Build a tag map from string pairs.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// Node at `(lat, lon)` with tags.
pub fn node(id: i64, lat: f64, lon: f64, pairs: &[(&str, &str)]) -> Node {
    Node::new(id, lat, lon, tags(pairs))
}

/// Way over `nodes` with tags.
pub fn way(id: i64, nodes: &[i64], pairs: &[(&str, &str)]) -> Way {
    Way::new(id, nodes.to_vec(), tags(pairs))
}

/// Relation over `(kind, id, role)` members with tags.
pub fn relation(id: i64, members: &[(EntityKind, i64, &str)], pairs: &[(&str, &str)]) -> Relation {
    let members = members
        .iter()
        .map(|(kind, member, role)| RelationMember::new(EntityId::new(*kind, *member), *role))
        .collect();
    Relation::new(id, members, tags(pairs))
}

/// Rules used across the staging tests: gates close access at both ends of
/// their way, level crossings mark every node and steps mark their centre.
pub fn sample_rules() -> RuleTable {
    RuleTable::new([
        PropagateRule::new("barrier", "gate", Placement::Border).setting("access", "no"),
        PropagateRule::new("railway", "level_crossing", Placement::All),
        PropagateRule::new("highway", "steps", Placement::Center).with_prefix("way_"),
    ])
    .expect("sample rules are valid")
}

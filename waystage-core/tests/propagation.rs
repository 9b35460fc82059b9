//! Rule engine and index behaviour across whole ways.

use std::collections::HashMap;

use geo::Coord;
use rstest::{fixture, rstest};
use waystage_core::propagate::{Placement, PropagateRule};
use waystage_core::{
    Node, PropagatedWay, PropagationEngine, PropagationIndex, RuleTable, SyntheticIds, Tags, Way,
};

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[fixture]
fn engine() -> PropagationEngine {
    let rules = RuleTable::new([
        PropagateRule::new("highway", "steps", Placement::Center),
        PropagateRule::new("barrier", "gate", Placement::Border).setting("access", "no"),
    ])
    .expect("valid rules");
    PropagationEngine::new(rules, SyntheticIds::default())
}

fn locate(nodes: &[(i64, f64, f64)]) -> HashMap<i64, Coord<f64>> {
    nodes
        .iter()
        .map(|(id, lat, lon)| (*id, Coord { x: *lon, y: *lat }))
        .collect()
}

fn propagate(engine: &PropagationEngine, way: &Way, index: &mut PropagationIndex) -> PropagatedWay {
    let coords = locate(&[(1, 0.0, 0.0), (2, 0.0, 1.0), (3, 0.0, 2.0)]);
    let propagated = engine
        .apply(way, |id| coords.get(&id).copied())
        .expect("propagation succeeds")
        .expect("a rule applies");
    index.register_way(&propagated);
    propagated
}

#[rstest]
fn centre_of_three_nodes_is_the_middle_node(engine: PropagationEngine) {
    let mut index = PropagationIndex::new(SyntheticIds::default());
    let way = Way::new(50, vec![1, 2, 3], tags(&[("highway", "steps")]));
    let propagated = propagate(&engine, &way, &mut index);

    assert!(propagated.synthetic.is_empty());
    assert_eq!(propagated.node_ids, vec![1, 2, 3]);
    assert_eq!(propagated.targets().collect::<Vec<_>>(), vec![2]);
    for (id, expected) in [(1, None), (2, Some("steps")), (3, None)] {
        let node_tags = index.tags_for_node(id);
        assert_eq!(node_tags.get("highway").map(String::as_str), expected, "node {id}");
    }
}

#[rstest]
fn centre_of_two_nodes_is_a_synthetic_midpoint(engine: PropagationEngine) {
    let mut index = PropagationIndex::new(SyntheticIds::default());
    let way = Way::new(51, vec![1, 2], tags(&[("highway", "steps")]));
    let propagated = propagate(&engine, &way, &mut index);

    let midpoint = propagated.synthetic.first().expect("synthetic node");
    assert_eq!(midpoint.location, Coord { x: 0.5, y: 0.0 });
    assert!(index.is_synthetic(midpoint.id));
    assert_eq!(index.synthetic_way(midpoint.id), Some(51));
    assert!(index.tags_for_node(1).is_empty());
    assert_eq!(
        index.tags_for_node(midpoint.id).get("highway").map(String::as_str),
        Some("steps")
    );
}

#[rstest]
fn border_gate_reaches_endpoints_through_anchors(engine: PropagationEngine) {
    let mut index = PropagationIndex::new(SyntheticIds::default());
    let way = Way::new(100, vec![1, 2, 3], tags(&[("barrier", "gate")]));
    propagate(&engine, &way, &mut index);

    assert_eq!(index.propagated_tags(1).get("access").map(String::as_str), Some("no"));
    assert!(index.propagated_tags(2).is_empty());
    assert_eq!(index.propagated_tags(3).get("access").map(String::as_str), Some("no"));
}

#[rstest]
fn applying_twice_changes_nothing(engine: PropagationEngine) {
    let mut index = PropagationIndex::new(SyntheticIds::default());
    let way = Way::new(50, vec![1, 2, 3], tags(&[("highway", "steps")]));
    propagate(&engine, &way, &mut index);

    let mut node = Node::new(2, 0.0, 1.0, tags(&[("highway", "elevator")]));
    assert_eq!(index.apply_to_node(&mut node, true), 0);
    let before = node.clone();
    index.apply_to_node(&mut node, true);
    assert_eq!(node, before);
    assert_eq!(node.tags.get("highway").map(String::as_str), Some("elevator"));
}

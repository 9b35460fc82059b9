//! Property-based tests for the identifier codec.
//!
//! # Invariants tested
//!
//! - **Determinism:** converting the same id twice yields the same internal id.
//! - **Disjointness:** geo-hashed nodes, ways and relations never share an id.
//! - **Order:** the original id survives in the high bits.
//! - **Displacement:** distinct additions keep merged inputs apart.

use std::collections::HashSet;

use proptest::prelude::*;
use waystage_core::{
    Entity, EntityId, EntityKind, IdCodec, IdConversion, Node, Relation, RelationMember, SHIFT_ID,
    Tags, Way, displace,
};

fn convert(codec: &mut IdCodec, mut entity: Entity) -> i64 {
    codec
        .convert(&mut entity)
        .map(|conversion| conversion.internal)
        .expect("id fits")
}

fn lat() -> impl Strategy<Value = f64> {
    -85.0_f64..85.0
}

fn lon() -> impl Strategy<Value = f64> {
    -180.0_f64..180.0
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn conversion_is_deterministic(id in 0_i64..(1 << 40), lat in lat(), lon in lon()) {
        let mut first = IdCodec::new(IdConversion::default());
        let mut second = IdCodec::new(IdConversion::default());
        let a = convert(&mut first, Node::new(id, lat, lon, Tags::new()).into());
        let b = convert(&mut second, Node::new(id, lat, lon, Tags::new()).into());
        prop_assert_eq!(a, b);
        prop_assert_eq!(convert(&mut first, Node::new(id, lat, lon, Tags::new()).into()), a);
    }

    #[test]
    fn kinds_never_collide(
        id in 0_i64..(1 << 40),
        node_location in (lat(), lon()),
        way_location in (lat(), lon()),
    ) {
        let mut codec = IdCodec::new(IdConversion::default());
        let original = Node::new(id, node_location.0, node_location.1, Tags::new());
        let node = convert(&mut codec, original.into());
        // A way with the same original id, built over an unrelated node.
        let helper = convert(
            &mut codec,
            Node::new(id + 1, way_location.0, way_location.1, Tags::new()).into(),
        );
        let way = convert(&mut codec, Way::new(id, vec![id + 1], Tags::new()).into());
        let relation = convert(
            &mut codec,
            Relation::new(
                id,
                vec![RelationMember::new(EntityId::new(EntityKind::Way, id), "outer")],
                Tags::new(),
            )
            .into(),
        );
        let ids: HashSet<_> = [node, way, relation].into_iter().collect();
        prop_assert_eq!(ids.len(), 3);
        prop_assert_ne!(helper, way);
    }

    #[test]
    fn high_bits_preserve_order(
        a in 0_i64..(1 << 40),
        b in 0_i64..(1 << 40),
        lat in lat(),
        lon in lon(),
    ) {
        prop_assume!(a < b);
        let mut codec = IdCodec::new(IdConversion::default());
        let low = convert(&mut codec, Node::new(a, lat, lon, Tags::new()).into());
        let high = convert(&mut codec, Node::new(b, -lat, -lon, Tags::new()).into());
        prop_assert!(low < high);
        prop_assert_eq!(low >> SHIFT_ID, a);
    }

    #[test]
    fn displacement_separates_inputs(id in -(1_i64 << 40)..(1 << 40), shift in 1_u32..8) {
        let original = EntityId::new(EntityKind::Node, id);
        let first = displace(original, IdConversion::displaced(shift, 0)).expect("fits");
        let second = displace(original, IdConversion::displaced(shift, 1)).expect("fits");
        prop_assert_ne!(first, second);
        prop_assert_eq!(first.signum(), id.signum());
    }
}

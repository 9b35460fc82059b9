//! Conversion from original OSM ids to internal staging ids.
//!
//! Two schemes exist:
//!
//! - **Displacement**: used for negative (already synthetic) ids and whenever
//!   geo-hashing is disabled. Negative ids map to
//!   `-((|id| << shift_bits) + addition)`; non-negative ids map to
//!   `(id << shift_bits) + addition`, which is the identity when both
//!   parameters are zero. Distinct `(shift_bits, addition)` pairs keep merged
//!   inputs in disjoint ranges.
//! - **Geo-hashed**: positive ids become
//!   `(id << SHIFT_ID) | (kind % 2) | (bucket << 1)`. Nodes bucket their own
//!   tile coordinate, ways sum the recorded hashes of their member nodes. The
//!   bucket field is `SHIFT_ID - 1` bits wide; nodes and ways use the values
//!   `0..RELATION_BUCKET` and relations always use [`RELATION_BUCKET`], so the
//!   three kinds never share an internal id.
//!
//! Every conversion is recorded, so converting the same `(id, kind)` again
//! returns the same internal id for the rest of the run. Ways and relations
//! look their members up in that table: nodes must be converted before the
//! ways that reference them, and ways before the relations that reference
//! them. Members missing from the table are left untouched and reported back
//! as unresolved.
use std::collections::HashMap;

use thiserror::Error;

use crate::tile::{tile31_x, tile31_y};
use crate::{Entity, EntityId, EntityKind, Node, Relation, Way};

/// Number of low bits reserved in geo-hashed ids.
pub const SHIFT_ID: u32 = 6;

const BUCKET_BITS: u32 = SHIFT_ID - 1;

/// Bucket field value used by every relation; nodes and ways stay below it.
pub const RELATION_BUCKET: i64 = (1 << BUCKET_BITS) - 1;

/// Per-run id conversion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IdConversion {
    /// Left shift applied by the displacement scheme.
    pub shift_bits: u32,
    /// Offset added by the displacement scheme; must not be negative.
    pub addition: i64,
    /// Use geo-hashed ids for non-negative originals.
    pub geo_hash: bool,
}

impl Default for IdConversion {
    fn default() -> Self {
        Self {
            shift_bits: 0,
            addition: 0,
            geo_hash: true,
        }
    }
}

impl IdConversion {
    /// Parameters that leave every id unchanged.
    pub const fn identity() -> Self {
        Self {
            shift_bits: 0,
            addition: 0,
            geo_hash: false,
        }
    }

    /// Displacement-only parameters for one of several merged inputs.
    pub const fn displaced(shift_bits: u32, addition: i64) -> Self {
        Self {
            shift_bits,
            addition,
            geo_hash: false,
        }
    }

    /// Left shift applied to non-negative ids.
    pub const fn positive_shift(&self) -> u32 {
        if self.geo_hash {
            SHIFT_ID
        } else {
            self.shift_bits
        }
    }
}

/// Errors raised while converting ids.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdCodecError {
    /// The converted id would not fit in an `i64`.
    #[error("{entity} does not fit the internal id space after a shift of {shift} bits")]
    OutOfRange {
        /// Offending original id.
        entity: EntityId,
        /// Shift that overflowed.
        shift: u32,
    },
    /// A converted node id would collide with synthetic node ids.
    #[error("{entity} converts to {internal}, inside the synthetic node range from {base}")]
    SyntheticRange {
        /// Offending original id.
        entity: EntityId,
        /// Id the conversion produced.
        internal: i64,
        /// First synthetic id.
        base: i64,
    },
}

/// A recorded conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertedId {
    /// Internal id.
    pub internal: i64,
    /// Geo hash that went into the id; zero for displaced ids.
    pub hash: i64,
}

/// Result of converting one entity in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    /// Id the entity arrived with.
    pub original: EntityId,
    /// Id the entity now carries.
    pub internal: i64,
    /// Members that were not yet in the conversion table and kept their
    /// original id.
    pub unresolved: Vec<EntityId>,
}

impl Conversion {
    /// Whether every member reference was rewritten.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Stateful id converter for one staging run.
///
/// # Examples
/// ```
/// use waystage_core::{IdCodec, IdConversion, Node, Tags, Way};
///
/// let mut codec = IdCodec::new(IdConversion::default());
/// let mut node = Node::new(10, 52.5, 13.4, Tags::new()).into();
/// let node_conversion = codec.convert(&mut node).expect("node id fits");
///
/// let mut way = Way::new(3, vec![10], Tags::new()).into();
/// let way_conversion = codec.convert(&mut way).expect("way id fits");
/// assert!(way_conversion.is_complete());
/// if let waystage_core::Entity::Way(way) = way {
///     assert_eq!(way.node_ids, vec![node_conversion.internal]);
/// }
/// ```
#[derive(Debug, Default)]
pub struct IdCodec {
    conversion: IdConversion,
    table: HashMap<(EntityKind, i64), ConvertedId>,
    synthetic_base: Option<i64>,
}

impl IdCodec {
    /// Create an empty codec.
    pub fn new(conversion: IdConversion) -> Self {
        Self {
            conversion,
            table: HashMap::new(),
            synthetic_base: None,
        }
    }

    /// Refuse node ids that convert to `base` or above.
    ///
    /// The staging writer reserves that range for synthetic nodes.
    #[must_use]
    pub const fn below_synthetic(mut self, base: i64) -> Self {
        self.synthetic_base = Some(base);
        self
    }

    /// Conversion parameters in use.
    pub const fn conversion(&self) -> IdConversion {
        self.conversion
    }

    /// Number of recorded conversions.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether nothing has been converted yet.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Previously recorded conversion for an original id.
    pub fn lookup(&self, kind: EntityKind, original: i64) -> Option<ConvertedId> {
        self.table.get(&(kind, original)).copied()
    }

    /// Convert an entity's id in place, rewriting member references.
    ///
    /// Ways have their node ids replaced; relations have node and way members
    /// replaced from the table. Relation members are not followed: their ids
    /// are re-encoded with the relation formula, which needs no recorded state,
    /// so nested relations may arrive in any order.
    pub fn convert(&mut self, entity: &mut Entity) -> Result<Conversion, IdCodecError> {
        match entity {
            Entity::Node(node) => self.convert_node(node),
            Entity::Way(way) => self.convert_way(way),
            Entity::Relation(relation) => self.convert_relation(relation),
        }
    }

    fn convert_node(&mut self, node: &mut Node) -> Result<Conversion, IdCodecError> {
        let original = EntityId::new(EntityKind::Node, node.id);
        let converted = match self.lookup(EntityKind::Node, node.id) {
            Some(recorded) => recorded,
            None => {
                let hash = if self.conversion.geo_hash {
                    node_hash(node.lat(), node.lon())
                } else {
                    0
                };
                self.record(original, hash)?
            }
        };
        node.id = converted.internal;
        Ok(Conversion {
            original,
            internal: converted.internal,
            unresolved: Vec::new(),
        })
    }

    fn convert_way(&mut self, way: &mut Way) -> Result<Conversion, IdCodecError> {
        let original = EntityId::new(EntityKind::Way, way.id);
        let mut hash: i64 = 0;
        let mut unresolved = Vec::new();
        for node_id in &mut way.node_ids {
            match self.member(EntityKind::Node, *node_id)? {
                Some(member) => {
                    hash = hash.wrapping_add(member.hash);
                    *node_id = member.internal;
                }
                None => unresolved.push(EntityId::new(EntityKind::Node, *node_id)),
            }
        }
        for node in &mut way.nodes {
            if let Some(member) = self.lookup(EntityKind::Node, node.id) {
                node.id = member.internal;
            }
        }

        let converted = match self.lookup(EntityKind::Way, way.id) {
            Some(recorded) => recorded,
            None => self.record(original, hash)?,
        };
        way.id = converted.internal;
        Ok(Conversion {
            original,
            internal: converted.internal,
            unresolved,
        })
    }

    fn convert_relation(&mut self, relation: &mut Relation) -> Result<Conversion, IdCodecError> {
        let original = EntityId::new(EntityKind::Relation, relation.id);
        let mut unresolved = Vec::new();
        for member in &mut relation.members {
            match self.member(member.id.kind, member.id.id)? {
                Some(converted) => member.id.id = converted.internal,
                None => unresolved.push(member.id),
            }
        }

        let converted = match self.lookup(EntityKind::Relation, relation.id) {
            Some(recorded) => recorded,
            None => self.record(original, 0)?,
        };
        relation.id = converted.internal;
        Ok(Conversion {
            original,
            internal: converted.internal,
            unresolved,
        })
    }

    /// Resolve a member reference without recording it.
    fn member(&self, kind: EntityKind, id: i64) -> Result<Option<ConvertedId>, IdCodecError> {
        if let Some(recorded) = self.lookup(kind, id) {
            return Ok(Some(recorded));
        }
        // Relation ids and displaced ids are pure functions of the original.
        if kind == EntityKind::Relation || !self.uses_geo_hash(id) {
            let internal = self.encode(EntityId::new(kind, id), 0)?;
            return Ok(Some(ConvertedId { internal, hash: 0 }));
        }
        Ok(None)
    }

    fn record(&mut self, original: EntityId, hash: i64) -> Result<ConvertedId, IdCodecError> {
        let internal = self.encode(original, hash)?;
        let converted = ConvertedId { internal, hash };
        self.table.insert((original.kind, original.id), converted);
        Ok(converted)
    }

    const fn uses_geo_hash(&self, id: i64) -> bool {
        self.conversion.geo_hash && id >= 0
    }

    fn encode(&self, original: EntityId, hash: i64) -> Result<i64, IdCodecError> {
        let internal = if self.uses_geo_hash(original.id) {
            geo_encode(original, hash)?
        } else {
            displace(original, self.conversion)?
        };
        match self.synthetic_base {
            Some(base) if original.kind == EntityKind::Node && internal >= base => {
                Err(IdCodecError::SyntheticRange {
                    entity: original,
                    internal,
                    base,
                })
            }
            _ => Ok(internal),
        }
    }
}

/// Tile bucket of a node location.
pub fn node_hash(lat: f64, lon: f64) -> i64 {
    (tile31_x(lon) + tile31_y(lat)) >> 10
}

/// Apply the displacement scheme to one id.
pub fn displace(original: EntityId, conversion: IdConversion) -> Result<i64, IdCodecError> {
    let IdConversion {
        shift_bits,
        addition,
        ..
    } = conversion;
    let out_of_range = || IdCodecError::OutOfRange {
        entity: original,
        shift: shift_bits,
    };
    if original.id >= 0 {
        if shift_bits == 0 && addition == 0 {
            return Ok(original.id);
        }
        return shift_left(original.id, shift_bits)
            .and_then(|shifted| shifted.checked_add(addition))
            .ok_or_else(out_of_range);
    }
    original
        .id
        .checked_neg()
        .and_then(|magnitude| shift_left(magnitude, shift_bits))
        .and_then(|shifted| shifted.checked_add(addition))
        .map(|displaced| -displaced)
        .ok_or_else(out_of_range)
}

/// Apply the geo-hashed scheme to a non-negative id.
fn geo_encode(original: EntityId, hash: i64) -> Result<i64, IdCodecError> {
    let bucket = match original.kind {
        EntityKind::Relation => RELATION_BUCKET,
        EntityKind::Node | EntityKind::Way => hash.rem_euclid(RELATION_BUCKET),
    };
    let shifted = shift_left(original.id, SHIFT_ID).ok_or(IdCodecError::OutOfRange {
        entity: original,
        shift: SHIFT_ID,
    })?;
    Ok(shifted | (original.kind.ordinal() % 2) | (bucket << 1))
}

/// Shift a non-negative value left, refusing to overflow into the sign bit.
fn shift_left(value: i64, bits: u32) -> Option<i64> {
    if bits >= 63 || value < 0 {
        return None;
    }
    (value <= i64::MAX >> bits).then(|| value << bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RelationMember, Tags};
    use rstest::{fixture, rstest};

    #[fixture]
    fn codec() -> IdCodec {
        IdCodec::new(IdConversion::default())
    }

    fn node(id: i64, lat: f64, lon: f64) -> Entity {
        Node::new(id, lat, lon, Tags::new()).into()
    }

    #[rstest]
    fn identity_leaves_ids_alone() {
        let mut codec = IdCodec::new(IdConversion::identity());
        let mut entity = node(42, 1.0, 2.0);
        let conversion = codec.convert(&mut entity).expect("convert");
        assert_eq!(conversion.internal, 42);
        assert_eq!(entity.id(), 42);
    }

    #[rstest]
    #[case(-5, 2, 1, -21)]
    #[case(-1, 0, 0, -1)]
    #[case(5, 2, 1, 21)]
    #[case(5, 0, 0, 5)]
    fn displaces_ids(
        #[case] id: i64,
        #[case] shift: u32,
        #[case] addition: i64,
        #[case] expected: i64,
    ) {
        let original = EntityId::new(EntityKind::Node, id);
        let displaced = displace(original, IdConversion::displaced(shift, addition));
        assert_eq!(displaced, Ok(expected));
    }

    #[rstest]
    fn negative_ids_skip_geo_hashing(mut codec: IdCodec) {
        let mut entity = node(-7, 52.0, 13.0);
        let conversion = codec.convert(&mut entity).expect("convert");
        assert_eq!(conversion.internal, -7);
    }

    #[rstest]
    fn geo_hashed_node_keeps_high_bits(mut codec: IdCodec) {
        let mut entity = node(1234, 52.52, 13.405);
        let conversion = codec.convert(&mut entity).expect("convert");
        assert_eq!(conversion.internal >> SHIFT_ID, 1234);
        assert_eq!(conversion.internal & 1, 0, "nodes use the even parity");
        let bucket = (conversion.internal >> 1) & RELATION_BUCKET;
        assert!(bucket < RELATION_BUCKET);
    }

    #[rstest]
    fn way_hash_sums_member_hashes(mut codec: IdCodec) {
        let mut a = node(1, 10.0, 10.0);
        let mut b = node(2, -10.0, 40.0);
        let ha = codec.convert(&mut a).map(|c| c.internal).expect("convert a");
        let hb = codec.convert(&mut b).map(|c| c.internal).expect("convert b");
        let mut way: Entity = Way::new(9, vec![1, 2], Tags::new()).into();
        let conversion = codec.convert(&mut way).expect("convert way");

        let expected_hash = node_hash(10.0, 10.0) + node_hash(-10.0, 40.0);
        let expected = (9 << SHIFT_ID) | 1 | (expected_hash.rem_euclid(RELATION_BUCKET) << 1);
        assert_eq!(conversion.internal, expected);
        let Entity::Way(way) = way else {
            panic!("expected a way");
        };
        assert_eq!(way.node_ids, vec![ha, hb]);
    }

    #[rstest]
    fn reports_unresolved_way_members(mut codec: IdCodec) {
        let mut way: Entity = Way::new(9, vec![1, 2], Tags::new()).into();
        let mut known = node(2, 0.0, 0.0);
        let known_id = codec.convert(&mut known).map(|c| c.internal).expect("convert");

        let conversion = codec.convert(&mut way).expect("convert way");
        assert_eq!(
            conversion.unresolved,
            vec![EntityId::new(EntityKind::Node, 1)]
        );
        let Entity::Way(way) = way else {
            panic!("expected a way");
        };
        assert_eq!(way.node_ids, vec![1, known_id], "unknown member kept as-is");
    }

    #[rstest]
    fn relation_members_keep_order(mut codec: IdCodec) {
        let mut n = node(5, 1.0, 1.0);
        let node_id = codec.convert(&mut n).map(|c| c.internal).expect("convert");
        let mut relation: Entity = Relation::new(
            3,
            vec![
                RelationMember::new(EntityId::new(EntityKind::Relation, 8), "subarea"),
                RelationMember::new(EntityId::new(EntityKind::Node, 5), "label"),
            ],
            Tags::new(),
        )
        .into();
        let conversion = codec.convert(&mut relation).expect("convert relation");
        assert!(conversion.is_complete());

        let Entity::Relation(relation) = relation else {
            panic!("expected a relation");
        };
        let nested = (8 << SHIFT_ID) | (RELATION_BUCKET << 1);
        let ids: Vec<_> = relation.members.iter().map(|m| m.id.id).collect();
        assert_eq!(ids, vec![nested, node_id]);
        assert_eq!(relation.id, (3 << SHIFT_ID) | (RELATION_BUCKET << 1));
    }

    #[rstest]
    fn repeated_conversion_is_stable(mut codec: IdCodec) {
        let mut first = node(77, 48.0, 2.0);
        let mut moved = node(77, -33.0, 151.0);
        let a = codec.convert(&mut first).expect("first");
        let b = codec.convert(&mut moved).expect("second");
        assert_eq!(a.internal, b.internal);
        assert_eq!(codec.len(), 1);
    }

    #[rstest]
    fn refuses_nodes_reaching_the_synthetic_range() {
        let base = 1_i64 << 50;
        let mut codec = IdCodec::new(IdConversion::displaced(20, 0)).below_synthetic(base);
        let mut entity = node(1 << 31, 0.0, 0.0);
        let err = codec.convert(&mut entity).expect_err("collides with synthetic ids");
        assert_eq!(
            err,
            IdCodecError::SyntheticRange {
                entity: EntityId::new(EntityKind::Node, 1 << 31),
                internal: 1 << 51,
                base,
            }
        );
        assert!(codec.is_empty(), "refused ids are not recorded");

        let mut below = node((1 << 29) - 1, 0.0, 0.0);
        let conversion = codec.convert(&mut below).expect("fits below the base");
        assert!(conversion.internal < base);
    }

    #[rstest]
    fn synthetic_ceiling_only_applies_to_nodes() {
        let mut codec = IdCodec::new(IdConversion::identity()).below_synthetic(1 << 20);
        let mut way: Entity = Way::new(1 << 21, Vec::new(), Tags::new()).into();
        let conversion = codec.convert(&mut way).expect("ways have their own table");
        assert_eq!(conversion.internal, 1 << 21);
    }

    #[rstest]
    fn rejects_overflowing_ids(mut codec: IdCodec) {
        let mut entity = node(i64::MAX >> 2, 0.0, 0.0);
        let err = codec.convert(&mut entity).expect_err("overflow");
        assert!(matches!(err, IdCodecError::OutOfRange { shift: SHIFT_ID, .. }));
    }
}

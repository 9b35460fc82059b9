//! Core domain types for the waystage staging pipeline.
//!
//! Responsibilities:
//! - Model OSM entities and their tags.
//! - Convert original ids into the internal id space.
//! - Encode tag blobs for the staging store.
//! - Plan and index tag propagation from ways onto nodes.
//!
//! Boundaries:
//! - No I/O; persistence lives in `waystage-data`.
//!
//! Invariants:
//! - Internal node, way and relation ids never collide within one run.
//! - Synthetic node ids lie above a reserved bit and encode their way.

mod config;
mod entity;
mod ids;
pub mod propagate;
pub mod tags;
mod tile;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::{
    DEFAULT_BATCH_SIZE, DuplicatePolicy, MIN_REAL_ID_BITS, StagingConfig, StagingConfigError,
    SyntheticIds,
};
pub use entity::{Entity, EntityId, EntityKind, Node, Relation, RelationMember, Tags, Way};
pub use ids::{
    Conversion, ConvertedId, IdCodec, IdCodecError, IdConversion, RELATION_BUCKET, SHIFT_ID,
    displace, node_hash,
};
pub use propagate::{
    PropagatedSpan, PropagatedWay, PropagationEngine, PropagationError, PropagationIndex,
    RuleTable,
};
pub use tags::TagBlobError;

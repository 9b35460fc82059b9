//! Facade crate for the waystage OSM staging pipeline.
//!
//! This crate re-exports the core domain types and exposes the SQLite staging
//! store, writer and reader behind the `store-sqlite` feature.

#![forbid(unsafe_code)]

pub use waystage_core::{
    DuplicatePolicy, Entity, EntityId, EntityKind, IdCodec, IdCodecError, IdConversion, Node,
    PropagationEngine, PropagationError, PropagationIndex, Relation, RelationMember, RuleTable,
    StagingConfig, StagingConfigError, SyntheticIds, Tags, Way,
};

pub use waystage_core::propagate::{Placement, Predicate, PropagateRule, RuleTableError};

#[cfg(feature = "store-sqlite")]
pub use waystage_data::{
    ConfigLoadError, EntityStream, OsmStageError, OsmStageReport, StagedCounts, StagingOutcome,
    StagingReadError, StagingReader, StagingSummary, StagingWriteError, StagingWriter, StreamKind,
    StreamMessage, TagsPreparation, load_rule_table, load_staging_config, stage_osm_pbf,
};

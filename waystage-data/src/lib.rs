//! Persistence and ingestion for the waystage staging pipeline.
//!
//! Responsibilities:
//! - Stage converted entities into an embedded SQLite store in batches.
//! - Run tag propagation while ways are staged.
//! - Read staged entities back by id or as bounded background streams.
//! - Adapt OSM PBF extracts to the staging writer.
//! - Load run configuration and propagation rules from disk.
//!
//! Boundaries:
//! - Domain rules (id conversion, propagation planning) live in
//!   `waystage-core`.
//! - Consumers own whatever they build from the streams.
//!
//! Invariants:
//! - Commits are the only durability points.
//! - A stream yields entities in id order and ends with exactly one
//!   end-of-stream marker.
//! - No global mutable state; the propagation index travels from writer to
//!   reader explicitly.

mod config;
mod ingest;
mod reader;
mod store;
mod writer;

pub use config::{ConfigLoadError, load_rule_table, load_staging_config};
pub use ingest::{OsmStageError, OsmStageReport, stage_osm_pbf};
pub use reader::{
    EntityStream, StagedCounts, StagingReadError, StagingReader, StreamKind, StreamMessage,
    TagsPreparation,
};
pub use store::{OpenMode, StagingStore, StagingStoreError, StoreStats};
pub use writer::{
    StagingOutcome, StagingSummary, StagingWriteError, StagingWriter, is_boundary,
};

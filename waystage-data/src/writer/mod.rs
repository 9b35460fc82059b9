//! Ingestion side of the staging pipeline.
//!
//! The writer takes entities from an upstream parser in node, way, relation
//! order, converts their ids, runs tag propagation on ways and stages the
//! resulting rows.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use thiserror::Error;
use waystage_core::tags::strip_ignored;
use waystage_core::{
    Entity, IdCodec, IdCodecError, Node, PropagatedSpan, PropagationEngine, PropagationError,
    PropagationIndex, Relation, RuleTable, StagingConfig, StagingConfigError, Tags, Way,
};

use crate::store::{OpenMode, StagingStore, StagingStoreError};

/// Settlement types that mark a way as a boundary.
const CITY_PLACES: [&str; 7] = [
    "city",
    "town",
    "village",
    "hamlet",
    "suburb",
    "neighbourhood",
    "locality",
];

/// Errors that abort a staging run.
#[derive(Debug, Error)]
pub enum StagingWriteError {
    /// The configuration was rejected.
    #[error("invalid staging configuration")]
    Config {
        /// Validation failure.
        #[source]
        source: StagingConfigError,
    },
    /// The store failed.
    #[error("staging store failed")]
    Store {
        /// Store failure.
        #[source]
        source: StagingStoreError,
    },
    /// An id could not be converted.
    #[error("failed to convert entity id")]
    Id {
        /// Codec failure.
        #[source]
        source: IdCodecError,
    },
}

impl From<StagingStoreError> for StagingWriteError {
    fn from(source: StagingStoreError) -> Self {
        Self::Store { source }
    }
}

/// Counters for one staging run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingSummary {
    /// Nodes staged from the input, excluding synthetic nodes.
    pub nodes: u64,
    /// Nodes staged with at least one tag.
    pub tagged_nodes: u64,
    /// Ways staged.
    pub ways: u64,
    /// Relations staged.
    pub relations: u64,
    /// Synthetic nodes created by propagation.
    pub synthetic_nodes: u64,
    /// Ways whose tags were propagated onto nodes.
    pub propagated_ways: u64,
    /// Way or relation members missing from the id table.
    pub unresolved_members: u64,
    /// Ways that needed more synthetic nodes than allowed.
    pub synthetic_overflows: u64,
    /// Ways whose propagation was abandoned for another reason.
    pub abandoned_ways: u64,
    /// Rows that failed to persist.
    pub failed_rows: u64,
    /// Entities staged again and replaced.
    pub redefinitions: u64,
    /// Transactions committed.
    pub commits: u64,
}

/// What a finished run hands to the egress side.
#[derive(Debug)]
pub struct StagingOutcome {
    /// Store location.
    pub path: Utf8PathBuf,
    /// Run counters.
    pub summary: StagingSummary,
    /// Every propagated span of the run.
    pub index: PropagationIndex,
}

/// Single-threaded writer for one staging run.
#[derive(Debug)]
pub struct StagingWriter {
    config: StagingConfig,
    store: StagingStore,
    codec: IdCodec,
    engine: Option<PropagationEngine>,
    index: PropagationIndex,
    summary: StagingSummary,
}

impl StagingWriter {
    /// Start a run on an empty store at `path`.
    pub fn create(
        path: &Utf8Path,
        config: StagingConfig,
        rules: RuleTable,
    ) -> Result<Self, StagingWriteError> {
        Self::open(path, config, rules, OpenMode::Create)
    }

    /// Continue staging into an existing store.
    pub fn resume(
        path: &Utf8Path,
        config: StagingConfig,
        rules: RuleTable,
    ) -> Result<Self, StagingWriteError> {
        Self::open(path, config, rules, OpenMode::Resume)
    }

    fn open(
        path: &Utf8Path,
        config: StagingConfig,
        rules: RuleTable,
        mode: OpenMode,
    ) -> Result<Self, StagingWriteError> {
        config
            .validate()
            .map_err(|source| StagingWriteError::Config { source })?;
        let store = StagingStore::open(path, &config, mode)?;
        let engine = (config.propagate && !rules.is_empty())
            .then(|| PropagationEngine::new(rules, config.synthetic));
        Ok(Self {
            codec: IdCodec::new(config.ids).below_synthetic(config.synthetic.base()),
            index: PropagationIndex::new(config.synthetic),
            store,
            engine,
            config,
            summary: StagingSummary::default(),
        })
    }

    /// Counters so far.
    pub fn summary(&self) -> StagingSummary {
        let stats = self.store.stats();
        StagingSummary {
            commits: stats.commits,
            failed_rows: stats.failed_rows,
            redefinitions: stats.redefinitions,
            ..self.summary.clone()
        }
    }

    /// Spans registered so far.
    pub const fn index(&self) -> &PropagationIndex {
        &self.index
    }

    /// Id conversions recorded so far.
    pub const fn codec(&self) -> &IdCodec {
        &self.codec
    }

    /// Stage one entity.
    pub fn write(&mut self, mut entity: Entity) -> Result<(), StagingWriteError> {
        strip_ignored(entity.tags_mut(), &self.config.ignored_tags);
        let conversion = self
            .codec
            .convert(&mut entity)
            .map_err(|source| StagingWriteError::Id { source })?;
        for member in &conversion.unresolved {
            warn!(
                "{} references {member}, which was not staged before it",
                conversion.original
            );
        }
        self.summary.unresolved_members += conversion.unresolved.len() as u64;

        let redefined = self.store.check_redefinition(entity.entity_id())?;
        match entity {
            Entity::Node(node) => self.write_node(&node),
            Entity::Way(way) => self.write_way(way, redefined),
            Entity::Relation(relation) => self.write_relation(&relation),
        }
    }

    /// Stage every entity of an iterator, stopping at the first fatal error.
    pub fn write_all<I>(&mut self, entities: I) -> Result<(), StagingWriteError>
    where
        I: IntoIterator<Item = Entity>,
    {
        entities.into_iter().try_for_each(|entity| self.write(entity))
    }

    /// Commit staged rows now.
    pub fn flush(&mut self) -> Result<(), StagingWriteError> {
        self.store.commit().map_err(StagingWriteError::from)
    }

    /// Commit outstanding rows and hand over the run's results.
    pub fn finish(self) -> Result<StagingOutcome, StagingWriteError> {
        let mut summary = self.summary();
        let path = self.store.path().to_path_buf();
        let stats = self.store.finish()?;
        summary.commits = stats.commits;
        summary.failed_rows = stats.failed_rows;
        info!(
            "staged {} nodes ({} synthetic), {} ways and {} relations into {path} over {} commits",
            summary.nodes,
            summary.synthetic_nodes,
            summary.ways,
            summary.relations,
            summary.commits
        );
        if summary.unresolved_members + summary.synthetic_overflows + summary.failed_rows > 0 {
            warn!(
                "staging skipped {} unresolved members, {} overflowing ways and {} failed rows",
                summary.unresolved_members, summary.synthetic_overflows, summary.failed_rows
            );
        }
        Ok(StagingOutcome {
            path,
            summary,
            index: self.index,
        })
    }

    fn write_node(&mut self, node: &Node) -> Result<(), StagingWriteError> {
        self.store.stage_node(node, false)?;
        self.summary.nodes += 1;
        if !node.tags.is_empty() {
            self.summary.tagged_nodes += 1;
        }
        Ok(())
    }

    fn write_way(&mut self, mut way: Way, redefined: bool) -> Result<(), StagingWriteError> {
        let stale = self.index.remove_way(way.id);
        if redefined || !stale.is_empty() {
            self.discard_propagation(way.id, &stale)?;
        }
        if let Some(engine) = self.engine.as_ref().filter(|e| e.applies_to(&way.tags)) {
            let mut locations = HashMap::with_capacity(way.node_ids.len());
            for id in &way.node_ids {
                if let Some(location) = self.store.node_location(*id)? {
                    locations.insert(*id, location);
                }
            }
            match engine.apply(&way, |id| locations.get(&id).copied()) {
                Ok(Some(propagated)) => {
                    for synthetic in &propagated.synthetic {
                        self.store.stage_node(synthetic, true)?;
                    }
                    for target in propagated.targets() {
                        self.store.flag_node(target)?;
                    }
                    self.summary.synthetic_nodes += propagated.synthetic.len() as u64;
                    self.summary.propagated_ways += 1;
                    self.index.register_way(&propagated);
                    way.node_ids = propagated.node_ids;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("abandoned tag propagation: {err}");
                    match err {
                        PropagationError::SyntheticOverflow { .. } => {
                            self.summary.synthetic_overflows += 1;
                        }
                        PropagationError::SyntheticIdRange { .. }
                        | PropagationError::MissingLocation { .. } => {
                            self.summary.abandoned_ways += 1;
                        }
                    }
                }
            }
        }
        self.store.stage_way(&way, is_boundary(&way.tags))?;
        self.summary.ways += 1;
        Ok(())
    }

    /// Undo an earlier propagation of a way that is being staged again.
    ///
    /// Anchors keep their flag while another way still propagates to them.
    fn discard_propagation(
        &mut self,
        way_id: i64,
        stale: &[PropagatedSpan],
    ) -> Result<(), StagingWriteError> {
        let mut anchors: Vec<i64> = Vec::new();
        for span in stale {
            if !anchors.contains(&span.anchor) && !self.index.references_node(span.anchor) {
                anchors.push(span.anchor);
            }
        }
        let synthetic = self.config.synthetic.way_range(way_id);
        self.store.discard_propagation(synthetic, &anchors)?;
        if !stale.is_empty() {
            info!(
                "way {way_id} was staged again; dropped {} propagated spans",
                stale.len()
            );
        }
        Ok(())
    }

    fn write_relation(&mut self, relation: &Relation) -> Result<(), StagingWriteError> {
        self.store.stage_relation(relation)?;
        self.summary.relations += 1;
        Ok(())
    }
}

/// Whether a way outlines a boundary or a settlement.
pub fn is_boundary(tags: &Tags) -> bool {
    tags.contains_key("boundary")
        || tags
            .get("place")
            .is_some_and(|place| CITY_PLACES.contains(&place.as_str()))
}

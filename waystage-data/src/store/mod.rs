//! SQLite staging store with batched writes.
//!
//! Rows accumulate in memory until the configured threshold is reached; the
//! batch is then written and committed in one transaction. Commits are the
//! only durability points, so a crash loses at most the rows staged since the
//! last commit.
#![forbid(unsafe_code)]

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use geo::Coord;
use log::{debug, warn};
use rusqlite::{CachedStatement, Connection, OptionalExtension, Transaction, params};
use thiserror::Error;
use waystage_core::tags::encode_tags;
use waystage_core::{DuplicatePolicy, EntityId, EntityKind, Node, Relation, StagingConfig, Way};

mod batch;
mod schema;

use batch::{NodeRow, PendingBatch, RelationRow, WayRow};

/// Errors raised by the staging store.
#[derive(Debug, Error)]
pub enum StagingStoreError {
    /// Failed to create the parent directory for the store.
    #[error("failed to create parent directory for {path:?}")]
    CreateDirectory {
        /// Store path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Opening the SQLite database failed.
    #[error("failed to open staging store at {path:?}")]
    Open {
        /// Store path.
        path: Utf8PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A statement failed outside per-row persistence.
    #[error("staging store operation `{operation}` failed")]
    Sqlite {
        /// Operation that failed.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// An id was staged twice while redefinitions are rejected.
    #[error("{entity} was staged more than once")]
    Redefinition {
        /// Entity seen twice.
        entity: EntityId,
    },
}

impl StagingStoreError {
    fn sqlite(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Sqlite { operation, source }
    }
}

/// How [`StagingStore::open`] treats an existing database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Drop existing tables and start empty.
    Create,
    /// Keep existing rows and continue staging into them.
    Resume,
}

/// Counters maintained by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Transactions committed.
    pub commits: u64,
    /// Rows that failed to persist and were skipped.
    pub failed_rows: u64,
    /// Ids staged a second time and replaced.
    pub redefinitions: u64,
}

#[derive(Debug, Default)]
struct SeenIds {
    nodes: HashSet<i64>,
    ways: HashSet<i64>,
    relations: HashSet<i64>,
}

impl SeenIds {
    fn for_kind(&mut self, kind: EntityKind) -> &mut HashSet<i64> {
        match kind {
            EntityKind::Node => &mut self.nodes,
            EntityKind::Way => &mut self.ways,
            EntityKind::Relation => &mut self.relations,
        }
    }
}

/// Embedded store holding staged nodes, way memberships and relation
/// memberships.
#[derive(Debug)]
pub struct StagingStore {
    path: Utf8PathBuf,
    connection: Connection,
    batch: PendingBatch,
    batch_size: usize,
    duplicates: DuplicatePolicy,
    seen: SeenIds,
    stats: StoreStats,
}

impl StagingStore {
    /// Open a store at `path`.
    ///
    /// Parent directories are created as needed. When resuming with
    /// redefinition tracking enabled, the ids already present are loaded so
    /// redefinitions across runs are detected.
    pub fn open(
        path: &Utf8Path,
        config: &StagingConfig,
        mode: OpenMode,
    ) -> Result<Self, StagingStoreError> {
        waystage_fs::ensure_parent_dir(path).map_err(|source| {
            StagingStoreError::CreateDirectory {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let connection =
            Connection::open(path.as_std_path()).map_err(|source| StagingStoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        schema::initialise(&connection, mode == OpenMode::Create)
            .map_err(StagingStoreError::sqlite("create schema"))?;

        let mut store = Self {
            path: path.to_path_buf(),
            connection,
            batch: PendingBatch::default(),
            batch_size: config.batch_size.max(1),
            duplicates: config.duplicates,
            seen: SeenIds::default(),
            stats: StoreStats::default(),
        };
        if mode == OpenMode::Resume && store.duplicates != DuplicatePolicy::Overwrite {
            store.preload_seen()?;
        }
        Ok(store)
    }

    /// Location of the store on disk.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Counters so far.
    pub const fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Rows waiting for the next commit.
    pub fn pending_rows(&self) -> usize {
        self.batch.len()
    }

    /// Apply the redefinition policy before staging `entity`.
    ///
    /// Returns `true` when earlier rows for the id were removed. With
    /// [`DuplicatePolicy::Replace`] the pending batch is committed first so
    /// the deletion sees every earlier row.
    pub fn check_redefinition(&mut self, entity: EntityId) -> Result<bool, StagingStoreError> {
        if self.duplicates == DuplicatePolicy::Overwrite {
            return Ok(false);
        }
        if self.seen.for_kind(entity.kind).insert(entity.id) {
            return Ok(false);
        }
        if self.duplicates == DuplicatePolicy::Reject {
            return Err(StagingStoreError::Redefinition { entity });
        }

        self.commit()?;
        let statement = match entity.kind {
            EntityKind::Node => schema::DELETE_NODE,
            EntityKind::Way => schema::DELETE_WAY,
            EntityKind::Relation => schema::DELETE_RELATION,
        };
        self.connection
            .execute(statement, [entity.id])
            .map_err(StagingStoreError::sqlite("delete redefined rows"))?;
        self.stats.redefinitions += 1;
        debug!("removed earlier rows for redefined {entity}");
        Ok(true)
    }

    /// Remove what an earlier propagation of a way left behind.
    ///
    /// Deletes the synthetic nodes in `synthetic` (first and last id,
    /// inclusive) and clears the propagation flag of `anchors`. Pending rows
    /// are committed first so the cleanup sees them.
    pub fn discard_propagation(
        &mut self,
        synthetic: Option<(i64, i64)>,
        anchors: &[i64],
    ) -> Result<(), StagingStoreError> {
        self.commit()?;
        let transaction = self
            .connection
            .transaction()
            .map_err(StagingStoreError::sqlite("begin transaction"))?;
        let mut removed = 0;
        if let Some((first, last)) = synthetic {
            removed = transaction
                .execute(schema::DELETE_NODE_RANGE, [first, last])
                .map_err(StagingStoreError::sqlite("delete synthetic nodes"))?;
        }
        {
            let mut unflag = prepare(&transaction, schema::UNFLAG_NODE)?;
            for anchor in anchors {
                unflag
                    .execute([anchor])
                    .map_err(StagingStoreError::sqlite("clear propagation flags"))?;
            }
        }
        transaction
            .commit()
            .map_err(StagingStoreError::sqlite("commit transaction"))?;
        self.stats.commits += 1;
        debug!(
            "discarded {removed} synthetic nodes and {} propagation flags",
            anchors.len()
        );
        Ok(())
    }

    /// Stage a node row.
    pub fn stage_node(&mut self, node: &Node, propagate: bool) -> Result<(), StagingStoreError> {
        self.batch.push_node(NodeRow {
            id: node.id,
            location: node.location,
            tags: encode_tags(&node.tags),
            propagate,
        });
        self.after_push()
    }

    /// Mark a node as a propagation target.
    pub fn flag_node(&mut self, id: i64) -> Result<(), StagingStoreError> {
        self.batch.flag_node(id);
        self.after_push()
    }

    /// Stage one row per node reference of a way.
    ///
    /// The tag blob is stored on ordinal zero; the boundary flag on every
    /// row.
    pub fn stage_way(&mut self, way: &Way, boundary: bool) -> Result<(), StagingStoreError> {
        let mut blob = Some(encode_tags(&way.tags));
        for (ord, node) in (0_i64..).zip(&way.node_ids) {
            self.batch.push_way(WayRow {
                id: way.id,
                node: *node,
                ord,
                tags: blob.take(),
                boundary,
            });
        }
        self.after_push()
    }

    /// Stage one row per relation member, tags on ordinal zero.
    pub fn stage_relation(&mut self, relation: &Relation) -> Result<(), StagingStoreError> {
        let mut blob = Some(encode_tags(&relation.tags));
        for (ord, member) in (0_i64..).zip(&relation.members) {
            self.batch.push_relation(RelationRow {
                id: relation.id,
                member: member.id.id,
                kind: member.id.kind.ordinal(),
                role: member.role.clone(),
                ord,
                tags: blob.take(),
            });
        }
        self.after_push()
    }

    /// Location of a staged node, including nodes not yet flushed.
    pub fn node_location(&self, id: i64) -> Result<Option<Coord<f64>>, StagingStoreError> {
        if let Some(location) = self.batch.node_location(id) {
            return Ok(Some(location));
        }
        self.connection
            .prepare_cached(schema::SELECT_NODE_LOCATION)
            .and_then(|mut statement| {
                statement
                    .query_row([id], |row| {
                        Ok(Coord {
                            x: row.get::<_, f64>(1)?,
                            y: row.get::<_, f64>(0)?,
                        })
                    })
                    .optional()
            })
            .map_err(StagingStoreError::sqlite("look up node location"))
    }

    /// Write and commit every pending row.
    ///
    /// Does nothing when the batch is empty, so no empty transaction is
    /// ever counted.
    pub fn commit(&mut self) -> Result<(), StagingStoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let rows = self.batch.len();
        let transaction = self
            .connection
            .transaction()
            .map_err(StagingStoreError::sqlite("begin transaction"))?;
        let failed = write_batch(&transaction, &self.batch)?;
        transaction
            .commit()
            .map_err(StagingStoreError::sqlite("commit transaction"))?;
        self.batch.clear();
        self.stats.commits += 1;
        self.stats.failed_rows += failed;
        debug!(
            "committed {rows} staged rows to {} (commit {})",
            self.path, self.stats.commits
        );
        Ok(())
    }

    /// Commit outstanding rows and close the store.
    pub fn finish(mut self) -> Result<StoreStats, StagingStoreError> {
        self.commit()?;
        Ok(self.stats)
    }

    fn after_push(&mut self) -> Result<(), StagingStoreError> {
        if self.batch.len() >= self.batch_size {
            self.commit()?;
        }
        Ok(())
    }

    fn preload_seen(&mut self) -> Result<(), StagingStoreError> {
        for (kind, query) in [
            (EntityKind::Node, schema::SELECT_NODE_IDS),
            (EntityKind::Way, schema::SELECT_WAY_IDS),
            (EntityKind::Relation, schema::SELECT_RELATION_IDS),
        ] {
            let mut statement = self
                .connection
                .prepare(query)
                .map_err(StagingStoreError::sqlite("load staged ids"))?;
            let ids = statement
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(StagingStoreError::sqlite("load staged ids"))?;
            let seen = self.seen.for_kind(kind);
            for id in ids {
                seen.insert(id.map_err(StagingStoreError::sqlite("load staged ids"))?);
            }
        }
        Ok(())
    }
}

/// Write a batch inside `transaction`, returning the number of rows skipped.
fn write_batch(
    transaction: &Transaction<'_>,
    batch: &PendingBatch,
) -> Result<u64, StagingStoreError> {
    let mut nodes = prepare(transaction, schema::UPSERT_NODE)?;
    let mut flags = prepare(transaction, schema::FLAG_NODE)?;
    let mut ways = prepare(transaction, schema::UPSERT_WAY_ROW)?;
    let mut relations = prepare(transaction, schema::UPSERT_RELATION_ROW)?;

    let mut failed = 0;
    for row in batch.nodes() {
        let outcome = nodes.execute(params![
            row.id,
            row.location.y,
            row.location.x,
            row.tags,
            row.propagate
        ]);
        failed += report(outcome, EntityId::new(EntityKind::Node, row.id));
    }
    for id in batch.flags() {
        let outcome = flags.execute([id]);
        failed += report(outcome, EntityId::new(EntityKind::Node, *id));
    }
    for row in batch.ways() {
        let outcome = ways.execute(params![row.id, row.node, row.ord, row.tags, row.boundary]);
        failed += report(outcome, EntityId::new(EntityKind::Way, row.id));
    }
    for row in batch.relations() {
        let outcome = relations.execute(params![
            row.id, row.member, row.kind, row.role, row.ord, row.tags
        ]);
        failed += report(outcome, EntityId::new(EntityKind::Relation, row.id));
    }
    Ok(failed)
}

fn prepare<'a>(
    transaction: &'a Transaction<'_>,
    sql: &str,
) -> Result<CachedStatement<'a>, StagingStoreError> {
    transaction
        .prepare_cached(sql)
        .map_err(StagingStoreError::sqlite("prepare staging statements"))
}

/// Log a failed row and count it; successful rows count zero.
fn report(outcome: rusqlite::Result<usize>, entity: EntityId) -> u64 {
    match outcome {
        Ok(_) => 0,
        Err(err) => {
            warn!("failed to persist row for {entity}: {err}");
            1
        }
    }
}

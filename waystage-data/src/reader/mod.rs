//! Egress side of the staging pipeline.
//!
//! A [`StagingReader`] opens a finished store read-only. It loads single
//! entities on demand and starts [`EntityStream`]s that rebuild whole
//! entities on a background thread.
#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Rows};
use thiserror::Error;
use waystage_core::tags::decode_tags;
use waystage_core::{
    Entity, EntityId, EntityKind, Node, PropagationIndex, Relation, RelationMember, TagBlobError,
    Tags, Way,
};

use crate::writer::StagingOutcome;

mod stream;

pub use stream::{EntityStream, StreamKind, StreamMessage};

const SELECT_NODE: &str = "SELECT id, latitude, longitude, tags FROM node WHERE id = ?1";

const SELECT_WAY: &str = "
    SELECT w.id, w.node, w.tags, n.latitude, n.longitude, n.tags
    FROM ways w LEFT JOIN node n ON n.id = w.node
    WHERE w.id = ?1
    ORDER BY w.ord";

const SELECT_RELATION: &str =
    "SELECT id, member, type, role, tags FROM relations WHERE id = ?1 ORDER BY ord";

const COUNT_NODES: &str =
    "SELECT COUNT(*) FROM node WHERE length(tags) > 0 OR propagate = 1";
const COUNT_WAYS: &str = "SELECT COUNT(DISTINCT id) FROM ways";
const COUNT_BOUNDARY_WAYS: &str = "SELECT COUNT(DISTINCT id) FROM ways WHERE boundary = 1";
const COUNT_RELATIONS: &str = "SELECT COUNT(DISTINCT id) FROM relations";

/// Errors raised while reading a staging store.
#[derive(Debug, Error)]
pub enum StagingReadError {
    /// No store exists at the path.
    #[error("no staging store at {path:?}")]
    Missing {
        /// Requested path.
        path: Utf8PathBuf,
    },
    /// Checking for the store failed.
    #[error("failed to inspect staging store path {path:?}")]
    Inspect {
        /// Requested path.
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
    /// A query failed.
    #[error("staging store query `{operation}` failed")]
    Query {
        /// Operation that failed.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A persisted tag blob was corrupt.
    #[error("corrupt tags on {entity}")]
    TagBlob {
        /// Entity owning the blob.
        entity: EntityId,
        /// Decoding failure.
        #[source]
        source: TagBlobError,
    },
    /// A relation row names a member kind outside the known ordinals.
    #[error("relation {relation} has a member of unknown kind {ordinal}")]
    UnknownMemberKind {
        /// Relation id.
        relation: i64,
        /// Persisted kind ordinal.
        ordinal: i64,
    },
    /// The producer thread could not be started.
    #[error("failed to spawn the {kind} stream producer")]
    Spawn {
        /// Requested stream.
        kind: StreamKind,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The producer went away without finishing the stream.
    #[error("the {kind} stream ended without an end-of-stream marker")]
    StreamInterrupted {
        /// Interrupted stream.
        kind: StreamKind,
    },
}

impl StagingReadError {
    fn query(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Query { operation, source }
    }
}

/// Hook applied to every tag map the reader decodes.
///
/// Implementations run on stream producer threads as well as on the caller's
/// thread, hence the `Send + Sync` bound.
pub trait TagsPreparation: Send + Sync {
    /// Rewrite the tags of one entity of `kind`.
    fn process_tags(&self, kind: EntityKind, tags: &mut Tags);

    /// Called once before a stream of `kind` starts producing.
    fn new_iteration(&self, _kind: EntityKind) {}
}

/// Entity totals of a staged store, for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedCounts {
    /// Nodes that will be streamed: tagged or flagged by propagation.
    pub nodes: u64,
    /// Distinct ways.
    pub ways: u64,
    /// Distinct ways flagged as boundaries.
    pub boundary_ways: u64,
    /// Distinct relations.
    pub relations: u64,
}

/// Read-only access to a staging store.
pub struct StagingReader {
    path: Utf8PathBuf,
    connection: Connection,
    preparation: Option<Arc<dyn TagsPreparation>>,
    index: PropagationIndex,
}

impl fmt::Debug for StagingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingReader")
            .field("path", &self.path)
            .field("preparation", &self.preparation.is_some())
            .field("index", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl StagingReader {
    /// Open an existing store at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, StagingReadError> {
        let exists =
            waystage_fs::store_file_exists(path).map_err(|source| StagingReadError::Inspect {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            return Err(StagingReadError::Missing {
                path: path.to_path_buf(),
            });
        }
        let connection = open_read_only(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            connection,
            preparation: None,
            index: PropagationIndex::default(),
        })
    }

    /// Open the store a writer just finished, keeping its propagation index.
    pub fn from_outcome(outcome: StagingOutcome) -> Result<Self, StagingReadError> {
        Ok(Self::open(&outcome.path)?.with_index(outcome.index))
    }

    /// Apply `preparation` to every decoded tag map.
    #[must_use]
    pub fn with_preparation(mut self, preparation: Arc<dyn TagsPreparation>) -> Self {
        self.preparation = Some(preparation);
        self
    }

    /// Use the propagation index of the run that built the store.
    #[must_use]
    pub fn with_index(mut self, index: PropagationIndex) -> Self {
        self.index = index;
        self
    }

    /// Location of the store.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Propagation index handed over by the writer.
    pub const fn index(&self) -> &PropagationIndex {
        &self.index
    }

    /// Tags propagated onto node `id`, empty when none were.
    pub fn propagated_tags(&self, id: i64) -> Tags {
        self.index.propagated_tags(id)
    }

    /// Load one node.
    pub fn load_node(&self, id: i64) -> Result<Option<Node>, StagingReadError> {
        let preparation = self.preparation.as_deref();
        self.connection
            .prepare_cached(SELECT_NODE)
            .map_err(StagingReadError::query("prepare node lookup"))?
            .query_row([id], |row| Ok(node_from_row(row, preparation)))
            .optional()
            .map_err(StagingReadError::query("load node"))?
            .transpose()
    }

    /// Load one way with its nodes resolved in way order.
    ///
    /// Nodes missing from the store keep their id in `node_ids` but are
    /// absent from `nodes`.
    pub fn load_way(&self, id: i64) -> Result<Option<Way>, StagingReadError> {
        let mut statement = self
            .connection
            .prepare_cached(SELECT_WAY)
            .map_err(StagingReadError::query("prepare way lookup"))?;
        let mut rows = statement
            .query([id])
            .map_err(StagingReadError::query("load way"))?;
        let mut found = None;
        assemble_ways(&mut rows, self.preparation.as_deref(), |way| {
            found = Some(way);
            true
        })?;
        Ok(found)
    }

    /// Load one relation, resolving members `depth` levels deep.
    ///
    /// A depth of zero returns bare member references. Each level resolves
    /// node and way members fully and nested relations one level shallower,
    /// so cycles terminate once the depth is used up.
    pub fn load_relation(
        &self,
        id: i64,
        depth: usize,
    ) -> Result<Option<Relation>, StagingReadError> {
        let Some(mut relation) = self.relation_shell(id)? else {
            return Ok(None);
        };
        if depth == 0 {
            return Ok(Some(relation));
        }
        for member in &mut relation.members {
            let entity = match member.id.kind {
                EntityKind::Node => self.load_node(member.id.id)?.map(Entity::Node),
                EntityKind::Way => self.load_way(member.id.id)?.map(Entity::Way),
                EntityKind::Relation => self
                    .load_relation(member.id.id, depth - 1)?
                    .map(Entity::Relation),
            };
            member.entity = entity.map(Box::new);
        }
        Ok(Some(relation))
    }

    /// Every node reachable from relation `id`, in first-seen order.
    ///
    /// Node members count directly, way members contribute their resolved
    /// nodes and nested relations are followed up to `max_depth` levels.
    /// Each relation is visited at most once.
    pub fn relation_nodes(&self, id: i64, max_depth: usize) -> Result<Vec<Node>, StagingReadError> {
        let mut closure = NodeClosure::default();
        self.collect_relation_nodes(id, max_depth, &mut closure)?;
        Ok(closure.nodes)
    }

    /// Entity totals for progress reporting.
    pub fn counts(&self) -> Result<StagedCounts, StagingReadError> {
        let count = |sql: &str| -> Result<u64, StagingReadError> {
            let total: i64 = self
                .connection
                .query_row(sql, [], |row| row.get(0))
                .map_err(StagingReadError::query("count staged entities"))?;
            Ok(u64::try_from(total).unwrap_or_default())
        };
        Ok(StagedCounts {
            nodes: count(COUNT_NODES)?,
            ways: count(COUNT_WAYS)?,
            boundary_ways: count(COUNT_BOUNDARY_WAYS)?,
            relations: count(COUNT_RELATIONS)?,
        })
    }

    /// Start streaming every entity of `kind` through a queue holding at
    /// most `capacity` entities.
    ///
    /// The producer opens its own connection, so streams may run while this
    /// reader keeps serving random-access calls.
    pub fn stream(
        &self,
        kind: StreamKind,
        capacity: usize,
    ) -> Result<EntityStream, StagingReadError> {
        debug!("starting {kind} stream over {} (capacity {capacity})", self.path);
        EntityStream::spawn(self.path.clone(), kind, capacity, self.preparation.clone())
    }

    fn relation_shell(&self, id: i64) -> Result<Option<Relation>, StagingReadError> {
        let mut statement = self
            .connection
            .prepare_cached(SELECT_RELATION)
            .map_err(StagingReadError::query("prepare relation lookup"))?;
        let mut rows = statement
            .query([id])
            .map_err(StagingReadError::query("load relation"))?;
        let mut found = None;
        assemble_relations(&mut rows, self.preparation.as_deref(), |relation| {
            found = Some(relation);
            true
        })?;
        Ok(found)
    }

    fn collect_relation_nodes(
        &self,
        id: i64,
        depth: usize,
        closure: &mut NodeClosure,
    ) -> Result<(), StagingReadError> {
        if !closure.relations.insert(id) {
            return Ok(());
        }
        let Some(relation) = self.relation_shell(id)? else {
            return Ok(());
        };
        for member in relation.members {
            match member.id.kind {
                EntityKind::Node => {
                    if let Some(node) = self.load_node(member.id.id)? {
                        closure.push(node);
                    }
                }
                EntityKind::Way => {
                    if let Some(way) = self.load_way(member.id.id)? {
                        way.nodes.into_iter().for_each(|node| closure.push(node));
                    }
                }
                EntityKind::Relation if depth > 0 => {
                    self.collect_relation_nodes(member.id.id, depth - 1, closure)?;
                }
                EntityKind::Relation => {}
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct NodeClosure {
    relations: HashSet<i64>,
    seen: HashSet<i64>,
    nodes: Vec<Node>,
}

impl NodeClosure {
    fn push(&mut self, node: Node) {
        if self.seen.insert(node.id) {
            self.nodes.push(node);
        }
    }
}

fn open_read_only(path: &Utf8Path) -> Result<Connection, StagingReadError> {
    Connection::open_with_flags(
        path.as_std_path(),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| StagingReadError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Decode a tag blob and run the preparation hook over it.
fn decode(
    blob: &[u8],
    entity: EntityId,
    preparation: Option<&dyn TagsPreparation>,
) -> Result<Tags, StagingReadError> {
    let mut tags =
        decode_tags(blob).map_err(|source| StagingReadError::TagBlob { entity, source })?;
    if let Some(preparation) = preparation {
        preparation.process_tags(entity.kind, &mut tags);
    }
    Ok(tags)
}

/// Build a node from `id, latitude, longitude, tags` columns.
fn node_from_row(
    row: &Row<'_>,
    preparation: Option<&dyn TagsPreparation>,
) -> Result<Node, StagingReadError> {
    let read = |row: &Row<'_>| -> rusqlite::Result<(i64, f64, f64, Vec<u8>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    };
    let (id, lat, lon, blob) = read(row).map_err(StagingReadError::query("read node row"))?;
    let tags = decode(&blob, EntityId::new(EntityKind::Node, id), preparation)?;
    Ok(Node::new(id, lat, lon, tags))
}

/// Fold way rows ordered by id then ordinal into whole ways.
///
/// Rows carry `way id, node id, way tags, latitude, longitude, node tags`
/// with the node columns null for unresolved references. `emit` returns
/// `false` to stop early; the return value reports whether every way was
/// emitted.
fn assemble_ways(
    rows: &mut Rows<'_>,
    preparation: Option<&dyn TagsPreparation>,
    mut emit: impl FnMut(Way) -> bool,
) -> Result<bool, StagingReadError> {
    let mut current: Option<Way> = None;
    while let Some(row) = rows.next().map_err(StagingReadError::query("read way rows"))? {
        let columns = WayColumns::read(row).map_err(StagingReadError::query("read way row"))?;
        if let Some(done) = current.take_if(|way| way.id != columns.id) {
            if !emit(done) {
                return Ok(false);
            }
        }
        let way = current.get_or_insert_with(|| Way::new(columns.id, Vec::new(), Tags::new()));
        if let Some(blob) = &columns.way_tags {
            way.tags = decode(blob, EntityId::new(EntityKind::Way, way.id), preparation)?;
        }
        way.node_ids.push(columns.node);
        if let (Some(lat), Some(lon)) = (columns.latitude, columns.longitude) {
            let blob = columns.node_tags.unwrap_or_default();
            let tags = decode(&blob, EntityId::new(EntityKind::Node, columns.node), preparation)?;
            way.nodes.push(Node::new(columns.node, lat, lon, tags));
        }
    }
    Ok(current.is_none_or(emit))
}

struct WayColumns {
    id: i64,
    node: i64,
    way_tags: Option<Vec<u8>>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    node_tags: Option<Vec<u8>>,
}

impl WayColumns {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            node: row.get(1)?,
            way_tags: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            node_tags: row.get(5)?,
        })
    }
}

/// Fold relation rows (`id, member, type, role, tags`) ordered by id then
/// ordinal into relations with unloaded members.
fn assemble_relations(
    rows: &mut Rows<'_>,
    preparation: Option<&dyn TagsPreparation>,
    mut emit: impl FnMut(Relation) -> bool,
) -> Result<bool, StagingReadError> {
    let mut current: Option<Relation> = None;
    while let Some(row) = rows
        .next()
        .map_err(StagingReadError::query("read relation rows"))?
    {
        let read = |row: &Row<'_>| -> rusqlite::Result<(i64, i64, i64, String, Option<Vec<u8>>)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        };
        let (id, member, ordinal, role, blob) =
            read(row).map_err(StagingReadError::query("read relation row"))?;
        if let Some(done) = current.take_if(|relation| relation.id != id) {
            if !emit(done) {
                return Ok(false);
            }
        }
        let relation = current.get_or_insert_with(|| Relation::new(id, Vec::new(), Tags::new()));
        if let Some(blob) = blob {
            relation.tags = decode(&blob, EntityId::new(EntityKind::Relation, id), preparation)?;
        }
        let kind = EntityKind::from_ordinal(ordinal).ok_or(StagingReadError::UnknownMemberKind {
            relation: id,
            ordinal,
        })?;
        relation
            .members
            .push(RelationMember::new(EntityId::new(kind, member), role));
    }
    Ok(current.is_none_or(emit))
}

//! Background producers for bulk entity streams.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};
use rusqlite::Connection;
use waystage_core::{Entity, EntityKind};

use super::{
    StagingReadError, TagsPreparation, assemble_relations, assemble_ways, node_from_row,
    open_read_only,
};

const STREAM_NODES: &str = "
    SELECT id, latitude, longitude, tags FROM node
    WHERE length(tags) > 0 OR propagate = 1
    ORDER BY id";

const STREAM_WAYS: &str = "
    SELECT w.id, w.node, w.tags, n.latitude, n.longitude, n.tags
    FROM ways w LEFT JOIN node n ON n.id = w.node
    ORDER BY w.id, w.ord";

const STREAM_BOUNDARY_WAYS: &str = "
    SELECT w.id, w.node, w.tags, n.latitude, n.longitude, n.tags
    FROM ways w LEFT JOIN node n ON n.id = w.node
    WHERE w.boundary = 1
    ORDER BY w.id, w.ord";

const STREAM_RELATIONS: &str =
    "SELECT id, member, type, role, tags FROM relations ORDER BY id, ord";

/// Entity family a stream scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Tagged or propagation-flagged nodes.
    Node,
    /// Every way, with resolved nodes.
    Way,
    /// Ways flagged as boundaries.
    WayBoundary,
    /// Every relation, with unloaded members.
    Relation,
}

impl StreamKind {
    /// Entity kind the stream yields.
    pub const fn entity_kind(self) -> EntityKind {
        match self {
            Self::Node => EntityKind::Node,
            Self::Way | Self::WayBoundary => EntityKind::Way,
            Self::Relation => EntityKind::Relation,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::WayBoundary => "boundary-way",
            Self::Relation => "relation",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One message on a stream's queue.
#[derive(Debug)]
pub enum StreamMessage {
    /// A rebuilt entity.
    Entity(Entity),
    /// The producer failed and stopped.
    Failed(StagingReadError),
    /// Every entity was produced.
    EndOfStream,
}

/// Consumer end of a bulk stream.
///
/// Iterating yields entities in id order and stops after the end-of-stream
/// marker. Dropping the stream early makes the producer stop at its next
/// send.
#[derive(Debug)]
pub struct EntityStream {
    kind: StreamKind,
    receiver: Option<Receiver<StreamMessage>>,
    producer: Option<JoinHandle<()>>,
    produced: Arc<AtomicUsize>,
    finished: bool,
}

impl EntityStream {
    pub(super) fn spawn(
        path: Utf8PathBuf,
        kind: StreamKind,
        capacity: usize,
        preparation: Option<Arc<dyn TagsPreparation>>,
    ) -> Result<Self, StagingReadError> {
        let (sender, receiver) = sync_channel(capacity);
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let producer = std::thread::Builder::new()
            .name(format!("waystage-{kind}-stream"))
            .spawn(move || {
                let queue = Queue {
                    sender,
                    produced: counter,
                };
                produce(&path, kind, preparation.as_deref(), &queue);
            })
            .map_err(|source| StagingReadError::Spawn { kind, source })?;
        Ok(Self {
            kind,
            receiver: Some(receiver),
            producer: Some(producer),
            produced,
            finished: false,
        })
    }

    /// Stream kind.
    pub const fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Entities the producer has queued so far.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::Acquire)
    }

    /// Receive the next raw message, blocking while the queue is empty.
    ///
    /// Returns `None` once the end-of-stream marker or a failure has been
    /// delivered. A producer that disappears without either is reported as
    /// [`StagingReadError::StreamInterrupted`].
    pub fn next_message(&mut self) -> Option<StreamMessage> {
        if self.finished {
            return None;
        }
        let receiver = self.receiver.as_ref()?;
        let message = match receiver.recv() {
            Ok(message) => message,
            Err(_) => StreamMessage::Failed(StagingReadError::StreamInterrupted {
                kind: self.kind,
            }),
        };
        if !matches!(message, StreamMessage::Entity(_)) {
            self.finished = true;
        }
        Some(message)
    }
}

impl Iterator for EntityStream {
    type Item = Result<Entity, StagingReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_message()? {
            StreamMessage::Entity(entity) => Some(Ok(entity)),
            StreamMessage::Failed(err) => Some(Err(err)),
            StreamMessage::EndOfStream => None,
        }
    }
}

impl Drop for EntityStream {
    fn drop(&mut self) {
        // Disconnect first so a producer blocked on a full queue wakes up.
        self.receiver.take();
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                warn!("{} stream producer panicked", self.kind);
            }
        }
    }
}

/// Producer end of the queue.
struct Queue {
    sender: SyncSender<StreamMessage>,
    produced: Arc<AtomicUsize>,
}

impl Queue {
    /// Queue one entity; `false` once the consumer has gone away.
    fn entity(&self, entity: Entity) -> bool {
        if self.sender.send(StreamMessage::Entity(entity)).is_err() {
            return false;
        }
        self.produced.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn finish(&self, message: StreamMessage) {
        // A consumer that already left needs no marker.
        let _ = self.sender.send(message);
    }
}

fn produce(
    path: &Utf8Path,
    kind: StreamKind,
    preparation: Option<&dyn TagsPreparation>,
    queue: &Queue,
) {
    if let Some(preparation) = preparation {
        preparation.new_iteration(kind.entity_kind());
    }
    let outcome = open_read_only(path)
        .and_then(|connection| scan(&connection, kind, preparation, queue));
    match outcome {
        Ok(true) => {
            debug!(
                "{kind} stream over {path} finished after {} entities",
                queue.produced.load(Ordering::Acquire)
            );
            queue.finish(StreamMessage::EndOfStream);
        }
        Ok(false) => debug!("{kind} stream over {path} dropped by its consumer"),
        Err(err) => {
            warn!("{kind} stream over {path} failed: {err}");
            queue.finish(StreamMessage::Failed(err));
        }
    }
}

/// Scan the store in id order; `Ok(false)` when the consumer left early.
fn scan(
    connection: &Connection,
    kind: StreamKind,
    preparation: Option<&dyn TagsPreparation>,
    queue: &Queue,
) -> Result<bool, StagingReadError> {
    let sql = match kind {
        StreamKind::Node => STREAM_NODES,
        StreamKind::Way => STREAM_WAYS,
        StreamKind::WayBoundary => STREAM_BOUNDARY_WAYS,
        StreamKind::Relation => STREAM_RELATIONS,
    };
    let mut statement = connection
        .prepare(sql)
        .map_err(StagingReadError::query("prepare stream scan"))?;
    let mut rows = statement
        .query([])
        .map_err(StagingReadError::query("start stream scan"))?;
    match kind {
        StreamKind::Node => {
            while let Some(row) = rows
                .next()
                .map_err(StagingReadError::query("read node rows"))?
            {
                let node = node_from_row(row, preparation)?;
                if !queue.entity(Entity::Node(node)) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        StreamKind::Way | StreamKind::WayBoundary => {
            assemble_ways(&mut rows, preparation, |way| queue.entity(Entity::Way(way)))
        }
        StreamKind::Relation => assemble_relations(&mut rows, preparation, |relation| {
            queue.entity(Entity::Relation(relation))
        }),
    }
}

//! In-memory rows awaiting the next flush.

use std::collections::HashMap;

use geo::Coord;

#[derive(Debug, Clone, PartialEq)]
pub(super) struct NodeRow {
    pub(super) id: i64,
    pub(super) location: Coord<f64>,
    pub(super) tags: Vec<u8>,
    pub(super) propagate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct WayRow {
    pub(super) id: i64,
    pub(super) node: i64,
    pub(super) ord: i64,
    pub(super) tags: Option<Vec<u8>>,
    pub(super) boundary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RelationRow {
    pub(super) id: i64,
    pub(super) member: i64,
    pub(super) kind: i64,
    pub(super) role: String,
    pub(super) ord: i64,
    pub(super) tags: Option<Vec<u8>>,
}

/// Pending rows for the three tables plus propagate-flag updates.
///
/// Nodes are keyed by id so a node staged twice within one batch keeps a
/// single row and its location is visible before the batch is flushed.
#[derive(Debug, Default)]
pub(super) struct PendingBatch {
    nodes: Vec<NodeRow>,
    node_slots: HashMap<i64, usize>,
    flags: Vec<i64>,
    ways: Vec<WayRow>,
    relations: Vec<RelationRow>,
}

impl PendingBatch {
    /// Rows waiting to be written.
    pub(super) fn len(&self) -> usize {
        self.nodes.len() + self.flags.len() + self.ways.len() + self.relations.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(super) fn push_node(&mut self, row: NodeRow) {
        if let Some(existing) = self
            .node_slots
            .get(&row.id)
            .and_then(|slot| self.nodes.get_mut(*slot))
        {
            let propagate = existing.propagate || row.propagate;
            *existing = NodeRow { propagate, ..row };
            return;
        }
        self.node_slots.insert(row.id, self.nodes.len());
        self.nodes.push(row);
    }

    /// Flag a node; pending nodes are updated in place.
    pub(super) fn flag_node(&mut self, id: i64) {
        match self
            .node_slots
            .get(&id)
            .and_then(|slot| self.nodes.get_mut(*slot))
        {
            Some(row) => row.propagate = true,
            None => self.flags.push(id),
        }
    }

    pub(super) fn push_way(&mut self, row: WayRow) {
        self.ways.push(row);
    }

    pub(super) fn push_relation(&mut self, row: RelationRow) {
        self.relations.push(row);
    }

    /// Location of a node that has not been flushed yet.
    pub(super) fn node_location(&self, id: i64) -> Option<Coord<f64>> {
        self.node_slots
            .get(&id)
            .and_then(|slot| self.nodes.get(*slot))
            .map(|row| row.location)
    }

    pub(super) fn nodes(&self) -> &[NodeRow] {
        &self.nodes
    }

    pub(super) fn flags(&self) -> &[i64] {
        &self.flags
    }

    pub(super) fn ways(&self) -> &[WayRow] {
        &self.ways
    }

    pub(super) fn relations(&self) -> &[RelationRow] {
        &self.relations
    }

    pub(super) fn clear(&mut self) {
        self.nodes.clear();
        self.node_slots.clear();
        self.flags.clear();
        self.ways.clear();
        self.relations.clear();
    }
}

//! Run-wide lookup of propagated spans.

use std::collections::HashMap;

use super::engine::{PropagatedSpan, PropagatedWay};
use crate::config::SyntheticIds;
use crate::{Node, Tags, Way};

/// Every span registered during a staging run.
///
/// Spans are reachable by their own id (the existing node id or the
/// synthetic id) and by their anchor, the way node at the span's first
/// ordinal. The writer owns the index while staging and hands it over to the
/// reader once the run finishes.
#[derive(Debug, Clone, Default)]
pub struct PropagationIndex {
    synthetic: SyntheticIds,
    spans: Vec<PropagatedSpan>,
    by_id: HashMap<i64, Vec<usize>>,
    by_anchor: HashMap<i64, Vec<usize>>,
}

impl PropagationIndex {
    /// Empty index for a synthetic id layout.
    pub fn new(synthetic: SyntheticIds) -> Self {
        Self {
            synthetic,
            ..Self::default()
        }
    }

    /// Register one span under both keys.
    pub fn register(&mut self, span: PropagatedSpan) {
        let slot = self.spans.len();
        self.by_id.entry(span.id).or_default().push(slot);
        self.by_anchor.entry(span.anchor).or_default().push(slot);
        self.spans.push(span);
    }

    /// Register every span of a propagated way.
    pub fn register_way(&mut self, way: &PropagatedWay) {
        for span in &way.spans {
            self.register(span.clone());
        }
    }

    /// Drop every span of a way, returning the removed spans.
    ///
    /// Used when a way is staged again so its earlier propagation does not
    /// outlive it.
    pub fn remove_way(&mut self, way_id: i64) -> Vec<PropagatedSpan> {
        if !self.spans.iter().any(|span| span.way_id == way_id) {
            return Vec::new();
        }
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.spans)
            .into_iter()
            .partition(|span| span.way_id == way_id);
        self.by_id.clear();
        self.by_anchor.clear();
        for span in kept {
            self.register(span);
        }
        removed
    }

    /// Whether any span is anchored at or carried by node `id`.
    pub fn references_node(&self, id: i64) -> bool {
        self.by_anchor.contains_key(&id) || self.by_id.contains_key(&id)
    }

    /// Number of registered spans.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Whether nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Spans whose own id is `id`.
    pub fn spans_for_node(&self, id: i64) -> impl Iterator<Item = &PropagatedSpan> {
        self.lookup(&self.by_id, id)
    }

    /// Spans anchored at node `id`.
    pub fn spans_at_anchor(&self, id: i64) -> impl Iterator<Item = &PropagatedSpan> {
        self.lookup(&self.by_anchor, id)
    }

    /// Tags carried by the node with this id, first registration first.
    pub fn tags_for_node(&self, id: i64) -> Tags {
        merge(self.spans_for_node(id))
    }

    /// Tags propagated to spans anchored at node `id`.
    ///
    /// This is the lookup for downstream consumers that only know original
    /// way nodes: an endpoint anchors the synthetic midpoint next to it.
    pub fn propagated_tags(&self, id: i64) -> Tags {
        merge(self.spans_at_anchor(id))
    }

    /// Copy propagated tags onto a node without overwriting its own tags.
    ///
    /// Returns the number of tags added. Border spans are skipped when
    /// `include_border` is false.
    pub fn apply_to_node(&self, node: &mut Node, include_border: bool) -> usize {
        let mut added = 0;
        for span in self.spans_for_node(node.id) {
            if span.border && !include_border {
                continue;
            }
            for (key, value) in &span.tags {
                if !node.tags.contains_key(key) {
                    node.tags.insert(key.clone(), value.clone());
                    added += 1;
                }
            }
        }
        added
    }

    /// [`PropagationIndex::apply_to_node`] for every resolved node of a way.
    pub fn apply_to_way_nodes(&self, way: &mut Way, include_border: bool) -> usize {
        if self.is_empty() {
            return 0;
        }
        way.nodes
            .iter_mut()
            .map(|node| self.apply_to_node(node, include_border))
            .sum()
    }

    /// Whether an id lies in the synthetic node range.
    pub const fn is_synthetic(&self, id: i64) -> bool {
        self.synthetic.contains(id)
    }

    /// Way that produced a synthetic node id.
    pub const fn synthetic_way(&self, id: i64) -> Option<i64> {
        self.synthetic.way_of(id)
    }

    fn lookup<'a>(
        &'a self,
        map: &'a HashMap<i64, Vec<usize>>,
        id: i64,
    ) -> impl Iterator<Item = &'a PropagatedSpan> + 'a {
        map.get(&id)
            .into_iter()
            .flatten()
            .filter_map(move |slot| self.spans.get(*slot))
    }
}

fn merge<'a>(spans: impl Iterator<Item = &'a PropagatedSpan>) -> Tags {
    let mut tags = Tags::new();
    for span in spans {
        for (key, value) in &span.tags {
            tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    tags
}

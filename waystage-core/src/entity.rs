//! Entity model shared by ingestion, staging and egress.
//!
//! Entities carry whichever id space they currently live in: the upstream
//! parser hands over original ids, the staging writer rewrites them to
//! internal ids in place, and everything read back from the staging store uses
//! internal ids.

use std::collections::BTreeMap;
use std::fmt;

use geo::Coord;

/// Tag map for nodes, ways and relations.
///
/// Ordered so tag blobs and rule evaluation are reproducible across runs.
pub type Tags = BTreeMap<String, String>;

/// The three OSM entity families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntityKind {
    /// A point with a location.
    Node,
    /// An ordered list of nodes.
    Way,
    /// A list of typed, role-labelled members.
    Relation,
}

impl EntityKind {
    /// Stable ordinal used in composite keys and the relation `type` column.
    pub const fn ordinal(self) -> i64 {
        match self {
            Self::Node => 0,
            Self::Way => 1,
            Self::Relation => 2,
        }
    }

    /// Inverse of [`EntityKind::ordinal`].
    pub const fn from_ordinal(ordinal: i64) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Node),
            1 => Some(Self::Way),
            2 => Some(Self::Relation),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        };
        f.write_str(name)
    }
}

/// An id qualified by its entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    /// Entity family.
    pub kind: EntityKind,
    /// Original or internal id, depending on the processing stage.
    pub id: i64,
}

impl EntityId {
    /// Construct a new qualified id.
    pub const fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// A located point.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Entity id.
    pub id: i64,
    /// WGS84 position with `x = longitude`, `y = latitude`.
    pub location: Coord<f64>,
    /// Tags attached to the node.
    pub tags: Tags,
}

impl Node {
    /// Build a node from latitude/longitude in degrees.
    pub fn new(id: i64, lat: f64, lon: f64, tags: Tags) -> Self {
        Self {
            id,
            location: Coord { x: lon, y: lat },
            tags,
        }
    }

    /// Latitude in degrees.
    pub const fn lat(&self) -> f64 {
        self.location.y
    }

    /// Longitude in degrees.
    pub const fn lon(&self) -> f64 {
        self.location.x
    }
}

/// An ordered sequence of node references.
///
/// `node_ids` is the authoritative node order. `nodes` holds the nodes that
/// could be resolved to a location, in the same order; it is empty for ways
/// handed over by a parser and may be shorter than `node_ids` when a
/// referenced node is missing from the store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Way {
    /// Entity id.
    pub id: i64,
    /// Referenced node ids in way order.
    pub node_ids: Vec<i64>,
    /// Resolved nodes in way order.
    pub nodes: Vec<Node>,
    /// Tags attached to the way.
    pub tags: Tags,
}

impl Way {
    /// Build an unresolved way from node references.
    pub fn new(id: i64, node_ids: Vec<i64>, tags: Tags) -> Self {
        Self {
            id,
            node_ids,
            nodes: Vec::new(),
            tags,
        }
    }

    /// Look up a resolved node by id.
    pub fn node(&self, id: i64) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

/// A single relation member.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationMember {
    /// Kind and id of the member.
    pub id: EntityId,
    /// Role label, possibly empty.
    pub role: String,
    /// Loaded member entity, when the relation was read with enough depth.
    pub entity: Option<Box<Entity>>,
}

impl RelationMember {
    /// Build an unloaded member reference.
    pub fn new(id: EntityId, role: impl Into<String>) -> Self {
        Self {
            id,
            role: role.into(),
            entity: None,
        }
    }
}

/// A relation with ordered members.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Relation {
    /// Entity id.
    pub id: i64,
    /// Members in relation order.
    pub members: Vec<RelationMember>,
    /// Tags attached to the relation.
    pub tags: Tags,
}

impl Relation {
    /// Build a relation from unloaded members.
    pub fn new(id: i64, members: Vec<RelationMember>, tags: Tags) -> Self {
        Self { id, members, tags }
    }
}

/// Any staged entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// A node.
    Node(Node),
    /// A way.
    Way(Way),
    /// A relation.
    Relation(Relation),
}

impl Entity {
    /// Entity family.
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Node(_) => EntityKind::Node,
            Self::Way(_) => EntityKind::Way,
            Self::Relation(_) => EntityKind::Relation,
        }
    }

    /// Bare id.
    pub const fn id(&self) -> i64 {
        match self {
            Self::Node(node) => node.id,
            Self::Way(way) => way.id,
            Self::Relation(relation) => relation.id,
        }
    }

    /// Qualified id.
    pub const fn entity_id(&self) -> EntityId {
        EntityId::new(self.kind(), self.id())
    }

    /// Tags attached to the entity.
    pub const fn tags(&self) -> &Tags {
        match self {
            Self::Node(node) => &node.tags,
            Self::Way(way) => &way.tags,
            Self::Relation(relation) => &relation.tags,
        }
    }

    /// Mutable access to the entity's tags.
    pub fn tags_mut(&mut self) -> &mut Tags {
        match self {
            Self::Node(node) => &mut node.tags,
            Self::Way(way) => &mut way.tags,
            Self::Relation(relation) => &mut relation.tags,
        }
    }
}

impl From<Node> for Entity {
    fn from(node: Node) -> Self {
        Self::Node(node)
    }
}

impl From<Way> for Entity {
    fn from(way: Way) -> Self {
        Self::Way(way)
    }
}

impl From<Relation> for Entity {
    fn from(relation: Relation) -> Self {
        Self::Relation(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(EntityKind::Node)]
    #[case(EntityKind::Way)]
    #[case(EntityKind::Relation)]
    fn ordinals_round_trip(#[case] kind: EntityKind) {
        assert_eq!(EntityKind::from_ordinal(kind.ordinal()), Some(kind));
    }

    #[rstest]
    fn rejects_unknown_ordinal() {
        assert_eq!(EntityKind::from_ordinal(3), None);
    }

    #[rstest]
    fn node_exposes_lat_lon() {
        let node = Node::new(1, 52.5, 13.4, Tags::new());
        assert_eq!(node.lat(), 52.5);
        assert_eq!(node.lon(), 13.4);
    }

    #[rstest]
    fn entity_reports_qualified_id() {
        let entity = Entity::from(Way::new(7, vec![1, 2], Tags::new()));
        assert_eq!(entity.entity_id(), EntityId::new(EntityKind::Way, 7));
        assert_eq!(entity.entity_id().to_string(), "way 7");
    }
}

//! Conversion of decoded PBF elements into staging entities.
use log::warn;
use osmpbf::{Element, RelMemberType};
use waystage_core::{Entity, EntityId, EntityKind, Node, Relation, RelationMember, Tags, Way};

pub(super) fn collect_tags<'a, T>(tags: T) -> Tags
where
    T: IntoIterator<Item = (&'a str, &'a str)>,
{
    tags.into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

/// Build the entity for one element, keeping original ids.
pub(super) fn to_entity(element: &Element<'_>) -> Entity {
    match element {
        Element::Node(node) => {
            Node::new(node.id(), node.lat(), node.lon(), collect_tags(node.tags())).into()
        }
        Element::DenseNode(node) => {
            Node::new(node.id(), node.lat(), node.lon(), collect_tags(node.tags())).into()
        }
        Element::Way(way) => {
            Way::new(way.id(), way.refs().collect(), collect_tags(way.tags())).into()
        }
        Element::Relation(relation) => {
            let members = relation
                .members()
                .map(|member| {
                    let role = member.role().unwrap_or_else(|err| {
                        warn!(
                            "relation {} has an undecodable member role: {err}",
                            relation.id()
                        );
                        ""
                    });
                    RelationMember::new(
                        EntityId::new(member_kind(member.member_type), member.member_id),
                        role,
                    )
                })
                .collect();
            Relation::new(relation.id(), members, collect_tags(relation.tags())).into()
        }
    }
}

const fn member_kind(member_type: RelMemberType) -> EntityKind {
    match member_type {
        RelMemberType::Node => EntityKind::Node,
        RelMemberType::Way => EntityKind::Way,
        RelMemberType::Relation => EntityKind::Relation,
    }
}

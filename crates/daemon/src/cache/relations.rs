// Static relationship graph between entity kinds.

use crate::store::EntityKind;

/// How a child entity refers to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// `child[child_field] == parent[parent_field]`. `child_field` may be a
    /// dotted path into the child record.
    Field { parent_field: &'static str, child_field: &'static str },
    /// Every child entry in the partition depends on any parent change.
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub parent: EntityKind,
    pub child: EntityKind,
    pub link: Link,
    /// A change to a child also purges the parent's entries that list it.
    pub upward: bool,
}

impl Relationship {
    pub const fn field(parent: EntityKind, child: EntityKind, parent_field: &'static str, child_field: &'static str) -> Self {
        Self { parent, child, link: Link::Field { parent_field, child_field }, upward: false }
    }

    pub const fn partition_wide(parent: EntityKind, child: EntityKind) -> Self {
        Self { parent, child, link: Link::Partition, upward: false }
    }

    pub const fn with_upward(mut self, upward: bool) -> Self {
        self.upward = upward;
        self
    }
}

pub const DEFAULT_RELATIONSHIPS: [Relationship; 6] = [
    Relationship::field(EntityKind::Setting, EntityKind::Module, "setting_id", "classes.setting_id"),
    Relationship::field(EntityKind::Module, EntityKind::Function, "module_name", "module_name").with_upward(true),
    Relationship::field(EntityKind::Function, EntityKind::FunctionCall, "name", "name"),
    Relationship::partition_wide(EntityKind::Setting, EntityKind::Configuration),
    Relationship::partition_wide(EntityKind::Module, EntityKind::Configuration),
    Relationship::partition_wide(EntityKind::Function, EntityKind::Configuration),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipGraph {
    relationships: Vec<Relationship>,
}

impl Default for RelationshipGraph {
    fn default() -> Self {
        Self::new(DEFAULT_RELATIONSHIPS.to_vec())
    }
}

impl RelationshipGraph {
    pub fn new(relationships: Vec<Relationship>) -> Self {
        Self { relationships }
    }

    /// Toggle upward invalidation on an existing edge. Returns `false` when
    /// the graph has no such edge.
    pub fn set_upward(&mut self, parent: EntityKind, child: EntityKind, upward: bool) -> bool {
        let mut found = false;
        for rel in self.relationships.iter_mut().filter(|r| r.parent == parent && r.child == child) {
            rel.upward = upward;
            found = true;
        }
        found
    }

    pub fn children_of(&self, kind: EntityKind) -> impl Iterator<Item = &Relationship> {
        self.relationships.iter().filter(move |r| r.parent == kind)
    }

    pub fn parents_of(&self, kind: EntityKind) -> impl Iterator<Item = &Relationship> {
        self.relationships.iter().filter(move |r| r.child == kind)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_graph_links_module_to_functions_to_calls() {
        let graph = RelationshipGraph::default();

        let from_module: Vec<_> = graph.children_of(EntityKind::Module).map(|r| r.child).collect();
        assert_eq!(from_module, vec![EntityKind::Function, EntityKind::Configuration]);

        let from_function: Vec<_> = graph.children_of(EntityKind::Function).map(|r| r.child).collect();
        assert_eq!(from_function, vec![EntityKind::FunctionCall, EntityKind::Configuration]);

        assert_eq!(graph.children_of(EntityKind::FunctionCall).count(), 0);
    }

    #[test]
    fn upward_is_only_on_module_functions_by_default() {
        let graph = RelationshipGraph::default();
        let upward: Vec<_> = graph.relationships().iter().filter(|r| r.upward).map(|r| (r.parent, r.child)).collect();
        assert_eq!(upward, vec![(EntityKind::Module, EntityKind::Function)]);
    }

    #[test]
    fn set_upward_toggles_existing_edges_only() {
        let mut graph = RelationshipGraph::default();
        assert!(graph.set_upward(EntityKind::Function, EntityKind::FunctionCall, true));
        assert!(graph.parents_of(EntityKind::FunctionCall).all(|r| r.upward));
        assert!(!graph.set_upward(EntityKind::FunctionCall, EntityKind::Module, true));
    }
}

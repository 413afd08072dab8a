//! Local graph replica that actions execute against
//!
//! The dispatcher only needs the [`Scene`] contract; [`GraphScene`] is the
//! in-memory implementation used by the runtime, harness and tests.

use crate::effect::ApplyError;
use gsync_action::{EdgeSnapshot, NodeSnapshot, ObjectId};
use std::collections::{BTreeMap, BTreeSet};

/// Mutable view of a client's graph
pub trait Scene: Send {
    /// Node by id
    fn node(&self, id: &ObjectId) -> Option<&NodeSnapshot>;

    /// Mutable node by id
    fn node_mut(&mut self, id: &ObjectId) -> Option<&mut NodeSnapshot>;

    /// Add a node
    ///
    /// # Errors
    /// `ApplyError::NodeExists` if the id is taken
    fn insert_node(&mut self, id: ObjectId, node: NodeSnapshot) -> Result<(), ApplyError>;

    /// Remove a node, returning its last state
    fn remove_node(&mut self, id: &ObjectId) -> Option<NodeSnapshot>;

    /// Edge by id
    fn edge(&self, id: &ObjectId) -> Option<&EdgeSnapshot>;

    /// Add an edge between existing nodes
    ///
    /// # Errors
    /// `ApplyError::EdgeExists` or `ApplyError::MissingEndpoint`
    fn insert_edge(&mut self, id: ObjectId, edge: EdgeSnapshot) -> Result<(), ApplyError>;

    /// Remove an edge, returning its last state
    fn remove_edge(&mut self, id: &ObjectId) -> Option<EdgeSnapshot>;

    /// Ids of edges touching `node`
    fn incident_edges(&self, node: &ObjectId) -> Vec<ObjectId>;

    /// Whether `id` is highlighted
    fn is_hovered(&self, id: &ObjectId) -> bool;

    /// Set hover highlight; returns the previous state
    fn set_hovered(&mut self, id: &ObjectId, hovered: bool) -> bool;
}

/// In-memory graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphScene {
    nodes: BTreeMap<ObjectId, NodeSnapshot>,
    edges: BTreeMap<ObjectId, EdgeSnapshot>,
    hovered: BTreeSet<ObjectId>,
}

impl GraphScene {
    /// Create empty scene
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder helper for fixtures
    #[must_use]
    pub fn with_node(mut self, id: impl Into<ObjectId>, node: NodeSnapshot) -> Self {
        self.nodes.insert(id.into(), node);
        self
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = (&ObjectId, &NodeSnapshot)> {
        self.nodes.iter()
    }

    /// Edges in id order
    pub fn edges(&self) -> impl Iterator<Item = (&ObjectId, &EdgeSnapshot)> {
        self.edges.iter()
    }

    /// Same nodes and edges; hover state is ignored
    #[must_use]
    pub fn same_structure(&self, other: &GraphScene) -> bool {
        self.nodes == other.nodes && self.edges == other.edges
    }
}

impl Scene for GraphScene {
    fn node(&self, id: &ObjectId) -> Option<&NodeSnapshot> {
        self.nodes.get(id)
    }

    fn node_mut(&mut self, id: &ObjectId) -> Option<&mut NodeSnapshot> {
        self.nodes.get_mut(id)
    }

    fn insert_node(&mut self, id: ObjectId, node: NodeSnapshot) -> Result<(), ApplyError> {
        if self.nodes.contains_key(&id) {
            return Err(ApplyError::NodeExists(id));
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    fn remove_node(&mut self, id: &ObjectId) -> Option<NodeSnapshot> {
        self.hovered.remove(id);
        self.nodes.remove(id)
    }

    fn edge(&self, id: &ObjectId) -> Option<&EdgeSnapshot> {
        self.edges.get(id)
    }

    fn insert_edge(&mut self, id: ObjectId, edge: EdgeSnapshot) -> Result<(), ApplyError> {
        if self.edges.contains_key(&id) {
            return Err(ApplyError::EdgeExists(id));
        }
        for endpoint in [&edge.source, &edge.target] {
            if !self.nodes.contains_key(endpoint) {
                return Err(ApplyError::MissingEndpoint {
                    edge: id,
                    node: endpoint.clone(),
                });
            }
        }
        self.edges.insert(id, edge);
        Ok(())
    }

    fn remove_edge(&mut self, id: &ObjectId) -> Option<EdgeSnapshot> {
        self.hovered.remove(id);
        self.edges.remove(id)
    }

    fn incident_edges(&self, node: &ObjectId) -> Vec<ObjectId> {
        self.edges
            .iter()
            .filter(|(_, e)| &e.source == node || &e.target == node)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn is_hovered(&self, id: &ObjectId) -> bool {
        self.hovered.contains(id)
    }

    fn set_hovered(&mut self, id: &ObjectId, hovered: bool) -> bool {
        if hovered {
            !self.hovered.insert(id.clone())
        } else {
            self.hovered.remove(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsync_action::Vec3;

    fn node(name: &str) -> NodeSnapshot {
        NodeSnapshot::new("Class", name, Vec3::ZERO)
    }

    #[test]
    fn edge_needs_both_endpoints() {
        let mut scene = GraphScene::new().with_node("A", node("A"));
        let edge = EdgeSnapshot {
            source: ObjectId::new("A"),
            target: ObjectId::new("B"),
            edge_type: "calls".into(),
        };
        let err = scene.insert_edge(ObjectId::new("E1"), edge).unwrap_err();
        assert!(matches!(err, ApplyError::MissingEndpoint { .. }));
    }

    #[test]
    fn incident_edges_found_both_directions() {
        let mut scene = GraphScene::new()
            .with_node("A", node("A"))
            .with_node("B", node("B"));
        for (id, s, t) in [("E1", "A", "B"), ("E2", "B", "A")] {
            scene
                .insert_edge(
                    ObjectId::new(id),
                    EdgeSnapshot {
                        source: ObjectId::new(s),
                        target: ObjectId::new(t),
                        edge_type: "calls".into(),
                    },
                )
                .unwrap();
        }
        assert_eq!(scene.incident_edges(&ObjectId::new("A")).len(), 2);
    }

    #[test]
    fn hover_reports_previous_state() {
        let mut scene = GraphScene::new().with_node("A", node("A"));
        let id = ObjectId::new("A");
        assert!(!scene.set_hovered(&id, true));
        assert!(scene.set_hovered(&id, true));
        assert!(scene.set_hovered(&id, false));
        assert!(!scene.is_hovered(&id));
    }

    #[test]
    fn structure_ignores_hover() {
        let a = GraphScene::new().with_node("A", node("A"));
        let mut b = a.clone();
        b.set_hovered(&ObjectId::new("A"), true);
        assert!(a.same_structure(&b));
        assert_ne!(a, b);
    }
}

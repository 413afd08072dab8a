//! Client-side execution of action kinds
//!
//! [`ClientEffect::execute_on_client`] applies the visible mutation and
//! hands back the compensating [`Undo`], or `None` when the change cannot
//! be reversed locally. [`ClientEffect::footprint`] names the objects an
//! application reads or writes, so independent pending changes can be left
//! in place while a conflicting one is unwound.

use crate::scene::Scene;
use gsync_action::kind::{
    AddEdge, AddNode, DeleteEdge, DeleteNode, Hover, MoveNode, RenameNode, ResizeNode,
    ReviveNode, RotateNode,
};
use gsync_action::{ActionKind, ObjectId};
use std::collections::BTreeSet;
use std::fmt;

/// Scene application errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Node not in scene
    #[error("unknown node {0}")]
    UnknownNode(ObjectId),

    /// Edge not in scene
    #[error("unknown edge {0}")]
    UnknownEdge(ObjectId),

    /// Node id already taken
    #[error("node {0} already exists")]
    NodeExists(ObjectId),

    /// Edge id already taken
    #[error("edge {0} already exists")]
    EdgeExists(ObjectId),

    /// Edge endpoint not in scene
    #[error("edge {edge} references missing node {node}")]
    MissingEndpoint { edge: ObjectId, node: ObjectId },

    /// Node still has edges attached
    #[error("node {0} still has edges")]
    NodeHasEdges(ObjectId),
}

type UndoFn = Box<dyn FnOnce(&mut dyn Scene) -> Result<(), ApplyError> + Send>;

/// Compensating operation restoring the pre-application state
pub struct Undo(UndoFn);

impl Undo {
    /// Wrap a compensating closure
    pub fn new(f: impl FnOnce(&mut dyn Scene) -> Result<(), ApplyError> + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Run against the scene the action was applied to
    ///
    /// # Errors
    /// Whatever the scene reports when the state can no longer be restored
    pub fn run(self, scene: &mut dyn Scene) -> Result<(), ApplyError> {
        (self.0)(scene)
    }
}

impl fmt::Debug for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Undo(..)")
    }
}

/// Visible mutation of one action kind
pub trait ClientEffect {
    /// Apply to `scene`, returning the undo if the change is reversible
    ///
    /// # Errors
    /// `ApplyError` if the scene does not hold what the action expects; the
    /// scene is left unchanged in that case
    fn execute_on_client(
        &self,
        target: &ObjectId,
        scene: &mut dyn Scene,
    ) -> Result<Option<Undo>, ApplyError>;

    /// Objects the application touches when run against `scene` now
    fn footprint(&self, target: &ObjectId, scene: &dyn Scene) -> BTreeSet<ObjectId>;
}

impl ClientEffect for ActionKind {
    fn execute_on_client(
        &self,
        target: &ObjectId,
        scene: &mut dyn Scene,
    ) -> Result<Option<Undo>, ApplyError> {
        let id = target.clone();
        match self {
            Self::AddNode(AddNode { node }) | Self::ReviveNode(ReviveNode { node }) => {
                scene.insert_node(id.clone(), node.clone())?;
                Ok(Some(Undo::new(move |scene| {
                    if !scene.incident_edges(&id).is_empty() {
                        return Err(ApplyError::NodeHasEdges(id));
                    }
                    scene
                        .remove_node(&id)
                        .map(drop)
                        .ok_or(ApplyError::UnknownNode(id))
                })))
            }
            Self::MoveNode(MoveNode { position }) => {
                let node = scene
                    .node_mut(&id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                let before = std::mem::replace(&mut node.position, *position);
                Ok(Some(Undo::new(move |scene| {
                    let node = scene
                        .node_mut(&id)
                        .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                    node.position = before;
                    Ok(())
                })))
            }
            Self::ResizeNode(ResizeNode { scale }) => {
                let node = scene
                    .node_mut(&id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                let before = std::mem::replace(&mut node.scale, *scale);
                Ok(Some(Undo::new(move |scene| {
                    let node = scene
                        .node_mut(&id)
                        .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                    node.scale = before;
                    Ok(())
                })))
            }
            Self::RotateNode(RotateNode { degrees }) => {
                let node = scene
                    .node_mut(&id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                let before = std::mem::replace(&mut node.rotation, *degrees);
                Ok(Some(Undo::new(move |scene| {
                    let node = scene
                        .node_mut(&id)
                        .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                    node.rotation = before;
                    Ok(())
                })))
            }
            Self::RenameNode(RenameNode { name }) => {
                let node = scene
                    .node_mut(&id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                let before = std::mem::replace(&mut node.name, name.clone());
                Ok(Some(Undo::new(move |scene| {
                    let node = scene
                        .node_mut(&id)
                        .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                    node.name = before;
                    Ok(())
                })))
            }
            Self::DeleteNode(DeleteNode {}) => {
                if scene.node(&id).is_none() {
                    return Err(ApplyError::UnknownNode(id));
                }
                let hovered = scene.is_hovered(&id);
                let incident = scene.incident_edges(&id);
                for edge in &incident {
                    scene.remove_edge(edge);
                }
                let removed = scene
                    .remove_node(&id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                if !incident.is_empty() {
                    // Cascaded removal is not reversed locally
                    return Ok(None);
                }
                Ok(Some(Undo::new(move |scene| {
                    scene.insert_node(id.clone(), removed)?;
                    scene.set_hovered(&id, hovered);
                    Ok(())
                })))
            }
            Self::AddEdge(AddEdge { edge }) => {
                scene.insert_edge(id.clone(), edge.clone())?;
                Ok(Some(Undo::new(move |scene| {
                    scene
                        .remove_edge(&id)
                        .map(drop)
                        .ok_or(ApplyError::UnknownEdge(id))
                })))
            }
            Self::DeleteEdge(DeleteEdge {}) => {
                let hovered = scene.is_hovered(&id);
                let removed = scene
                    .remove_edge(&id)
                    .ok_or_else(|| ApplyError::UnknownEdge(id.clone()))?;
                Ok(Some(Undo::new(move |scene| {
                    scene.insert_edge(id.clone(), removed)?;
                    scene.set_hovered(&id, hovered);
                    Ok(())
                })))
            }
            Self::Hover(Hover { hovered }) => {
                let before = scene.set_hovered(&id, *hovered);
                Ok(Some(Undo::new(move |scene| {
                    scene.set_hovered(&id, before);
                    Ok(())
                })))
            }
        }
    }

    fn footprint(&self, target: &ObjectId, scene: &dyn Scene) -> BTreeSet<ObjectId> {
        let mut touched = BTreeSet::from([target.clone()]);
        match self {
            Self::AddEdge(AddEdge { edge }) => {
                touched.insert(edge.source.clone());
                touched.insert(edge.target.clone());
            }
            Self::DeleteEdge(_) => {
                if let Some(edge) = scene.edge(target) {
                    touched.insert(edge.source.clone());
                    touched.insert(edge.target.clone());
                }
            }
            Self::DeleteNode(_) | Self::AddNode(_) | Self::ReviveNode(_) => {
                touched.extend(scene.incident_edges(target));
            }
            _ => {}
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::GraphScene;
    use gsync_action::{EdgeSnapshot, NodeSnapshot, Vec3};
    use pretty_assertions::assert_eq;

    fn scene() -> GraphScene {
        GraphScene::new()
            .with_node("A", NodeSnapshot::new("Class", "A", Vec3::ZERO))
            .with_node("B", NodeSnapshot::new("Class", "B", Vec3::ONE))
    }

    fn undo_restores(kind: ActionKind, target: &str) {
        undo_restores_over(scene(), kind, target);
    }

    fn undo_restores_over(mut scene: GraphScene, kind: ActionKind, target: &str) {
        let before = scene.clone();
        let undo = kind
            .execute_on_client(&ObjectId::new(target), &mut scene)
            .unwrap()
            .expect("reversible");
        assert_ne!(scene, before);
        undo.run(&mut scene).unwrap();
        assert_eq!(scene, before);
    }

    #[test]
    fn move_undo_restores_position() {
        undo_restores(
            ActionKind::MoveNode(MoveNode {
                position: Vec3::new(4.0, 5.0, 6.0),
            }),
            "A",
        );
    }

    #[test]
    fn rename_undo_restores_name() {
        undo_restores(
            ActionKind::RenameNode(RenameNode {
                name: "Renamed".into(),
            }),
            "A",
        );
    }

    #[test]
    fn rotate_and_resize_undo() {
        undo_restores(ActionKind::RotateNode(RotateNode { degrees: 45.0 }), "A");
        undo_restores(
            ActionKind::ResizeNode(ResizeNode {
                scale: Vec3::new(2.0, 2.0, 2.0),
            }),
            "B",
        );
    }

    #[test]
    fn add_and_delete_lone_node_undo() {
        undo_restores(
            ActionKind::AddNode(AddNode {
                node: NodeSnapshot::new("Class", "C", Vec3::ZERO),
            }),
            "C",
        );
        undo_restores(ActionKind::DeleteNode(DeleteNode {}), "A");
    }

    #[test]
    fn edge_add_and_delete_undo() {
        let edge = EdgeSnapshot {
            source: ObjectId::new("A"),
            target: ObjectId::new("B"),
            edge_type: "calls".into(),
        };
        undo_restores(ActionKind::AddEdge(AddEdge { edge: edge.clone() }), "E1");

        let mut scene = scene();
        scene.insert_edge(ObjectId::new("E1"), edge).unwrap();
        let before = scene.clone();
        let undo = ActionKind::DeleteEdge(DeleteEdge {})
            .execute_on_client(&ObjectId::new("E1"), &mut scene)
            .unwrap()
            .unwrap();
        undo.run(&mut scene).unwrap();
        assert_eq!(scene, before);
    }

    #[test]
    fn cascaded_delete_has_no_undo() {
        let mut scene = scene();
        scene
            .insert_edge(
                ObjectId::new("E1"),
                EdgeSnapshot {
                    source: ObjectId::new("A"),
                    target: ObjectId::new("B"),
                    edge_type: "calls".into(),
                },
            )
            .unwrap();
        let undo = ActionKind::DeleteNode(DeleteNode {})
            .execute_on_client(&ObjectId::new("A"), &mut scene)
            .unwrap();
        assert!(undo.is_none());
        assert!(scene.edge(&ObjectId::new("E1")).is_none());
        assert!(scene.node(&ObjectId::new("A")).is_none());
    }

    #[test]
    fn failed_apply_leaves_scene_unchanged() {
        let mut scene = scene();
        let before = scene.clone();
        let err = ActionKind::MoveNode(MoveNode {
            position: Vec3::ONE,
        })
        .execute_on_client(&ObjectId::new("missing"), &mut scene)
        .unwrap_err();
        assert_eq!(err, ApplyError::UnknownNode(ObjectId::new("missing")));
        assert_eq!(scene, before);
    }

    #[test]
    fn hover_undo_restores_highlight() {
        undo_restores(ActionKind::Hover(Hover { hovered: true }), "A");
    }

    #[test]
    fn delete_undo_restores_hover() {
        let mut hovered = scene();
        hovered.set_hovered(&ObjectId::new("A"), true);
        undo_restores_over(hovered, ActionKind::DeleteNode(DeleteNode {}), "A");

        let mut with_edge = scene();
        with_edge
            .insert_edge(
                ObjectId::new("E1"),
                EdgeSnapshot {
                    source: ObjectId::new("A"),
                    target: ObjectId::new("B"),
                    edge_type: "calls".into(),
                },
            )
            .unwrap();
        with_edge.set_hovered(&ObjectId::new("E1"), true);
        undo_restores_over(with_edge, ActionKind::DeleteEdge(DeleteEdge {}), "E1");
    }

    #[test]
    fn add_undo_refuses_to_strand_edges() {
        let mut scene = scene();
        let undo = ActionKind::AddNode(AddNode {
            node: NodeSnapshot::new("Class", "C", Vec3::ZERO),
        })
        .execute_on_client(&ObjectId::new("C"), &mut scene)
        .unwrap()
        .unwrap();
        scene
            .insert_edge(
                ObjectId::new("E1"),
                EdgeSnapshot {
                    source: ObjectId::new("A"),
                    target: ObjectId::new("C"),
                    edge_type: "calls".into(),
                },
            )
            .unwrap();

        let err = undo.run(&mut scene).unwrap_err();
        assert_eq!(err, ApplyError::NodeHasEdges(ObjectId::new("C")));
        assert!(scene.node(&ObjectId::new("C")).is_some());
    }

    #[test]
    fn footprint_covers_endpoints_and_incident_edges() {
        let mut scene = scene();
        let edge = EdgeSnapshot {
            source: ObjectId::new("A"),
            target: ObjectId::new("B"),
            edge_type: "calls".into(),
        };
        let ids = |names: &[&str]| names.iter().map(|n| ObjectId::new(*n)).collect::<BTreeSet<_>>();

        let add = ActionKind::AddEdge(AddEdge { edge: edge.clone() });
        assert_eq!(add.footprint(&ObjectId::new("E1"), &scene), ids(&["A", "B", "E1"]));

        scene.insert_edge(ObjectId::new("E1"), edge).unwrap();
        let delete = ActionKind::DeleteNode(DeleteNode {});
        assert_eq!(delete.footprint(&ObjectId::new("B"), &scene), ids(&["B", "E1"]));
        let unlink = ActionKind::DeleteEdge(DeleteEdge {});
        assert_eq!(unlink.footprint(&ObjectId::new("E1"), &scene), ids(&["A", "B", "E1"]));

        let rename = ActionKind::RenameNode(RenameNode { name: "x".into() });
        assert_eq!(rename.footprint(&ObjectId::new("A"), &scene), ids(&["A"]));
    }
}

//! Closed set of replicated graph action kinds
//!
//! Each kind is a plain-value body. The visual semantics live with the
//! client scene; this module only describes the payloads, their tags and
//! how they affect object versions.

use crate::error::{ActionError, CodecError};
use crate::id::ObjectId;
use crate::version::VersionEffect;
use serde::{Deserialize, Serialize};

/// Wire tags of the built-in kinds
pub mod tags {
    /// [`super::ActionKind::AddNode`]
    pub const ADD_NODE: &str = "add_node";
    /// [`super::ActionKind::MoveNode`]
    pub const MOVE_NODE: &str = "move_node";
    /// [`super::ActionKind::ResizeNode`]
    pub const RESIZE_NODE: &str = "resize_node";
    /// [`super::ActionKind::RotateNode`]
    pub const ROTATE_NODE: &str = "rotate_node";
    /// [`super::ActionKind::RenameNode`]
    pub const RENAME_NODE: &str = "rename_node";
    /// [`super::ActionKind::DeleteNode`]
    pub const DELETE_NODE: &str = "delete_node";
    /// [`super::ActionKind::ReviveNode`]
    pub const REVIVE_NODE: &str = "revive_node";
    /// [`super::ActionKind::AddEdge`]
    pub const ADD_EDGE: &str = "add_edge";
    /// [`super::ActionKind::DeleteEdge`]
    pub const DELETE_EDGE: &str = "delete_edge";
    /// [`super::ActionKind::Hover`]
    pub const HOVER: &str = "hover";
}

/// Plain 3D vector
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Origin
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    /// Unit scale
    pub const ONE: Self = Self::new(1.0, 1.0, 1.0);

    /// Create vector
    #[inline]
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// All components finite (JSON cannot carry NaN/inf)
    #[inline]
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Full visible state of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_type: String,
    pub name: String,
    pub position: Vec3,
    pub scale: Vec3,
    /// Rotation around the up axis, degrees
    pub rotation: f32,
}

impl NodeSnapshot {
    /// Node with unit scale and no rotation
    #[must_use]
    pub fn new(node_type: impl Into<String>, name: impl Into<String>, position: Vec3) -> Self {
        Self {
            node_type: node_type.into(),
            name: name.into(),
            position,
            scale: Vec3::ONE,
            rotation: 0.0,
        }
    }
}

/// Full state of an edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub source: ObjectId,
    pub target: ObjectId,
    pub edge_type: String,
}

/// Create a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNode {
    pub node: NodeSnapshot,
}

/// Move a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveNode {
    pub position: Vec3,
}

/// Scale a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeNode {
    pub scale: Vec3,
}

/// Rotate a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotateNode {
    pub degrees: f32,
}

/// Rename a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameNode {
    pub name: String,
}

/// Delete a node; incident edges go with it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteNode {}

/// Re-create a deleted node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviveNode {
    pub node: NodeSnapshot,
}

/// Create an edge between two existing nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddEdge {
    pub edge: EdgeSnapshot,
}

/// Delete an edge
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteEdge {}

/// Ephemeral hover highlight; never versioned, never replayed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hover {
    pub hovered: bool,
}

/// Closed union of replicated action kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    AddNode(AddNode),
    MoveNode(MoveNode),
    ResizeNode(ResizeNode),
    RotateNode(RotateNode),
    RenameNode(RenameNode),
    DeleteNode(DeleteNode),
    ReviveNode(ReviveNode),
    AddEdge(AddEdge),
    DeleteEdge(DeleteEdge),
    Hover(Hover),
}

impl ActionKind {
    /// Wire tag selecting the decoder
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AddNode(_) => tags::ADD_NODE,
            Self::MoveNode(_) => tags::MOVE_NODE,
            Self::ResizeNode(_) => tags::RESIZE_NODE,
            Self::RotateNode(_) => tags::ROTATE_NODE,
            Self::RenameNode(_) => tags::RENAME_NODE,
            Self::DeleteNode(_) => tags::DELETE_NODE,
            Self::ReviveNode(_) => tags::REVIVE_NODE,
            Self::AddEdge(_) => tags::ADD_EDGE,
            Self::DeleteEdge(_) => tags::DELETE_EDGE,
            Self::Hover(_) => tags::HOVER,
        }
    }

    /// Human-readable category used in rollback notifications
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::AddNode(_) => "Add node",
            Self::MoveNode(_) => "Move",
            Self::ResizeNode(_) => "Resize",
            Self::RotateNode(_) => "Rotate",
            Self::RenameNode(_) => "Rename",
            Self::DeleteNode(_) => "Delete node",
            Self::ReviveNode(_) => "Restore node",
            Self::AddEdge(_) => "Add edge",
            Self::DeleteEdge(_) => "Delete edge",
            Self::Hover(_) => "Hover",
        }
    }

    /// Effect on the target version when committed
    #[must_use]
    pub fn version_effect(&self) -> VersionEffect {
        match self {
            Self::DeleteNode(_) | Self::DeleteEdge(_) => VersionEffect::Delete,
            Self::ReviveNode(_) => VersionEffect::Revive,
            _ => VersionEffect::Bump,
        }
    }

    /// Whether the server checks versions for this kind
    #[inline]
    #[must_use]
    pub fn uses_versioning(&self) -> bool {
        !matches!(self, Self::Hover(_))
    }

    /// Whether the kind is ephemeral (no replay, no gap recovery)
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Hover(_))
    }

    /// Check that the payload is made of replicable plain values
    ///
    /// # Errors
    /// `ActionError::NotReplicable` naming the offending field
    pub fn validate(&self) -> Result<(), ActionError> {
        let tag = self.tag();
        match self {
            Self::AddNode(AddNode { node }) | Self::ReviveNode(ReviveNode { node }) => {
                validate_node(tag, node)
            }
            Self::MoveNode(MoveNode { position }) if !position.is_finite() => {
                Err(ActionError::not_replicable(tag, "position is not finite"))
            }
            Self::ResizeNode(ResizeNode { scale }) if !scale.is_finite() => {
                Err(ActionError::not_replicable(tag, "scale is not finite"))
            }
            Self::RotateNode(RotateNode { degrees }) if !degrees.is_finite() => {
                Err(ActionError::not_replicable(tag, "rotation is not finite"))
            }
            Self::RenameNode(RenameNode { name }) if name.trim().is_empty() => {
                Err(ActionError::not_replicable(tag, "name is empty"))
            }
            Self::AddEdge(AddEdge { edge }) if edge.source.is_empty() || edge.target.is_empty() => {
                Err(ActionError::not_replicable(tag, "edge endpoint is empty"))
            }
            _ => Ok(()),
        }
    }

    /// Encode the body (without tag)
    ///
    /// # Errors
    /// JSON serialization failure
    pub fn body(&self) -> Result<serde_json::Value, CodecError> {
        let value = match self {
            Self::AddNode(b) => serde_json::to_value(b)?,
            Self::MoveNode(b) => serde_json::to_value(b)?,
            Self::ResizeNode(b) => serde_json::to_value(b)?,
            Self::RotateNode(b) => serde_json::to_value(b)?,
            Self::RenameNode(b) => serde_json::to_value(b)?,
            Self::DeleteNode(b) => serde_json::to_value(b)?,
            Self::ReviveNode(b) => serde_json::to_value(b)?,
            Self::AddEdge(b) => serde_json::to_value(b)?,
            Self::DeleteEdge(b) => serde_json::to_value(b)?,
            Self::Hover(b) => serde_json::to_value(b)?,
        };
        Ok(value)
    }
}

fn validate_node(tag: &'static str, node: &NodeSnapshot) -> Result<(), ActionError> {
    if node.name.trim().is_empty() {
        return Err(ActionError::not_replicable(tag, "node name is empty"));
    }
    if !node.position.is_finite() || !node.scale.is_finite() || !node.rotation.is_finite() {
        return Err(ActionError::not_replicable(tag, "node geometry is not finite"));
    }
    Ok(())
}

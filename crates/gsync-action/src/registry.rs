//! Tag → decoder registry for action kinds
//!
//! Provides [`KindRegistry`], the explicit table the codec consults to turn
//! a `{kind, body}` pair back into an [`ActionKind`].

use crate::action::{Action, WireAction};
use crate::error::CodecError;
use crate::kind::{self, tags, ActionKind};
use std::collections::HashMap;

/// Decoder for one kind body
pub type KindDecoder = fn(serde_json::Value) -> Result<ActionKind, serde_json::Error>;

/// Registry of decodable action kinds
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    decoders: HashMap<String, KindDecoder>,
}

impl KindRegistry {
    /// Create new empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Create registry with all built-in kinds
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(tags::ADD_NODE, |v| {
            serde_json::from_value(v).map(ActionKind::AddNode)
        });
        registry.register(tags::MOVE_NODE, |v| {
            serde_json::from_value(v).map(ActionKind::MoveNode)
        });
        registry.register(tags::RESIZE_NODE, |v| {
            serde_json::from_value(v).map(ActionKind::ResizeNode)
        });
        registry.register(tags::ROTATE_NODE, |v| {
            serde_json::from_value(v).map(ActionKind::RotateNode)
        });
        registry.register(tags::RENAME_NODE, |v| {
            serde_json::from_value(v).map(ActionKind::RenameNode)
        });
        registry.register(tags::DELETE_NODE, |v| {
            serde_json::from_value::<kind::DeleteNode>(v).map(ActionKind::DeleteNode)
        });
        registry.register(tags::REVIVE_NODE, |v| {
            serde_json::from_value(v).map(ActionKind::ReviveNode)
        });
        registry.register(tags::ADD_EDGE, |v| {
            serde_json::from_value(v).map(ActionKind::AddEdge)
        });
        registry.register(tags::DELETE_EDGE, |v| {
            serde_json::from_value::<kind::DeleteEdge>(v).map(ActionKind::DeleteEdge)
        });
        registry.register(tags::HOVER, |v| {
            serde_json::from_value(v).map(ActionKind::Hover)
        });
        registry
    }

    /// Register (or replace) the decoder for `tag`
    pub fn register(&mut self, tag: &str, decoder: KindDecoder) {
        self.decoders.insert(tag.to_string(), decoder);
    }

    /// Remove a decoder
    #[inline]
    pub fn remove(&mut self, tag: &str) -> bool {
        self.decoders.remove(tag).is_some()
    }

    /// Check if tag is decodable
    #[inline]
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Registered tags, sorted
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Number of registered kinds
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode a kind body selected by `tag`
    ///
    /// # Errors
    /// - `CodecError::UnknownTag` if no decoder is registered
    /// - `CodecError::MalformedBody` if the body does not fit the decoder
    pub fn decode(&self, tag: &str, body: serde_json::Value) -> Result<ActionKind, CodecError> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| CodecError::UnknownTag(tag.to_string()))?;
        decoder(body).map_err(|source| CodecError::MalformedBody {
            tag: tag.to_string(),
            source,
        })
    }

    /// Decode a full wire action
    ///
    /// # Errors
    /// Same as [`Self::decode`], plus `CodecError::EmptyTarget`
    pub fn decode_action(&self, mut wire: WireAction) -> Result<Action, CodecError> {
        let body = std::mem::take(&mut wire.body);
        let kind = self.decode(&wire.kind, body)?;
        Action::from_wire_parts(wire, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ClientId;
    use crate::kind::{MoveNode, Vec3};
    use crate::version::ObjectVersion;
    use pretty_assertions::assert_eq;

    #[test]
    fn registry_new_empty() {
        let registry = KindRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn registry_with_defaults_covers_all_kinds() {
        let registry = KindRegistry::with_defaults();
        assert_eq!(registry.len(), 10);
        for tag in [
            tags::ADD_NODE,
            tags::MOVE_NODE,
            tags::RESIZE_NODE,
            tags::ROTATE_NODE,
            tags::RENAME_NODE,
            tags::DELETE_NODE,
            tags::REVIVE_NODE,
            tags::ADD_EDGE,
            tags::DELETE_EDGE,
            tags::HOVER,
        ] {
            assert!(registry.contains(tag), "missing {tag}");
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = KindRegistry::with_defaults();
        let err = registry
            .decode("teleport", serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(t) if t == "teleport"));
    }

    #[test]
    fn removed_tag_no_longer_decodes() {
        let mut registry = KindRegistry::with_defaults();
        assert!(registry.remove(tags::HOVER));
        assert!(registry
            .decode(tags::HOVER, serde_json::json!({ "hovered": true }))
            .is_err());
    }

    #[test]
    fn malformed_body_names_tag() {
        let registry = KindRegistry::with_defaults();
        let err = registry
            .decode(tags::MOVE_NODE, serde_json::json!({ "degrees": 3 }))
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedBody { tag, .. } if tag == tags::MOVE_NODE));
    }

    #[test]
    fn wire_action_keeps_concurrency_fields() {
        let registry = KindRegistry::with_defaults();
        let kind = ActionKind::MoveNode(MoveNode {
            position: Vec3::new(1.0, 2.0, 3.0),
        });
        let mut action = Action::builder(kind, "N1", ClientId(4))
            .with_recipients([ClientId(5)])
            .build()
            .unwrap();
        action.assign_network_version(8);
        action.stamp(ObjectVersion::new(5)).unwrap();

        let text = serde_json::to_string(&action.to_wire().unwrap()).unwrap();
        let wire: WireAction = serde_json::from_str(&text).unwrap();
        let decoded = registry.decode_action(wire).unwrap();
        assert_eq!(decoded, action);
    }

    #[test]
    fn broadcast_action_omits_recipients_field() {
        let kind = ActionKind::MoveNode(MoveNode {
            position: Vec3::ZERO,
        });
        let action = Action::builder(kind, "N1", ClientId(1)).build().unwrap();
        let json = serde_json::to_value(action.to_wire().unwrap()).unwrap();
        assert!(json.get("recipients").is_none());
    }
}

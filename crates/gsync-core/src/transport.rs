//! Transport contract and an in-process hub
//!
//! The core relies on at-least-once, per-connection in-order delivery and
//! never reorders frames itself.

use crate::error::TransportError;
use dashmap::DashMap;
use gsync_action::ClientId;
use tokio::sync::mpsc;

/// One frame with its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: ClientId,
    pub frame: String,
}

/// Unicast and broadcast primitives
pub trait Transport: Send + Sync {
    /// Send one frame to `to`
    ///
    /// # Errors
    /// `TransportError` if `to` is unreachable
    fn unicast(&self, from: ClientId, to: ClientId, frame: String) -> Result<(), TransportError>;

    /// Send one frame to every peer in `to`
    ///
    /// Attempts all peers; returns the last failure, if any.
    ///
    /// # Errors
    /// `TransportError` if any peer was unreachable
    fn broadcast(&self, from: ClientId, to: &[ClientId], frame: &str) -> Result<(), TransportError> {
        let mut result = Ok(());
        for peer in to {
            if let Err(err) = self.unicast(from, *peer, frame.to_owned()) {
                tracing::warn!(%peer, error = %err, "broadcast delivery failed");
                result = Err(err);
            }
        }
        result
    }
}

/// In-process transport over unbounded tokio channels
#[derive(Debug, Default)]
pub struct LocalHub {
    peers: DashMap<ClientId, mpsc::UnboundedSender<Envelope>>,
}

impl LocalHub {
    /// Create hub with no peers
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, returning its inbox; replaces any earlier connection
    pub fn connect(&self, id: ClientId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(id, tx);
        rx
    }

    /// Drop `id`'s connection
    pub fn disconnect(&self, id: ClientId) -> bool {
        self.peers.remove(&id).is_some()
    }

    /// Whether `id` is connected
    #[must_use]
    pub fn is_connected(&self, id: ClientId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Number of connected peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no peer is connected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Transport for LocalHub {
    fn unicast(&self, from: ClientId, to: ClientId, frame: String) -> Result<(), TransportError> {
        let sender = self
            .peers
            .get(&to)
            .ok_or(TransportError::UnknownPeer(to))?;
        sender
            .send(Envelope { from, frame })
            .map_err(|_| TransportError::Closed)
    }
}

//! Protocol messages, their JSON envelope and packet fragmentation
//!
//! Every message travels as `{"type": <tag>, "payload": <body>}`. Action
//! payloads are encoded as `{kind, body}` pairs and decoded through the
//! [`KindRegistry`]. Encoded messages longer than the configured packet
//! size are split into fragments and gathered again by a [`Reassembler`].

use crate::error::RejectReason;
use gsync_action::{
    Action, ClientId, CodecError, KindRegistry, ObjectId, ObjectVersion, WireAction,
};
use gsync_history::{ActionRecord, LedgerOp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use ulid::Ulid;

/// Bytes reserved for the fragment header when splitting
pub const FRAGMENT_OVERHEAD: usize = 128;

/// A commit as delivered to clients
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    /// Server sequence; `None` for transient or targeted actions
    pub sequence: Option<u64>,
    pub action: Action,
}

/// Refusal sent to the originator only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub target: ObjectId,
    pub requester: ClientId,
    pub network_version: u64,
    /// Authoritative version at decision time
    pub object_version: ObjectVersion,
    pub server_id: ClientId,
    pub reason: RejectReason,
}

/// Join reply: everything a fresh replica needs
#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    pub head: u64,
    pub replay: Vec<Committed>,
    pub ledger: Option<Vec<ActionRecord>>,
}

/// Protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client → server: request to commit an action
    Submit(Action),
    /// Server → clients: committed action
    Commit(Committed),
    /// Server → originator: refused action
    Reject(Reject),
    /// Client → server: resend these sequence numbers
    GapRequest { missing: Vec<u64> },
    /// Server → client: previously committed records
    Resend { entries: Vec<Committed> },
    /// Server → clients: current head sequence
    Head { sequence: u64 },
    /// Client → server: (re)join and request replay
    Join,
    /// Server → client: join replay
    Welcome(Welcome),
    /// Either direction: replicated ledger edit
    Ledger(LedgerOp),
}

impl Message {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submit(_) => "submit",
            Self::Commit(_) => "commit",
            Self::Reject(_) => "reject",
            Self::GapRequest { .. } => "gap_request",
            Self::Resend { .. } => "resend",
            Self::Head { .. } => "head",
            Self::Join => "join",
            Self::Welcome(_) => "welcome",
            Self::Ledger(_) => "ledger",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCommitted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    action: WireAction,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum WireMessage {
    Submit(WireAction),
    Commit(WireCommitted),
    Reject(Reject),
    GapRequest {
        missing: Vec<u64>,
    },
    Resend {
        entries: Vec<WireCommitted>,
    },
    Head {
        sequence: u64,
    },
    Join,
    Welcome {
        head: u64,
        replay: Vec<WireCommitted>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ledger: Option<Vec<ActionRecord>>,
    },
    Ledger(LedgerOp),
}

/// One transport frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Packet {
    /// A complete encoded message
    Whole { data: String },
    /// Part `index` of `count` of a larger message
    Fragment {
        packet_id: Ulid,
        count: u32,
        index: u32,
        data: String,
    },
}

/// Message ↔ text codec
#[derive(Debug, Clone)]
pub struct WireCodec {
    registry: KindRegistry,
    max_packet_size: usize,
}

impl WireCodec {
    /// Create codec using `registry` to decode action kinds
    #[must_use]
    pub fn new(registry: KindRegistry, max_packet_size: usize) -> Self {
        Self {
            registry,
            max_packet_size: max_packet_size.max(FRAGMENT_OVERHEAD * 2),
        }
    }

    /// Kind registry in use
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// Encode a message as one JSON envelope
    ///
    /// # Errors
    /// JSON serialization failure
    pub fn encode(&self, message: &Message) -> Result<String, CodecError> {
        let wire = match message {
            Message::Submit(action) => WireMessage::Submit(action.to_wire()?),
            Message::Commit(committed) => WireMessage::Commit(to_wire_committed(committed)?),
            Message::Reject(reject) => WireMessage::Reject(reject.clone()),
            Message::GapRequest { missing } => WireMessage::GapRequest {
                missing: missing.clone(),
            },
            Message::Resend { entries } => WireMessage::Resend {
                entries: entries
                    .iter()
                    .map(to_wire_committed)
                    .collect::<Result<_, _>>()?,
            },
            Message::Head { sequence } => WireMessage::Head {
                sequence: *sequence,
            },
            Message::Join => WireMessage::Join,
            Message::Welcome(welcome) => WireMessage::Welcome {
                head: welcome.head,
                replay: welcome
                    .replay
                    .iter()
                    .map(to_wire_committed)
                    .collect::<Result<_, _>>()?,
                ledger: welcome.ledger.clone(),
            },
            Message::Ledger(op) => WireMessage::Ledger(op.clone()),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decode one JSON envelope
    ///
    /// # Errors
    /// - `CodecError::Json` for a malformed envelope
    /// - `CodecError::UnknownTag` / `MalformedBody` for undecodable actions
    pub fn decode(&self, text: &str) -> Result<Message, CodecError> {
        let wire: WireMessage = serde_json::from_str(text)?;
        Ok(match wire {
            WireMessage::Submit(action) => Message::Submit(self.registry.decode_action(action)?),
            WireMessage::Commit(committed) => Message::Commit(self.decode_committed(committed)?),
            WireMessage::Reject(reject) => Message::Reject(reject),
            WireMessage::GapRequest { missing } => Message::GapRequest { missing },
            WireMessage::Resend { entries } => Message::Resend {
                entries: self.decode_entries(entries)?,
            },
            WireMessage::Head { sequence } => Message::Head { sequence },
            WireMessage::Join => Message::Join,
            WireMessage::Welcome {
                head,
                replay,
                ledger,
            } => Message::Welcome(Welcome {
                head,
                replay: self.decode_entries(replay)?,
                ledger,
            }),
            WireMessage::Ledger(op) => Message::Ledger(op),
        })
    }

    /// Encode and split into transport frames
    ///
    /// # Errors
    /// JSON serialization failure
    pub fn frames(&self, message: &Message) -> Result<Vec<String>, CodecError> {
        let text = self.encode(message)?;
        split_packets(text, self.max_packet_size - FRAGMENT_OVERHEAD)
            .iter()
            .map(|packet| serde_json::to_string(packet).map_err(CodecError::from))
            .collect()
    }

    fn decode_committed(&self, wire: WireCommitted) -> Result<Committed, CodecError> {
        Ok(Committed {
            sequence: wire.sequence,
            action: self.registry.decode_action(wire.action)?,
        })
    }

    fn decode_entries(&self, entries: Vec<WireCommitted>) -> Result<Vec<Committed>, CodecError> {
        entries
            .into_iter()
            .map(|e| self.decode_committed(e))
            .collect()
    }
}

fn to_wire_committed(committed: &Committed) -> Result<WireCommitted, CodecError> {
    Ok(WireCommitted {
        sequence: committed.sequence,
        action: committed.action.to_wire()?,
    })
}

/// Split `text` into packets whose data is at most `chunk` bytes
///
/// Splits fall on UTF-8 character boundaries.
#[must_use]
pub fn split_packets(text: String, chunk: usize) -> Vec<Packet> {
    let chunk = chunk.max(4);
    if text.len() <= chunk {
        return vec![Packet::Whole { data: text }];
    }

    let mut parts = Vec::new();
    let mut rest = text.as_str();
    while !rest.is_empty() {
        let mut end = rest.len().min(chunk);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        parts.push(head.to_string());
        rest = tail;
    }

    let packet_id = Ulid::new();
    let count = u32::try_from(parts.len()).unwrap_or(u32::MAX);
    parts
        .into_iter()
        .zip(0u32..)
        .map(|(data, index)| Packet::Fragment {
            packet_id,
            count,
            index,
            data,
        })
        .collect()
}

#[derive(Debug)]
struct Partial {
    count: u32,
    parts: BTreeMap<u32, String>,
}

/// Gathers fragments per packet id into whole messages
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<Ulid, Partial>,
}

impl Reassembler {
    /// Create empty reassembler
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of incomplete packets
    #[inline]
    #[must_use]
    pub fn incomplete(&self) -> usize {
        self.partial.len()
    }

    /// Feed one frame; returns the message text once complete
    ///
    /// Duplicate fragments are ignored.
    ///
    /// # Errors
    /// - `CodecError::Json` for an unparsable frame
    /// - `CodecError::BadFragment` for inconsistent counts or indexes
    pub fn push(&mut self, frame: &str) -> Result<Option<String>, CodecError> {
        match serde_json::from_str::<Packet>(frame)? {
            Packet::Whole { data } => Ok(Some(data)),
            Packet::Fragment {
                packet_id,
                count,
                index,
                data,
            } => {
                let bad = |reason: &str| CodecError::BadFragment {
                    packet: packet_id.to_string(),
                    reason: reason.to_string(),
                };
                if count == 0 || index >= count {
                    return Err(bad("index out of range"));
                }
                let partial = self.partial.entry(packet_id).or_insert_with(|| Partial {
                    count,
                    parts: BTreeMap::new(),
                });
                if partial.count != count {
                    return Err(bad("fragment count changed"));
                }
                partial.parts.entry(index).or_insert(data);
                if partial.parts.len() < count as usize {
                    return Ok(None);
                }
                let whole = self
                    .partial
                    .remove(&packet_id)
                    .map(|p| p.parts.into_values().collect::<String>());
                Ok(whole)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsync_action::kind::{MoveNode, RenameNode};
    use gsync_action::{ActionKind, Vec3};
    use gsync_history::{ActionRecord, OpId};
    use pretty_assertions::assert_eq;

    fn codec() -> WireCodec {
        WireCodec::new(KindRegistry::with_defaults(), 32_000)
    }

    fn stamped_move() -> Action {
        let mut action = Action::builder(
            ActionKind::MoveNode(MoveNode {
                position: Vec3::new(1.0, 2.0, 3.0),
            }),
            "N1",
            ClientId(3),
        )
        .build()
        .unwrap();
        action.assign_network_version(4);
        action.stamp(ObjectVersion::new(5)).unwrap();
        action
    }

    #[test]
    fn envelope_has_type_and_payload() {
        let text = codec()
            .encode(&Message::GapRequest { missing: vec![7] })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "gap_request");
        assert_eq!(value["payload"]["missing"][0], 7);
    }

    #[test]
    fn commit_decodes_through_registry() {
        let codec = codec();
        let message = Message::Commit(Committed {
            sequence: Some(8),
            action: stamped_move(),
        });
        let decoded = codec.decode(&codec.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn reject_carries_authoritative_version() {
        let codec = codec();
        let reject = Message::Reject(Reject {
            target: ObjectId::new("N1"),
            requester: ClientId(2),
            network_version: 1,
            object_version: ObjectVersion::new(6),
            server_id: ClientId::SERVER,
            reason: RejectReason::VersionConflict,
        });
        let text = codec.encode(&reject).unwrap();
        assert!(text.contains("\"object_version\":6"));
        assert_eq!(codec.decode(&text).unwrap(), reject);
    }

    #[test]
    fn unknown_kind_fails_decode() {
        let codec = codec();
        let mut text = codec
            .encode(&Message::Submit(stamped_move()))
            .unwrap();
        text = text.replace("\"move_node\"", "\"teleport\"");
        assert!(matches!(
            codec.decode(&text),
            Err(CodecError::UnknownTag(tag)) if tag == "teleport"
        ));
    }

    #[test]
    fn small_message_is_one_whole_frame() {
        let frames = codec().frames(&Message::Join).unwrap();
        assert_eq!(frames.len(), 1);
        let mut reassembler = Reassembler::new();
        let text = reassembler.push(&frames[0]).unwrap().unwrap();
        assert_eq!(codec().decode(&text).unwrap(), Message::Join);
    }

    #[test]
    fn large_welcome_is_fragmented_and_reassembled_out_of_order() {
        let codec = WireCodec::new(KindRegistry::with_defaults(), 512);
        let ledger: Vec<ActionRecord> = (0..40)
            .map(|i| {
                ActionRecord::done(
                    gsync_action::ActionId::new(),
                    ClientId(1),
                    [ObjectId::new(format!("node-ü-{i}"))],
                )
            })
            .collect();
        let message = Message::Welcome(Welcome {
            head: 1,
            replay: vec![Committed {
                sequence: Some(1),
                action: stamped_move(),
            }],
            ledger: Some(ledger),
        });

        let mut frames = codec.frames(&message).unwrap();
        assert!(frames.len() > 1);
        frames.reverse();
        let dup = frames[0].clone();
        frames.insert(1, dup);

        let mut reassembler = Reassembler::new();
        let mut done = None;
        for frame in &frames {
            if let Some(text) = reassembler.push(frame).unwrap() {
                done = Some(text);
            }
        }
        let text = done.expect("complete");
        assert_eq!(codec.decode(&text).unwrap(), message);
        assert_eq!(reassembler.incomplete(), 0);
    }

    #[test]
    fn split_respects_char_boundaries() {
        let text = "ééééé".to_string();
        let packets = split_packets(text.clone(), 5);
        let joined: String = packets
            .into_iter()
            .map(|p| match p {
                Packet::Fragment { data, .. } => data,
                Packet::Whole { data } => data,
            })
            .collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn inconsistent_fragment_is_rejected() {
        let mut reassembler = Reassembler::new();
        let frame = serde_json::to_string(&Packet::Fragment {
            packet_id: Ulid::new(),
            count: 2,
            index: 2,
            data: String::new(),
        })
        .unwrap();
        assert!(matches!(
            reassembler.push(&frame),
            Err(CodecError::BadFragment { .. })
        ));
    }

    #[test]
    fn ledger_op_passes_through() {
        let codec = codec();
        let op = gsync_history::LedgerOp::Delete {
            op_id: OpId::new(),
            record_id: gsync_history::RecordId::new(),
        };
        let message = Message::Ledger(op);
        assert_eq!(codec.decode(&codec.encode(&message).unwrap()).unwrap(), message);
    }

    #[test]
    fn rename_submit_keeps_name() {
        let codec = codec();
        let action = Action::builder(
            ActionKind::RenameNode(RenameNode {
                name: "Überklasse".into(),
            }),
            "N2",
            ClientId(1),
        )
        .build()
        .unwrap();
        let message = Message::Submit(action);
        assert_eq!(codec.decode(&codec.encode(&message).unwrap()).unwrap(), message);
    }
}

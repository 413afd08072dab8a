//! gsync Action Model
//!
//! Serializable graph actions and the per-object version policy they are
//! checked against.
//!
//! # Core Concepts
//!
//! - [`Action`]: one intended mutation plus its concurrency fields
//! - [`ActionKind`]: closed union of replicated payloads
//! - [`ObjectVersion`]: per-object counter, `-1` for deleted objects
//! - [`KindRegistry`]: tag → decoder table used by the wire codec
//!
//! # Example
//!
//! ```rust,ignore
//! use gsync_action::{Action, ActionKind, ClientId, ObjectVersion};
//!
//! let mut action = Action::builder(kind, "N1", ClientId(1)).build()?;
//! action.stamp(ObjectVersion::new(5))?;
//! assert_eq!(action.new_version(), ObjectVersion::new(6));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod action;
mod error;
mod id;
mod registry;
mod version;

/// Built-in action kinds
pub mod kind;

pub use action::{Action, ActionBuilder, ActionKey, WireAction};
pub use error::{ActionError, CodecError};
pub use id::{ActionId, ClientId, ObjectId};
pub use kind::{ActionKind, EdgeSnapshot, NodeSnapshot, Vec3};
pub use registry::{KindDecoder, KindRegistry};
pub use version::{ObjectVersion, VersionEffect};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

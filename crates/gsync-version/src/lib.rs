//! gsync Version Stores
//!
//! Per-object version bookkeeping for optimistic concurrency.
//!
//! - [`AuthoritativeVersions`]: the server's store; the single writer that
//!   decides commits through [`AuthoritativeVersions::check_and_commit`]
//! - [`MirrorVersions`]: a client's mirror, moved only by committed
//!   broadcasts
//!
//! Both implement [`VersionStore`], whose lookups are explicit
//! [`VersionLookup`] results rather than errors.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod authoritative;
mod error;
mod mirror;
mod store;

pub use authoritative::AuthoritativeVersions;
pub use error::VersionError;
pub use mirror::MirrorVersions;
pub use store::{VersionLookup, VersionStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

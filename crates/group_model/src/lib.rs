//! Canonical model for discovered consensus groups.
//!
//! Transports resolve their medium-specific advertisements into
//! [`ResolvedService`] records; the [`GroupBook`] folds those records into
//! per-transport [`ResolvedGroup`]s and hands out complete snapshots after
//! every mutation.

pub mod book;
pub mod group;
pub mod peer;
pub mod service;

pub use book::{GroupBook, Snapshot};
pub use group::{GroupDescriptor, ResolvedGroup};
pub use peer::{Peer, CURRENT_PEERS_FILE, GENESIS_PEERS_FILE};
pub use service::{ProviderId, ResolvedService, ServiceIdentity};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("service {raw} does not belong to group {group_uid} ({group_name}): advertised {found_uid} ({found_name})")]
    GroupMismatch {
        group_uid: String,
        group_name: String,
        found_uid: String,
        found_name: String,
        raw: String,
    },
    #[error("service {raw} is not a member of group {group_uid}")]
    UnknownMember { group_uid: String, raw: String },
}

pub type Result<T> = std::result::Result<T, ModelError>;

//! Multi-transport discovery of consensus groups and the join workflow.
//!
//! Each registered transport resolves its medium-specific advertisements
//! into the canonical model and publishes complete snapshots through its
//! [`TransportContext`]; the [`DiscoveryController`] caches those
//! snapshots, fans start/stop out to every transport, and drives the
//! atomic join that materializes a configuration directory.

pub mod beacon;
pub mod controller;
pub mod lan;
pub mod relay;
pub mod transport;

pub use beacon::{BeaconConfig, BeaconPacket, BeaconTransport};
pub use controller::{ControllerEvent, DiscoveryController, JoinRequest};
pub use lan::LanTransport;
pub use relay::RelayTransport;
pub use transport::{
    Advertisement, AdvertiserHandle, DiscoveryTransport, MockTransport, SnapshotSink,
    TransportContext,
};

use group_model::ProviderId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A transport could not start. Isolated to that transport; the
    /// controller keeps the others running and surfaces this as an event.
    #[error("transport failed to start: {0}")]
    StartFailed(String),
    #[error("failed to advertise: {0}")]
    Advertise(String),
    /// An advertisement could not be resolved, including the single
    /// fallback attempt. Terminal for that advertisement only.
    #[error("failed to resolve advertisement {raw}: {reason}")]
    Resolution { raw: String, reason: String },
    #[error("join failed: {reason}")]
    JoinFailed {
        reason: String,
        #[source]
        source: Option<group_config::ConfigError>,
    },
    #[error("no transport registered for provider {0}")]
    UnknownProvider(ProviderId),
    #[error("configuration store: {0}")]
    Config(#[from] group_config::ConfigError),
    #[error(transparent)]
    Model(#[from] group_model::ModelError),
}

impl DiscoveryError {
    pub fn resolution(raw: &str, reason: impl Into<String>) -> Self {
        Self::Resolution {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    pub fn join(reason: impl Into<String>) -> Self {
        Self::JoinFailed {
            reason: reason.into(),
            source: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

//! Configuration-directory lifecycle for joined groups.
//!
//! Layout under the store root:
//! - `<root>/<appId>_<uniqueId>_<description>_` is a live configuration
//! - `<root>/<appId>_<uniqueId>_<description>_<n>` is a backup at version n
//!
//! Each configuration directory holds a flat TOML settings document, the
//! genesis and current peers documents, a one-line private-key file, and
//! the engine's private storage subdirectory.

pub mod name;
pub mod node_config;
pub mod store;

pub use name::{decode_description, encode_description, random_unique_id, CompositeName};
pub use node_config::{NodeConfiguration, NodeConfigurationBuilder};
pub use store::{
    AmendOutcome, CollisionPolicy, ConfigDirectory, ConfigStore, PRIVATE_KEY_FILE, SETTINGS_FILE,
};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration directory {name} already exists")]
    Collision { name: String },
    #[error("renaming {} to backup {} failed: {source}", from.display(), to.display())]
    BackupRename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed directory name: {name}")]
    MalformedName { name: String },
    #[error("invalid configuration: {0}")]
    InvalidTunable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings encode error: {0}")]
    SettingsEncode(#[from] toml::ser::Error),
    #[error("settings parse error: {0}")]
    SettingsParse(#[from] toml::de::Error),
    #[error("peers document error: {0}")]
    Peers(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

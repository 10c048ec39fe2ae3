//! Composite directory names and the description codec.
//!
//! Grammar: `{appId}_{uniqueId}_{encodedDescription}_` with a trailing
//! integer when the directory is a backup. The description is escaped so
//! the delimiter can never appear inside a field; decoding the
//! description back is best-effort for display only.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::{ConfigError, Result};

pub const DELIMITER: char = '_';
pub const UNIQUE_ID_LEN: usize = 12;

/// A fresh random unique id for a newly founded group.
pub fn random_unique_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UNIQUE_ID_LEN)
        .map(char::from)
        .collect()
}

/// Escape every byte outside `[A-Za-z0-9.-]` as `%XX`.
pub fn encode_description(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Best-effort inverse of [`encode_description`]. Invalid escapes pass
/// through literally; the result is for display, not round-tripping.
pub fn decode_description(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A parsed configuration-directory name.
///
/// `description` is kept in its encoded form; backups of the same live
/// directory share everything but the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeName {
    pub app_id: String,
    pub unique_id: String,
    pub description: String,
    pub backup_version: Option<u32>,
}

impl CompositeName {
    /// Build a live name, encoding the human-readable description.
    pub fn new(app_id: &str, unique_id: &str, description: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            unique_id: unique_id.to_string(),
            description: encode_description(description),
            backup_version: None,
        }
    }

    /// Parse a directory name against the grammar. Fewer than three
    /// fields, an empty field, or trailing junk is malformed. A parseable
    /// fourth field marks a backup at that version, otherwise the name is
    /// live.
    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split(DELIMITER).collect();
        if !(3..=4).contains(&parts.len())
            || parts[0].is_empty()
            || parts[1].is_empty()
            || parts[2].is_empty()
        {
            return Err(ConfigError::MalformedName {
                name: name.to_string(),
            });
        }
        Ok(Self {
            app_id: parts[0].to_string(),
            unique_id: parts[1].to_string(),
            description: parts[2].to_string(),
            backup_version: parts.get(3).and_then(|f| f.parse().ok()),
        })
    }

    pub fn dir_name(&self) -> String {
        match self.backup_version {
            None => format!(
                "{}{d}{}{d}{}{d}",
                self.app_id,
                self.unique_id,
                self.description,
                d = DELIMITER
            ),
            Some(version) => format!(
                "{}{d}{}{d}{}{d}{version}",
                self.app_id,
                self.unique_id,
                self.description,
                d = DELIMITER
            ),
        }
    }

    pub fn is_backup(&self) -> bool {
        self.backup_version.is_some()
    }

    pub fn with_backup_version(&self, version: u32) -> Self {
        Self {
            backup_version: Some(version),
            ..self.clone()
        }
    }

    /// Whether `other` names the same configuration, live or backup.
    pub fn same_lineage(&self, other: &CompositeName) -> bool {
        self.app_id == other.app_id
            && self.unique_id == other.unique_id
            && self.description == other.description
    }

    /// The description decoded for display.
    pub fn display_description(&self) -> String {
        decode_description(&self.description)
    }
}

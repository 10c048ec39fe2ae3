//! The configuration-directory store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use group_model::{Peer, CURRENT_PEERS_FILE, GENESIS_PEERS_FILE};
use tracing::{debug, info, warn};

use crate::name::CompositeName;
use crate::node_config::NodeConfiguration;
use crate::{ConfigError, Result};

pub const SETTINGS_FILE: &str = "settings.toml";
pub const PRIVATE_KEY_FILE: &str = "priv_key";

/// What to do when a create hits an existing directory of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Fail and leave everything untouched.
    Abort,
    /// Remove the existing tree, then proceed.
    Delete,
    /// Keep exactly one backup: drop older backups, move the live
    /// directory to version 1.
    SingleBackup,
    /// Keep full history: move the live directory to the next free
    /// backup version.
    CompleteBackup,
}

/// One enumerated configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigDirectory {
    pub name: CompositeName,
    pub path: PathBuf,
}

/// Outcome of an amend: whether the document was rewritten, and the new
/// moniker if the amend changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmendOutcome {
    pub rewritten: bool,
    pub moniker: Option<String>,
}

/// Maps (unique id, description, peer lists, configuration) to durable
/// named directories under one root.
///
/// The in-memory index is only ever rebuilt by a full re-scan after a
/// structural change, never patched incrementally. Concurrent same-name
/// creates are not lock-protected; callers rely on unique-id entropy.
pub struct ConfigStore {
    root: PathBuf,
    app_id: String,
    policy: CollisionPolicy,
    index: Vec<ConfigDirectory>,
}

impl ConfigStore {
    /// Open a store rooted at `root`, creating it if missing. `app_id`
    /// must not contain the name delimiter.
    pub fn open(root: &Path, app_id: &str, policy: CollisionPolicy) -> Result<Self> {
        fs::create_dir_all(root)?;
        let mut store = Self {
            root: root.to_path_buf(),
            app_id: app_id.to_string(),
            policy,
            index: Vec::new(),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Every directory in the root whose name fits the grammar.
    pub fn directories(&self) -> &[ConfigDirectory] {
        &self.index
    }

    /// Live (non-backup) directories only.
    pub fn live_directories(&self) -> Vec<&ConfigDirectory> {
        self.index.iter().filter(|d| !d.name.is_backup()).collect()
    }

    pub fn find_live(&self, unique_id: &str) -> Option<&ConfigDirectory> {
        self.index
            .iter()
            .find(|d| !d.name.is_backup() && d.name.unique_id == unique_id)
    }

    /// Rebuild the index from a full scan of the root. Names that fail
    /// the grammar are skipped, not errors.
    pub fn rescan(&mut self) -> Result<()> {
        let mut index = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let raw = entry.file_name();
            let raw = raw.to_string_lossy();
            match CompositeName::parse(&raw) {
                Ok(name) => index.push(ConfigDirectory {
                    name,
                    path: entry.path(),
                }),
                Err(_) => {
                    debug!(name = %raw, "skipping malformed directory name");
                }
            }
        }
        index.sort_by_key(|d| d.name.dir_name());
        self.index = index;
        Ok(())
    }

    /// Create a configuration directory for a group.
    ///
    /// Applies the collision policy if the composite name already exists,
    /// then materializes the full tree: engine storage subdirectory,
    /// settings document, genesis and current peers documents in the
    /// given order, and the one-line private-key file. The index is
    /// rebuilt only after every write succeeded.
    pub fn create_configuration(
        &mut self,
        unique_id: &str,
        description: &str,
        config: &NodeConfiguration,
        private_key_hex: &str,
        genesis_peers: &[Peer],
        current_peers: &[Peer],
    ) -> Result<PathBuf> {
        let name = CompositeName::new(&self.app_id, unique_id, description);
        let path = self.root.join(name.dir_name());

        if path.exists() {
            self.apply_collision_policy(&name, &path)?;
        }

        fs::create_dir_all(path.join(&config.db_name))?;

        let settings = toml::to_string(&config.settings_document(&path))?;
        fs::write(path.join(SETTINGS_FILE), settings)?;
        fs::write(
            path.join(GENESIS_PEERS_FILE),
            serde_json::to_string_pretty(genesis_peers)?,
        )?;
        fs::write(
            path.join(CURRENT_PEERS_FILE),
            serde_json::to_string_pretty(current_peers)?,
        )?;
        fs::write(path.join(PRIVATE_KEY_FILE), format!("{private_key_hex}\n"))?;

        self.rescan()?;
        info!(dir = %path.display(), "configuration directory created");
        Ok(path)
    }

    fn apply_collision_policy(&mut self, name: &CompositeName, path: &Path) -> Result<()> {
        match self.policy {
            CollisionPolicy::Abort => Err(ConfigError::Collision {
                name: name.dir_name(),
            }),
            CollisionPolicy::Delete => {
                fs::remove_dir_all(path)?;
                debug!(dir = %path.display(), "existing configuration deleted");
                Ok(())
            }
            CollisionPolicy::SingleBackup => {
                for version in self.backup_versions(name)? {
                    let stale = self.root.join(name.with_backup_version(version).dir_name());
                    fs::remove_dir_all(&stale)?;
                    debug!(dir = %stale.display(), "stale backup deleted");
                }
                self.rename_to_backup(name, path, 1)
            }
            CollisionPolicy::CompleteBackup => {
                let next = self
                    .backup_versions(name)?
                    .into_iter()
                    .max()
                    .unwrap_or(0)
                    .saturating_add(1);
                self.rename_to_backup(name, path, next)
            }
        }
    }

    /// A failed backup rename is fatal to the create; proceeding would
    /// leave an inconsistent tree.
    fn rename_to_backup(&self, name: &CompositeName, path: &Path, version: u32) -> Result<()> {
        let backup_path = self.root.join(name.with_backup_version(version).dir_name());
        fs::rename(path, &backup_path).map_err(|source| ConfigError::BackupRename {
            from: path.to_path_buf(),
            to: backup_path.clone(),
            source,
        })?;
        info!(
            from = %path.display(),
            to = %backup_path.display(),
            "live configuration moved to backup"
        );
        Ok(())
    }

    fn backup_versions(&self, name: &CompositeName) -> Result<Vec<u32>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let raw = entry.file_name();
            if let Ok(parsed) = CompositeName::parse(&raw.to_string_lossy()) {
                if parsed.same_lineage(name) {
                    if let Some(version) = parsed.backup_version {
                        versions.push(version);
                    }
                }
            }
        }
        Ok(versions)
    }

    /// Apply `changes` to the settings document of the directory at
    /// `path`. Value-equal entries are no-ops; the document is rewritten
    /// only if at least one key actually changed.
    pub fn amend_settings(
        &mut self,
        path: &Path,
        changes: &BTreeMap<String, toml::Value>,
    ) -> Result<AmendOutcome> {
        let settings_path = path.join(SETTINGS_FILE);
        let raw = fs::read_to_string(&settings_path)?;
        let mut current: BTreeMap<String, toml::Value> = toml::from_str(&raw)?;

        let mut rewritten = false;
        let mut moniker = None;
        for (key, value) in changes {
            if current.get(key) == Some(value) {
                continue;
            }
            if key == "moniker" {
                moniker = value.as_str().map(str::to_string);
            }
            current.insert(key.clone(), value.clone());
            rewritten = true;
        }

        if rewritten {
            fs::write(&settings_path, toml::to_string(&current)?)?;
            debug!(file = %settings_path.display(), "settings document rewritten");
        }
        Ok(AmendOutcome { rewritten, moniker })
    }

    /// Best-effort recursive removal of a directory by composite name.
    /// Returns whether the tree is gone; never errors.
    pub fn delete_configuration(&mut self, dir_name: &str) -> bool {
        let path = self.root.join(dir_name);
        let removed = match fs::remove_dir_all(&path) {
            Ok(()) => true,
            Err(e) => {
                warn!(dir = %path.display(), error = %e, "configuration delete failed");
                false
            }
        };
        if let Err(e) = self.rescan() {
            warn!(error = %e, "index rescan after delete failed");
        }
        removed
    }
}

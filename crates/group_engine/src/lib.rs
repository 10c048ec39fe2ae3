//! The consensus-engine contract.
//!
//! The engine is an external process from this crate's point of view: it
//! is handed a configuration directory written by the config store and is
//! only ever driven through the narrow [`ConsensusEngine`] trait. Nothing
//! here interprets engine-internal state beyond these calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use group_model::{Peer, CURRENT_PEERS_FILE, GENESIS_PEERS_FILE};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine process could not come up. The usual cause is a
    /// previous instance still holding its network port.
    #[error("engine failed to start: {0}")]
    StartFailed(String),
    #[error("engine is not running")]
    NotRunning,
    #[error("read peers document {path}: {source}")]
    PeersRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse peers document {path}: {source}")]
    PeersParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The narrow interface a running consensus engine exposes.
///
/// Constructed against a configuration directory; peers documents and the
/// stats document are the only state it ever reveals.
#[async_trait::async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Human-readable engine name (e.g. "babble", "mock").
    fn name(&self) -> &str;

    /// Start gossiping from the configuration directory.
    async fn start(&self) -> Result<()>;

    /// Submit an opaque transaction payload to the running engine.
    async fn submit_transaction(&self, payload: &[u8]) -> Result<()>;

    /// Leave the group cleanly and stop.
    async fn leave(&self) -> Result<()>;

    /// The genesis peer list the engine was configured with.
    async fn genesis_peers(&self) -> Result<Vec<Peer>>;

    /// The peer list as the engine sees it now.
    async fn current_peers(&self) -> Result<Vec<Peer>>;

    /// Opaque stats document for display.
    async fn stats(&self) -> Result<serde_json::Value>;
}

/// In-process stand-in engine for tests and the demo binary.
///
/// Reads its peer lists straight from the configuration directory and
/// records every submitted transaction. Start can be scripted to fail so
/// callers can exercise their rollback paths.
pub struct MockEngine {
    config_dir: PathBuf,
    running: AtomicBool,
    fail_start: Option<String>,
    submitted: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl MockEngine {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            running: AtomicBool::new(false),
            fail_start: None,
            submitted: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Script the next `start` call to fail with the given message.
    pub fn failing_start(config_dir: &Path, message: &str) -> Self {
        Self {
            fail_start: Some(message.to_string()),
            ..Self::new(config_dir)
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Transactions submitted so far, in order.
    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.submitted.lock().unwrap().clone()
    }

    fn read_peers(&self, file_name: &str) -> Result<Vec<Peer>> {
        let path = self.config_dir.join(file_name);
        let raw = std::fs::read_to_string(&path).map_err(|source| EngineError::PeersRead {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| EngineError::PeersParse { path, source })
    }
}

#[async_trait::async_trait]
impl ConsensusEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self) -> Result<()> {
        if let Some(message) = &self.fail_start {
            return Err(EngineError::StartFailed(message.clone()));
        }
        self.running.store(true, Ordering::SeqCst);
        debug!(dir = %self.config_dir.display(), "mock engine started");
        Ok(())
    }

    async fn submit_transaction(&self, payload: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        self.submitted.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        self.running.store(false, Ordering::SeqCst);
        debug!(dir = %self.config_dir.display(), "mock engine left group");
        Ok(())
    }

    async fn genesis_peers(&self) -> Result<Vec<Peer>> {
        self.read_peers(GENESIS_PEERS_FILE)
    }

    async fn current_peers(&self) -> Result<Vec<Peer>> {
        self.read_peers(CURRENT_PEERS_FILE)
    }

    async fn stats(&self) -> Result<serde_json::Value> {
        let submitted = self.submitted.lock().unwrap().len();
        Ok(serde_json::json!({
            "engine": "mock",
            "running": self.is_running(),
            "transactions_submitted": submitted,
        }))
    }
}

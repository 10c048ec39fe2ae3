//! Engine tunables and the flat settings document.

use std::collections::BTreeMap;
use std::path::Path;

use crate::{ConfigError, Result};

/// The tunables a consensus engine is configured with.
///
/// Immutable once built; construct through [`NodeConfiguration::builder`],
/// which rejects values that would be meaningless to the engine.
#[derive(Debug, Clone)]
pub struct NodeConfiguration {
    pub listen: String,
    pub advertise: Option<String>,
    pub no_service: bool,
    pub service_listen: Option<String>,
    pub heartbeat_ms: u64,
    pub slow_heartbeat_ms: u64,
    pub max_pool: u32,
    pub timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub sync_limit: u32,
    pub fast_sync: bool,
    pub store: bool,
    pub cache_size: u32,
    pub bootstrap: bool,
    pub maintenance_mode: bool,
    pub suspend_limit: u32,
    pub moniker: String,
    pub loadpeers: bool,
    pub db_name: String,
    pub log_level: String,
}

impl NodeConfiguration {
    pub fn builder() -> NodeConfigurationBuilder {
        NodeConfigurationBuilder::default()
    }

    /// The complete flat settings document for a directory rooted at
    /// `datadir`, covering every tunable plus the derived path and
    /// address keys. `service-listen` is only present when set.
    pub fn settings_document(&self, datadir: &Path) -> BTreeMap<String, toml::Value> {
        let mut doc = BTreeMap::new();
        doc.insert(
            "datadir".to_string(),
            toml::Value::String(datadir.display().to_string()),
        );
        doc.insert(
            "db".to_string(),
            toml::Value::String(datadir.join(&self.db_name).display().to_string()),
        );
        doc.insert(
            "log".to_string(),
            toml::Value::String(self.log_level.clone()),
        );
        doc.insert(
            "listen".to_string(),
            toml::Value::String(self.listen.clone()),
        );
        doc.insert(
            "advertise".to_string(),
            toml::Value::String(self.advertise.clone().unwrap_or_else(|| self.listen.clone())),
        );
        doc.insert(
            "no-service".to_string(),
            toml::Value::Boolean(self.no_service),
        );
        if let Some(service_listen) = &self.service_listen {
            doc.insert(
                "service-listen".to_string(),
                toml::Value::String(service_listen.clone()),
            );
        }
        doc.insert(
            "heartbeat".to_string(),
            toml::Value::String(format!("{}ms", self.heartbeat_ms)),
        );
        doc.insert(
            "slow-heartbeat".to_string(),
            toml::Value::String(format!("{}ms", self.slow_heartbeat_ms)),
        );
        doc.insert(
            "max-pool".to_string(),
            toml::Value::Integer(self.max_pool as i64),
        );
        doc.insert(
            "timeout".to_string(),
            toml::Value::Integer(self.timeout_ms as i64),
        );
        doc.insert(
            "join_timeout".to_string(),
            toml::Value::Integer(self.join_timeout_ms as i64),
        );
        doc.insert(
            "sync-limit".to_string(),
            toml::Value::Integer(self.sync_limit as i64),
        );
        doc.insert("fast-sync".to_string(), toml::Value::Boolean(self.fast_sync));
        doc.insert("store".to_string(), toml::Value::Boolean(self.store));
        doc.insert(
            "cache-size".to_string(),
            toml::Value::Integer(self.cache_size as i64),
        );
        doc.insert("bootstrap".to_string(), toml::Value::Boolean(self.bootstrap));
        doc.insert(
            "maintenance-mode".to_string(),
            toml::Value::Boolean(self.maintenance_mode),
        );
        doc.insert(
            "suspend-limit".to_string(),
            toml::Value::Integer(self.suspend_limit as i64),
        );
        doc.insert(
            "moniker".to_string(),
            toml::Value::String(self.moniker.clone()),
        );
        doc.insert("loadpeers".to_string(), toml::Value::Boolean(self.loadpeers));
        doc
    }
}

/// Builder with engine defaults; `build` validates.
#[derive(Debug, Clone)]
pub struct NodeConfigurationBuilder {
    listen: String,
    advertise: Option<String>,
    no_service: bool,
    service_listen: Option<String>,
    heartbeat_ms: u64,
    slow_heartbeat_ms: u64,
    max_pool: u32,
    timeout_ms: u64,
    join_timeout_ms: u64,
    sync_limit: u32,
    fast_sync: bool,
    store: bool,
    cache_size: u32,
    bootstrap: bool,
    maintenance_mode: bool,
    suspend_limit: u32,
    moniker: String,
    loadpeers: bool,
    db_name: String,
    log_level: String,
}

impl Default for NodeConfigurationBuilder {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1337".to_string(),
            advertise: None,
            no_service: true,
            service_listen: None,
            heartbeat_ms: 500,
            slow_heartbeat_ms: 1000,
            max_pool: 2,
            timeout_ms: 1000,
            join_timeout_ms: 10_000,
            sync_limit: 1000,
            fast_sync: false,
            store: true,
            cache_size: 50_000,
            bootstrap: false,
            maintenance_mode: false,
            suspend_limit: 300,
            moniker: String::new(),
            loadpeers: true,
            db_name: "badger_db".to_string(),
            log_level: "debug".to_string(),
        }
    }
}

impl NodeConfigurationBuilder {
    pub fn listen(mut self, listen: &str) -> Self {
        self.listen = listen.to_string();
        self
    }

    pub fn advertise(mut self, advertise: &str) -> Self {
        self.advertise = Some(advertise.to_string());
        self
    }

    pub fn no_service(mut self, no_service: bool) -> Self {
        self.no_service = no_service;
        self
    }

    pub fn service_listen(mut self, service_listen: &str) -> Self {
        self.service_listen = Some(service_listen.to_string());
        self
    }

    pub fn heartbeat_ms(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms;
        self
    }

    pub fn slow_heartbeat_ms(mut self, slow_heartbeat_ms: u64) -> Self {
        self.slow_heartbeat_ms = slow_heartbeat_ms;
        self
    }

    pub fn max_pool(mut self, max_pool: u32) -> Self {
        self.max_pool = max_pool;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn join_timeout_ms(mut self, join_timeout_ms: u64) -> Self {
        self.join_timeout_ms = join_timeout_ms;
        self
    }

    pub fn sync_limit(mut self, sync_limit: u32) -> Self {
        self.sync_limit = sync_limit;
        self
    }

    pub fn fast_sync(mut self, fast_sync: bool) -> Self {
        self.fast_sync = fast_sync;
        self
    }

    pub fn store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn cache_size(mut self, cache_size: u32) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn maintenance_mode(mut self, maintenance_mode: bool) -> Self {
        self.maintenance_mode = maintenance_mode;
        self
    }

    pub fn suspend_limit(mut self, suspend_limit: u32) -> Self {
        self.suspend_limit = suspend_limit;
        self
    }

    pub fn moniker(mut self, moniker: &str) -> Self {
        self.moniker = moniker.to_string();
        self
    }

    pub fn loadpeers(mut self, loadpeers: bool) -> Self {
        self.loadpeers = loadpeers;
        self
    }

    pub fn db_name(mut self, db_name: &str) -> Self {
        self.db_name = db_name.to_string();
        self
    }

    pub fn log_level(mut self, log_level: &str) -> Self {
        self.log_level = log_level.to_string();
        self
    }

    pub fn build(self) -> Result<NodeConfiguration> {
        if self.moniker.trim().is_empty() {
            return Err(ConfigError::InvalidTunable("moniker must not be empty".into()));
        }
        if self.listen.trim().is_empty() {
            return Err(ConfigError::InvalidTunable(
                "listen address must not be empty".into(),
            ));
        }
        if self.heartbeat_ms == 0 || self.slow_heartbeat_ms == 0 {
            return Err(ConfigError::InvalidTunable(
                "heartbeat intervals must be positive".into(),
            ));
        }
        if self.timeout_ms == 0 || self.join_timeout_ms == 0 {
            return Err(ConfigError::InvalidTunable("timeouts must be positive".into()));
        }
        if self.max_pool == 0 {
            return Err(ConfigError::InvalidTunable("max-pool must be positive".into()));
        }
        if self.cache_size == 0 {
            return Err(ConfigError::InvalidTunable("cache-size must be positive".into()));
        }
        if self.sync_limit == 0 {
            return Err(ConfigError::InvalidTunable("sync-limit must be positive".into()));
        }
        if self.db_name.trim().is_empty() {
            return Err(ConfigError::InvalidTunable("db name must not be empty".into()));
        }
        Ok(NodeConfiguration {
            listen: self.listen,
            advertise: self.advertise,
            no_service: self.no_service,
            service_listen: self.service_listen,
            heartbeat_ms: self.heartbeat_ms,
            slow_heartbeat_ms: self.slow_heartbeat_ms,
            max_pool: self.max_pool,
            timeout_ms: self.timeout_ms,
            join_timeout_ms: self.join_timeout_ms,
            sync_limit: self.sync_limit,
            fast_sync: self.fast_sync,
            store: self.store,
            cache_size: self.cache_size,
            bootstrap: self.bootstrap,
            maintenance_mode: self.maintenance_mode,
            suspend_limit: self.suspend_limit,
            moniker: self.moniker,
            loadpeers: self.loadpeers,
            db_name: self.db_name,
            log_level: self.log_level,
        })
    }
}

//! Daemon configuration.
//!
//! Priority: environment variables > `config.toml` in the data directory >
//! built-in defaults. Every tunable has a sane default, so a bare daemon
//! with no config file behaves exactly as documented.

use std::fs;
use std::time::Duration;

use serde::Deserialize;

/// Debounce window for filesystem events in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Seconds between integrity reconciler cycles
pub const DEFAULT_INTEGRITY_INTERVAL_SECS: u64 = 60;

/// Records examined per reconciler cycle
pub const DEFAULT_INTEGRITY_BATCH: usize = 5000;

/// Seconds between full rescans of network bookmarks
pub const DEFAULT_NETWORK_SCAN_INTERVAL_SECS: u64 = 300;

/// Request handler worker threads
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Socket read deadline in seconds
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;

/// Handler deadline for queries in seconds
pub const DEFAULT_HANDLER_DEADLINE_SECS: u64 = 10;

/// Extended deadline for RESCAN / ADD_BOOKMARK in seconds
pub const DEFAULT_SCAN_DEADLINE_SECS: u64 = 60;

/// Cached query responses per daemon
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 128;

/// Configuration file format (TOML), at `<data dir>/config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub watcher: WatcherSection,
    #[serde(default)]
    pub reconciler: ReconcilerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    pub pool_size: Option<usize>,
    pub read_timeout_secs: Option<u64>,
    pub handler_deadline_secs: Option<u64>,
    pub scan_deadline_secs: Option<u64>,
    pub query_cache_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatcherSection {
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconcilerSection {
    pub interval_secs: Option<u64>,
    pub batch: Option<usize>,
    pub network_scan_interval_secs: Option<u64>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub debounce_ms: u64,
    pub integrity_interval_secs: u64,
    pub integrity_batch: usize,
    pub network_scan_interval_secs: u64,
    pub pool_size: usize,
    pub read_timeout_secs: u64,
    pub handler_deadline_secs: u64,
    pub scan_deadline_secs: u64,
    pub query_cache_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            integrity_interval_secs: DEFAULT_INTEGRITY_INTERVAL_SECS,
            integrity_batch: DEFAULT_INTEGRITY_BATCH,
            network_scan_interval_secs: DEFAULT_NETWORK_SCAN_INTERVAL_SECS,
            pool_size: DEFAULT_POOL_SIZE,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            handler_deadline_secs: DEFAULT_HANDLER_DEADLINE_SECS,
            scan_deadline_secs: DEFAULT_SCAN_DEADLINE_SECS,
            query_cache_size: DEFAULT_QUERY_CACHE_SIZE,
        }
    }
}

impl DaemonConfig {
    pub fn debounce_duration(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn integrity_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_interval_secs)
    }

    pub fn network_scan_interval(&self) -> Duration {
        Duration::from_secs(self.network_scan_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn handler_deadline(&self) -> Duration {
        Duration::from_secs(self.handler_deadline_secs)
    }

    pub fn scan_deadline(&self) -> Duration {
        Duration::from_secs(self.scan_deadline_secs)
    }

    fn load_from_file() -> Option<ConfigFile> {
        let config_path = crate::persist::data_dir().ok()?.join("config.toml");
        if !config_path.exists() {
            return None;
        }
        let content = fs::read_to_string(&config_path).ok()?;
        toml::from_str(&content).ok()
    }

    fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(v) = file.server.pool_size {
            self.pool_size = v.max(1);
        }
        if let Some(v) = file.server.read_timeout_secs {
            self.read_timeout_secs = v;
        }
        if let Some(v) = file.server.handler_deadline_secs {
            self.handler_deadline_secs = v;
        }
        if let Some(v) = file.server.scan_deadline_secs {
            self.scan_deadline_secs = v;
        }
        if let Some(v) = file.server.query_cache_size {
            self.query_cache_size = v.max(1);
        }
        if let Some(v) = file.watcher.debounce_ms {
            self.debounce_ms = v;
        }
        if let Some(v) = file.reconciler.interval_secs {
            self.integrity_interval_secs = v;
        }
        if let Some(v) = file.reconciler.batch {
            self.integrity_batch = v.max(1);
        }
        if let Some(v) = file.reconciler.network_scan_interval_secs {
            self.network_scan_interval_secs = v;
        }
    }

    fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok()?.parse().ok()
        }

        if let Some(v) = env_parse("NIXNAV_DEBOUNCE_MS") {
            self.debounce_ms = v;
        }
        if let Some(v) = env_parse("NIXNAV_INTEGRITY_SECS") {
            self.integrity_interval_secs = v;
        }
        if let Some(v) = env_parse::<usize>("NIXNAV_INTEGRITY_BATCH") {
            self.integrity_batch = v.max(1);
        }
        if let Some(v) = env_parse("NIXNAV_NETWORK_SCAN_SECS") {
            self.network_scan_interval_secs = v;
        }
        if let Some(v) = env_parse::<usize>("NIXNAV_POOL_SIZE") {
            self.pool_size = v.max(1);
        }
        if let Some(v) = env_parse("NIXNAV_READ_TIMEOUT_SECS") {
            self.read_timeout_secs = v;
        }
        if let Some(v) = env_parse("NIXNAV_HANDLER_DEADLINE_SECS") {
            self.handler_deadline_secs = v;
        }
        if let Some(v) = env_parse("NIXNAV_SCAN_DEADLINE_SECS") {
            self.scan_deadline_secs = v;
        }
    }

    /// Load config with priority: environment variables > config file >
    /// defaults.
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(file) = Self::load_from_file() {
            config.apply_file(&file);
        }
        config.apply_env();
        config
    }
}

//! Configuration management module for wgns.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings for the namespace helper and its control tool.
//! Settings are read from a TOML file, validated, and then overridden by
//! `WGNS_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Kind of panel database that feeds the proxy allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PanelKind {
    #[serde(rename = "x-ui")]
    XUi,
    #[serde(rename = "marzban")]
    Marzban,
}

impl PanelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PanelKind::XUi => "x-ui",
            PanelKind::Marzban => "marzban",
        }
    }

    /// Database location used by a stock installation of the panel.
    pub fn default_db_path(&self) -> PathBuf {
        match self {
            PanelKind::XUi => PathBuf::from("/etc/x-ui/x-ui.db"),
            PanelKind::Marzban => PathBuf::from("/var/lib/marzban/db.sqlite3"),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x-ui" | "xui" => Some(PanelKind::XUi),
            "marzban" => Some(PanelKind::Marzban),
            _ => None,
        }
    }
}

impl std::fmt::Display for PanelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem locations used for durable and runtime state.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Tunnel records and the persisted credential source location.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Per-port credential lists, fingerprint markers and proxy configs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory receiving the output of every proxy process.
    #[serde(default = "default_proxy_log_dir")]
    pub proxy_log_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/etc/wgns")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wgns")
}

fn default_proxy_log_dir() -> PathBuf {
    PathBuf::from("/var/log/wgns")
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            state_dir: default_state_dir(),
            data_dir: default_data_dir(),
            proxy_log_dir: default_proxy_log_dir(),
        }
    }
}

/// Panel (credential source) settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PanelConfig {
    /// Panel flavour; selects the default database path.
    pub kind: Option<PanelKind>,

    /// Explicit database path; overrides the panel default.
    pub db_path: Option<PathBuf>,

    /// Command whose output announces new users (e.g. `["marzban", "logs"]`).
    #[serde(default)]
    pub log_command: Vec<String>,
}

impl PanelConfig {
    /// Database path resolved from the explicit value or the panel default.
    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        match (&self.db_path, self.kind) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(kind)) => Some(kind.default_db_path()),
            (None, None) => None,
        }
    }
}

/// Background watcher settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherConfig {
    /// Polling period in seconds (default: 5)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Failures in a row before the watcher backs off (default: 10)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Service unit that runs the watcher under the OS supervisor
    #[serde(default = "default_service_unit")]
    pub service_unit: String,

    /// Prefer the OS supervisor over an in-process task (default: true)
    #[serde(default = "default_true")]
    pub prefer_service: bool,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_service_unit() -> String {
    "wgns-watcher.service".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            interval_secs: default_interval_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            service_unit: default_service_unit(),
            prefer_service: default_true(),
        }
    }
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Proxy process settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Binary launched inside every namespace
    #[serde(default = "default_proxy_binary")]
    pub binary: PathBuf,

    /// Directories searched for an existing `xray` binary to install
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,

    /// Wrap the inbound in an HTTP header obfuscation layer
    #[serde(default = "default_true")]
    pub use_http_header: bool,

    /// Host header announced by the HTTP obfuscation layer
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// Request path announced by the HTTP obfuscation layer
    #[serde(default = "default_http_path")]
    pub http_path: String,

    /// Wait after terminating an old proxy before launching a new one
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
}

fn default_proxy_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/xray-ns")
}

fn default_search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/x-ui/bin"),
        PathBuf::from("/usr/bin"),
        PathBuf::from("/usr/local/bin"),
    ]
}

fn default_http_host() -> String {
    "iran.ir".to_string()
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_restart_grace_ms() -> u64 {
    500
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            binary: default_proxy_binary(),
            search_paths: default_search_paths(),
            use_http_header: default_true(),
            http_host: default_http_host(),
            http_path: default_http_path(),
            restart_grace_ms: default_restart_grace_ms(),
        }
    }
}

impl ProxyConfig {
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }
}

/// Namespace networking settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Nameservers written to every namespace's resolv.conf
    #[serde(default = "default_namespace_dns")]
    pub namespace_dns: Vec<String>,

    /// Upper bound for a single endpoint resolution attempt
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,

    /// Handshake polls after a tunnel restart (default: 10)
    #[serde(default = "default_handshake_attempts")]
    pub handshake_attempts: u32,

    /// Seconds between handshake polls (default: 2)
    #[serde(default = "default_handshake_interval_secs")]
    pub handshake_interval_secs: u64,
}

fn default_namespace_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string()]
}

fn default_resolve_timeout_ms() -> u64 {
    1500
}

fn default_handshake_attempts() -> u32 {
    10
}

fn default_handshake_interval_secs() -> u64 {
    2
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            namespace_dns: default_namespace_dns(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            handshake_attempts: default_handshake_attempts(),
            handshake_interval_secs: default_handshake_interval_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn handshake_interval(&self) -> Duration {
        Duration::from_secs(self.handshake_interval_secs)
    }
}

/// Restore discovery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestoreConfig {
    /// Directories scanned for operator tunnel configs
    #[serde(default = "default_search_dirs")]
    pub search_dirs: Vec<PathBuf>,
}

fn default_search_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/root"), PathBuf::from("/etc/wireguard")]
}

impl Default for RestoreConfig {
    fn default() -> Self {
        RestoreConfig {
            search_dirs: default_search_dirs(),
        }
    }
}

/// Main configuration structure for wgns.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub panel: PanelConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub restore: RestoreConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            paths: PathsConfig::default(),
            panel: PanelConfig::default(),
            watcher: WatcherConfig::default(),
            proxy: ProxyConfig::default(),
            network: NetworkConfig::default(),
            restore: RestoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        // Environment variables take precedence over the file
        let mut config = config;
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Load the file if present, otherwise defaults with env overrides applied.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::FileNotFound(_)) => {
                let mut config = Config::default();
                Self::apply_env_overrides(&mut config);
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watcher.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "watcher.interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.watcher.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidValue {
                key: "watcher.max_consecutive_failures".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.network.resolve_timeout_ms == 0 || self.network.resolve_timeout_ms > 2000 {
            return Err(ConfigError::InvalidValue {
                key: "network.resolve_timeout_ms".to_string(),
                message: "must be between 1 and 2000".to_string(),
            });
        }

        if self.network.handshake_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "network.handshake_attempts".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.proxy.binary.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "proxy.binary".to_string(),
                message: "proxy binary path cannot be empty".to_string(),
            });
        }

        for (key, dir) in [
            ("paths.state_dir", &self.paths.state_dir),
            ("paths.data_dir", &self.paths.data_dir),
            ("paths.proxy_log_dir", &self.paths.proxy_log_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "directory cannot be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: WGNS_)
    /// Example keys:
    /// - WGNS_LOG_LEVEL
    /// - WGNS_STATE_DIR, WGNS_DATA_DIR, WGNS_PROXY_LOG_DIR
    /// - WGNS_PANEL_KIND, WGNS_PANEL_DB_PATH
    /// - WGNS_WATCHER_INTERVAL_SECS, WGNS_WATCHER_PREFER_SERVICE
    /// - WGNS_PROXY_BINARY, WGNS_NETWORK_NAMESPACE_DNS, WGNS_RESTORE_SEARCH_DIRS
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }

        if let Ok(v) = env::var("WGNS_LOG_LEVEL") {
            cfg.log_level = v;
        }

        if let Ok(v) = env::var("WGNS_STATE_DIR") {
            if !v.is_empty() {
                cfg.paths.state_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("WGNS_DATA_DIR") {
            if !v.is_empty() {
                cfg.paths.data_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("WGNS_PROXY_LOG_DIR") {
            if !v.is_empty() {
                cfg.paths.proxy_log_dir = PathBuf::from(v);
            }
        }

        if let Ok(v) = env::var("WGNS_PANEL_KIND") {
            if let Some(kind) = PanelKind::parse(&v) {
                cfg.panel.kind = Some(kind);
            }
        }
        if let Ok(v) = env::var("WGNS_PANEL_DB_PATH") {
            if !v.is_empty() {
                cfg.panel.db_path = Some(PathBuf::from(v));
            }
        }

        if let Ok(v) = env::var("WGNS_WATCHER_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                cfg.watcher.interval_secs = n;
            }
        }
        if let Ok(v) = env::var("WGNS_WATCHER_PREFER_SERVICE") {
            if let Some(b) = parse_bool(&v) {
                cfg.watcher.prefer_service = b;
            }
        }

        if let Ok(v) = env::var("WGNS_PROXY_BINARY") {
            if !v.is_empty() {
                cfg.proxy.binary = PathBuf::from(v);
            }
        }

        if let Ok(v) = env::var("WGNS_NETWORK_NAMESPACE_DNS") {
            let list = split_csv(&v);
            if !list.is_empty() {
                cfg.network.namespace_dns = list;
            }
        }

        if let Ok(v) = env::var("WGNS_RESTORE_SEARCH_DIRS") {
            let list = split_csv(&v);
            if !list.is_empty() {
                cfg.restore.search_dirs = list.into_iter().map(PathBuf::from).collect();
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/wgns/config.toml")
    }

    /// Per-user fallback location for unprivileged dry runs.
    pub fn user_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("wgns").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

//! Configuration management for the NSD broker.
//!
//! The config file lives at a platform-appropriate location:
//! - Linux: `~/.config/nsd-broker/config.toml`
//! - macOS: `~/Library/Application Support/nsd-broker/config.toml`
//!
//! On first run, no config file exists. The broker falls back to
//! [`BrokerConfig::default`] and proceeds without writing one; `nsd-broker`'s
//! `init`/`install` CLI path is what persists a config file explicitly.
//!
//! # Config File Format (TOML)
//!
//! ```toml
//! cleanup_delay_ms = 10000
//! max_requests_per_client = 10
//! max_label_length = 63
//! managed_discovery_enabled = false
//! managed_advertiser_enabled = false
//! # network_interface = "en0"  # optional: restrict mDNS to this interface
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default delay before the socket-monitoring/legacy-daemon lifecycle
/// controller tears down idle state (spec §4.7).
const DEFAULT_CLEANUP_DELAY_MS: u64 = 10_000;

/// Default per-client outstanding-request cap (spec §4.3, `MAX_LIMIT`).
const DEFAULT_MAX_REQUESTS_PER_CLIENT: usize = 10;

/// Default instance-name byte budget (spec §4.4). Not meant to be
/// user-tunable in practice, but kept as a named, overridable constant
/// rather than a literal sprinkled through `names.rs`.
const DEFAULT_MAX_LABEL_LENGTH: usize = 63;

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config file at {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine config directory for this platform")]
    NoConfigDir,
}

/// The persisted configuration for this broker instance.
///
/// All fields have sensible defaults: a broker with no config file behaves
/// identically to one loaded from [`BrokerConfig::default`]'s serialized
/// form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Delay, in milliseconds, the socket/legacy-daemon lifecycle controller
    /// waits before tearing down idle state after the last client request
    /// (spec §4.7). A new request before the delay elapses cancels the
    /// pending cleanup.
    #[serde(default = "default_cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,

    /// Maximum outstanding requests a single client may hold at once
    /// (spec §4.3, `MAX_LIMIT`). A `MaxLimit` error is returned once this
    /// is reached.
    #[serde(default = "default_max_requests_per_client")]
    pub max_requests_per_client: usize,

    /// Maximum UTF-8 byte length of a registered instance name
    /// (spec §4.4). Truncation preserves codepoint boundaries.
    #[serde(default = "default_max_label_length")]
    pub max_label_length: usize,

    /// Whether the managed mDNS backend is available for discovery
    /// operations. When `false`, the backend router (spec §4.5) always
    /// selects the legacy backend for new discover/resolve/watch
    /// operations, regardless of `managed_advertiser_enabled`.
    #[serde(default)]
    pub managed_discovery_enabled: bool,

    /// Whether the managed mDNS backend is available for registration
    /// operations. Independent of `managed_discovery_enabled` — a broker
    /// can run managed discovery without managed advertising, or vice
    /// versa.
    #[serde(default)]
    pub managed_advertiser_enabled: bool,

    /// Optional: restrict mDNS to this network interface (e.g. `"en0"`).
    /// If not set, backends use their own interface-resolution
    /// collaborator (spec §4.5, out of core scope).
    #[serde(default)]
    pub network_interface: Option<String>,
}

fn default_cleanup_delay_ms() -> u64 {
    DEFAULT_CLEANUP_DELAY_MS
}

fn default_max_requests_per_client() -> usize {
    DEFAULT_MAX_REQUESTS_PER_CLIENT
}

fn default_max_label_length() -> usize {
    DEFAULT_MAX_LABEL_LENGTH
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cleanup_delay_ms: DEFAULT_CLEANUP_DELAY_MS,
            max_requests_per_client: DEFAULT_MAX_REQUESTS_PER_CLIENT,
            max_label_length: DEFAULT_MAX_LABEL_LENGTH,
            managed_discovery_enabled: false,
            managed_advertiser_enabled: false,
            network_interface: None,
        }
    }
}

impl BrokerConfig {
    /// Returns the platform-appropriate config directory path.
    ///
    /// - Linux: `~/.config/nsd-broker/`
    /// - macOS: `~/Library/Application Support/nsd-broker/`
    ///
    /// Returns `None` if the platform's config directory can't be determined
    /// (very rare — would mean `$HOME` is not set).
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nsd-broker"))
    }

    /// Returns the full path to the config file.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.toml"))
    }

    /// Returns the platform-appropriate data directory for storing logs.
    ///
    /// - Linux: `~/.local/share/nsd-broker/`
    /// - macOS: `~/Library/Application Support/nsd-broker/`
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("nsd-broker"))
    }

    /// Returns the default path for the Unix socket used for the connector
    /// IPC protocol.
    ///
    /// Uses `$XDG_RUNTIME_DIR` on Linux (typically `/run/user/1000/`),
    /// falling back to `/tmp/nsd-broker-{user}.sock`.
    pub fn default_socket_path() -> PathBuf {
        if let Some(runtime_dir) = dirs::runtime_dir() {
            runtime_dir.join("nsd-broker.sock")
        } else {
            let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
            PathBuf::from(format!("/tmp/nsd-broker-{user}.sock"))
        }
    }

    /// Loads the config from the default config file path.
    ///
    /// Returns `Ok(None)` if the config file doesn't exist yet (first run) —
    /// callers should fall back to [`BrokerConfig::default`].
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    /// Loads the config from a specific file path.
    ///
    /// Returns `Ok(None)` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_owned(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(Some(config))
    }

    /// Saves this config to the default config file path.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    /// Saves this config to a specific file path.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: path.to_owned(),
                source: e,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(())
    }
}

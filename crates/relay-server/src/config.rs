//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - `/etc/relay/relay.toml`, `~/.config/relay/relay.toml`, `relay.toml`
//! - Environment variables (`RELAY_PORT`, `RELAY_CLUSTER__ROLE`, ...)

use anyhow::{Context, Result};
use relay_core::{ClusterConfig, LogConfig, DEFAULT_LINK_QUEUE, DEFAULT_MAILBOX_CAPACITY};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files searched for configuration, lowest priority first.
const CONFIG_PATHS: [&str; 3] = [
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
    "relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Durable log configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Multi-process fan-out.
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Connection state recovery.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Live messages buffered per connection. A connection that falls
    /// further behind is closed and resumes from its offset.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time before a connection is dropped, in milliseconds.
    /// Also bounds the wait for the `connect` frame.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Durable log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file, shared by every process.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// How long a write waits on a locked database, in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Rows buffered per replay stream.
    #[serde(default = "default_replay_buffer")]
    pub replay_buffer: usize,
}

/// Process role in a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Single process serving clients; in-process fan-out.
    #[default]
    Standalone,
    /// Serves clients; fans out through the hub.
    Worker,
    /// Relays fan-out between workers; serves no clients.
    Hub,
}

/// Multi-process fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Role of this process.
    #[serde(default)]
    pub role: Role,

    /// Address the hub listens on and workers connect to.
    #[serde(default = "default_hub_addr")]
    pub hub_addr: SocketAddr,

    /// Worker name announced to the hub. Defaults to `worker-<pid>`.
    #[serde(default)]
    pub worker: Option<String>,

    /// Delay between hub reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect")]
    pub reconnect_ms: u64,

    /// Relay frames queued per hub link.
    #[serde(default = "default_link_queue")]
    pub link_queue: usize,
}

/// Connection state recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How long a closed connection can be resumed, in milliseconds.
    #[serde(default = "default_max_disconnection")]
    pub max_disconnection_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("chat.db")
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_replay_buffer() -> usize {
    64
}

fn default_hub_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5049))
}

fn default_reconnect() -> u64 {
    1_000
}

fn default_link_queue() -> usize {
    DEFAULT_LINK_QUEUE
}

fn default_max_disconnection() -> u64 {
    120_000 // 2 minutes
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            storage: StorageConfig::default(),
            cluster: ClusterSettings::default(),
            recovery: RecoveryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            busy_timeout_ms: default_busy_timeout(),
            replay_buffer: default_replay_buffer(),
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            role: Role::default(),
            hub_addr: default_hub_addr(),
            worker: None,
            reconnect_ms: default_reconnect(),
            link_queue: default_link_queue(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_disconnection_ms: default_max_disconnection(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default files and the environment.
    ///
    /// Missing files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            builder = builder.add_source(config::File::from(Path::new(expanded.as_ref())).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` and `port` do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// How long a connection may stay silent.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    /// Resume window for closed connections.
    #[must_use]
    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery.max_disconnection_ms)
    }

    /// Durable log settings.
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        let mut log = LogConfig::new(&self.storage.path);
        log.busy_timeout = Duration::from_millis(self.storage.busy_timeout_ms);
        log.replay_buffer = self.storage.replay_buffer.max(1);
        log
    }

    /// Hub link settings for the worker role.
    #[must_use]
    pub fn cluster_config(&self) -> ClusterConfig {
        let worker = self
            .cluster
            .worker
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));
        let mut cluster = ClusterConfig::new(self.cluster.hub_addr, worker);
        cluster.reconnect = Duration::from_millis(self.cluster.reconnect_ms);
        cluster.queue = self.cluster.link_queue.max(1);
        cluster
    }

    /// Live messages buffered per connection, at least one.
    #[must_use]
    pub fn mailbox_capacity(&self) -> usize {
        self.transport.mailbox_capacity.max(1)
    }
}

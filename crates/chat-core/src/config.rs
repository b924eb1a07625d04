//! Node configuration.
//!
//! A `NodeConfig` can be built in code, loaded from a JSON file, or both; the
//! binaries load the file first and then apply command-line overrides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::error::{ChatError, Result};

/// Lowest listen port a node may be configured with.
pub const MIN_LISTEN_PORT: u16 = 1025;

/// A peer to dial once the node is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port to accept peers on. `0` lets the OS choose, which only tests use.
    pub listen_port: u16,
    pub username: String,
    pub remote: Option<RemotePeer>,
    /// How long a duplicate-resolution keep-alive may go unanswered.
    pub probe_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Probe a peer after this much silence. `None` disables idle probing.
    pub idle_probe_interval_secs: Option<u64>,
    /// Delay before the higher-addressed side of a gossiped pair dials.
    pub gossip_backoff_ms: u64,
    pub max_frame_len: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            username: String::new(),
            remote: None,
            probe_timeout_ms: 3_000,
            handshake_timeout_ms: 5_000,
            idle_probe_interval_secs: Some(30),
            gossip_backoff_ms: 500,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_port: u16, username: impl Into<String>) -> Self {
        Self {
            listen_port,
            username: username.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = serde_json::from_str(&content)
            .map_err(|e| ChatError::Config(format!("cannot parse {}: {e}", path.display())))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks the values a user can get wrong on the command line.
    pub fn validate(&self) -> Result<()> {
        if self.listen_port < MIN_LISTEN_PORT {
            return Err(ChatError::Config(format!(
                "listen port {} is outside {}..=65535",
                self.listen_port, MIN_LISTEN_PORT
            )));
        }
        if self.username.trim().is_empty() {
            return Err(ChatError::Config("username must not be empty".into()));
        }
        if let Some(remote) = &self.remote {
            if remote.port < MIN_LISTEN_PORT {
                return Err(ChatError::Config(format!(
                    "remote port {} is outside {}..=65535",
                    remote.port, MIN_LISTEN_PORT
                )));
            }
        }
        if self.max_frame_len == 0 {
            return Err(ChatError::Config("max_frame_len must be positive".into()));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_probe_interval(&self) -> Option<Duration> {
        self.idle_probe_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn gossip_backoff(&self) -> Duration {
        Duration::from_millis(self.gossip_backoff_ms)
    }
}

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::engine::channel::Channel;
use crate::error::ConfigError;
use crate::membership::snapshot::{CHANNEL_PLACEHOLDER, DEFAULT_CHATTERS_URL};
use crate::membership::watcher::PollTiming;

/// Top-level cluster configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Channels joined at startup, spread over the worker connections.
    pub channels: Vec<String>,
    pub cluster: ClusterSection,
    pub options: OptionsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Number of worker connections.
    pub connections: usize,
    /// Rebuild join/part events by polling chatter lists.
    pub mock_membership: bool,
    /// Every watched channel is polled at least once in this window.
    pub membership_timer_local_ms: u64,
    /// Never poll more often than this, however many channels are watched.
    pub membership_timer_global_ms: u64,
    /// Chatters endpoint with a `{channel}` placeholder.
    pub chatters_url: String,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            connections: 10,
            mock_membership: false,
            membership_timer_local_ms: 20_000,
            membership_timer_global_ms: 20,
            chatters_url: DEFAULT_CHATTERS_URL.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptionsSection {
    /// Minimum time between two joins on one connection.
    pub join_interval_ms: u64,
}

impl Default for OptionsSection {
    fn default() -> Self {
        Self {
            join_interval_ms: 2000,
        }
    }
}

impl ClusterConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            Self::from_toml(path, &contents)?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_toml(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply `CLUSTER_*` overrides. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CLUSTER_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.cluster.connections = n;
        }
        if let Some(v) = var("CLUSTER_MOCK_MEMBERSHIP")
            && let Ok(enabled) = v.parse()
        {
            self.cluster.mock_membership = enabled;
        }
        if let Some(v) = var("CLUSTER_MEMBERSHIP_TIMER_LOCAL_MS")
            && let Ok(ms) = v.parse()
        {
            self.cluster.membership_timer_local_ms = ms;
        }
        if let Some(v) = var("CLUSTER_MEMBERSHIP_TIMER_GLOBAL_MS")
            && let Ok(ms) = v.parse()
        {
            self.cluster.membership_timer_global_ms = ms;
        }
        if let Some(v) = var("CLUSTER_JOIN_INTERVAL_MS")
            && let Ok(ms) = v.parse()
        {
            self.options.join_interval_ms = ms;
        }
        if let Some(v) = var("CLUSTER_CHATTERS_URL") {
            self.cluster.chatters_url = v;
        }
        if let Some(v) = var("CLUSTER_CHANNELS") {
            self.channels = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        if self.options.join_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "join_interval_ms" });
        }
        if self.cluster.membership_timer_local_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "membership_timer_local_ms" });
        }
        if self.cluster.membership_timer_global_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "membership_timer_global_ms" });
        }
        if self.cluster.mock_membership && !self.cluster.chatters_url.contains(CHANNEL_PLACEHOLDER) {
            return Err(ConfigError::ChattersUrl(self.cluster.chatters_url.clone()));
        }
        self.initial_channels().map(|_| ())
    }

    /// Startup channels, normalized, duplicates dropped, order kept.
    pub fn initial_channels(&self) -> Result<Vec<Channel>, ConfigError> {
        let mut channels: Vec<Channel> = Vec::with_capacity(self.channels.len());
        for name in &self.channels {
            let channel = Channel::parse(name).map_err(|reason| ConfigError::InvalidChannel {
                name: name.clone(),
                reason,
            })?;
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    pub fn join_interval(&self) -> Duration {
        Duration::from_millis(self.options.join_interval_ms)
    }

    pub fn poll_timing(&self) -> PollTiming {
        PollTiming {
            local_budget: Duration::from_millis(self.cluster.membership_timer_local_ms),
            global_min: Duration::from_millis(self.cluster.membership_timer_global_ms),
        }
    }
}

//! Channel server configuration
//!
//! Every field has a default, so an empty TOML file (or no file at all) yields a
//! working single-channel server. CLI flags in `main.rs` override the
//! host/port pair after loading.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::world_state::ScalingPolicy;
use crate::error::{ChannelError, Result};

/// Top-level configuration for one channel server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel number within the world
    pub id: u16,
    /// Display name, used as the sender of server chat messages
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Outbound queue depth per session
    pub send_queue_capacity: usize,
    /// Pause between send queue drains
    pub send_pacing_ms: u64,
    /// Sessions with no inbound packet for this long are logged out
    pub idle_timeout_secs: u64,
    /// Capacity of the pre-seeded lobby stages
    pub lobby_capacity: u16,
    /// Capacity of stages created implicitly by entering an unknown ID
    pub default_stage_capacity: u16,
    /// How long `WaitStageBinary` waits for a publish before failing
    pub wait_stage_binary_timeout_secs: u64,
    pub debug: DebugOptions,
    pub world_event: WorldEventConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "mhf-channel".to_string(),
            host: "0.0.0.0".to_string(),
            port: 54001,
            send_queue_capacity: 20,
            send_pacing_ms: 5,
            idle_timeout_secs: 30,
            lobby_capacity: 100,
            default_stage_capacity: 4,
            wait_stage_binary_timeout_secs: 10,
            debug: DebugOptions::default(),
            world_event: WorldEventConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ChannelError::state(format!("invalid config: {}", e)))
    }

    /// Config for the `offset`-th sibling channel: next port, next ID
    pub fn sibling(&self, offset: u16) -> Self {
        let mut config = self.clone();
        config.id = self.id + offset;
        config.port = self.port + offset;
        config.name = format!("{}-{}", self.name, config.id);
        config
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn send_pacing(&self) -> Duration {
        Duration::from_millis(self.send_pacing_ms)
    }

    pub fn wait_stage_binary_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_stage_binary_timeout_secs)
    }
}

/// Packet tracing switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub log_inbound_messages: bool,
    pub log_outbound_messages: bool,
    /// Include a hex dump of the payload
    pub log_message_data: bool,
    /// Payloads longer than this are summarized instead of dumped
    pub max_hexdump_length: usize,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            log_inbound_messages: false,
            log_outbound_messages: false,
            log_message_data: false,
            max_hexdump_length: 256,
        }
    }
}

/// Naming convention and tuning of the shared world event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldEventConfig {
    /// Semaphores whose name starts with this drive the world-event lifecycle
    pub semaphore_prefix: String,
    /// Suffix of the semaphore whose members receive register notifications
    pub main_semaphore_suffix: String,
    /// Capacity of world-event semaphores
    pub max_players: u16,
    /// Length of each counter array
    pub counters: usize,
    /// Notify every member after a register operation, not just the caller
    pub low_latency: bool,
    pub scaling: ScalingPolicy,
}

impl Default for WorldEventConfig {
    fn default() -> Self {
        Self {
            semaphore_prefix: "hs_l0u3B5".to_string(),
            main_semaphore_suffix: "3".to_string(),
            max_players: 127,
            counters: 30,
            low_latency: true,
            scaling: ScalingPolicy::default(),
        }
    }
}

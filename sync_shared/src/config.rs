//! Configuration system.
//!
//! Loads client and relay configuration from JSON strings or files.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    entity::SpawnPoint,
    math::{Quat, Vec3},
};

/// Client-side sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:8080`.
    pub server_url: String,
    /// Logical game/room name sent in `hello`.
    pub game: String,
    /// Connect as soon as the context is started in online mode.
    pub auto_connect: bool,
    /// Retry after transport errors and server closes.
    pub auto_reconnect: bool,
    /// Fixed wait before each reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Upper bound on the close handshake during shutdown.
    pub close_timeout_ms: u64,
    /// Local send cadence (50 ms = 20 Hz).
    pub sync_interval_ms: u64,
    /// Remote smoothing factor; multiplied by the frame delta.
    pub interpolation_speed: f32,
    /// Simulation tick rate of the demo loop.
    pub tick_hz: u32,
    /// Spawn a remote entity on the first update from an unknown peer.
    pub lazy_remote_spawn: bool,
    /// Slots for spawned vehicles, handed out round-robin.
    pub spawn_points: Vec<SpawnPoint>,
}

fn default_spawn_points() -> Vec<SpawnPoint> {
    (0..4)
        .map(|i| SpawnPoint::new(Vec3::new(i as f32 * 4.0, 0.0, 0.0), Quat::IDENTITY))
        .collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            game: "race".to_string(),
            auto_connect: true,
            auto_reconnect: true,
            reconnect_delay_ms: 2000,
            close_timeout_ms: 1000,
            sync_interval_ms: 50,
            interpolation_speed: 15.0,
            tick_hz: 60,
            lazy_remote_spawn: true,
            spawn_points: default_spawn_points(),
        }
    }
}

impl SyncConfig {
    /// Parses config from JSON. Missing keys take their defaults.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_hz.max(1) as f32)
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address, e.g. `127.0.0.1:8080`.
    pub listen_addr: String,
    /// Participants per session.
    pub capacity: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            capacity: 2,
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = SyncConfig::from_json_str(r#"{"game":"derby","reconnect_delay_ms":500}"#).unwrap();
        assert_eq!(cfg.game, "derby");
        assert_eq!(cfg.reconnect_delay(), Duration::from_millis(500));
        assert_eq!(cfg.sync_interval(), Duration::from_millis(50));
        assert_eq!(cfg.interpolation_speed, 15.0);
        assert_eq!(cfg.spawn_points.len(), 4);
    }

    #[test]
    fn spawn_points_parse() {
        let cfg = SyncConfig::from_json_str(
            r#"{"spawn_points":[{"position":{"x":1.0,"y":2.0,"z":3.0}}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.spawn_points.len(), 1);
        assert_eq!(cfg.spawn_points[0].position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(cfg.spawn_points[0].rotation, Quat::IDENTITY);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = SyncConfig::load("/nonexistent/sync.json").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/sync.json"));
    }

    #[test]
    fn relay_defaults() {
        let cfg = RelayConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.capacity, 2);
    }
}

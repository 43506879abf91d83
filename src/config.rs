use crate::voxel::VoxelLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for a world's sync loop. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub tick_period_ms: u64,
    pub save_interval_secs: f64,
    pub state_path: Option<PathBuf>,
    /// `None` runs until the process stops.
    pub max_ticks: Option<u64>,
    pub max_chunk_bytes: usize,
    pub voxel_limits: VoxelLimits,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            save_interval_secs: 5.0,
            state_path: None,
            max_ticks: None,
            max_chunk_bytes: 64 * 1024,
            voxel_limits: VoxelLimits::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        log::info!("[config] loaded {}", path.display());
        Ok(config)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn with_tick_period_ms(mut self, ms: u64) -> Self {
        self.tick_period_ms = ms;
        self
    }

    pub fn with_save_interval_secs(mut self, secs: f64) -> Self {
        self.save_interval_secs = secs;
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }

    pub fn with_max_chunk_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_bytes = bytes.max(1);
        self
    }

    pub fn with_voxel_limits(mut self, limits: VoxelLimits) -> Self {
        self.voxel_limits = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SyncConfig::from_json_str(r#"{ "tick_period_ms": 50, "state_path": "world.bin" }"#).unwrap();
        assert_eq!(config.tick_period_ms, 50);
        assert_eq!(config.state_path, Some(PathBuf::from("world.bin")));
        assert_eq!(config.save_interval_secs, 5.0);
        assert_eq!(config.voxel_limits, VoxelLimits::default());
    }

    #[test]
    fn nested_voxel_limits_parse() {
        let config = SyncConfig::from_json_str(r#"{ "voxel_limits": { "max_voxels": 10 } }"#).unwrap();
        assert_eq!(config.voxel_limits.max_voxels, 10);
        assert_eq!(config.voxel_limits.max_materials, 65_536);
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            SyncConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{ "max_ticks": 3 }"#).unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.max_ticks, Some(3));
        assert!(matches!(
            SyncConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}

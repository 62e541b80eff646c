//! Engine configuration, loaded from TOML or JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

/// Reconnect backoff and connect-storm limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay after the first failure (default: 500ms).
    pub initial_delay_ms: u64,
    /// Ceiling for the backoff (default: 30s).
    pub max_delay_ms: u64,
    /// Growth factor per consecutive failure (default: 2.0).
    pub backoff_multiplier: f64,
    /// Uniform jitter as a fraction of the delay, applied in both directions (default: 0.2).
    pub jitter_fraction: f64,
    /// Upper bound of the random stagger before a channel's first attempt (default: 250ms).
    pub initial_stagger_ms: u64,
    /// Connect attempts allowed in flight across all channels (default: 256).
    pub max_concurrent_connects: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.2,
            initial_stagger_ms: 250,
            max_concurrent_connects: 256,
        }
    }
}

/// A PV to archive, as listed in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvEntry {
    /// PV name.
    pub name: String,
    /// `DBR_*` sample type name.
    pub sample_type: String,
    /// Metadata fields captured alongside the value.
    #[serde(default)]
    pub extra_fields: Vec<String>,
    /// Alternate names resolving to this PV.
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Archive engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Startup grace period for a connect attempt, covering open and first value (default: 5s).
    pub connect_timeout_ms: u64,
    /// Per-channel writer queue depth (default: 1024).
    pub sink_queue_depth: usize,
    /// Reconnect scheduling.
    pub reconnect: ReconnectConfig,
    /// PVs to archive.
    pub pvs: Vec<PvEntry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            sink_queue_depth: 1024,
            reconnect: ReconnectConfig::default(),
            pvs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file; the format follows the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        if ext != "toml" && ext != "json" {
            return Err(ArchiveError::Config(format!(
                "unsupported config file extension: {}",
                ext
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = if ext == "toml" {
            toml::from_str(&contents)?
        } else {
            serde_json::from_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnect;
        if self.connect_timeout_ms == 0 {
            return Err(ArchiveError::Config("connect_timeout_ms must be > 0".into()));
        }
        if self.sink_queue_depth == 0 {
            return Err(ArchiveError::Config("sink_queue_depth must be > 0".into()));
        }
        if r.initial_delay_ms == 0 {
            return Err(ArchiveError::Config("initial_delay_ms must be > 0".into()));
        }
        if r.initial_delay_ms > r.max_delay_ms {
            return Err(ArchiveError::Config(format!(
                "initial_delay_ms ({}) > max_delay_ms ({})",
                r.initial_delay_ms, r.max_delay_ms
            )));
        }
        if r.backoff_multiplier < 1.0 {
            return Err(ArchiveError::Config("backoff_multiplier must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&r.jitter_fraction) {
            return Err(ArchiveError::Config("jitter_fraction must be in [0, 1)".into()));
        }
        if r.max_concurrent_connects == 0 {
            return Err(ArchiveError::Config("max_concurrent_connects must be > 0".into()));
        }
        Ok(())
    }

    /// The connect grace period as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

//! # Configuration
//!
//! YAML-based configuration for a transpose deployment: block geometry,
//! send routing, station buffering and real-time scheduling.
//!
//! ## Search Path
//!
//! Configuration is loaded from the first file found:
//! 1. Path in the `TABX_CONFIG` environment variable
//! 2. `./tabx.yaml` (current directory)
//!
//! ## Example Configuration
//!
//! ```yaml
//! transpose:
//!   nr_samples: 1024
//!   nr_subbands: 16
//!   nr_channels: 16
//!   nr_blocks: 0
//!   max_blocks_in_flight: 3
//!
//! sender:
//!   routes:
//!     0: "cbt001:5200"
//!     1: "cbt002:5200"
//!   overflow_policy: drop_oldest
//!
//! realtime:
//!   enable: true
//!   priority: high
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::collector::CollectorConfig;
use crate::queue::OverflowPolicy;
use crate::rt::WorkerPriority;
use crate::sender::SenderConfig;

/// Error type for configuration operations.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// No configuration file was found
    NotFound(String),
    /// Failed to read a configuration file
    ReadError(String),
    /// Failed to parse configuration
    ParseError(String),
    /// Invalid configuration value
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(msg) => write!(f, "config not found: {}", msg),
            ConfigError::ReadError(msg) => write!(f, "failed to read config: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::ValidationError(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Block geometry and collector policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransposeSection {
    /// Samples per subband per block
    pub nr_samples: usize,
    /// Subbands per block
    pub nr_subbands: usize,
    /// Channels per sample
    pub nr_channels: usize,
    /// Blocks per file; 0 = unknown/unbounded
    pub nr_blocks: u64,
    /// Bound on assembling blocks; 0 = strict sequential mode
    pub max_blocks_in_flight: usize,
    /// Output buffers per collector
    pub nr_pool_buffers: usize,
}

impl Default for TransposeSection {
    fn default() -> Self {
        Self {
            nr_samples: 1024,
            nr_subbands: 16,
            nr_channels: 16,
            nr_blocks: 0,
            max_blocks_in_flight: 0,
            nr_pool_buffers: 4,
        }
    }
}

impl TransposeSection {
    /// Collector parameters for one output file.
    pub fn collector_config(&self, file: u32) -> CollectorConfig {
        CollectorConfig {
            file,
            nr_blocks: self.nr_blocks,
            nr_subbands: self.nr_subbands,
            nr_samples: self.nr_samples,
            nr_channels: self.nr_channels,
            max_blocks_in_flight: self.max_blocks_in_flight,
            nr_pool_buffers: self.nr_pool_buffers,
        }
    }
}

/// Outgoing routing and queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSection {
    /// File index → destination `host:port`
    pub routes: HashMap<u32, String>,
    /// Per-destination queue capacity in subbands
    pub queue_capacity: usize,
    /// Full-queue behavior
    pub overflow_policy: OverflowPolicy,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Connection attempts before a destination is declared dead
    pub connect_attempts: u32,
    /// Pause between attempts in milliseconds
    pub retry_interval_ms: u64,
}

impl Default for SenderSection {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::Block,
            connect_timeout_ms: 5000,
            connect_attempts: 3,
            retry_interval_ms: 500,
        }
    }
}

impl SenderSection {
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            routes: self.routes.clone(),
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_attempts: self.connect_attempts,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

/// Station-side ring buffer and sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSection {
    /// Beamlets per station stream
    pub nr_beamlets: usize,
    /// Ring capacity in samples per beamlet (rounded up to a power of two)
    pub buffer_capacity: usize,
    /// Bound on validity-flag ranges per read window
    pub max_flag_ranges: usize,
    /// Station sample rate in Hz
    pub sample_rate_hz: f64,
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            nr_beamlets: 244,
            buffer_capacity: 1 << 20,
            max_flag_ranges: 16,
            sample_rate_hz: 195_312.5,
        }
    }
}

/// Real-time scheduling for the worker loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    /// Enable real-time scheduling
    pub enable: bool,
    /// Scheduling class: normal, medium or high
    pub priority: String,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            enable: false,
            priority: "high".to_string(),
        }
    }
}

impl RealtimeSection {
    /// The worker priority this section selects.
    pub fn worker_priority(&self) -> Result<WorkerPriority, ConfigError> {
        if !self.enable {
            return Ok(WorkerPriority::Normal);
        }
        match self.priority.as_str() {
            "normal" => Ok(WorkerPriority::Normal),
            "medium" => Ok(WorkerPriority::Medium),
            "high" => Ok(WorkerPriority::High),
            other => Err(ConfigError::ValidationError(format!(
                "unknown priority '{}' (expected normal, medium or high)",
                other
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete deployment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabxConfig {
    pub transpose: TransposeSection,
    pub sender: SenderSection,
    pub station: StationSection,
    pub realtime: RealtimeSection,
    pub log: LogSection,
}

impl TabxConfig {
    /// Load from the search path, falling back to defaults when no file
    /// exists.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("TABX_CONFIG") {
            return Self::from_file(Path::new(&path));
        }
        let local = Path::new("tabx.yaml");
        if local.exists() {
            return Self::from_file(local);
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    pub fn from_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Reject values no deployment can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transpose;
        if t.nr_samples == 0 || t.nr_subbands == 0 || t.nr_channels == 0 {
            return Err(ConfigError::ValidationError(format!(
                "block geometry must be non-zero, got {}x{}x{}",
                t.nr_samples, t.nr_subbands, t.nr_channels
            )));
        }
        if t.nr_pool_buffers == 0 {
            return Err(ConfigError::ValidationError(
                "at least one output pool buffer is required".into(),
            ));
        }
        if self.station.sample_rate_hz <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "sample rate must be positive, got {}",
                self.station.sample_rate_hz
            )));
        }
        if self.station.nr_beamlets == 0 {
            return Err(ConfigError::ValidationError(
                "at least one beamlet is required".into(),
            ));
        }
        self.realtime.worker_priority()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TabxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transpose.nr_subbands, 16);
        assert_eq!(config.sender.overflow_policy, OverflowPolicy::Block);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = TabxConfig::default();
        config.transpose.max_blocks_in_flight = 3;
        config.sender.routes.insert(0, "cbt001:5200".into());

        let yaml = config.to_yaml().unwrap();
        let parsed = TabxConfig::from_str(&yaml).unwrap();
        assert_eq!(parsed.transpose.max_blocks_in_flight, 3);
        assert_eq!(parsed.sender.routes.get(&0).unwrap(), "cbt001:5200");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "transpose:\n  nr_subbands: 4\n";
        let config = TabxConfig::from_str(yaml).unwrap();
        assert_eq!(config.transpose.nr_subbands, 4);
        assert_eq!(config.transpose.nr_samples, 1024);
        assert_eq!(config.station.max_flag_ranges, 16);
    }

    #[test]
    fn test_overflow_policy_parses() {
        let yaml = "sender:\n  overflow_policy: drop_oldest\n";
        let config = TabxConfig::from_str(yaml).unwrap();
        assert_eq!(config.sender.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_zero_geometry_rejected() {
        let yaml = "transpose:\n  nr_channels: 0\n";
        let err = TabxConfig::from_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_unknown_priority_rejected() {
        let yaml = "realtime:\n  enable: true\n  priority: turbo\n";
        let err = TabxConfig::from_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_priority_disabled_is_normal() {
        let section = RealtimeSection {
            enable: false,
            priority: "high".into(),
        };
        assert_eq!(section.worker_priority().unwrap(), WorkerPriority::Normal);
    }

    #[test]
    fn test_collector_config_conversion() {
        let section = TransposeSection {
            nr_samples: 64,
            nr_subbands: 8,
            nr_channels: 1,
            nr_blocks: 100,
            max_blocks_in_flight: 2,
            nr_pool_buffers: 3,
        };
        let cfg = section.collector_config(7);
        assert_eq!(cfg.file, 7);
        assert_eq!(cfg.nr_blocks, 100);
        assert!(cfg.can_drop());
    }

    #[test]
    fn test_missing_file_reported() {
        let err = TabxConfig::from_file(Path::new("/nonexistent/tabx.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}

//! # Configuration System
//!
//! YAML configuration for bladeRF sessions:
//!
//! - Device selection (identifier string, library path, driver verbosity)
//! - Channel parameters applied before streaming
//! - Sync transfer settings (buffer count/size, transfers, timeout)
//! - Async stream settings (buffer pool, layout)
//! - Logging
//!
//! ## Configuration Search Path
//!
//! Configuration is loaded from the first file found:
//! 1. Path specified via `BLADERF_CONFIG` environment variable
//! 2. `./bladerf.yaml` (current directory)
//! 3. `~/.config/bladerf/config.yaml` (user config)
//! 4. `/etc/bladerf/config.yaml` (system config)
//!
//! ## Example Configuration
//!
//! ```yaml
//! device:
//!   identifier: "*:serial=a662"
//!
//! channel:
//!   direction: rx
//!   index: 0
//!   frequency_hz: 96600000
//!   sample_rate_hz: 4000000
//!
//! stream:
//!   layout: rx_x2
//!   buffer_count: 16
//!   samples_per_buffer: 8192
//!   transfer_count: 8
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::logging::LogConfig;
use crate::types::{Channel, ChannelLayout, Direction, Format, GainMode, Verbosity};

/// Buffer sizes must be a multiple of this many samples.
pub const SAMPLES_ALIGNMENT: usize = 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),

    #[error("failed to read config: {0}")]
    ReadError(String),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Which device to open and how to reach the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device identifier (e.g. "*:serial=a662"); empty opens the first device
    pub identifier: String,
    /// Explicit path to libbladeRF (None = platform search)
    pub library: Option<PathBuf>,
    /// Driver-side log level
    pub verbosity: Verbosity,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            library: None,
            verbosity: Verbosity::Warning,
        }
    }
}

/// Channel parameters applied before streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub direction: Direction,
    pub index: u8,
    pub frequency_hz: u64,
    pub sample_rate_hz: u32,
    pub bandwidth_hz: u32,
    pub gain_mode: GainMode,
    /// Overall gain in dB; only applied when set
    pub gain_db: Option<i32>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            direction: Direction::Rx,
            index: 0,
            frequency_hz: 96_600_000,
            sample_rate_hz: 4_000_000,
            bandwidth_hz: 1_500_000,
            gain_mode: GainMode::Default,
            gain_db: None,
        }
    }
}

impl ChannelSettings {
    pub fn channel(&self) -> Channel {
        Channel::new(self.direction, self.index)
    }
}

/// Settings for the blocking sync interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub layout: ChannelLayout,
    pub format: Format,
    /// Buffers in the driver's internal pool (>= 2)
    pub num_buffers: u32,
    /// Samples per buffer, multiple of 1024
    pub buffer_size: u32,
    /// USB transfers in flight (< num_buffers)
    pub num_transfers: u32,
    /// Per-transfer timeout in milliseconds
    pub timeout_ms: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            layout: ChannelLayout::RxX1,
            format: Format::Sc16Q11,
            num_buffers: 16,
            buffer_size: 8192,
            num_transfers: 8,
            timeout_ms: 3500,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_pool(
            "sync",
            self.num_buffers as usize,
            self.buffer_size as usize,
            self.num_transfers as usize,
        )
    }
}

/// Settings for the callback-driven stream interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub format: Format,
    /// Buffers in the engine-owned pool (>= 2)
    pub buffer_count: usize,
    /// Samples per buffer, multiple of 1024
    pub samples_per_buffer: usize,
    /// USB transfers in flight (< buffer_count)
    pub transfer_count: usize,
    pub direction: Direction,
    pub layout: ChannelLayout,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: Format::Sc16Q11,
            buffer_count: 16,
            samples_per_buffer: 8192,
            transfer_count: 8,
            direction: Direction::Rx,
            layout: ChannelLayout::RxX1,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_pool(
            "stream",
            self.buffer_count,
            self.samples_per_buffer,
            self.transfer_count,
        )?;
        if self.layout.direction() != self.direction {
            return Err(ConfigError::ValidationError(format!(
                "stream layout {:?} does not match direction {}",
                self.layout, self.direction
            )));
        }
        Ok(())
    }
}

fn validate_pool(
    section: &str,
    buffers: usize,
    samples: usize,
    transfers: usize,
) -> Result<(), ConfigError> {
    if buffers < 2 {
        return Err(ConfigError::ValidationError(format!(
            "{}: at least 2 buffers required, got {}",
            section, buffers
        )));
    }
    if samples == 0 || samples % SAMPLES_ALIGNMENT != 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}: buffer size must be a positive multiple of {}, got {}",
            section, SAMPLES_ALIGNMENT, samples
        )));
    }
    if transfers == 0 || transfers >= buffers {
        return Err(ConfigError::ValidationError(format!(
            "{}: transfer count must be in 1..{}, got {}",
            section, buffers, transfers
        )));
    }
    Ok(())
}

/// Complete session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BladeRfConfig {
    pub device: DeviceSettings,
    pub channel: ChannelSettings,
    pub sync: SyncConfig,
    pub stream: StreamConfig,
    pub logging: LogConfig,
}

impl BladeRfConfig {
    /// Load configuration from the default search path.
    ///
    /// Returns the default config if no file is found.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("BLADERF_CONFIG") {
            if Path::new(&path).exists() {
                return Self::load_from(Path::new(&path));
            }
        }

        for path in &Self::config_search_paths() {
            if path.exists() {
                return Self::load_from(path);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_yaml()?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))
    }

    /// Standard locations, in search order (excluding the environment variable).
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./bladerf.yaml")];

        if let Some(dirs) = directories::ProjectDirs::from("", "", "bladerf") {
            paths.push(dirs.config_dir().join("config.yaml"));
        }

        paths.push(PathBuf::from("/etc/bladerf/config.yaml"));
        paths
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.frequency_hz == 0 {
            return Err(ConfigError::ValidationError(
                "frequency_hz must be > 0".to_string(),
            ));
        }
        if self.channel.sample_rate_hz == 0 {
            return Err(ConfigError::ValidationError(
                "sample_rate_hz must be > 0".to_string(),
            ));
        }
        self.sync.validate()?;
        self.stream.validate()?;
        Ok(())
    }

    /// Example configuration as YAML: a two-channel RX stream.
    pub fn example_yaml() -> String {
        let config = Self {
            device: DeviceSettings {
                identifier: "*:serial=a662".to_string(),
                ..Default::default()
            },
            sync: SyncConfig {
                layout: ChannelLayout::RxX2,
                ..Default::default()
            },
            stream: StreamConfig {
                layout: ChannelLayout::RxX2,
                ..Default::default()
            },
            ..Default::default()
        };

        serde_yaml::to_string(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BladeRfConfig::default();
        assert!(config.device.identifier.is_empty());
        assert_eq!(config.stream.buffer_count, 16);
        assert_eq!(config.stream.samples_per_buffer, 8192);
        assert_eq!(config.sync.timeout_ms, 3500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
device:
  identifier: "*:serial=f12c"
  verbosity: debug

channel:
  direction: tx
  index: 1
  frequency_hz: 915000000
  gain_mode: mgc
  gain_db: 30

sync:
  layout: tx_x1
  format: sc16_q11_meta
  timeout_ms: 500

stream:
  direction: tx
  layout: tx_x2
  buffer_count: 32
"#;

        let config = BladeRfConfig::parse(yaml).unwrap();
        assert_eq!(config.device.identifier, "*:serial=f12c");
        assert_eq!(config.device.verbosity, Verbosity::Debug);
        assert_eq!(config.channel.channel(), Channel::TX1);
        assert_eq!(config.channel.gain_mode, GainMode::Mgc);
        assert_eq!(config.channel.gain_db, Some(30));
        assert_eq!(config.sync.format, Format::Sc16Q11Meta);
        assert_eq!(config.sync.timeout_ms, 500);
        assert_eq!(config.sync.num_buffers, 16);
        assert_eq!(config.stream.layout, ChannelLayout::TxX2);
        assert_eq!(config.stream.buffer_count, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stream_validation() {
        let mut stream = StreamConfig::default();
        assert!(stream.validate().is_ok());

        stream.buffer_count = 1;
        assert!(stream.validate().is_err());

        stream.buffer_count = 16;
        stream.samples_per_buffer = 1000;
        assert!(stream.validate().is_err());

        stream.samples_per_buffer = 0;
        assert!(stream.validate().is_err());

        stream.samples_per_buffer = 2048;
        stream.transfer_count = 16;
        assert!(stream.validate().is_err());

        stream.transfer_count = 8;
        stream.layout = ChannelLayout::TxX1;
        assert!(stream.validate().is_err());
    }

    #[test]
    fn test_validation_error_maps_to_invalid_parameter() {
        let err: Error = SyncConfig {
            num_transfers: 0,
            ..Default::default()
        }
        .validate()
        .unwrap_err()
        .into();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bladerf.yaml");

        let mut config = BladeRfConfig::default();
        config.channel.frequency_hz = 433_920_000;
        config.save(&path).unwrap();

        let loaded = BladeRfConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let err = BladeRfConfig::load_from(Path::new("/nonexistent/bladerf.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }

    #[test]
    fn test_example_yaml() {
        let yaml = BladeRfConfig::example_yaml();
        assert!(yaml.contains("rx_x2"));
        let parsed = BladeRfConfig::parse(&yaml).unwrap();
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_config_search_paths() {
        let paths = BladeRfConfig::config_search_paths();
        assert!(paths[0].ends_with("bladerf.yaml"));
        assert!(paths.last().unwrap().starts_with("/etc"));
    }
}

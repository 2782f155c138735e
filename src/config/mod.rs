//! Configuration module
//!
//! Handles loading and saving ledgerwire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::device::wait_budget;
use crate::discovery::{DeviceMatcher, LEDGER_PRODUCT, LEDGER_USAGE_PAGE, LEDGER_VENDOR_ID};
use crate::exchange::{ExchangeConfig, GlitchSignature, RecoveryPolicy, DEFAULT_READ_TIMEOUT};
use crate::protocol::{from_hex, FrameFormat, FramingMode, DEFAULT_CHANNEL, PACKET_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Which device to talk to
    #[serde(default)]
    pub device: DeviceConfig,

    /// Framing and timeouts
    #[serde(default)]
    pub transport: TransportConfig,

    /// Glitch recovery bounds
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// USB vendor id
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    /// Substring of the product name (case-insensitive)
    pub product: Option<String>,
    /// HID usage page of the interface to open
    pub usage_page: Option<u16>,
}

fn default_vendor_id() -> u16 {
    LEDGER_VENDOR_ID
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product: Some(LEDGER_PRODUCT.to_string()),
            usage_page: Some(LEDGER_USAGE_PAGE),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Channel id written in every packet
    #[serde(default = "default_channel")]
    pub channel: u16,
    /// Use BLE framing (no channel field)
    #[serde(default)]
    pub ble: bool,
    /// Report size in bytes
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    /// Wait per report in ms (0 or negative blocks indefinitely)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: i64,
    /// Overall wait for a response in ms (0 waits forever)
    #[serde(default)]
    pub response_timeout_ms: u64,
    /// Hex report that triggers recovery (all zeros if not set)
    pub glitch_signature: Option<String>,
}

fn default_channel() -> u16 {
    DEFAULT_CHANNEL
}

fn default_packet_size() -> usize {
    PACKET_SIZE
}

fn default_read_timeout() -> i64 {
    DEFAULT_READ_TIMEOUT.as_millis() as i64
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            ble: false,
            packet_size: default_packet_size(),
            read_timeout_ms: default_read_timeout(),
            response_timeout_ms: 0,
            glitch_signature: None,
        }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Glitch count at which to pause once before resending
    #[serde(default = "default_backoff_after")]
    pub backoff_after: u32,
    /// Pause length in ms
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
    /// Glitch count at which to give up
    #[serde(default = "default_max_glitches")]
    pub max_glitches: u32,
}

fn default_backoff_after() -> u32 {
    RecoveryPolicy::default().backoff_after
}

fn default_backoff() -> u64 {
    RecoveryPolicy::default().backoff.as_millis() as u64
}

fn default_max_glitches() -> u32 {
    RecoveryPolicy::default().max_glitches
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backoff_after: default_backoff_after(),
            backoff_ms: default_backoff(),
            max_glitches: default_max_glitches(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("ledgerwire/config.toml")),
            Some(PathBuf::from("./ledgerwire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading config from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Device matcher built from the `device` section
    pub fn matcher(&self) -> DeviceMatcher {
        DeviceMatcher {
            vendor_id: self.device.vendor_id,
            product: self.device.product.clone(),
            usage_page: self.device.usage_page,
        }
    }

    pub fn frame_format(&self) -> ConfigResult<FrameFormat> {
        let mode = if self.transport.ble {
            FramingMode::Ble
        } else {
            FramingMode::Hid
        };
        FrameFormat::new(self.transport.channel, mode, self.transport.packet_size)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Exchange settings built from the `transport` and `recovery` sections
    pub fn exchange_config(&self) -> ConfigResult<ExchangeConfig> {
        let format = self.frame_format()?;

        let glitch_signature = match &self.transport.glitch_signature {
            Some(hex) => {
                let pattern = from_hex(hex)
                    .map_err(|e| ConfigError::Invalid(format!("glitch_signature: {}", e)))?;
                if pattern.len() != format.packet_size() {
                    return Err(ConfigError::Invalid(format!(
                        "glitch_signature is {} bytes, reports are {}",
                        pattern.len(),
                        format.packet_size()
                    )));
                }
                GlitchSignature::new(pattern)
            }
            None => GlitchSignature::zeroed(format.packet_size()),
        };

        let recovery = RecoveryPolicy {
            backoff_after: self.recovery.backoff_after,
            backoff: Duration::from_millis(self.recovery.backoff_ms),
            max_glitches: self.recovery.max_glitches,
        };
        if recovery.max_glitches == 0 {
            return Err(ConfigError::Invalid("max_glitches must be at least 1".to_string()));
        }

        let response_timeout = match self.transport.response_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(ExchangeConfig {
            format,
            read_timeout: wait_budget(self.transport.read_timeout_ms),
            response_timeout,
            glitch_signature,
            recovery,
        })
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        device: DeviceConfig {
            product: Some("Nano".to_string()),
            ..Default::default()
        },
        transport: TransportConfig {
            response_timeout_ms: 60_000,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.channel, DEFAULT_CHANNEL);
        assert_eq!(config.matcher(), DeviceMatcher::default());
        assert_eq!(config.exchange_config().unwrap(), ExchangeConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.transport.read_timeout_ms = 250;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.transport.read_timeout_ms, 250);
        assert_eq!(loaded.device.vendor_id, LEDGER_VENDOR_ID);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.device.product.as_deref(), Some("Nano"));
        assert_eq!(
            parsed.exchange_config().unwrap().response_timeout,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transport]
            ble = true
            read_timeout_ms = 0
            glitch_signature = "ff"

            [recovery]
            max_glitches = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.recovery.backoff_ms, 100);
        assert!(matches!(config.exchange_config(), Err(ConfigError::Invalid(_))));

        let mut config = config;
        config.transport.glitch_signature = Some("ab".repeat(PACKET_SIZE));
        let exchange = config.exchange_config().unwrap();
        assert_eq!(exchange.format.mode(), FramingMode::Ble);
        assert_eq!(exchange.read_timeout, None);
        assert_eq!(exchange.recovery.max_glitches, 3);
        assert!(exchange.glitch_signature.matches(&[0xab; PACKET_SIZE]));
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let mut config = Config::default();
        config.transport.channel = 0;
        assert!(matches!(config.frame_format(), Err(ConfigError::Invalid(_))));
    }
}

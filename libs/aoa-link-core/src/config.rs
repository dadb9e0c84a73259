use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    accessory::AccessoryDescriptor,
    connection::{ConnectionOptions, DEFAULT_REENUMERATION_TIMEOUT},
    negotiation::DEFAULT_CONTROL_TIMEOUT,
    transport::{DEFAULT_POOL_SIZE, DEFAULT_READ_BACKOFF, MAX_ENVELOPE_SIZE, TransportOptions},
};

pub const CONFIG_DIR_NAME: &str = "aoa-link";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_ACCESSORY_DEVICE_PATH: &str = "/dev/usb_accessory";

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The default configuration file path is not available.
    #[error("Default configuration file path is not available")]
    NotAvailable,
    #[error("Failed to read configuration file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_local_dir()
        .map(|path| path.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NotAvailable)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_envelope_size: usize,
    pub pool_size: usize,
    pub read_backoff_ms: u64,
    pub max_read_failures: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_envelope_size: MAX_ENVELOPE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            read_backoff_ms: DEFAULT_READ_BACKOFF.as_millis() as u64,
            max_read_failures: None,
        }
    }
}

impl TransportConfig {
    /// Replace values no transport can run with by their defaults.
    fn sanitize(&mut self) {
        if self.max_envelope_size == 0 {
            warn!("max_envelope_size must be at least 1, using {MAX_ENVELOPE_SIZE}");
            self.max_envelope_size = MAX_ENVELOPE_SIZE;
        }
        if self.pool_size == 0 {
            warn!("pool_size must be at least 1, using {DEFAULT_POOL_SIZE}");
            self.pool_size = DEFAULT_POOL_SIZE;
        }
    }

    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            max_envelope_size: self.max_envelope_size,
            pool_size: self.pool_size,
            read_backoff: Duration::from_millis(self.read_backoff_ms),
            max_read_failures: self.max_read_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub control_timeout_ms: u64,
    pub reenumeration_timeout_ms: u64,
    pub interface_number: u8,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: DEFAULT_CONTROL_TIMEOUT.as_millis() as u64,
            reenumeration_timeout_ms: DEFAULT_REENUMERATION_TIMEOUT.as_millis() as u64,
            interface_number: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessoryDeviceConfig {
    /// Device node the accessory side reads and writes.
    pub path: PathBuf,
}

impl Default for AccessoryDeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_ACCESSORY_DEVICE_PATH),
        }
    }
}

/// Everything both ends of the link can be configured with. Every field is
/// optional in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub accessory: AccessoryDescriptor,
    pub transport: TransportConfig,
    pub negotiation: NegotiationConfig,
    pub accessory_device: AccessoryDeviceConfig,
}

impl LinkConfig {
    pub fn from_json(source: &[u8]) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_slice(source)?;
        config.transport.sanitize();
        Ok(config)
    }

    /// Read the file at `path`. A file that does not exist is `Ok(None)`.
    pub fn read(path: &Path) -> Result<Option<Self>, ConfigError> {
        debug!("Reading configuration file from {path:?}");
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No configuration file at {path:?}");
                return Ok(None);
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        Self::from_json(&content)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Load from `path`, or from the default location when none is given.
    /// Anything that goes wrong is logged and the defaults are used.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Ok(path) => path,
                Err(e) => {
                    error!("{e}. Using default configuration.");
                    return Self::default();
                }
            },
        };

        match Self::read(&path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                error!("{e}. Using default configuration.");
                Self::default()
            }
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            interface: self.negotiation.interface_number,
            control_timeout: Duration::from_millis(self.negotiation.control_timeout_ms),
            reenumeration_timeout: Duration::from_millis(
                self.negotiation.reenumeration_timeout_ms,
            ),
            transport: self.transport.options(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_file(name: &str, content: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("aoa-link-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        let options = config.connection_options();

        assert_eq!(config.accessory, AccessoryDescriptor::default());
        assert_eq!(options.interface, 0);
        assert_eq!(options.control_timeout, Duration::from_secs(10));
        assert_eq!(options.reenumeration_timeout, Duration::from_secs(10));
        assert_eq!(options.transport, TransportOptions::default());
        assert_eq!(
            config.accessory_device.path,
            PathBuf::from("/dev/usb_accessory")
        );
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = LinkConfig::from_json(
            br#"{
                "accessory": { "model": "Bench Rig" },
                "transport": { "read_backoff_ms": 250, "max_read_failures": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.accessory.model, "Bench Rig");
        assert_eq!(config.accessory.manufacturer, "Android");
        let options = config.transport.options();
        assert_eq!(options.read_backoff, Duration::from_millis(250));
        assert_eq!(options.max_read_failures, Some(3));
        assert_eq!(options.max_envelope_size, 16384);
        assert_eq!(config.negotiation, NegotiationConfig::default());
    }

    #[test]
    fn test_unusable_transport_sizes_fall_back() {
        let config = LinkConfig::from_json(
            br#"{ "transport": { "max_envelope_size": 0, "pool_size": 0, "read_backoff_ms": 1 } }"#,
        )
        .unwrap();

        assert_eq!(config.transport.max_envelope_size, 16384);
        assert_eq!(config.transport.pool_size, 8);
        assert_eq!(config.transport.read_backoff_ms, 1);
    }

    #[test]
    fn test_read_missing_file() {
        let path = std::env::temp_dir().join("aoa-link-test-does-not-exist.json");
        assert!(LinkConfig::read(&path).unwrap().is_none());
        assert_eq!(LinkConfig::load(Some(path.as_path())), LinkConfig::default());
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let path = scratch_file("malformed.json", b"{ not json");

        assert!(matches!(
            LinkConfig::read(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert_eq!(LinkConfig::load(Some(path.as_path())), LinkConfig::default());
    }

    #[test]
    fn test_load_explicit_path() {
        let path = scratch_file(
            "explicit.json",
            br#"{ "accessory_device": { "path": "/tmp/accessory" } }"#,
        );

        let config = LinkConfig::load(Some(path.as_path()));

        assert_eq!(config.accessory_device.path, PathBuf::from("/tmp/accessory"));
    }
}

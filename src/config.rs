//! Configuration for block device clients

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::virtq::MAX_QUEUE_SIZE;
use crate::{Error, Result};

/// Configuration for opening a [`BlockDeviceClient`](crate::BlockDeviceClient)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Path to the device file exposing the shared region
    pub device: PathBuf,
    /// Ring size agreed with the backend (default: 256)
    pub queue_size: u16,
    /// Queue identifier passed to the notify call (default: 0)
    pub queue_index: u16,
    /// Upper bound on waiting for one completion (default: 5s)
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Sleep between used-ring polls (default: 10us)
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Extra attempts when the ring is momentarily full (default: 3)
    pub queue_full_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::new(),
            queue_size: 256,
            queue_index: 0,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(10),
            queue_full_retries: 3,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device path
    pub fn device<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.device = path.into();
        self
    }

    /// Set the ring size
    pub fn queue_size(mut self, size: u16) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the queue identifier used for notifications
    pub fn queue_index(mut self, index: u16) -> Self {
        self.queue_index = index;
        self
    }

    /// Set the completion timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how often a full queue is retried
    pub fn queue_full_retries(mut self, retries: u32) -> Self {
        self.queue_full_retries = retries;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.device.as_os_str().is_empty() {
            return Err(Error::Config("device path must be set".into()));
        }

        let size = self.queue_size as u32;
        if size < 2 || size > MAX_QUEUE_SIZE || !size.is_power_of_two() {
            return Err(Error::Config(format!(
                "queue size {} must be a power of two between 2 and {}",
                self.queue_size, MAX_QUEUE_SIZE
            )));
        }

        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be greater than zero".into()));
        }
        if self.poll_interval > self.timeout {
            return Err(Error::Config(format!(
                "poll interval {:?} exceeds timeout {:?}",
                self.poll_interval, self.timeout
            )));
        }

        Ok(())
    }
}

/// Load a client configuration from a JSON or YAML file (chosen by extension).
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let config: ClientConfig = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    };

    config.validate()?;
    Ok(config)
}

/// Durations as humantime strings ("5s", "10us").
mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}

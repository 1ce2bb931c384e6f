//! Engine settings.
//!
//! [`Settings`] replaces process-wide defaults: it is built once (from code or
//! TOML) and handed to [`Host::new`](crate::Host::new) and
//! [`ChannelSelector::new`](crate::ChannelSelector::new).
//!
//! ```
//! use kanalwahl::Settings;
//!
//! let settings = Settings::from_toml_str("sample_rate = 44100\nramp_duration = 0.05").unwrap();
//! assert_eq!(settings.sample_rate, 44100);
//! assert_eq!(settings.channel_count, 2);
//! ```

use std::path::Path;

use dasp_graph::Buffer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::unit::StreamFormat;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Stream and automation settings shared by a host and the nodes it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sample rate of the render context in Hz
    pub sample_rate: u32,

    /// Channel count negotiated with the host
    pub channel_count: u16,

    /// Default ramp duration in seconds for new nodes (0 = immediate)
    pub ramp_duration: f64,

    /// Capacity of each node's control message queue
    pub message_queue_size: usize,

    /// Capacity of each node's notification queue
    pub notification_queue_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channel_count: 2,
            ramp_duration: 0.000_2,
            message_queue_size: 64,
            notification_queue_size: 64,
        }
    }
}

impl Settings {
    /// Parse and validate settings from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), ?settings, "loaded settings");
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if !self.ramp_duration.is_finite() || self.ramp_duration < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "ramp_duration must be a finite, non-negative number of seconds (got {})",
                self.ramp_duration
            )));
        }
        if self.message_queue_size == 0 || self.notification_queue_size == 0 {
            return Err(ConfigError::Invalid("queue sizes must be non-zero".into()));
        }
        Ok(())
    }

    /// Format the host offers to processing units.
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            channels: self.channel_count,
        }
    }

    /// Duration of one render block in seconds.
    pub fn block_duration(&self) -> f64 {
        Buffer::LEN as f64 / self.sample_rate as f64
    }
}

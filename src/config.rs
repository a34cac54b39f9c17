//! Client configuration.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sys::MediaStreamConstraints;

/// Environment variable naming a TOML config file.
pub const CONFIG_ENV: &str = "DUO_CALL_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Free-form label shown to the other participant.
    pub display_name: String,

    pub room: String,

    /// Answer incoming calls without waiting for `accept_call`.
    pub auto_answer: bool,

    pub media: MediaStreamConstraints,

    /// `tracing_subscriber::EnvFilter` directives.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_owned(),
            room: "lobby".to_owned(),
            auto_answer: true,
            media: MediaStreamConstraints::default(),
            log_filter: "info".to_owned(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Loads the file named by [`CONFIG_ENV`], or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn with_identity(
        mut self,
        display_name: impl Into<String>,
        room: impl Into<String>,
    ) -> Self {
        self.display_name = display_name.into();
        self.room = room.into();
        self
    }
}

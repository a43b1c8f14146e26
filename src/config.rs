//! Configuration for rocketchat-realtime

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::RealtimeError;
use crate::realtime::{Credentials, SessionConfig, DEFAULT_SUBSCRIPTION_BUFFER};

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rocketchat-realtime")
        .join("config.toml")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Realtime API WebSocket URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Login name or email address
    #[serde(default)]
    pub username: Option<String>,

    /// Plaintext password (digested before it is sent)
    #[serde(default)]
    pub password: Option<String>,

    /// Resume token; used instead of the password when both are set
    #[serde(default)]
    pub token: Option<String>,

    /// Frames buffered per subscription before pushes are dropped
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

fn default_server_url() -> String {
    "ws://localhost:3000/websocket".to_string()
}

fn default_subscription_buffer() -> usize {
    DEFAULT_SUBSCRIPTION_BUFFER
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            username: None,
            password: None,
            token: None,
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    /// Credentials to authenticate with. A token wins over a password.
    pub fn credentials(&self) -> Result<Credentials, RealtimeError> {
        let username = self
            .username
            .clone()
            .ok_or_else(|| RealtimeError::Config("No username configured".into()))?;

        match (&self.token, &self.password) {
            (Some(token), _) => Ok(Credentials::Token {
                username,
                token: token.clone(),
            }),
            (None, Some(password)) => Ok(Credentials::Password {
                username,
                password: password.clone(),
            }),
            (None, None) => Err(RealtimeError::Config(
                "Neither a password nor a token is configured".into(),
            )),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.server_url.clone(),
            subscription_buffer: self.subscription_buffer.max(1),
        }
    }
}

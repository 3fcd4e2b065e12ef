//! Deployment configuration.

use crate::push::PushMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};
use thiserror::Error;
use vireo_core::Notice;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inactivity interval after which a session expires, in seconds.
    pub session_timeout: u64,
    /// How long a request waits for the session lock, in milliseconds.
    pub lock_timeout: u64,
    pub push_mode: PushMode,
    /// Surface invocations without a handler to the client as an error.
    pub strict_rpc: bool,
    /// Require the session's CSRF token on every request.
    pub xsrf_protection: bool,
    /// Seconds between client heartbeats; 0 turns heartbeats off.
    pub heartbeat_interval: u64,
    /// When false, heartbeats alone keep a session from going idle.
    pub close_idle_sessions: bool,
    pub system_messages: SystemMessages,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            session_timeout: 1800,
            lock_timeout: 30_000,
            push_mode: PushMode::Disabled,
            strict_rpc: false,
            xsrf_protection: true,
            heartbeat_interval: 300,
            close_idle_sessions: false,
            system_messages: SystemMessages::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&source)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout == 0 {
            return Err(ConfigError::Invalid("session_timeout must be positive".into()));
        }
        if self.lock_timeout == 0 {
            return Err(ConfigError::Invalid("lock_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Silence after which the client is considered gone: three missed heartbeats, with slack
    /// for late ones.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        match self.heartbeat_interval {
            0 => None,
            secs => Some(Duration::from_millis(secs.saturating_mul(3100))),
        }
    }
}

/// User-facing messages for the terminal failure modes.
///
/// A configured message only replaces the fields it names.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "SystemMessagesOverrides")]
pub struct SystemMessages {
    pub session_expired: SystemMessage,
    pub communication_error: SystemMessage,
}

impl Default for SystemMessages {
    fn default() -> Self {
        SystemMessages {
            session_expired: SystemMessage {
                caption: Some("Session Expired".into()),
                message: Some("Take note of any unsaved data, and click here to continue.".into()),
                url: None,
                enabled: true,
            },
            communication_error: SystemMessage {
                caption: Some("Communication problem".into()),
                message: Some("Take note of any unsaved data, and click here to continue.".into()),
                url: None,
                enabled: true,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SystemMessagesOverrides {
    session_expired: SystemMessageOverride,
    communication_error: SystemMessageOverride,
}

impl From<SystemMessagesOverrides> for SystemMessages {
    fn from(overrides: SystemMessagesOverrides) -> Self {
        let defaults = SystemMessages::default();
        SystemMessages {
            session_expired: overrides.session_expired.apply_to(defaults.session_expired),
            communication_error: overrides.communication_error.apply_to(defaults.communication_error),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SystemMessageOverride {
    caption: Option<String>,
    message: Option<String>,
    url: Option<String>,
    enabled: Option<bool>,
}

impl SystemMessageOverride {
    fn apply_to(self, base: SystemMessage) -> SystemMessage {
        SystemMessage {
            caption: self.caption.or(base.caption),
            message: self.message.or(base.message),
            url: self.url.or(base.url),
            enabled: self.enabled.unwrap_or(base.enabled),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemMessage {
    pub caption: Option<String>,
    pub message: Option<String>,
    /// Where to go after the message; `None` reloads the application.
    pub url: Option<String>,
    /// When false the client skips the notice and goes straight to `url`.
    pub enabled: bool,
}

impl SystemMessage {
    pub fn notice(&self) -> Notice {
        if self.enabled {
            Notice {
                caption: self.caption.clone(),
                message: self.message.clone(),
                url: self.url.clone(),
            }
        } else {
            Notice {
                url: self.url.clone(),
                ..Notice::default()
            }
        }
    }
}

use crate::state::ListeningMode;
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

/// Runtime configuration, read once at startup. Nothing here is persisted
/// by the core; it is plain input to the composition root.
#[derive(Debug)]
pub struct AppConfig {
    /// Backend endpoint handed to the transport implementation.
    pub server_url: String,
    /// Device access token, kept out of logs and debug output.
    pub access_token: Option<SecretBox<String>>,
    pub listening_mode: ListeningMode,
    pub wake_word_enabled: bool,
    /// RMS threshold for the reference energy detector.
    pub wake_threshold: f32,
    pub command_queue_size: usize,
    pub shutdown_timeout: Duration,
    pub resource_cleanup_timeout: Duration,
    pub playback_wait_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server_url: "ws://localhost:8000/session".to_string(),
            access_token: None,
            listening_mode: ListeningMode::AutoStop,
            wake_word_enabled: true,
            wake_threshold: 0.12,
            command_queue_size: 256,
            shutdown_timeout: Duration::from_secs(5),
            resource_cleanup_timeout: Duration::from_secs(1),
            playback_wait_timeout: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment. A `.env` file is honored in
    /// development but its absence is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = AppConfig::default();

        if let Ok(url) = env::var("VOXLINK_SERVER_URL") {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    name: "VOXLINK_SERVER_URL".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            config.server_url = url;
        }

        if let Ok(token) = env::var("VOXLINK_ACCESS_TOKEN") {
            if token.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    name: "VOXLINK_ACCESS_TOKEN".to_string(),
                    reason: "must not be empty when set".to_string(),
                });
            }
            config.access_token = Some(SecretBox::new(Box::new(token)));
        }

        if let Ok(mode) = env::var("VOXLINK_LISTENING_MODE") {
            config.listening_mode =
                ListeningMode::parse(&mode).ok_or_else(|| ConfigError::InvalidValue {
                    name: "VOXLINK_LISTENING_MODE".to_string(),
                    reason: format!("unknown mode '{mode}'"),
                })?;
        }

        if let Ok(enabled) = env::var("VOXLINK_WAKE_WORD_ENABLED") {
            config.wake_word_enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
        }

        if let Ok(threshold) = env::var("VOXLINK_WAKE_THRESHOLD") {
            config.wake_threshold =
                threshold
                    .parse::<f32>()
                    .map_err(|e| ConfigError::InvalidValue {
                        name: "VOXLINK_WAKE_THRESHOLD".to_string(),
                        reason: e.to_string(),
                    })?;
        }

        if let Ok(secs) = env::var("VOXLINK_SHUTDOWN_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                name: "VOXLINK_SHUTDOWN_TIMEOUT_SECS".to_string(),
                reason: e.to_string(),
            })?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.command_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "command_queue_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.wake_threshold) {
            return Err(ConfigError::InvalidValue {
                name: "wake_threshold".to_string(),
                reason: "must be within 0.0..=1.0".to_string(),
            });
        }
        Ok(())
    }

    /// Expose the access token for the transport handshake only.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_ref()
            .map(|token| token.expose_secret().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "VOXLINK_SERVER_URL",
            "VOXLINK_ACCESS_TOKEN",
            "VOXLINK_LISTENING_MODE",
            "VOXLINK_WAKE_WORD_ENABLED",
            "VOXLINK_WAKE_THRESHOLD",
            "VOXLINK_SHUTDOWN_TIMEOUT_SECS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_load() {
        clear_env();
        let config = AppConfig::load().unwrap();
        assert_eq!(config.listening_mode, ListeningMode::AutoStop);
        assert!(config.wake_word_enabled);
        assert_eq!(config.command_queue_size, 256);
        assert!(config.access_token().is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("VOXLINK_LISTENING_MODE", "manual");
        env::set_var("VOXLINK_WAKE_WORD_ENABLED", "false");
        env::set_var("VOXLINK_ACCESS_TOKEN", "tok-123");
        let config = AppConfig::load().unwrap();
        assert_eq!(config.listening_mode, ListeningMode::Manual);
        assert!(!config.wake_word_enabled);
        assert_eq!(config.access_token(), Some("tok-123"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_mode_rejected() {
        clear_env();
        env::set_var("VOXLINK_LISTENING_MODE", "sometimes");
        assert!(AppConfig::load().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_empty_token_rejected() {
        clear_env();
        env::set_var("VOXLINK_ACCESS_TOKEN", "  ");
        assert!(AppConfig::load().is_err());
        clear_env();
    }
}

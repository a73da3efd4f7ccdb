//! Client configuration.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default signaling endpoint.
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:4000/sfu";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the signaling server.
    pub signaling_url: String,

    /// Per-request timeout. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            request_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_url = vars
            .get("SFU_SIGNALING_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        if !(signaling_url.starts_with("ws://") || signaling_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_SIGNALING_URL must be a ws:// or wss:// URL, got {signaling_url:?}"
            )));
        }

        let request_timeout = match vars.get("SFU_REQUEST_TIMEOUT_MS") {
            None => None,
            Some(raw) => {
                let millis = raw.trim().parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue(format!("SFU_REQUEST_TIMEOUT_MS: {e}"))
                })?;
                if millis == 0 {
                    return Err(ConfigError::InvalidValue(
                        "SFU_REQUEST_TIMEOUT_MS must be positive".to_string(),
                    ));
                }
                Some(Duration::from_millis(millis))
            }
        };

        Ok(Self {
            signaling_url,
            request_timeout,
        })
    }
}

//! SFU service configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default, so an empty environment yields a working local server.

use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:4000";

/// Default URL path accepted for the WebSocket upgrade.
pub const DEFAULT_SIGNALING_PATH: &str = "/sfu";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default IP the forwarding engine listens on for media.
pub const DEFAULT_LISTEN_IP: &str = "127.0.0.1";

/// Default SFU instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sfu";

/// SFU service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:4000").
    pub signaling_bind_address: String,

    /// Path clients must request to upgrade (default: "/sfu").
    pub signaling_path: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// IP address transports listen on.
    pub listen_ip: IpAddr,

    /// Address advertised in ICE candidates instead of `listen_ip`.
    pub announced_ip: Option<IpAddr>,

    /// Maximum peers per room. Zero means unlimited.
    pub max_peers_per_room: usize,

    /// Maximum open producers per peer. Zero means unlimited.
    pub max_producers_per_peer: usize,

    /// Unique identifier for this instance, used in logs.
    pub instance_id: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidValue(format!("{name} has unparseable value {raw:?}"))
        }),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());
        signaling_bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue(format!("SFU_SIGNALING_BIND_ADDRESS: {e}")))?;

        let signaling_path = vars
            .get("SFU_SIGNALING_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_PATH.to_string());
        if !signaling_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(
                "SFU_SIGNALING_PATH must start with '/'".to_string(),
            ));
        }

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let listen_ip = match parse_var::<IpAddr>(vars, "SFU_LISTEN_IP")? {
            Some(ip) => ip,
            None => DEFAULT_LISTEN_IP
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("default listen ip: {e}")))?,
        };

        let announced_ip = parse_var::<IpAddr>(vars, "SFU_ANNOUNCED_IP")?;

        let max_peers_per_room = parse_var(vars, "SFU_MAX_PEERS_PER_ROOM")?.unwrap_or(0);
        let max_producers_per_peer = parse_var(vars, "SFU_MAX_PRODUCERS_PER_PEER")?.unwrap_or(0);

        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            signaling_path,
            health_bind_address,
            listen_ip,
            announced_ip,
            max_peers_per_room,
            max_producers_per_peer,
            instance_id,
        })
    }
}

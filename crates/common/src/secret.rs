//! Secret types for protecting sensitive values from accidental logging.
//!
//! The SFU client carries a bearer credential through `join`. It is wrapped in
//! [`SecretString`] so that deriving `Debug` on intents, configs, or errors
//! never prints it.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct JoinRequest {
//!     room: String,
//!     credential: SecretString,
//! }
//!
//! let req = JoinRequest {
//!     room: "r1".to_string(),
//!     credential: SecretString::from("bearer-abc"),
//! };
//!
//! let shown = format!("{req:?}");
//! assert!(!shown.contains("bearer-abc"));
//!
//! // Reading the value requires an explicit call.
//! let raw: &str = req.credential.expose_secret();
//! assert_eq!(raw, "bearer-abc");
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("bearer-xyz");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("bearer-xyz"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("token-123");
        assert_eq!(secret.expose_secret(), "token-123");
    }

    #[test]
    fn test_deserialize_credential() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Intent {
            room: String,
            credential: SecretString,
        }

        let json = r#"{"room": "r1", "credential": "my-token"}"#;
        let intent: Intent = serde_json::from_str(json).expect("deserialize");

        assert_eq!(intent.credential.expose_secret(), "my-token");

        let debug = format!("{intent:?}");
        assert!(debug.contains("r1"));
        assert!(!debug.contains("my-token"));
    }
}

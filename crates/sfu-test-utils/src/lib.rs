//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU service and client.
//!
//! This crate provides:
//! - Server test harness (`TestSfuServer` for end-to-end tests)
//! - Raw protocol client (`RawSignalingClient` for wire-level tests)
//! - Scriptable capture devices (`FakeMediaDevices`)
//! - Wire fixtures (RTP parameters, DTLS parameters)
//! - Eventual-condition polling (`assert_eventually`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestSfuServer::spawn().await?;
//!     let mut client = RawSignalingClient::connect(&server.url()).await?;
//!
//!     let response = client
//!         .request("r1", Some("alice"), "CAPABILITIES_REQUEST", serde_json::json!({}))
//!         .await?;
//!     assert_eq!(response["type"], "CAPABILITIES_RESPONSE");
//!     Ok(())
//! }
//! ```

pub mod eventual;
pub mod fake_devices;
pub mod fixtures;
pub mod raw_client;
pub mod server_harness;

// Re-export commonly used items
pub use eventual::*;
pub use fake_devices::*;
pub use fixtures::*;
pub use raw_client::*;
pub use server_harness::*;

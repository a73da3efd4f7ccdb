//! SFU service library.
//!
//! Server side of a selective forwarding unit: participants join named
//! rooms over a JSON WebSocket protocol and exchange media through a
//! forwarding engine that this crate configures but never inspects.
//!
//! # Architecture
//!
//! ```text
//! SignalingServer (one listener, fixed path)
//! └── serve_connection (one task per WebSocket)
//!     └── SignalingHandler ──► RegistryActorHandle
//!                              └── RegistryActor (single owner of all rooms)
//!                                  └── Room ─ PeerSession ─► engine handles
//! ```
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Forwarding engine capability traits and the loopback engine
//! - [`errors`] - Error types and wire error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`registry`] - Room & peer registry actor
//! - [`signaling`] - WebSocket listener, connection loop and request handler

pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod signaling;

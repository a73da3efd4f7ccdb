//! JSON-over-WebSocket signaling.

pub mod connection;
pub mod handler;
pub mod server;

pub use handler::{Reply, SignalingHandler};
pub use server::SignalingServer;

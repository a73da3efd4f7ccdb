//! Signaling protocol for the SFU.
//!
//! This crate defines the JSON-over-WebSocket messages exchanged between a
//! participant and the forwarding server: correlated requests and responses,
//! uncorrelated push notifications, and the RTP/ICE/DTLS parameter shapes
//! they carry.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod message;
pub mod rtp;

pub use codec::CodecError;
pub use message::{Envelope, Push, Request, Response, ServerMessage};

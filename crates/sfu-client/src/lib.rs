//! SFU participant client.
//!
//! Drives one participant through capture, negotiation, live media and
//! teardown against the SFU signaling server.
//!
//! # Modules
//!
//! - [`channel`] - Request/response correlation and push delivery over one socket
//! - [`config`] - Client configuration from environment
//! - [`devices`] - Capture device seam and device selection
//! - [`errors`] - Error types and user-facing messages
//! - [`media`] - Track and stream model with clone and stop semantics
//! - [`negotiation`] - Local negotiation context (device, transports, producers, consumers)
//! - [`preview`] - Pre-join capture with generation-based cancellation
//! - [`session`] - Session controller actor

pub mod channel;
pub mod config;
pub mod devices;
pub mod errors;
pub mod media;
pub mod negotiation;
pub mod preview;
pub mod session;

pub use channel::{SignalingChannel, SignalingConnector, WebSocketConnector};
pub use config::ClientConfig;
pub use devices::{DeviceInfo, DeviceSelection, MediaConstraints, MediaDevices, TrackConstraint};
pub use errors::{CaptureError, ChannelError, NegotiationError, SessionError};
pub use media::{MediaStream, MediaTrack};
pub use preview::{PreviewCoordinator, PreviewOutcome, PreviewWants};
pub use session::{JoinIntent, RemoteTrack, SessionHandle, SessionPhase, SessionStats};

//! Identifier newtypes shared by the signaling server and client.
//!
//! Every identifier travels on the wire as a plain JSON string, so each type
//! is `#[serde(transparent)]` over a `String`. Keeping them distinct stops a
//! producer id from being passed where a consumer id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Name of a room. Chosen by clients, never generated by the server.
    RoomId
}

string_id! {
    /// Identifier for a participant within a room
    ParticipantId
}

string_id! {
    /// Identifier for a WebRTC transport
    TransportId
}

string_id! {
    /// Identifier for a producer (one outgoing track)
    ProducerId
}

string_id! {
    /// Identifier for a consumer (one subscription to a remote producer)
    ConsumerId
}

string_id! {
    /// Correlation token echoed back on the matching response
    RequestId
}

impl RoomId {
    /// Returns true if the room id is empty after trimming whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

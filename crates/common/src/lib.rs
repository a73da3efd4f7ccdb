//! Common utilities and types shared across the SFU components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes used on the wire and in the registry
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

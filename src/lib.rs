// Licensed under the Apache-2.0 license

#![no_std]

extern crate alloc;

// Common errors
pub mod error;

// Codec and protocol buffer
pub mod codec;

// Spdm common message protocol handling
pub mod protocol;

// Cryptographic operations facade
pub mod crypto;

// Transport layer handling
pub mod transport;

// Monotonic clock and sleep facade
pub mod time;

// Transcript management
pub mod transcript;

// Spdm requester connection state
pub mod state;

// Peer and local certificate chain handling
pub mod cert_store;

// Secure session management
pub mod session;

// Context and per-request procedures
pub mod requester;

// Per-session heartbeat watchdog
pub mod watchdog;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{SpdmError, SpdmResult};
pub use requester::{RequesterConfig, RequesterContext};
pub use watchdog::{SessionStopHandler, Watchdog};

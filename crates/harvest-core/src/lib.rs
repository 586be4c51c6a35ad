//! Core building blocks of the harvest metrics collector
//!
//! This crate provides the binary wire protocol used between collector
//! instances (a TLV packet format with optional signed and encrypted
//! envelopes), the exponential-backoff gate used to throttle flaky
//! dependencies, and the UDP transport and output-format helpers the
//! plugin layer composes around them.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod backoff;
pub mod errors;
pub mod format;
pub mod net;
pub mod protocol;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use errors::{ProtocolError, Result};
pub use protocol::{PacketBuilder, PacketParser};
pub use types::{SecurityLevel, Value, ValueKind, ValueList};

#[cfg(feature = "crypto")]
pub use protocol::crypto::PasswordStore;

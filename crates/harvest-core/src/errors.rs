//! Error types for the harvest wire protocol
//!
//! A packet that fails to parse is discarded as a unit; the variants below
//! tell the caller why, so transport loops can distinguish garbage input
//! from authentication problems and from their own sink failing.

// ----------------------------------------------------------------------------
// Protocol Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the packet parser, builder, and envelope handling
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Malformed input: bad TLV length, truncated frame, length/count
    /// mismatch, oversized identity string, invalid UTF-8
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A part tag the parser does not recognize
    #[error("unknown part type 0x{0:04x}")]
    UnknownPart(u16),

    /// A signed or encrypted envelope was seen but crypto support is not
    /// compiled in
    #[error("packet requires crypto support, which is not enabled")]
    NotSupported,

    /// No password is available for the user named in an encrypted
    /// envelope
    #[error("no password for user {0:?}")]
    UnknownUser(String),

    /// HMAC-SHA256 signature or SHA-1 content checksum did not verify
    #[error("packet authentication failed")]
    AuthFailed,

    /// The value sink asked for the scan to stop
    #[error("value sink error: {0}")]
    Sink(String),

    /// Socket-level failure in the transport helpers
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Create a malformed-packet error with a message
    pub fn malformed<T: Into<String>>(message: T) -> Self {
        ProtocolError::Malformed(message.into())
    }

    /// Create a sink error with a message
    pub fn sink<T: Into<String>>(message: T) -> Self {
        ProtocolError::Sink(message.into())
    }
}

pub type Result<T> = core::result::Result<T, ProtocolError>;

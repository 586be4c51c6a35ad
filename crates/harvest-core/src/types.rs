//! Shared types for the harvest collector
//!
//! The central type is [`ValueList`]: the identity/time/values tuple that
//! every sample carries. The network parser mutates one in place as it
//! walks a packet, and snapshots it into the sink on every VALUES part.

use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::errors::{ProtocolError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum length of an identity string, excluding the trailing NUL it
/// carries on the wire (64 bytes including NUL).
pub const MAX_IDENTITY_LEN: usize = 63;

// ----------------------------------------------------------------------------
// Values
// ----------------------------------------------------------------------------

/// Data-source type of a single value
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Counter = 0,
    Gauge = 1,
    Derive = 2,
    Absolute = 3,
}

impl ValueKind {
    pub fn from_wire(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ValueKind::Counter),
            1 => Ok(ValueKind::Gauge),
            2 => Ok(ValueKind::Derive),
            3 => Ok(ValueKind::Absolute),
            _ => Err(ProtocolError::malformed(format!(
                "unknown data source type {code}"
            ))),
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// A single sample value, tagged with its data-source type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Monotonic counter, wraps at the integer boundary
    Counter(u64),
    /// Free-standing measurement
    Gauge(f64),
    /// Rate source, differences are meaningful
    Derive(u64),
    /// Counter that resets on every read
    Absolute(u64),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Counter(_) => ValueKind::Counter,
            Value::Gauge(_) => ValueKind::Gauge,
            Value::Derive(_) => ValueKind::Derive,
            Value::Absolute(_) => ValueKind::Absolute,
        }
    }
}

// ----------------------------------------------------------------------------
// Value List
// ----------------------------------------------------------------------------

/// The identity/time/values tuple describing one batch of samples
///
/// Identity strings are bounded ASCII; the wire codec rejects anything
/// longer than [`MAX_IDENTITY_LEN`] bytes. `time` and `interval` are
/// durations since the UNIX epoch and between reads, respectively.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueList {
    pub host: String,
    pub plugin: String,
    pub plugin_instance: String,
    pub type_name: String,
    pub type_instance: String,
    pub time: Duration,
    pub interval: Duration,
    pub values: SmallVec<[Value; 4]>,
}

impl ValueList {
    /// The `host/plugin-instance/type-instance` identifier used by the
    /// plain-text protocol and the log output
    pub fn identifier(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(&self.host);
        out.push('/');
        out.push_str(&self.plugin);
        if !self.plugin_instance.is_empty() {
            out.push('-');
            out.push_str(&self.plugin_instance);
        }
        out.push('/');
        out.push_str(&self.type_name);
        if !self.type_instance.is_empty() {
            out.push('-');
            out.push_str(&self.type_instance);
        }
        out
    }
}

// ----------------------------------------------------------------------------
// Security Level
// ----------------------------------------------------------------------------

/// Minimum guarantee a packet must carry for its values to be delivered
///
/// Totally ordered: `None < Sign < Encrypt`. A packet starts at `None`
/// and is raised by each envelope it is unwrapped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityLevel {
    #[default]
    None,
    Sign,
    Encrypt,
}

impl std::str::FromStr for SecurityLevel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SecurityLevel::None),
            "sign" => Ok(SecurityLevel::Sign),
            "encrypt" => Ok(SecurityLevel::Encrypt),
            other => Err(ProtocolError::malformed(format!(
                "unknown security level {other:?}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Abstraction over a monotonic clock
///
/// Lets the backoff gate obtain "now" without being tied to wall-clock
/// time, so tests can drive time explicitly.
pub trait TimeSource {
    /// Monotonic time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// Monotonic clock backed by [`std::time::Instant`]
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind_round_trip() {
        for code in 0..=3u8 {
            assert_eq!(ValueKind::from_wire(code).unwrap().to_wire(), code);
        }
        assert!(ValueKind::from_wire(4).is_err());
        assert!(ValueKind::from_wire(0xff).is_err());
    }

    #[test]
    fn test_security_level_ordering() {
        assert!(SecurityLevel::None < SecurityLevel::Sign);
        assert!(SecurityLevel::Sign < SecurityLevel::Encrypt);
        assert_eq!("sign".parse::<SecurityLevel>().unwrap(), SecurityLevel::Sign);
        assert!("paranoid".parse::<SecurityLevel>().is_err());
    }

    #[test]
    fn test_identifier_elides_empty_instances() {
        let vl = ValueList {
            host: "web01".into(),
            plugin: "apache".into(),
            type_name: "http_requests".into(),
            ..Default::default()
        };
        assert_eq!(vl.identifier(), "web01/apache/http_requests");

        let vl = ValueList {
            plugin_instance: "vhost1".into(),
            type_instance: "GET".into(),
            ..vl
        };
        assert_eq!(vl.identifier(), "web01/apache-vhost1/http_requests-GET");
    }
}

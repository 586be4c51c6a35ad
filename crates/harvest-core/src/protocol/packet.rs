//! Packet-level parsing and building
//!
//! [`PacketParser`] walks a packet's TLV parts left to right, mutating a
//! [`ValueList`] accumulator: identity and time parts update it, every
//! VALUES part snapshots it into the caller's sink. Envelope parts
//! (SIGN_SHA256, ENCR_AES256) raise the packet's security level for the
//! region they cover; a VALUES part is only delivered when the current
//! level meets the parser's configured minimum.
//!
//! [`PacketBuilder`] is the sending half: it appends parts for
//! successive value lists, eliding identity and time parts whose value
//! is unchanged from the previous list.

use std::time::Duration;

use tracing::debug;

use crate::errors::{ProtocolError, Result};
use crate::types::{SecurityLevel, ValueList};

#[cfg(feature = "crypto")]
use super::crypto::{self, PasswordStore, SignOutcome};
use super::wire::{self, Cursor};
use super::PartType;
#[cfg(feature = "crypto")]
use super::MAX_ENVELOPE_DEPTH;

// ----------------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------------

/// Configured parser for received packets
///
/// ```
/// use harvest_core::{PacketParser, SecurityLevel};
///
/// let parser = PacketParser::new().min_level(SecurityLevel::None);
/// let mut seen = Vec::new();
/// parser.parse(&[], |vl| {
///     seen.push(vl.clone());
///     Ok(())
/// }).unwrap();
/// assert!(seen.is_empty());
/// ```
#[derive(Default)]
pub struct PacketParser<'a> {
    min_level: SecurityLevel,
    #[cfg(feature = "crypto")]
    passwords: Option<&'a dyn PasswordStore>,
    #[cfg(not(feature = "crypto"))]
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> PacketParser<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum security level a packet must reach for its VALUES parts
    /// to be delivered. Defaults to [`SecurityLevel::None`].
    pub fn min_level(mut self, level: SecurityLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Credential store used to verify signed and decrypt encrypted
    /// envelopes
    #[cfg(feature = "crypto")]
    pub fn passwords(mut self, store: &'a dyn PasswordStore) -> Self {
        self.passwords = Some(store);
        self
    }

    /// Parse one packet, feeding every delivered value list to `sink`
    ///
    /// The sink borrows the accumulator only for the duration of the
    /// call; it must copy anything it wants to keep. A sink error aborts
    /// the scan and is returned unchanged.
    pub fn parse<F>(&self, packet: &[u8], mut sink: F) -> Result<()>
    where
        F: FnMut(&ValueList) -> Result<()>,
    {
        let mut state = ValueList::default();
        self.parse_region(packet, &mut state, SecurityLevel::None, 0, &mut sink)
    }

    fn parse_region(
        &self,
        buf: &[u8],
        state: &mut ValueList,
        level: SecurityLevel,
        depth: u8,
        sink: &mut dyn FnMut(&ValueList) -> Result<()>,
    ) -> Result<()> {
        let mut cursor = Cursor::new(buf);
        while let Some(part) = cursor.next_part()? {
            match PartType::from_u16(part.tag)? {
                PartType::Host => state.host = wire::parse_string_part(part.payload)?,
                PartType::Plugin => state.plugin = wire::parse_string_part(part.payload)?,
                PartType::PluginInstance => {
                    state.plugin_instance = wire::parse_string_part(part.payload)?
                }
                PartType::Type => state.type_name = wire::parse_string_part(part.payload)?,
                PartType::TypeInstance => {
                    state.type_instance = wire::parse_string_part(part.payload)?
                }
                PartType::Time => {
                    state.time = Duration::from_secs(wire::parse_number_part(part.payload)?)
                }
                PartType::TimeHr => {
                    state.time = wire::hr_to_duration(wire::parse_number_part(part.payload)?)
                }
                PartType::Interval => {
                    state.interval = Duration::from_secs(wire::parse_number_part(part.payload)?)
                }
                PartType::IntervalHr => {
                    state.interval = wire::hr_to_duration(wire::parse_number_part(part.payload)?)
                }
                PartType::Values => {
                    state.values = wire::parse_values_part(part.payload)?;
                    if level >= self.min_level {
                        sink(state)?;
                    } else {
                        debug!(
                            identifier = %state.identifier(),
                            ?level,
                            "dropping values below the minimum security level"
                        );
                    }
                }
                PartType::SignSha256 => {
                    // The signature covers everything after the part;
                    // parsing of the remainder is delegated wholesale.
                    return self.parse_signed(part.payload, part.rest, state, level, depth, sink);
                }
                PartType::EncrAes256 => {
                    self.parse_encrypted(part.payload, state, level, depth, sink)?;
                }
            }
        }
        Ok(())
    }

    #[cfg(feature = "crypto")]
    fn parse_signed(
        &self,
        payload: &[u8],
        signed_region: &[u8],
        state: &mut ValueList,
        level: SecurityLevel,
        depth: u8,
        sink: &mut dyn FnMut(&ValueList) -> Result<()>,
    ) -> Result<()> {
        if depth >= MAX_ENVELOPE_DEPTH {
            return Err(ProtocolError::malformed("envelopes nested too deeply"));
        }
        match crypto::open_signed(payload, signed_region, self.passwords)? {
            SignOutcome::Verified { username } => {
                debug!(username, "signature verified");
                self.parse_region(
                    signed_region,
                    state,
                    level.max(SecurityLevel::Sign),
                    depth + 1,
                    sink,
                )
            }
            // Without credentials the signature cannot be checked; the
            // region is parsed best-effort without raising the level.
            SignOutcome::Unverified => {
                self.parse_region(signed_region, state, level, depth + 1, sink)
            }
        }
    }

    #[cfg(not(feature = "crypto"))]
    fn parse_signed(
        &self,
        _payload: &[u8],
        _signed_region: &[u8],
        _state: &mut ValueList,
        _level: SecurityLevel,
        _depth: u8,
        _sink: &mut dyn FnMut(&ValueList) -> Result<()>,
    ) -> Result<()> {
        Err(ProtocolError::NotSupported)
    }

    #[cfg(feature = "crypto")]
    fn parse_encrypted(
        &self,
        payload: &[u8],
        state: &mut ValueList,
        level: SecurityLevel,
        depth: u8,
        sink: &mut dyn FnMut(&ValueList) -> Result<()>,
    ) -> Result<()> {
        if depth >= MAX_ENVELOPE_DEPTH {
            return Err(ProtocolError::malformed("envelopes nested too deeply"));
        }
        let (username, inner) = crypto::open_encrypted(payload, self.passwords)?;
        debug!(username, "packet decrypted");
        self.parse_region(
            &inner,
            state,
            level.max(SecurityLevel::Encrypt),
            depth + 1,
            sink,
        )
    }

    #[cfg(not(feature = "crypto"))]
    fn parse_encrypted(
        &self,
        _payload: &[u8],
        _state: &mut ValueList,
        _level: SecurityLevel,
        _depth: u8,
        _sink: &mut dyn FnMut(&ValueList) -> Result<()>,
    ) -> Result<()> {
        Err(ProtocolError::NotSupported)
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Incremental packet encoder
///
/// Appends parts for each written [`ValueList`], skipping identity and
/// time parts that match the previously written list, the mirror image
/// of the parser's accumulator.
#[derive(Default)]
pub struct PacketBuilder {
    buf: Vec<u8>,
    state: ValueList,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes encoded so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append one value list
    pub fn write(&mut self, vl: &ValueList) -> Result<()> {
        if vl.host != self.state.host {
            wire::write_string_part(&mut self.buf, PartType::Host, &vl.host)?;
            self.state.host = vl.host.clone();
        }
        if vl.time != self.state.time {
            wire::write_number_part(&mut self.buf, PartType::TimeHr, wire::duration_to_hr(vl.time));
            self.state.time = vl.time;
        }
        if vl.interval != self.state.interval {
            wire::write_number_part(
                &mut self.buf,
                PartType::IntervalHr,
                wire::duration_to_hr(vl.interval),
            );
            self.state.interval = vl.interval;
        }
        if vl.plugin != self.state.plugin {
            wire::write_string_part(&mut self.buf, PartType::Plugin, &vl.plugin)?;
            self.state.plugin = vl.plugin.clone();
        }
        if vl.plugin_instance != self.state.plugin_instance {
            wire::write_string_part(&mut self.buf, PartType::PluginInstance, &vl.plugin_instance)?;
            self.state.plugin_instance = vl.plugin_instance.clone();
        }
        if vl.type_name != self.state.type_name {
            wire::write_string_part(&mut self.buf, PartType::Type, &vl.type_name)?;
            self.state.type_name = vl.type_name.clone();
        }
        if vl.type_instance != self.state.type_instance {
            wire::write_string_part(&mut self.buf, PartType::TypeInstance, &vl.type_instance)?;
            self.state.type_instance = vl.type_instance.clone();
        }
        wire::write_values_part(&mut self.buf, &vl.values)
    }

    /// Finish the packet unwrapped
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Finish the packet wrapped in a SIGN_SHA256 envelope
    #[cfg(feature = "crypto")]
    pub fn finish_signed(self, username: &str, password: &str) -> Result<Vec<u8>> {
        crypto::seal_signed(username, password, &self.buf)
    }

    /// Finish the packet wrapped in an ENCR_AES256 envelope
    #[cfg(feature = "crypto")]
    pub fn finish_encrypted(self, username: &str, password: &str) -> Result<Vec<u8>> {
        crypto::seal_encrypted(username, password, &self.buf)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use smallvec::smallvec;

    fn collect(parser: &PacketParser<'_>, packet: &[u8]) -> Result<Vec<ValueList>> {
        let mut out = Vec::new();
        parser.parse(packet, |vl| {
            out.push(vl.clone());
            Ok(())
        })?;
        Ok(out)
    }

    /// host "host", plugin "plug", one COUNTER of 42, hand-assembled
    fn unsigned_fixture() -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&hex::decode("00000009").unwrap());
        pkt.extend_from_slice(b"host\0");
        pkt.extend_from_slice(&hex::decode("00020009").unwrap());
        pkt.extend_from_slice(b"plug\0");
        pkt.extend_from_slice(&hex::decode("0006000f").unwrap());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.push(0x00);
        pkt.extend_from_slice(&42u64.to_be_bytes());
        pkt
    }

    #[test]
    fn test_unsigned_packet_delivers_one_list() {
        let lists = collect(&PacketParser::new(), &unsigned_fixture()).unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].host, "host");
        assert_eq!(lists[0].plugin, "plug");
        assert_eq!(lists[0].values.as_slice(), &[Value::Counter(42)]);
    }

    #[test]
    fn test_security_gate_suppresses_unsigned_values() {
        let parser = PacketParser::new().min_level(SecurityLevel::Sign);
        let lists = collect(&parser, &unsigned_fixture()).unwrap();
        assert!(lists.is_empty());
    }

    #[test]
    fn test_unknown_tag_rejects_packet() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&hex::decode("0100000500").unwrap());
        assert!(matches!(
            collect(&PacketParser::new(), &pkt),
            Err(ProtocolError::UnknownPart(0x0100))
        ));
    }

    #[test]
    fn test_trailing_garbage_rejects_packet() {
        let mut pkt = unsigned_fixture();
        pkt.extend_from_slice(&[0xde, 0xad]);
        assert!(matches!(
            collect(&PacketParser::new(), &pkt),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_accumulator_carries_identity_forward() {
        let mut builder = PacketBuilder::new();
        let first = ValueList {
            host: "db01".into(),
            plugin: "mysql".into(),
            type_name: "queries".into(),
            time: Duration::from_secs(1_500_000_000),
            interval: Duration::from_secs(10),
            values: smallvec![Value::Derive(1000)],
            ..Default::default()
        };
        let second = ValueList {
            type_instance: "slow".into(),
            values: smallvec![Value::Derive(3)],
            ..first.clone()
        };
        builder.write(&first).unwrap();
        builder.write(&second).unwrap();

        let lists = collect(&PacketParser::new(), &builder.finish()).unwrap();
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0], first);
        assert_eq!(lists[1], second);
        // The second list's parts elided the unchanged host/plugin/type.
        assert_eq!(lists[1].host, "db01");
    }

    #[test]
    fn test_sink_error_aborts_scan() {
        let mut builder = PacketBuilder::new();
        let vl = ValueList {
            host: "h".into(),
            plugin: "p".into(),
            type_name: "t".into(),
            values: smallvec![Value::Gauge(1.0)],
            ..Default::default()
        };
        builder.write(&vl).unwrap();
        builder.write(&vl).unwrap();
        let pkt = builder.finish();

        let mut calls = 0;
        let result = PacketParser::new().parse(&pkt, |_| {
            calls += 1;
            Err(ProtocolError::sink("stop"))
        });
        assert!(matches!(result, Err(ProtocolError::Sink(_))));
        assert_eq!(calls, 1);
    }

    #[cfg(feature = "crypto")]
    mod envelopes {
        use super::*;
        use std::collections::HashMap;

        fn store() -> HashMap<String, String> {
            let mut map = HashMap::new();
            map.insert("agent".to_owned(), "s3cret".to_owned());
            map
        }

        fn sample() -> ValueList {
            ValueList {
                host: "web01".into(),
                plugin: "load".into(),
                type_name: "load".into(),
                time: Duration::from_secs(1_600_000_000),
                interval: Duration::from_secs(10),
                values: smallvec![Value::Gauge(0.25), Value::Gauge(0.5), Value::Gauge(1.0)],
                ..Default::default()
            }
        }

        #[test]
        fn test_signed_packet_passes_sign_gate() {
            let mut builder = PacketBuilder::new();
            builder.write(&sample()).unwrap();
            let pkt = builder.finish_signed("agent", "s3cret").unwrap();

            let store = store();
            let parser = PacketParser::new()
                .passwords(&store)
                .min_level(SecurityLevel::Sign);
            let lists = collect(&parser, &pkt).unwrap();
            assert_eq!(lists.len(), 1);
            assert_eq!(lists[0], sample());
        }

        #[test]
        fn test_signed_packet_fails_encrypt_gate() {
            let mut builder = PacketBuilder::new();
            builder.write(&sample()).unwrap();
            let pkt = builder.finish_signed("agent", "s3cret").unwrap();

            let store = store();
            let parser = PacketParser::new()
                .passwords(&store)
                .min_level(SecurityLevel::Encrypt);
            assert!(collect(&parser, &pkt).unwrap().is_empty());
        }

        #[test]
        fn test_encrypted_packet_passes_encrypt_gate() {
            let mut builder = PacketBuilder::new();
            builder.write(&sample()).unwrap();
            let pkt = builder.finish_encrypted("agent", "s3cret").unwrap();

            let store = store();
            let parser = PacketParser::new()
                .passwords(&store)
                .min_level(SecurityLevel::Encrypt);
            let lists = collect(&parser, &pkt).unwrap();
            assert_eq!(lists.len(), 1);
            assert_eq!(lists[0], sample());
        }

        #[test]
        fn test_tampered_signature_rejects_whole_packet() {
            let mut builder = PacketBuilder::new();
            builder.write(&sample()).unwrap();
            let mut pkt = builder.finish_signed("agent", "s3cret").unwrap();
            pkt[4] ^= 0xff; // flip a bit of the HMAC

            let store = store();
            let parser = PacketParser::new().passwords(&store);
            assert!(matches!(collect(&parser, &pkt), Err(ProtocolError::AuthFailed)));
        }

        #[test]
        fn test_signed_without_store_parses_at_level_none() {
            let mut builder = PacketBuilder::new();
            builder.write(&sample()).unwrap();
            let pkt = builder.finish_signed("agent", "s3cret").unwrap();

            // Best-effort parse succeeds but the level stays None, so a
            // Sign minimum suppresses delivery.
            let lists = collect(&PacketParser::new(), &pkt).unwrap();
            assert_eq!(lists.len(), 1);

            let gated = PacketParser::new().min_level(SecurityLevel::Sign);
            assert!(collect(&gated, &pkt).unwrap().is_empty());
        }

        #[test]
        fn test_envelope_nesting_is_bounded() {
            let mut builder = PacketBuilder::new();
            builder.write(&sample()).unwrap();
            let once = builder.finish_signed("agent", "s3cret").unwrap();
            let twice =
                crate::protocol::crypto::seal_encrypted("agent", "s3cret", &once).unwrap();
            let thrice =
                crate::protocol::crypto::seal_encrypted("agent", "s3cret", &twice).unwrap();

            let store = store();
            let parser = PacketParser::new().passwords(&store);
            // Two envelopes (encrypt over sign) are fine.
            assert_eq!(collect(&parser, &twice).unwrap().len(), 1);
            // A third layer is a crafted packet.
            assert!(matches!(
                collect(&parser, &thrice),
                Err(ProtocolError::Malformed(_))
            ));
        }
    }

    mod round_trip {
        use super::*;
        use proptest::prelude::*;

        fn identity() -> impl Strategy<Value = String> {
            "[a-z0-9._-]{0,63}"
        }

        fn value() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<u64>().prop_map(Value::Counter),
                any::<u64>().prop_map(Value::Derive),
                any::<u64>().prop_map(Value::Absolute),
                // Finite gauges only: NaN never compares equal.
                prop::num::f64::NORMAL.prop_map(Value::Gauge),
            ]
        }

        proptest! {
            #[test]
            fn parse_inverts_encode(
                host in identity(),
                plugin in identity(),
                plugin_instance in identity(),
                type_name in identity(),
                type_instance in identity(),
                time in 0u64..=u32::MAX as u64,
                interval in 0u64..3600,
                values in prop::collection::vec(value(), 1..16),
            ) {
                let vl = ValueList {
                    host,
                    plugin,
                    plugin_instance,
                    type_name,
                    type_instance,
                    time: Duration::from_secs(time),
                    interval: Duration::from_secs(interval),
                    values: values.into_iter().collect(),
                };

                let mut builder = PacketBuilder::new();
                builder.write(&vl).unwrap();
                let lists = collect(&PacketParser::new(), &builder.finish()).unwrap();
                prop_assert_eq!(lists.as_slice(), std::slice::from_ref(&vl));
            }
        }
    }
}

//! Signed and encrypted packet envelopes
//!
//! Two outer envelopes protect a packet's tail: SIGN_SHA256 carries an
//! HMAC-SHA256 over the username and everything after the part, and
//! ENCR_AES256 carries an AES-256-OFB ciphertext whose plaintext is a
//! SHA-1 digest followed by an inner packet. The key for AES is the
//! SHA-256 of the user's password; the HMAC is keyed by the password
//! directly.

use std::collections::HashMap;

use aes::Aes256;
use hmac::{Hmac, Mac};
use ofb::cipher::{KeyIvInit, StreamCipher};
use ofb::Ofb;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::{ProtocolError, Result};

use super::{PartType, PART_HEADER_SIZE};

type HmacSha256 = Hmac<Sha256>;
type Aes256Ofb = Ofb<Aes256>;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Fixed bytes of a SIGN part: header plus the 32-byte HMAC
const SIGN_FIXED_SIZE: usize = PART_HEADER_SIZE + 32;

/// Fixed bytes of an ENCR part: header, username length, IV, SHA-1
const ENCR_FIXED_SIZE: usize = PART_HEADER_SIZE + 2 + 16 + 20;

// ----------------------------------------------------------------------------
// Password Lookup
// ----------------------------------------------------------------------------

/// Credential lookup for envelope verification and decryption
///
/// Receivers typically back this with an auth-file loaded at startup;
/// the blanket `HashMap` impl covers that case.
pub trait PasswordStore {
    fn password(&self, username: &str) -> Option<String>;
}

impl PasswordStore for HashMap<String, String> {
    fn password(&self, username: &str) -> Option<String> {
        self.get(username).cloned()
    }
}

// ----------------------------------------------------------------------------
// SIGN_SHA256
// ----------------------------------------------------------------------------

/// Result of examining a signed envelope
pub(crate) enum SignOutcome {
    /// Signature verified; the signed region is authentic for `username`
    Verified { username: String },
    /// No credentials to check against; the caller may fall back to
    /// parsing the region without raising the security level
    Unverified,
}

/// Check a SIGN_SHA256 part
///
/// `payload` is the part payload (`hash[32] || username`); the signed
/// region is everything after the part to the end of the packet. The
/// HMAC covers the username bytes followed by the signed region, keyed
/// with the user's password. Comparison is constant-time.
pub(crate) fn open_signed(
    payload: &[u8],
    signed_region: &[u8],
    store: Option<&dyn PasswordStore>,
) -> Result<SignOutcome> {
    if payload.len() < 33 {
        return Err(ProtocolError::malformed("signature part too short"));
    }
    let hash = &payload[..32];
    let user_bytes = &payload[32..];
    let username = std::str::from_utf8(user_bytes)
        .map_err(|_| ProtocolError::malformed("signature username is not valid UTF-8"))?;

    let Some(store) = store else {
        warn!("received a signed packet but no user database is configured; accepting it unverified");
        return Ok(SignOutcome::Unverified);
    };
    let Some(password) = store.password(username) else {
        warn!(username, "no password for signing user; accepting the packet unverified");
        return Ok(SignOutcome::Unverified);
    };

    let mut mac = HmacSha256::new_from_slice(password.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(user_bytes);
    mac.update(signed_region);
    mac.verify_slice(hash).map_err(|_| ProtocolError::AuthFailed)?;

    Ok(SignOutcome::Verified {
        username: username.to_owned(),
    })
}

/// Wrap `payload` in a SIGN_SHA256 envelope
pub(crate) fn seal_signed(username: &str, password: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let part_len = SIGN_FIXED_SIZE + username.len();
    if part_len > u16::MAX as usize {
        return Err(ProtocolError::malformed("signing username too long"));
    }

    let mut mac = HmacSha256::new_from_slice(password.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(username.as_bytes());
    mac.update(payload);
    let hash = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(part_len + payload.len());
    out.extend_from_slice(&(PartType::SignSha256 as u16).to_be_bytes());
    out.extend_from_slice(&(part_len as u16).to_be_bytes());
    out.extend_from_slice(&hash);
    out.extend_from_slice(username.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

// ----------------------------------------------------------------------------
// ENCR_AES256
// ----------------------------------------------------------------------------

/// Open an ENCR_AES256 part, returning the username and the decrypted
/// inner packet
///
/// `payload` layout: `u16 username_len || username || iv[16] ||
/// ciphertext`. The plaintext is `sha1[20] || inner_packet`; the digest
/// must match or the whole packet is rejected.
pub(crate) fn open_encrypted(
    payload: &[u8],
    store: Option<&dyn PasswordStore>,
) -> Result<(String, Vec<u8>)> {
    if payload.len() < 2 {
        return Err(ProtocolError::malformed("encrypted part too short"));
    }
    let username_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    // Past the username there must be room for the IV, the SHA-1, and at
    // least one byte of inner packet.
    if username_len == 0 || payload.len() < 2 + username_len + 16 + 20 + 1 {
        return Err(ProtocolError::malformed("encrypted part has invalid username length"));
    }

    let username = std::str::from_utf8(&payload[2..2 + username_len])
        .map_err(|_| ProtocolError::malformed("encryption username is not valid UTF-8"))?
        .to_owned();
    let iv = &payload[2 + username_len..2 + username_len + 16];
    let ciphertext = &payload[2 + username_len + 16..];

    let password = store
        .and_then(|s| s.password(&username))
        .ok_or_else(|| ProtocolError::UnknownUser(username.clone()))?;

    let key = Sha256::digest(password.as_bytes());
    let mut plaintext = ciphertext.to_vec();
    Aes256Ofb::new_from_slices(&key, iv)
        .expect("AES-256-OFB key and IV sizes are fixed")
        .apply_keystream(&mut plaintext);

    let (digest, inner) = plaintext.split_at(20);
    if Sha1::digest(inner).as_slice() != digest {
        return Err(ProtocolError::AuthFailed);
    }

    Ok((username, plaintext.split_off(20)))
}

/// Wrap `payload` in an ENCR_AES256 envelope with a random IV
pub(crate) fn seal_encrypted(username: &str, password: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let part_len = ENCR_FIXED_SIZE + username.len() + payload.len();
    if part_len > u16::MAX as usize {
        return Err(ProtocolError::malformed("packet too large to encrypt"));
    }

    let iv: [u8; 16] = rand::random();
    let key = Sha256::digest(password.as_bytes());

    let mut plaintext = Vec::with_capacity(20 + payload.len());
    plaintext.extend_from_slice(&Sha1::digest(payload));
    plaintext.extend_from_slice(payload);
    Aes256Ofb::new_from_slices(&key, &iv)
        .expect("AES-256-OFB key and IV sizes are fixed")
        .apply_keystream(&mut plaintext);

    let mut out = Vec::with_capacity(part_len);
    out.extend_from_slice(&(PartType::EncrAes256 as u16).to_be_bytes());
    out.extend_from_slice(&(part_len as u16).to_be_bytes());
    out.extend_from_slice(&(username.len() as u16).to_be_bytes());
    out.extend_from_slice(username.as_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&plaintext);
    Ok(out)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

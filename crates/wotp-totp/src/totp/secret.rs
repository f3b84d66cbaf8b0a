//! Base32 secret codec (RFC 4648) and the `SecretKey` wrapper.
//!
//! Decoding is tolerant of case, surrounding whitespace, inner spaces or
//! dashes used to group printed secrets, and trailing `=` padding. Any
//! input length is accepted as long as it decodes to at least one byte.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

use crate::totp::types::*;

/// Minimum number of base32 characters for secrets arriving from URIs and
/// vendor imports. Manual entry only needs a non-empty key.
pub const MIN_IMPORT_SECRET_CHARS: usize = 16;

/// The same floor for raw key bytes (16 base32 characters carry 10 bytes).
pub const MIN_IMPORT_SECRET_BYTES: usize = MIN_IMPORT_SECRET_CHARS * 5 / 8;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Canonical form: no separators, no padding, uppercase.
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .trim_end_matches('=')
        .to_uppercase()
}

/// Decode a base32 secret into raw key bytes.
pub fn decode(s: &str) -> TotpResult<Vec<u8>> {
    let cleaned = normalize(s);
    if cleaned.is_empty() {
        return Err(TotpError::new(TotpErrorKind::InvalidSecret, "Secret is empty"));
    }
    if let Some(bad) = cleaned.chars().find(|c| !matches!(c, 'A'..='Z' | '2'..='7')) {
        return Err(TotpError::new(
            TotpErrorKind::InvalidSecret,
            format!("Invalid base32 character '{}'", bad),
        ));
    }

    let bytes = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &cleaned)
        .ok_or_else(|| TotpError::new(TotpErrorKind::InvalidSecret, "Invalid base32 secret"))?;
    if bytes.is_empty() {
        return Err(TotpError::new(
            TotpErrorKind::InvalidSecret,
            "Secret decodes to zero bytes",
        ));
    }
    Ok(bytes)
}

/// Encode raw bytes as padded base32.
pub fn encode(bytes: &[u8]) -> String {
    base32::encode(base32::Alphabet::Rfc4648 { padding: true }, bytes)
}

/// `true` if `s` decodes to a usable key.
pub fn is_valid(s: &str) -> bool {
    decode(s).is_ok()
}

/// Stricter check used for URIs and vendor imports.
pub fn validate_import_secret(s: &str) -> TotpResult<SecretKey> {
    let len = normalize(s).len();
    let key = SecretKey::from_base32(s)?;
    if len < MIN_IMPORT_SECRET_CHARS {
        return Err(TotpError::new(
            TotpErrorKind::InvalidSecret,
            format!(
                "Secret too short: {} base32 characters, at least {} required",
                len, MIN_IMPORT_SECRET_CHARS
            ),
        ));
    }
    Ok(key)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SecretKey
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw HMAC key bytes. Never empty; wiped on drop; redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn new(bytes: Vec<u8>) -> TotpResult<Self> {
        if bytes.is_empty() {
            return Err(TotpError::new(TotpErrorKind::InvalidSecret, "Secret is empty"));
        }
        Ok(Self(bytes))
    }

    pub fn from_base32(s: &str) -> TotpResult<Self> {
        decode(s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Unpadded base32, as used in `otpauth://` URIs.
    pub fn to_base32(&self) -> String {
        base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<{} bytes redacted>)", self.0.len())
    }
}

impl Serialize for SecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SecretKey::from_base32(&s).map_err(serde::de::Error::custom)
    }
}

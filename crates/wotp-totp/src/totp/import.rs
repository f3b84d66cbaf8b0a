//! Multi-format import.
//!
//! Supported formats:
//! - `otpauth://` URIs, one per line (also the Authenticator browser-plugin export)
//! - Google Authenticator migration payloads (`otpauth-migration://offline?data=…`)
//! - 2FAS JSON backups
//! - Aegis plain-text JSON exports
//! - WinOTP token files and exports
//!
//! Parsing never touches the registry. Every entry is validated on its own;
//! a bad entry is counted and described in `messages` while the rest go
//! through. Only a payload that cannot be read as the claimed format at all
//! fails the whole call with `InvalidFormat`.

use base64::Engine;
use serde_json::Value;

use crate::totp::secret::{self, SecretKey};
use crate::totp::types::*;
use crate::totp::uri;

const MIGRATION_PREFIX: &str = "otpauth-migration://";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Auto-detect + dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse `payload` as `format`, resolving `Auto` first.
pub fn parse(format: ImportFormat, payload: &str) -> TotpResult<(ImportFormat, ParsedImport)> {
    let format = match format {
        ImportFormat::Auto => detect_format(payload).ok_or_else(|| {
            TotpError::new(TotpErrorKind::InvalidFormat, "Could not detect import format")
        })?,
        other => other,
    };

    let parsed = match format {
        ImportFormat::Auto => {
            return Err(TotpError::new(TotpErrorKind::InvalidFormat, "Could not detect import format"))
        }
        ImportFormat::OtpAuthUri => parse_vendor_text_lines(payload),
        ImportFormat::GoogleMigration => parse_migration_uri(payload)?,
        ImportFormat::TwoFasJson => parse_twofas_json(&parse_json(payload)?)?,
        ImportFormat::AegisJson => parse_aegis_json(&parse_json(payload)?)?,
        ImportFormat::WinOtpJson => parse_winotp_json(&parse_json(payload)?)?,
    };
    log::debug!(
        "Parsed {} payload: {} usable, {} rejected",
        format,
        parsed.tokens.len(),
        parsed.rejected
    );
    Ok((format, parsed))
}

/// Guess the format of `data` from its content.
pub fn detect_format(data: &str) -> Option<ImportFormat> {
    let trimmed = data.trim();
    let first_line = trimmed
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or_default();

    // otpauth-migration:// first (before otpauth://)
    if first_line.starts_with(MIGRATION_PREFIX) {
        return Some(ImportFormat::GoogleMigration);
    }
    if first_line.starts_with("otpauth://") {
        return Some(ImportFormat::OtpAuthUri);
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(val) = serde_json::from_str::<Value>(trimmed) {
            return detect_json_format(&val);
        }
    }
    None
}

fn detect_json_format(val: &Value) -> Option<ImportFormat> {
    // Aegis: { "version": N, "db": { "entries": [...] } } or encrypted "db": "<base64>"
    if (val.get("db").is_some() && val.get("header").is_some()) || val.pointer("/db/entries").is_some() {
        return Some(ImportFormat::AegisJson);
    }
    // 2FAS: { "services": [...] } or { "servicesEncrypted": "..." }
    if val.get("services").is_some() || val.get("servicesEncrypted").is_some() {
        return Some(ImportFormat::TwoFasJson);
    }
    // WinOTP: { "tokens": [...] }, [ {secret…}, … ] or { id: {secret…}, … }
    if val.get("tokens").map_or(false, Value::is_array) {
        return Some(ImportFormat::WinOtpJson);
    }
    if let Some(first) = val.as_array().and_then(|a| a.first()) {
        if first.get("secret").is_some() {
            return Some(ImportFormat::WinOtpJson);
        }
    }
    if let Some(map) = val.as_object() {
        if !map.is_empty() && map.values().all(|v| v.get("secret").is_some()) {
            return Some(ImportFormat::WinOtpJson);
        }
    }
    None
}

fn parse_json(data: &str) -> TotpResult<Value> {
    serde_json::from_str(data.trim()).map_err(|e| {
        TotpError::new(TotpErrorKind::InvalidFormat, format!("JSON parse error: {}", e))
    })
}

/// Parse any JSON backup the importer knows, detecting which one it is.
pub fn parse_vendor_json(data: &str) -> TotpResult<(ImportFormat, ParsedImport)> {
    let val = parse_json(data)?;
    let format = detect_json_format(&val).ok_or_else(|| {
        TotpError::new(TotpErrorKind::InvalidFormat, "Unrecognised JSON backup layout")
    })?;
    let parsed = match format {
        ImportFormat::TwoFasJson => parse_twofas_json(&val)?,
        ImportFormat::AegisJson => parse_aegis_json(&val)?,
        _ => parse_winotp_json(&val)?,
    };
    Ok((format, parsed))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Entry validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Loosely-typed fields pulled out of a vendor entry.
#[derive(Default)]
struct RawEntry<'a> {
    issuer: Option<&'a str>,
    name: Option<&'a str>,
    secret: Option<&'a str>,
    algorithm: Option<&'a str>,
    digits: Option<u64>,
    period: Option<u64>,
}

impl RawEntry<'_> {
    fn label(&self) -> String {
        let issuer = self.issuer.unwrap_or(UNKNOWN_ISSUER);
        match self.name.filter(|n| !n.is_empty()) {
            Some(name) => format!("{} ({})", issuer, name),
            None => issuer.to_string(),
        }
    }

    fn into_token(self) -> TotpResult<NewToken> {
        let secret = self.secret.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
            TotpError::new(TotpErrorKind::InvalidSecret, "Missing secret")
        })?;
        let key = secret::validate_import_secret(secret)?;

        let algorithm = match self.algorithm {
            Some(a) => a.parse::<Algorithm>()?,
            None => Algorithm::Sha1,
        };
        let digits = self.digits.unwrap_or(DEFAULT_DIGITS as u64);
        let period = self.period.unwrap_or(DEFAULT_PERIOD as u64);
        let digits = u8::try_from(digits).unwrap_or(0);
        let period = u32::try_from(period).unwrap_or(0);

        let issuer = self
            .issuer
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .unwrap_or(UNKNOWN_ISSUER);
        let name = self.name.map(str::trim).unwrap_or_default();

        let token = NewToken::new(issuer, name, key)
            .with_algorithm(algorithm)
            .with_digits(digits)
            .with_period(period);
        token.validate()?;
        Ok(token)
    }
}

fn collect(parsed: &mut ParsedImport, index: usize, raw: RawEntry<'_>) {
    let label = raw.label();
    match raw.into_token() {
        Ok(token) => parsed.tokens.push(token),
        Err(e) => parsed.reject(format!("Entry {} {}: {}", index + 1, label, e.message)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  otpauth:// lines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One URI per line; blank lines and `#` comments are ignored. Migration
/// URIs on a line are expanded in place.
pub fn parse_vendor_text_lines(text: &str) -> ParsedImport {
    let mut parsed = ParsedImport::default();

    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with(MIGRATION_PREFIX) {
            match parse_migration_uri(line) {
                Ok(inner) => {
                    parsed.tokens.extend(inner.tokens);
                    parsed.rejected += inner.rejected;
                    parsed
                        .messages
                        .extend(inner.messages.into_iter().map(|m| format!("Line {}: {}", i + 1, m)));
                }
                Err(e) => parsed.reject(format!("Line {}: {}", i + 1, e.message)),
            }
            continue;
        }
        match uri::parse_otpauth_uri(line) {
            Ok(token) => parsed.tokens.push(token),
            Err(e) => parsed.reject(format!("Line {}: {}", i + 1, e.message)),
        }
    }

    parsed
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Google Authenticator migration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse one or more `otpauth-migration://offline?data=…` URIs (one per
/// line, as produced by multi-part exports) or a bare base64 payload.
pub fn parse_migration_uri(text: &str) -> TotpResult<ParsedImport> {
    let mut combined = ParsedImport::default();
    let mut seen = false;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
        let b64 = if line.starts_with(MIGRATION_PREFIX) {
            extract_data_param(line).ok_or_else(|| {
                TotpError::new(TotpErrorKind::InvalidFormat, "No 'data=' parameter found")
            })?
        } else {
            line.to_string()
        };

        let bytes = base64_decode(&b64)?;
        let part = parse_migration_payload(&bytes)?;
        combined.tokens.extend(part.tokens);
        combined.rejected += part.rejected;
        combined.messages.extend(part.messages);
        seen = true;
    }

    if !seen {
        return Err(TotpError::new(TotpErrorKind::InvalidFormat, "Empty migration payload"));
    }
    Ok(combined)
}

/// Decode a `MigrationPayload` protobuf (no protobuf dependency).
///
/// The outer message has repeated field 1 (`OtpParameters`); batch
/// metadata fields are skipped. Each `OtpParameters` has:
///   1: secret (bytes)
///   2: name (string)
///   3: issuer (string)
///   4: algorithm (varint: 0=unspecified,1=SHA1,2=SHA256,3=SHA512,4=MD5)
///   5: digits (varint: 0=unspecified,1=SIX,2=EIGHT)
///   6: type (varint: 0=unspecified,1=HOTP,2=TOTP)
///   7: counter (varint)
pub fn parse_migration_payload(data: &[u8]) -> TotpResult<ParsedImport> {
    let truncated =
        || TotpError::new(TotpErrorKind::InvalidFormat, "Truncated migration payload");

    let mut parsed = ParsedImport::default();
    let mut reader = ProtoReader::new(data);
    let mut index = 0usize;

    while !reader.is_done() {
        let (field, wire) = reader.key().ok_or_else(truncated)?;
        if field == 1 && wire == WIRE_LEN {
            let sub = reader.bytes().ok_or_else(truncated)?;
            match parse_otp_parameters(sub) {
                Ok(token) => parsed.tokens.push(token),
                Err(e) => parsed.reject(format!("Entry {}: {}", index + 1, e.message)),
            }
            index += 1;
        } else {
            reader.skip(wire).ok_or_else(truncated)?;
        }
    }

    Ok(parsed)
}

fn parse_otp_parameters(data: &[u8]) -> TotpResult<NewToken> {
    let malformed = || TotpError::new(TotpErrorKind::InvalidFormat, "Malformed OTP parameters");

    let mut secret_bytes: &[u8] = &[];
    let mut name = String::new();
    let mut issuer = String::new();
    let mut algo = 0u64;
    let mut digits = 0u64;
    let mut otp_type = 0u64;
    let mut counter = 0u64;

    let mut reader = ProtoReader::new(data);
    while !reader.is_done() {
        let (field, wire) = reader.key().ok_or_else(malformed)?;
        match (field, wire) {
            (1, WIRE_LEN) => secret_bytes = reader.bytes().ok_or_else(malformed)?,
            (2, WIRE_LEN) => name = String::from_utf8_lossy(reader.bytes().ok_or_else(malformed)?).into_owned(),
            (3, WIRE_LEN) => issuer = String::from_utf8_lossy(reader.bytes().ok_or_else(malformed)?).into_owned(),
            (4, WIRE_VARINT) => algo = reader.varint().ok_or_else(malformed)?,
            (5, WIRE_VARINT) => digits = reader.varint().ok_or_else(malformed)?,
            (6, WIRE_VARINT) => otp_type = reader.varint().ok_or_else(malformed)?,
            (7, WIRE_VARINT) => counter = reader.varint().ok_or_else(malformed)?,
            (_, w) => reader.skip(w).ok_or_else(malformed)?,
        }
    }

    // Split "issuer:label" in name if issuer is empty
    let (issuer, name) = match (issuer.trim().is_empty(), name.split_once(':')) {
        (true, Some((i, n))) => (i.trim().to_string(), n.trim().to_string()),
        _ => (issuer.trim().to_string(), name.trim().to_string()),
    };
    let issuer = if issuer.is_empty() { UNKNOWN_ISSUER.to_string() } else { issuer };
    let label = format!("{} ({})", issuer, name);

    if otp_type == 1 {
        return Err(TotpError::new(
            TotpErrorKind::UnsupportedType,
            format!("{}: counter-based (HOTP) tokens are not supported", label),
        ));
    }
    let algorithm = match algo {
        0 | 1 => Algorithm::Sha1,
        2 => Algorithm::Sha256,
        3 => Algorithm::Sha512,
        4 => {
            return Err(TotpError::new(
                TotpErrorKind::UnsupportedAlgorithm,
                format!("{}: MD5 is not supported", label),
            ))
        }
        other => {
            return Err(TotpError::new(
                TotpErrorKind::UnsupportedAlgorithm,
                format!("{}: unknown algorithm code {}", label, other),
            ))
        }
    };
    let digits = if digits == 2 { 8 } else { DEFAULT_DIGITS };

    let key = SecretKey::new(secret_bytes.to_vec()).map_err(|_| {
        TotpError::new(TotpErrorKind::InvalidSecret, format!("{}: missing secret", label))
    })?;
    if key.len() < secret::MIN_IMPORT_SECRET_BYTES {
        return Err(TotpError::new(
            TotpErrorKind::InvalidSecret,
            format!(
                "{}: secret too short: {} bytes, at least {} required",
                label,
                key.len(),
                secret::MIN_IMPORT_SECRET_BYTES
            ),
        ));
    }

    let mut token = NewToken::new(issuer, name, key)
        .with_algorithm(algorithm)
        .with_digits(digits);
    if counter > 0 {
        token.counter_offset = Some(counter);
    }
    Ok(token)
}

const WIRE_VARINT: u8 = 0;
const WIRE_I64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_I32: u8 = 5;

/// Cursor over protobuf wire-format bytes.
struct ProtoReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn varint(&mut self) -> Option<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self.data.get(self.pos)?;
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Some(result);
            }
            shift += 7;
            if shift >= 64 {
                return None;
            }
        }
    }

    /// Field number and wire type.
    fn key(&mut self) -> Option<(u64, u8)> {
        let tag = self.varint()?;
        Some((tag >> 3, (tag & 0x07) as u8))
    }

    fn bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.varint()?).ok()?;
        let end = self.pos.checked_add(len)?;
        let out = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn advance(&mut self, n: usize) -> Option<()> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        self.pos = end;
        Some(())
    }

    fn skip(&mut self, wire: u8) -> Option<()> {
        match wire {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_I64 => self.advance(8),
            WIRE_LEN => self.bytes().map(|_| ()),
            WIRE_I32 => self.advance(4),
            _ => None,
        }
    }
}

fn extract_data_param(uri: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    let raw = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("data="))?;
    // '+' is literal base64 here, not an encoded space.
    Some(uri::percent_decode(raw).replace(' ', "+"))
}

fn base64_decode(data: &str) -> TotpResult<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Err(TotpError::new(TotpErrorKind::InvalidFormat, "Empty migration data"));
    }
    STANDARD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .or_else(|_| URL_SAFE.decode(trimmed))
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .map_err(|e| {
            TotpError::new(TotpErrorKind::InvalidFormat, format!("Base64 decode error: {}", e))
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  2FAS JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_twofas_json(val: &Value) -> TotpResult<ParsedImport> {
    if val.get("servicesEncrypted").is_some() && val.get("services").map_or(true, |s| {
        s.as_array().map_or(true, |a| a.is_empty())
    }) {
        return Err(TotpError::new(
            TotpErrorKind::InvalidFormat,
            "Encrypted 2FAS backups are not supported; export without a password",
        ));
    }
    let services = val.get("services").and_then(Value::as_array).ok_or_else(|| {
        TotpError::new(TotpErrorKind::InvalidFormat, "Missing 'services' array")
    })?;

    let mut parsed = ParsedImport::default();
    for (i, item) in services.iter().enumerate() {
        let otp = item.get("otp");
        let token_type = otp
            .and_then(|o| o.get("tokenType"))
            .and_then(Value::as_str)
            .unwrap_or("TOTP");
        let raw = RawEntry {
            issuer: otp
                .and_then(|o| o.get("issuer"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| item.get("name").and_then(Value::as_str)),
            name: otp
                .and_then(|o| o.get("account"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| item.get("name").and_then(Value::as_str)),
            secret: item
                .get("secret")
                .or_else(|| otp.and_then(|o| o.get("secret")))
                .and_then(Value::as_str),
            algorithm: otp.and_then(|o| o.get("algorithm")).and_then(Value::as_str),
            digits: otp.and_then(|o| o.get("digits")).and_then(Value::as_u64),
            period: otp.and_then(|o| o.get("period")).and_then(Value::as_u64),
        };

        if !token_type.eq_ignore_ascii_case("totp") {
            parsed.reject(format!(
                "Entry {} {}: unsupported token type {}",
                i + 1,
                raw.label(),
                token_type
            ));
            continue;
        }
        collect(&mut parsed, i, raw);
    }
    Ok(parsed)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Aegis JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_aegis_json(val: &Value) -> TotpResult<ParsedImport> {
    if val.get("db").map_or(false, Value::is_string) {
        return Err(TotpError::new(
            TotpErrorKind::InvalidFormat,
            "Encrypted Aegis vaults are not supported; export as plain JSON",
        ));
    }
    let entries = val.pointer("/db/entries").and_then(Value::as_array).ok_or_else(|| {
        TotpError::new(TotpErrorKind::InvalidFormat, "Missing db.entries array")
    })?;

    let mut parsed = ParsedImport::default();
    for (i, item) in entries.iter().enumerate() {
        let info = item.get("info");
        let raw = RawEntry {
            issuer: item.get("issuer").and_then(Value::as_str),
            name: item.get("name").and_then(Value::as_str),
            secret: info.and_then(|i| i.get("secret")).and_then(Value::as_str),
            algorithm: info.and_then(|i| i.get("algo")).and_then(Value::as_str),
            digits: info.and_then(|i| i.get("digits")).and_then(Value::as_u64),
            period: info.and_then(|i| i.get("period")).and_then(Value::as_u64),
        };

        let otp_type = item.get("type").and_then(Value::as_str).unwrap_or("totp");
        if !otp_type.eq_ignore_ascii_case("totp") {
            parsed.reject(format!(
                "Entry {} {}: unsupported token type {}",
                i + 1,
                raw.label(),
                otp_type
            ));
            continue;
        }
        collect(&mut parsed, i, raw);
    }
    Ok(parsed)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  WinOTP JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn winotp_entry(item: &Value) -> RawEntry<'_> {
    RawEntry {
        issuer: item.get("issuer").and_then(Value::as_str),
        name: item.get("name").and_then(Value::as_str),
        secret: item.get("secret").and_then(Value::as_str),
        algorithm: item.get("algorithm").and_then(Value::as_str),
        digits: item.get("digits").and_then(Value::as_u64),
        period: item.get("period").and_then(Value::as_u64),
    }
}

/// Accepts the id-keyed token map, a bare array of tokens, or a registry
/// document with a `tokens` array.
fn parse_winotp_json(val: &Value) -> TotpResult<ParsedImport> {
    let mut parsed = ParsedImport::default();

    let items: Vec<&Value> = if let Some(arr) = val.get("tokens").and_then(Value::as_array) {
        arr.iter().collect()
    } else if let Some(arr) = val.as_array() {
        arr.iter().collect()
    } else if let Some(map) = val.as_object() {
        map.values().collect()
    } else {
        return Err(TotpError::new(
            TotpErrorKind::InvalidFormat,
            "Expected a JSON object or array of tokens",
        ));
    };

    for (i, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            parsed.reject(format!("Entry {}: not a token object", i + 1));
            continue;
        }
        collect(&mut parsed, i, winotp_entry(item));
    }
    Ok(parsed)
}

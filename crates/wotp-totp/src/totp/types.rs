//! Core types for the token engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::totp::secret::SecretKey;

/// Issuer recorded for imported tokens that carry none.
pub const UNKNOWN_ISSUER: &str = "Unknown";

pub const DEFAULT_DIGITS: u8 = 6;
pub const DEFAULT_PERIOD: u32 = 30;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Algorithm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hash algorithm used for HMAC-based OTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri_name())
    }
}

impl Algorithm {
    /// Parse from a case-insensitive string; accepts `SHA-1`, `HmacSHA1`, …
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "SHA1" | "SHA-1" | "HMACSHA1" | "HMAC-SHA1" => Some(Self::Sha1),
            "SHA256" | "SHA-256" | "HMACSHA256" | "HMAC-SHA256" => Some(Self::Sha256),
            "SHA512" | "SHA-512" | "HMACSHA512" | "HMAC-SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Name used in `otpauth://` parameters.
    pub fn uri_name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }
}

impl FromStr for Algorithm {
    type Err = TotpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_loose(s).ok_or_else(|| {
            TotpError::new(
                TotpErrorKind::UnsupportedAlgorithm,
                format!("Unsupported algorithm '{}'", s),
            )
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Token records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A stored authenticator entry.
///
/// Only `issuer` and `name` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// UUID v4, never reused.
    pub id: String,
    pub issuer: String,
    /// Account label.
    pub name: String,
    /// Raw key bytes; persisted as base32.
    pub secret: SecretKey,
    #[serde(default = "default_digits")]
    pub digits: u8,
    #[serde(default = "default_period")]
    pub period: u32,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Reserved for counter-based tokens carried over from migrations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_offset: Option<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_digits() -> u8 {
    DEFAULT_DIGITS
}

fn default_period() -> u32 {
    DEFAULT_PERIOD
}

impl TokenRecord {
    /// Materialise a validated draft with a fresh id.
    pub fn from_new(token: NewToken) -> TotpResult<Self> {
        token.validate()?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            issuer: token.issuer,
            name: token.name,
            secret: token.secret,
            digits: token.digits,
            period: token.period,
            algorithm: token.algorithm,
            counter_offset: token.counter_offset,
            created_at: Utc::now(),
        })
    }

    /// Same checks as [`NewToken::validate`], plus a non-empty id.
    pub fn validate(&self) -> TotpResult<()> {
        if self.id.trim().is_empty() {
            return Err(TotpError::new(TotpErrorKind::InvalidParameter, "Token id is empty"));
        }
        check_parameters(self.digits, self.period)
    }

    /// "Issuer (name)", or whichever of the two is present.
    pub fn display_name(&self) -> String {
        match (self.issuer.is_empty(), self.name.is_empty()) {
            (false, false) => format!("{} ({})", self.issuer, self.name),
            (false, true) => self.issuer.clone(),
            _ => self.name.clone(),
        }
    }

    /// Case-insensitive substring match on issuer or name.
    pub fn matches(&self, needle_lower: &str) -> bool {
        needle_lower.is_empty()
            || self.issuer.to_lowercase().contains(needle_lower)
            || self.name.to_lowercase().contains(needle_lower)
    }

    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            id: self.id.clone(),
            issuer: self.issuer.clone(),
            name: self.name.clone(),
            digits: self.digits,
            period: self.period,
            algorithm: self.algorithm,
            created_at: self.created_at,
        }
    }
}

/// Input for creating a token; the secret is already decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewToken {
    pub issuer: String,
    pub name: String,
    pub secret: SecretKey,
    pub digits: u8,
    pub period: u32,
    pub algorithm: Algorithm,
    pub counter_offset: Option<u64>,
}

impl NewToken {
    pub fn new(issuer: impl Into<String>, name: impl Into<String>, secret: SecretKey) -> Self {
        Self {
            issuer: issuer.into(),
            name: name.into(),
            secret,
            digits: DEFAULT_DIGITS,
            period: DEFAULT_PERIOD,
            algorithm: Algorithm::Sha1,
            counter_offset: None,
        }
    }

    /// Decode `secret` as base32 and apply defaults.
    pub fn from_base32(
        issuer: impl Into<String>,
        name: impl Into<String>,
        secret: &str,
    ) -> TotpResult<Self> {
        Ok(Self::new(issuer, name, SecretKey::from_base32(secret)?))
    }

    pub fn with_digits(mut self, digits: u8) -> Self {
        self.digits = digits;
        self
    }

    pub fn with_period(mut self, period: u32) -> Self {
        self.period = period;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Check digit count and period.
    pub fn validate(&self) -> TotpResult<()> {
        check_parameters(self.digits, self.period)
    }
}

fn check_parameters(digits: u8, period: u32) -> TotpResult<()> {
    if !(6..=8).contains(&digits) {
        return Err(TotpError::new(
            TotpErrorKind::InvalidParameter,
            format!("Digits must be 6, 7 or 8 (got {})", digits),
        ));
    }
    if period == 0 {
        return Err(TotpError::new(
            TotpErrorKind::InvalidParameter,
            "Period must be greater than zero",
        ));
    }
    Ok(())
}

/// Token metadata without the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub id: String,
    pub issuer: String,
    pub name: String,
    pub digits: u8,
    pub period: u32,
    pub algorithm: Algorithm,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Computed codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A code for one token at one instant. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedCode {
    pub token_id: String,
    pub code: String,
    /// Fractional seconds until `code` expires, in `(0, period]`.
    pub time_remaining: f64,
    /// Code for the following window.
    pub next_code: Option<String>,
}

/// The code that becomes valid when the current window ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextCode {
    pub token_id: String,
    pub code: String,
    /// Seconds until this code becomes current.
    pub valid_in: f64,
}

/// One row of the token list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenView {
    pub id: String,
    pub issuer: String,
    pub name: String,
    pub code: String,
    pub time_remaining: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Import / export
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Payload formats understood by the importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    /// Detect from content.
    Auto,
    /// `otpauth://` URIs, one per line (also the Authenticator browser-plugin export).
    OtpAuthUri,
    /// `otpauth-migration://offline?data=…` or its raw base64 payload.
    GoogleMigration,
    /// 2FAS backup (`services[]`).
    TwoFasJson,
    /// Aegis plain-text vault export.
    AegisJson,
    /// WinOTP's own token file or export.
    WinOtpJson,
}

impl fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::OtpAuthUri => "otpauth URIs",
            Self::GoogleMigration => "Google Authenticator migration",
            Self::TwoFasJson => "2FAS JSON",
            Self::AegisJson => "Aegis JSON",
            Self::WinOtpJson => "WinOTP JSON",
        };
        f.write_str(s)
    }
}

impl FromStr for ImportFormat {
    type Err = TotpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "auto" => Ok(Self::Auto),
            "otpauth" | "otpauthuri" | "uri" | "uris" | "authenticator" => Ok(Self::OtpAuthUri),
            "google" | "googlemigration" | "migration" => Ok(Self::GoogleMigration),
            "2fas" | "twofas" | "2fasjson" | "twofasjson" => Ok(Self::TwoFasJson),
            "aegis" | "aegisjson" => Ok(Self::AegisJson),
            "winotp" | "winotpjson" => Ok(Self::WinOtpJson),
            _ => Err(TotpError::new(
                TotpErrorKind::InvalidFormat,
                format!("Unknown import format '{}'", s),
            )),
        }
    }
}

/// Result of parsing a payload, before anything touches the registry.
#[derive(Debug, Clone, Default)]
pub struct ParsedImport {
    pub tokens: Vec<NewToken>,
    /// Entries present in the payload but unusable.
    pub rejected: usize,
    pub messages: Vec<String>,
}

impl ParsedImport {
    pub(crate) fn reject(&mut self, message: impl Into<String>) {
        self.rejected += 1;
        self.messages.push(message.into());
    }
}

/// Overall classification of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Complete,
    Partial,
    NothingImported,
}

/// What an import did to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub format: ImportFormat,
    pub accepted: usize,
    pub rejected: usize,
    /// Entries identical (issuer + secret) to a stored token.
    pub skipped_duplicate: usize,
    pub messages: Vec<String>,
    pub imported_ids: Vec<String>,
}

impl ImportOutcome {
    pub fn status(&self) -> ImportStatus {
        match (self.accepted, self.rejected) {
            (0, _) => ImportStatus::NothingImported,
            (_, 0) => ImportStatus::Complete,
            _ => ImportStatus::Partial,
        }
    }

    /// Turn any rejected entry into a `PartialImportFailure`.
    pub fn ensure_complete(self) -> TotpResult<Self> {
        if self.rejected == 0 {
            return Ok(self);
        }
        Err(TotpError::new(
            TotpErrorKind::PartialImportFailure,
            format!(
                "{} of {} entries could not be imported",
                self.rejected,
                self.accepted + self.rejected
            ),
        )
        .with_detail(self.messages.join("; ")))
    }
}

/// Output formats for `export_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// One `otpauth://` URI per token.
    OtpAuthUris,
    /// One JSON object per token.
    Json,
    /// A single WinOTP token-file document.
    WinOtpJson,
}

impl FromStr for ExportFormat {
    type Err = TotpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "otpauth" | "otpauthuris" | "uri" | "uris" => Ok(Self::OtpAuthUris),
            "json" => Ok(Self::Json),
            "winotp" | "winotpjson" => Ok(Self::WinOtpJson),
            _ => Err(TotpError::new(
                TotpErrorKind::InvalidFormat,
                format!("Unknown export format '{}'", s),
            )),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error kind for this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotpErrorKind {
    InvalidSecret,
    MalformedUri,
    UnsupportedType,
    UnsupportedAlgorithm,
    InvalidParameter,
    InvalidFormat,
    NotFound,
    PersistenceFailure,
    SyncTimeout,
    SyncFailure,
    PartialImportFailure,
}

/// Crate-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotpError {
    pub kind: TotpErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

pub type TotpResult<T> = Result<T, TotpError>;

impl fmt::Display for TotpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for TotpError {}

impl TotpError {
    pub fn new(kind: TotpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(TotpErrorKind::NotFound, format!("Token not found: {}", id))
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::new(TotpErrorKind::PersistenceFailure, msg)
    }
}

impl From<TotpError> for String {
    fn from(e: TotpError) -> String {
        e.to_string()
    }
}

impl From<wotp_time_ntp::time_ntp::SyncError> for TotpError {
    fn from(e: wotp_time_ntp::time_ntp::SyncError) -> Self {
        let kind = if e.is_timeout() {
            TotpErrorKind::SyncTimeout
        } else {
            TotpErrorKind::SyncFailure
        };
        TotpError::new(kind, e.to_string())
    }
}

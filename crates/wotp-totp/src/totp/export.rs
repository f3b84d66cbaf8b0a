//! Export tokens in various formats.
//!
//! Supported formats:
//! - otpauth:// URIs (one string per token)
//! - JSON (one object per token)
//! - WinOTP token file (a single id-keyed document, re-importable)
//!
//! Exports always contain secrets; callers decide where they go.

use serde_json::{json, Map, Value};

use crate::totp::types::*;
use crate::totp::uri;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Public API
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Export `records` in the requested format, in registry order.
pub fn export(records: &[TokenRecord], format: ExportFormat) -> TotpResult<Vec<String>> {
    match format {
        ExportFormat::OtpAuthUris => Ok(records.iter().map(uri::build_otpauth_uri).collect()),
        ExportFormat::Json => records.iter().map(export_json_entry).collect(),
        ExportFormat::WinOtpJson => export_winotp_document(records).map(|doc| vec![doc]),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn export_json_entry(record: &TokenRecord) -> TotpResult<String> {
    serde_json::to_string(record).map_err(|e| {
        TotpError::new(
            TotpErrorKind::InvalidFormat,
            format!("JSON serialise error: {}", e),
        )
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  WinOTP token file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn export_winotp_document(records: &[TokenRecord]) -> TotpResult<String> {
    let mut map = Map::new();
    for r in records {
        let mut entry = json!({
            "issuer": r.issuer,
            "name": r.name,
            "secret": r.secret.to_base32(),
            "created": r.created_at.to_rfc3339(),
        });
        // Only non-default parameters, so older readers see the plain layout.
        if let Some(obj) = entry.as_object_mut() {
            if r.digits != DEFAULT_DIGITS {
                obj.insert("digits".into(), Value::from(r.digits));
            }
            if r.period != DEFAULT_PERIOD {
                obj.insert("period".into(), Value::from(r.period));
            }
            if r.algorithm != Algorithm::Sha1 {
                obj.insert("algorithm".into(), Value::from(r.algorithm.uri_name()));
            }
        }
        map.insert(r.id.clone(), entry);
    }
    serde_json::to_string_pretty(&Value::Object(map)).map_err(|e| {
        TotpError::new(
            TotpErrorKind::InvalidFormat,
            format!("JSON serialise error: {}", e),
        )
    })
}

//! `otpauth://` URI parsing and generation per the Google Authenticator
//! key-URI format:
//! <https://github.com/google/google-authenticator/wiki/Key-Uri-Format>
//!
//! Format: `otpauth://totp/ISSUER:LABEL?secret=BASE32&issuer=ISSUER&algorithm=SHA1&digits=6&period=30`
//!
//! Only time-based tokens are accepted.

use url::Url;

use crate::totp::secret;
use crate::totp::types::*;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Parse
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse an `otpauth://totp/…` URI.
pub fn parse_otpauth_uri(uri: &str) -> TotpResult<NewToken> {
    let url = Url::parse(uri.trim()).map_err(|e| {
        TotpError::new(TotpErrorKind::MalformedUri, format!("Invalid URI: {}", e))
    })?;

    if url.scheme() != "otpauth" {
        return Err(TotpError::new(
            TotpErrorKind::MalformedUri,
            format!("Expected scheme 'otpauth', got '{}'", url.scheme()),
        ));
    }

    match url.host_str().map(|h| h.to_ascii_lowercase()) {
        Some(ref t) if t == "totp" => {}
        Some(other) => {
            return Err(TotpError::new(
                TotpErrorKind::UnsupportedType,
                format!("Unsupported OTP type '{}', only totp is supported", other),
            ))
        }
        None => {
            return Err(TotpError::new(
                TotpErrorKind::MalformedUri,
                "Missing OTP type in URI",
            ))
        }
    }

    // Path is "/LABEL" or "/ISSUER:LABEL"
    let path = url.path();
    let path = percent_decode(path.strip_prefix('/').unwrap_or(path));
    let (label_issuer, name) = match path.split_once(':') {
        Some((issuer, name)) => (Some(issuer.trim().to_string()), name.trim().to_string()),
        None => (None, path.trim().to_string()),
    };

    let mut secret_param = None;
    let mut param_issuer = None;
    let mut algorithm = Algorithm::Sha1;
    let mut digits = DEFAULT_DIGITS;
    let mut period = DEFAULT_PERIOD;

    for (key, value) in url.query_pairs() {
        match key.to_ascii_lowercase().as_str() {
            "secret" => secret_param = Some(value.to_string()),
            "issuer" => param_issuer = Some(value.trim().to_string()),
            "algorithm" => algorithm = value.parse()?,
            "digits" => {
                digits = value.parse::<u8>().ok().filter(|d| (6..=8).contains(d)).ok_or_else(|| {
                    TotpError::new(
                        TotpErrorKind::InvalidParameter,
                        format!("Invalid digits '{}'", value),
                    )
                })?;
            }
            "period" => {
                period = value.parse::<u32>().ok().filter(|p| *p > 0).ok_or_else(|| {
                    TotpError::new(
                        TotpErrorKind::InvalidParameter,
                        format!("Invalid period '{}'", value),
                    )
                })?;
            }
            _ => {} // ignore unknown params
        }
    }

    let secret_param = secret_param.ok_or_else(|| {
        TotpError::new(TotpErrorKind::InvalidSecret, "Missing 'secret' parameter")
    })?;
    let key = secret::validate_import_secret(&secret_param)?;

    // Prefer issuer from query param, then from path prefix
    let issuer = param_issuer
        .filter(|i| !i.is_empty())
        .or(label_issuer.filter(|i| !i.is_empty()))
        .unwrap_or_default();

    Ok(NewToken::new(issuer, name, key)
        .with_algorithm(algorithm)
        .with_digits(digits)
        .with_period(period))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Generate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build an `otpauth://totp/` URI; default parameters are omitted.
pub fn build_otpauth_uri(record: &TokenRecord) -> String {
    let label = percent_encode(&record.name);
    let path = if record.issuer.is_empty() {
        label
    } else {
        format!("{}:{}", percent_encode(&record.issuer), label)
    };

    let mut params = vec![format!("secret={}", record.secret.to_base32())];
    if !record.issuer.is_empty() {
        params.push(format!("issuer={}", percent_encode(&record.issuer)));
    }
    if record.algorithm != Algorithm::Sha1 {
        params.push(format!("algorithm={}", record.algorithm.uri_name()));
    }
    if record.digits != DEFAULT_DIGITS {
        params.push(format!("digits={}", record.digits));
    }
    if record.period != DEFAULT_PERIOD {
        params.push(format!("period={}", record.period));
    }

    format!("otpauth://totp/{}?{}", path, params.join("&"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Percent encoding helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn percent_encode(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                output.push(byte as char);
            }
            _ => output.push_str(&format!("%{:02X}", byte)),
        }
    }
    output
}

/// Decode `%XX` sequences as UTF-8; malformed escapes are kept verbatim.
pub(crate) fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

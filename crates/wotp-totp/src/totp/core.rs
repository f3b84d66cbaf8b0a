//! Core OTP generation: RFC 4226 (HOTP) and RFC 6238 (TOTP).
//!
//! Everything here is a pure function of its inputs. Time is passed in as
//! fractional unix seconds so callers decide which clock to trust.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::totp::types::*;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  HOTP (RFC 4226 §5.3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HMAC-based one-time password for `counter`.
pub fn hotp(key: &[u8], counter: u64, digits: u8, algo: Algorithm) -> TotpResult<String> {
    if !(6..=8).contains(&digits) {
        return Err(TotpError::new(
            TotpErrorKind::InvalidParameter,
            format!("Digits must be 6, 7 or 8 (got {})", digits),
        ));
    }
    let digest = compute_hmac(key, &counter.to_be_bytes(), algo)?;
    Ok(truncate(&digest, digits))
}

fn compute_hmac(key: &[u8], data: &[u8], algo: Algorithm) -> TotpResult<Vec<u8>> {
    fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> TotpResult<Vec<u8>> {
        let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key).map_err(|e| {
            TotpError::new(TotpErrorKind::InvalidSecret, format!("HMAC key rejected: {}", e))
        })?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    match algo {
        Algorithm::Sha1 => run::<Hmac<Sha1>>(key, data),
        Algorithm::Sha256 => run::<Hmac<Sha256>>(key, data),
        Algorithm::Sha512 => run::<Hmac<Sha512>>(key, data),
    }
}

/// Dynamic truncation.
fn truncate(digest: &[u8], digits: u8) -> String {
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    let code = binary % 10u32.pow(digits as u32);
    format!("{:0>width$}", code, width = digits as usize)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  TOTP (RFC 6238)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Time-step counter. Negative or non-finite epochs count as 0.
pub fn totp_counter(epoch: f64, period: u32) -> u64 {
    let secs = whole_seconds(epoch);
    secs / period.max(1) as u64
}

/// Fractional seconds until the current window ends, always in `(0, period]`.
pub fn time_remaining(epoch: f64, period: u32) -> f64 {
    let p = period.max(1) as f64;
    let epoch = if epoch.is_finite() && epoch > 0.0 { epoch } else { 0.0 };
    let elapsed = epoch.rem_euclid(p);
    if elapsed > 0.0 {
        p - elapsed
    } else {
        p
    }
}

pub fn totp_code(
    key: &[u8],
    epoch: f64,
    digits: u8,
    period: u32,
    algo: Algorithm,
) -> TotpResult<String> {
    check_period(period)?;
    hotp(key, totp_counter(epoch, period), digits, algo)
}

/// Code for the window after the one containing `epoch`.
pub fn next_code(
    key: &[u8],
    epoch: f64,
    digits: u8,
    period: u32,
    algo: Algorithm,
) -> TotpResult<String> {
    check_period(period)?;
    hotp(key, totp_counter(epoch, period).saturating_add(1), digits, algo)
}

fn check_period(period: u32) -> TotpResult<()> {
    if period == 0 {
        return Err(TotpError::new(
            TotpErrorKind::InvalidParameter,
            "Period must be greater than zero",
        ));
    }
    Ok(())
}

fn whole_seconds(epoch: f64) -> u64 {
    if epoch.is_finite() && epoch > 0.0 {
        epoch.floor() as u64
    } else {
        0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  High-level: codes for a record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Current code and remaining time for `record` at `epoch`.
pub fn code_at(record: &TokenRecord, epoch: f64, with_next: bool) -> TotpResult<ComputedCode> {
    let key = record.secret.as_bytes();
    let code = totp_code(key, epoch, record.digits, record.period, record.algorithm)?;
    let next = if with_next {
        Some(next_code(key, epoch, record.digits, record.period, record.algorithm)?)
    } else {
        None
    };
    Ok(ComputedCode {
        token_id: record.id.clone(),
        code,
        time_remaining: time_remaining(epoch, record.period),
        next_code: next,
    })
}

/// The code that takes over when the current window of `record` ends.
pub fn next_code_at(record: &TokenRecord, epoch: f64) -> TotpResult<NextCode> {
    let code = next_code(
        record.secret.as_bytes(),
        epoch,
        record.digits,
        record.period,
        record.algorithm,
    )?;
    Ok(NextCode {
        token_id: record.id.clone(),
        code,
        valid_in: time_remaining(epoch, record.period),
    })
}

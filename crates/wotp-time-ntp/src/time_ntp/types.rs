//! Shared types for the time source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Public NTP pools tried in order, starting from the last one that answered.
pub const DEFAULT_NTP_SERVERS: &[&str] = &[
    "pool.ntp.org",
    "time.google.com",
    "time.windows.com",
    "time.nist.gov",
];

/// Standard NTP port.
pub const NTP_PORT: u16 = 123;

/// Shortest allowed periodic sync interval.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Longest allowed periodic sync interval.
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(3600);
/// Default periodic sync interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Weight of a fresh measurement when blending with the previous offset.
pub const SMOOTHING_WEIGHT: f64 = 0.7;

/// Clamp a requested sync interval into `[MIN_SYNC_INTERVAL, MAX_SYNC_INTERVAL]`.
pub fn clamp_sync_interval(requested: Duration) -> Duration {
    requested.clamp(MIN_SYNC_INTERVAL, MAX_SYNC_INTERVAL)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Sync state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of the offset correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Unsynced,
    Syncing,
    Synced,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsynced => write!(f, "unsynced"),
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
        }
    }
}

/// Snapshot of the time source, suitable for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NtpStatus {
    pub state: SyncState,
    /// Applied correction in milliseconds; `None` until the first successful sync.
    pub offset_ms: Option<f64>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Server that answered the last successful sync.
    pub last_server: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Reference samples
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One round-trip measurement against a reference clock.
///
/// All values are seconds; `reference_time` and `received_at` are unix
/// epoch seconds on the reference and local clock respectively.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSample {
    /// Reference clock reading when the reply left the server.
    pub reference_time: f64,
    /// Network round trip, excluding server processing time.
    pub round_trip: f64,
    /// Local clock reading when the reply arrived.
    pub received_at: f64,
    /// Host that produced the sample, if the provider knows it.
    pub server: Option<String>,
}

impl ReferenceSample {
    /// Estimated `reference - local` clock offset in seconds.
    pub fn offset(&self) -> f64 {
        self.reference_time + self.round_trip.max(0.0) / 2.0 - self.received_at
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tuning for a single `TimeSource::sync` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Upper bound on the whole sync, all samples included.
    pub timeout: Duration,
    /// Number of queries; the one with the smallest round trip wins.
    pub samples: usize,
    /// Blend a new offset with the previous one instead of replacing it.
    pub smoothing: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            samples: 3,
            smoothing: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Failure of a reference-clock query or a whole sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("time sync timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error talking to {server}: {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid reply from {server}: {reason}")]
    InvalidReply { server: String, reason: String },
    #[error("no reference servers configured")]
    NoServers,
    #[error("time sync failed: {0}")]
    Failed(String),
}

impl SyncError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_clamped_to_bounds() {
        assert_eq!(clamp_sync_interval(Duration::from_secs(5)), MIN_SYNC_INTERVAL);
        assert_eq!(clamp_sync_interval(Duration::from_secs(7200)), MAX_SYNC_INTERVAL);
        assert_eq!(
            clamp_sync_interval(Duration::from_secs(600)),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn sample_offset_includes_half_round_trip() {
        let sample = ReferenceSample {
            reference_time: 1000.0,
            round_trip: 0.2,
            received_at: 998.0,
            server: None,
        };
        assert!((sample.offset() - 2.1).abs() < 1e-9);
    }

    #[test]
    fn negative_round_trip_ignored() {
        let sample = ReferenceSample {
            reference_time: 10.0,
            round_trip: -4.0,
            received_at: 10.0,
            server: None,
        };
        assert_eq!(sample.offset(), 0.0);
    }

    #[test]
    fn sync_state_display() {
        assert_eq!(SyncState::Synced.to_string(), "synced");
        assert_eq!(SyncState::default(), SyncState::Unsynced);
    }

    #[test]
    fn timeout_error_is_timeout() {
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!SyncError::NoServers.is_timeout());
    }
}

//! Local clocks.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of local wall-clock time as fractional unix seconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> f64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. Microsecond resolution.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch_seconds: f64) -> Self {
        Self {
            micros: AtomicI64::new(to_micros(epoch_seconds)),
        }
    }

    pub fn set(&self, epoch_seconds: f64) {
        self.micros.store(to_micros(epoch_seconds), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.micros.fetch_add(to_micros(seconds), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

fn to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}

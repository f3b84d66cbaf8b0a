//! Time / NTP crate: sub-modules.

pub mod types;
pub mod clock;
pub mod provider;
pub mod source;

pub use types::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use provider::{ReferenceTimeProvider, SntpProvider};
pub use source::{PeriodicSync, TimeSource};

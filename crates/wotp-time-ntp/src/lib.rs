//! # WinOTP – NTP-corrected time source
//!
//! Wall-clock time with an optional correction measured against a
//! reference clock:
//!
//! - **Clock** – injectable local clock (`SystemClock`, `ManualClock`)
//! - **SNTP** – RFC 4330 client over UDP with rotating server list
//! - **Time source** – offset estimation, smoothing, cancellation-safe sync,
//!   status reporting, and an opt-in periodic background sync

pub mod time_ntp;

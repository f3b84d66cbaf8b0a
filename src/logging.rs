//! Subscriber setup for the binary.
//!
//! Library crates log through the `log` facade; `try_init` installs the
//! `tracing-log` bridge so those records reach the same subscriber.

use tracing_subscriber::EnvFilter;

use crate::error::{AppError, AppResult};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "WINOTP_LOG";

fn build_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str, json: bool) -> AppResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_filter(level))
        .with_target(false)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| AppError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_fallback_directive_still_builds() {
        let filter = build_filter("not a [valid directive");
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn second_init_fails() {
        // Either this call or one from another test installs first.
        let _ = init("debug", false);
        assert!(matches!(init("debug", false), Err(AppError::Logging(_))));
    }
}

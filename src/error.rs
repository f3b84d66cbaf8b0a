use std::path::PathBuf;

use thiserror::Error;
use wotp_totp::totp::TotpError;

/// Errors surfaced by the application layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no data directory available on this platform")]
    NoDataDir,

    #[error("app is locked: wrong or missing PIN/password (use --unlock)")]
    Locked,

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] TotpError),
}

pub type AppResult<T> = Result<T, AppError>;

//! # WinOTP
//!
//! Application layer around the token engine: configuration, logging and
//! construction of a ready-to-use [`TokenService`].
//!
//! ```rust,no_run
//! # async fn example() -> winotp_lib::AppResult<()> {
//! let config = winotp_lib::config::AppConfig::load_or_default(None)?;
//! let service = winotp_lib::open_service(&config, false).await?;
//! for view in service.list_tokens("", true).await? {
//!     println!("{} {}", view.code, view.issuer);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;

use std::sync::Arc;

use wotp_time_ntp::time_ntp::{Clock, SystemClock, TimeSource};
use wotp_totp::totp::lock::LOCK_FILE_NAME;
use wotp_totp::totp::{AppLock, EncryptedFileStore, JsonFileStore, SecretStore, TokenService};

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use wotp_totp::totp;

/// Pick the store the config asks for.
pub fn build_store(config: &AppConfig, debug: bool) -> AppResult<Arc<dyn SecretStore>> {
    let path = config.tokens_path(debug)?;
    let store: Arc<dyn SecretStore> = match &config.encryption_password {
        Some(password) if !password.is_empty() => {
            tracing::info!("Using encrypted token file {}", path.display());
            Arc::new(EncryptedFileStore::new(path, password.clone()))
        }
        _ => {
            tracing::info!("Using token file {}", path.display());
            Arc::new(JsonFileStore::new(path))
        }
    };
    Ok(store)
}

/// The app lock stored next to the token file.
pub async fn open_app_lock(config: &AppConfig) -> AppResult<AppLock> {
    let path = config.data_dir()?.join(LOCK_FILE_NAME);
    Ok(AppLock::open(path).await?)
}

/// Open the token service described by `config`.
pub async fn open_service(config: &AppConfig, debug: bool) -> AppResult<TokenService> {
    open_service_with_store(config, build_store(config, debug)?).await
}

/// Like [`open_service`] with an explicit store.
pub async fn open_service_with_store(
    config: &AppConfig,
    store: Arc<dyn SecretStore>,
) -> AppResult<TokenService> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let time = Arc::new(TimeSource::new(clock.clone(), config.ntp.sync_options()));
    let provider = Arc::new(config.ntp.provider(clock));
    Ok(TokenService::open(store, time, provider).await?)
}

/// Start background re-sync at the configured interval when NTP is enabled.
/// Returns whether a sync loop is now running.
pub fn start_background_sync(service: &TokenService, config: &AppConfig) -> bool {
    if !config.ntp.enabled {
        tracing::debug!("NTP disabled; no background sync");
        return false;
    }
    service.start_periodic_sync(config.ntp.sync_interval());
    service.periodic_sync_running()
}

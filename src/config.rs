//! Application configuration.
//!
//! Read from `<config dir>/WinOTP/config.json`; every field has a default,
//! so a missing file or a partial one is fine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wotp_time_ntp::time_ntp::{
    clamp_sync_interval, Clock, SntpProvider, SyncOptions, DEFAULT_NTP_SERVERS,
};

use crate::error::{AppError, AppResult};

pub const APP_DIR_NAME: &str = "WinOTP";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const TOKENS_FILE_NAME: &str = "tokens.json";
/// Token file used when running with `--debug`.
pub const DEV_TOKENS_FILE_NAME: &str = "tokens.json.dev";

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the token file.
    pub data_dir: Option<PathBuf>,
    pub tokens_file: String,
    /// When set, tokens are stored encrypted with this password.
    pub encryption_password: Option<String>,
    /// Filter directive used when `WINOTP_LOG` is unset.
    pub log_level: String,
    pub log_json: bool,
    pub ntp: NtpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            tokens_file: TOKENS_FILE_NAME.to_string(),
            encryption_password: None,
            log_level: "info".to_string(),
            log_json: false,
            ntp: NtpConfig::default(),
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("tokens_file", &self.tokens_file)
            .field("encrypted", &self.encryption_password.is_some())
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .field("ntp", &self.ntp)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    pub enabled: bool,
    pub servers: Vec<String>,
    /// Per-server reply timeout.
    pub timeout_ms: u64,
    /// Queries per sync; clamped to 1..=8.
    pub samples: usize,
    /// Background re-sync interval; clamped to 60..=3600.
    pub sync_interval_secs: u64,
    pub smoothing: bool,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: DEFAULT_NTP_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeout_ms: 1000,
            samples: 3,
            sync_interval_secs: 300,
            smoothing: true,
        }
    }
}

impl NtpConfig {
    pub fn samples(&self) -> usize {
        self.samples.clamp(1, 8)
    }

    pub fn per_server_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        clamp_sync_interval(Duration::from_secs(self.sync_interval_secs))
    }

    /// Bound for a whole sync: every sample may walk the full server list.
    pub fn sync_options(&self) -> SyncOptions {
        let servers = self.servers.len().max(1) as u32;
        let samples = self.samples();
        SyncOptions {
            timeout: self.per_server_timeout() * servers * samples as u32 + Duration::from_secs(1),
            samples,
            smoothing: self.smoothing,
        }
    }

    pub fn provider(&self, clock: Arc<dyn Clock>) -> SntpProvider {
        SntpProvider::new(self.servers.clone())
            .with_timeout(self.per_server_timeout())
            .with_clock(clock)
    }
}

impl AppConfig {
    /// `<config dir>/WinOTP/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| AppError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, or the default location; a missing file gives defaults.
    pub fn load_or_default(path: Option<&Path>) -> AppResult<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(p) => p,
            None => return Ok(Self::default()),
        };
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let config = Self::load(&path)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn data_dir(&self) -> AppResult<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|d| d.join(APP_DIR_NAME))
                .ok_or(AppError::NoDataDir),
        }
    }

    /// Token file path; `debug` selects the development file.
    pub fn tokens_path(&self, debug: bool) -> AppResult<PathBuf> {
        let name = if debug {
            DEV_TOKENS_FILE_NAME
        } else {
            self.tokens_file.as_str()
        };
        Ok(self.data_dir()?.join(name))
    }
}

//! App lock: an optional PIN or password guarding access to the codes.
//!
//! Only a PHC-format PBKDF2-SHA256 hash is stored (`auth_config.json`), e.g.
//! `$pbkdf2-sha256$i=600000,l=32$<salt>$<hash>`. Verification re-derives and
//! compares through `password-hash`, which compares in constant time.

use std::path::{Path, PathBuf};

use pbkdf2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{Params, Pbkdf2};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::totp::crypto::PBKDF2_ITERATIONS;
use crate::totp::store::{read_optional, write_atomic};
use crate::totp::types::*;

pub const LOCK_FILE_NAME: &str = "auth_config.json";
pub const MIN_PIN_DIGITS: usize = 4;
pub const MIN_PASSWORD_CHARS: usize = 6;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Which secret unlocks the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Pin,
    Password,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pin => write!(f, "pin"),
            Self::Password => write!(f, "password"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LockFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_type: Option<LockKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pin_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password_hash: Option<String>,
}

impl LockFile {
    fn hash_for(&self, kind: LockKind) -> Option<&str> {
        match kind {
            LockKind::Pin => self.pin_hash.as_deref(),
            LockKind::Password => self.password_hash.as_deref(),
        }
    }

    /// The active kind, if its hash is actually present.
    fn active(&self) -> Option<LockKind> {
        self.auth_type.filter(|k| self.hash_for(*k).is_some())
    }
}

fn lock_err(msg: impl Into<String>) -> TotpError {
    TotpError::persistence(msg)
}

pub struct AppLock {
    path: PathBuf,
    rounds: u32,
    state: Mutex<LockFile>,
}

impl std::fmt::Debug for AppLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppLock")
            .field("path", &self.path)
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

impl AppLock {
    /// Read the lock file at `path`; a missing file means no lock.
    pub async fn open(path: impl Into<PathBuf>) -> TotpResult<Self> {
        let path = path.into();
        let state = match read_optional(&path).await? {
            Some(text) if !text.trim().is_empty() => serde_json::from_str(&text).map_err(|e| {
                lock_err(format!("Corrupt lock file {}: {}", path.display(), e))
            })?,
            _ => LockFile::default(),
        };
        Ok(Self {
            path,
            rounds: PBKDF2_ITERATIONS,
            state: Mutex::new(state),
        })
    }

    /// PBKDF2 rounds for newly set secrets.
    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn kind(&self) -> Option<LockKind> {
        self.state.lock().await.active()
    }

    pub async fn is_enabled(&self) -> bool {
        self.kind().await.is_some()
    }

    pub async fn set_pin(&self, pin: &str) -> TotpResult<()> {
        let pin = pin.trim();
        if pin.len() < MIN_PIN_DIGITS || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(TotpError::new(
                TotpErrorKind::InvalidParameter,
                format!("PIN must be at least {} digits", MIN_PIN_DIGITS),
            ));
        }
        self.set(LockKind::Pin, pin).await
    }

    pub async fn set_password(&self, password: &str) -> TotpResult<()> {
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(TotpError::new(
                TotpErrorKind::InvalidParameter,
                format!("Password must be at least {} characters", MIN_PASSWORD_CHARS),
            ));
        }
        self.set(LockKind::Password, password).await
    }

    async fn set(&self, kind: LockKind, secret: &str) -> TotpResult<()> {
        let hash = hash_secret(secret, self.rounds).await?;
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        match kind {
            LockKind::Pin => next.pin_hash = Some(hash),
            LockKind::Password => next.password_hash = Some(hash),
        }
        next.auth_type = Some(kind);
        self.write(&next).await?;
        *state = next;
        log::info!("App lock set to {}", kind);
        Ok(())
    }

    /// Remove every stored secret.
    pub async fn clear(&self) -> TotpResult<()> {
        let mut state = self.state.lock().await;
        let next = LockFile::default();
        self.write(&next).await?;
        *state = next;
        log::info!("App lock cleared");
        Ok(())
    }

    /// `true` when `pin` matches, or when the app is not PIN-locked.
    pub async fn verify_pin(&self, pin: &str) -> TotpResult<bool> {
        self.verify_kind(LockKind::Pin, pin.trim()).await
    }

    /// `true` when `password` matches, or when the app is not password-locked.
    pub async fn verify_password(&self, password: &str) -> TotpResult<bool> {
        self.verify_kind(LockKind::Password, password).await
    }

    /// Check `secret` against whichever lock is active.
    pub async fn verify(&self, secret: &str) -> TotpResult<bool> {
        match self.kind().await {
            Some(LockKind::Pin) => self.verify_pin(secret).await,
            Some(LockKind::Password) => self.verify_password(secret).await,
            None => Ok(true),
        }
    }

    async fn verify_kind(&self, kind: LockKind, secret: &str) -> TotpResult<bool> {
        let stored = {
            let state = self.state.lock().await;
            if state.active() != Some(kind) {
                return Ok(true);
            }
            match state.hash_for(kind) {
                Some(hash) => hash.to_string(),
                None => return Ok(true),
            }
        };
        let ok = check_secret(secret, stored).await?;
        if !ok {
            log::warn!("App lock: wrong {}", kind);
        }
        Ok(ok)
    }

    async fn write(&self, file: &LockFile) -> TotpResult<()> {
        let text = serde_json::to_string_pretty(file)
            .map_err(|e| lock_err(format!("JSON serialize: {}", e)))?;
        write_atomic(&self.path, &text).await
    }
}

// PBKDF2 at full strength takes a noticeable moment, so it runs off the
// async workers.

async fn hash_secret(secret: &str, rounds: u32) -> TotpResult<String> {
    let secret = Zeroizing::new(secret.to_string());
    tokio::task::spawn_blocking(move || {
        let salt_bytes: [u8; SALT_LEN] = rand::random();
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| lock_err(format!("Failed to encode salt: {}", e)))?;
        let params = Params {
            rounds,
            output_length: HASH_LEN,
        };
        let hash = Pbkdf2
            .hash_password_customized(secret.as_bytes(), None, None, params, &salt)
            .map_err(|e| lock_err(format!("Hashing failed: {}", e)))?;
        Ok(hash.to_string())
    })
    .await
    .map_err(|e| lock_err(format!("Hash task failed: {}", e)))?
}

async fn check_secret(secret: &str, stored: String) -> TotpResult<bool> {
    let secret = Zeroizing::new(secret.to_string());
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored)
            .map_err(|e| lock_err(format!("Stored lock hash is unreadable: {}", e)))?;
        match Pbkdf2.verify_password(secret.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(lock_err(format!("Lock verification failed: {}", e))),
        }
    })
    .await
    .map_err(|e| lock_err(format!("Verify task failed: {}", e)))?
}

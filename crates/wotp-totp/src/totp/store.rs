//! # Secret stores
//!
//! Durable storage for the token registry. The registry never touches the
//! filesystem itself; it hands a complete [`PersistedRegistry`] snapshot to
//! a [`SecretStore`] after every mutation and loads one at startup.
//!
//! ## Implementations
//!
//! - [`MemoryStore`]: keeps the last snapshot in memory (tests, ephemeral use)
//! - [`JsonFileStore`]: pretty JSON on disk, written via temp file + rename
//! - [`EncryptedFileStore`]: same file layout wrapped in an AES-256-GCM envelope
//!
//! ## File format
//!
//! ```json
//! { "version": 1, "sort_ascending": true, "tokens": [ { "id": "…", "issuer": "…", … } ] }
//! ```
//!
//! Older token files are a bare object keyed by token id
//! (`{ "<id>": { "issuer", "name", "secret", "created" } }`); both file
//! stores read that layout and rewrite it in the current one on the next
//! save.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wotp_totp::totp::{JsonFileStore, SecretStore};
//!
//! # async fn example() -> Result<(), wotp_totp::totp::TotpError> {
//! let store = JsonFileStore::new("tokens.json");
//! if let Some(registry) = store.load().await? {
//!     println!("{} tokens on disk", registry.tokens.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::totp::crypto::{self, Envelope};
use crate::totp::secret::SecretKey;
use crate::totp::types::*;

/// Current on-disk layout version.
pub const REGISTRY_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the registry persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRegistry {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Sort preference for listings.
    #[serde(default = "default_ascending")]
    pub sort_ascending: bool,
    #[serde(default)]
    pub tokens: Vec<TokenRecord>,
}

fn default_version() -> u32 {
    REGISTRY_VERSION
}

fn default_ascending() -> bool {
    true
}

impl Default for PersistedRegistry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            sort_ascending: true,
            tokens: Vec::new(),
        }
    }
}

impl PersistedRegistry {
    pub fn new(tokens: Vec<TokenRecord>, sort_ascending: bool) -> Self {
        Self {
            version: REGISTRY_VERSION,
            sort_ascending,
            tokens,
        }
    }

    /// Parse either the current layout or the legacy id-keyed token map.
    pub fn from_json(text: &str) -> TotpResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TotpError::persistence(format!("Corrupt token file: {}", e)))?;

        if value.get("tokens").is_some() {
            return serde_json::from_value(value)
                .map_err(|e| TotpError::persistence(format!("Corrupt token file: {}", e)));
        }

        let map = value.as_object().ok_or_else(|| {
            TotpError::persistence("Corrupt token file: expected a JSON object")
        })?;
        let mut tokens = Vec::with_capacity(map.len());
        let mut unreadable = Vec::new();
        for (id, entry) in map {
            match legacy_record(id, entry) {
                Ok(record) => tokens.push(record),
                Err(e) => unreadable.push(format!("{} ({})", id, e.message)),
            }
        }
        if !unreadable.is_empty() {
            return Err(TotpError::persistence(format!(
                "Legacy token file has unreadable entries: {}",
                unreadable.join(", ")
            )));
        }
        log::info!("Loaded {} tokens from legacy token map", tokens.len());
        Ok(Self::new(tokens, true))
    }

    /// Reject snapshots that break record invariants or repeat an id.
    pub fn validate(&self) -> TotpResult<()> {
        let mut seen = HashSet::with_capacity(self.tokens.len());
        for token in &self.tokens {
            token.validate().map_err(|e| {
                TotpError::persistence(format!("Stored token {} is invalid: {}", token.id, e.message))
            })?;
            if !seen.insert(token.id.as_str()) {
                return Err(TotpError::persistence(format!(
                    "Stored token id {} appears more than once",
                    token.id
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> TotpResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TotpError::persistence(format!("JSON serialize: {}", e)))
    }
}

fn legacy_record(id: &str, entry: &Value) -> TotpResult<TokenRecord> {
    let field = |k: &str| entry.get(k).and_then(Value::as_str).unwrap_or_default();
    let secret = SecretKey::from_base32(field("secret"))?;
    let issuer = match field("issuer").trim() {
        "" => UNKNOWN_ISSUER.to_string(),
        other => other.to_string(),
    };
    let created_at = DateTime::parse_from_rfc3339(field("created"))
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(TokenRecord {
        id: id.to_string(),
        issuer,
        name: field("name").trim().to_string(),
        secret,
        digits: DEFAULT_DIGITS,
        period: DEFAULT_PERIOD,
        algorithm: Algorithm::Sha1,
        counter_offset: None,
        created_at,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable home for the registry snapshot.
///
/// `persist` must be all-or-nothing: after an error the previously
/// persisted snapshot is still what `load` returns.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    async fn load(&self) -> TotpResult<Option<PersistedRegistry>>;

    async fn persist(&self, registry: &PersistedRegistry) -> TotpResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory store. Persist failures can be switched on for testing
/// rollback paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<PersistedRegistry>>,
    fail_persist: AtomicBool,
    persist_count: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: PersistedRegistry) -> Self {
        Self {
            saved: Mutex::new(Some(registry)),
            ..Self::default()
        }
    }

    /// Make every following `persist` fail (or succeed again).
    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `persist` calls.
    pub fn persist_count(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }

    pub async fn saved(&self) -> Option<PersistedRegistry> {
        self.saved.lock().await.clone()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn load(&self) -> TotpResult<Option<PersistedRegistry>> {
        Ok(self.saved.lock().await.clone())
    }

    async fn persist(&self, registry: &PersistedRegistry) -> TotpResult<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(TotpError::persistence("Memory store is set to fail"));
        }
        *self.saved.lock().await = Some(registry.clone());
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) async fn read_optional(path: &Path) -> TotpResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TotpError::persistence(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Write `contents` next to `path` and rename over it.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> TotpResult<()> {
    let io_err = |what: &str, e: std::io::Error| {
        TotpError::persistence(format!("Failed to {} {}: {}", what, path.display(), e))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err("create directory for", e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(e) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err("write", e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err("replace", e));
    }
    Ok(())
}

/// Plain JSON token file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecretStore for JsonFileStore {
    async fn load(&self) -> TotpResult<Option<PersistedRegistry>> {
        match read_optional(&self.path).await? {
            Some(text) if !text.trim().is_empty() => PersistedRegistry::from_json(&text).map(Some),
            _ => Ok(None),
        }
    }

    async fn persist(&self, registry: &PersistedRegistry) -> TotpResult<()> {
        write_atomic(&self.path, &registry.to_json()?).await
    }
}

/// Password-protected token file.
///
/// Reads plain JSON files too, so an existing unencrypted file is upgraded
/// on the first save.
pub struct EncryptedFileStore {
    path: PathBuf,
    password: Zeroizing<String>,
    iterations: u32,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileStore")
            .field("path", &self.path)
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl EncryptedFileStore {
    pub fn new(path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            password: Zeroizing::new(password.into()),
            iterations: crypto::PBKDF2_ITERATIONS,
        }
    }

    /// Override the PBKDF2 work factor used for new writes.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecretStore for EncryptedFileStore {
    async fn load(&self) -> TotpResult<Option<PersistedRegistry>> {
        let text = match read_optional(&self.path).await? {
            Some(text) if !text.trim().is_empty() => text,
            _ => return Ok(None),
        };
        if Envelope::sniff(&text) {
            let plain = Zeroizing::new(crypto::decrypt_document(&text, &self.password)?);
            PersistedRegistry::from_json(&plain).map(Some)
        } else {
            log::warn!("{} is not encrypted; it will be encrypted on next save", self.path.display());
            PersistedRegistry::from_json(&text).map(Some)
        }
    }

    async fn persist(&self, registry: &PersistedRegistry) -> TotpResult<()> {
        let plain = Zeroizing::new(registry.to_json()?);
        let sealed = crypto::encrypt_document(&plain, &self.password, self.iterations)?;
        write_atomic(&self.path, &sealed).await
    }
}

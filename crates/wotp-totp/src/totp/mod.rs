//! TOTP crate: sub-modules.

pub mod types;
pub mod secret;
pub mod core;
pub mod uri;
pub mod import;
pub mod export;
pub mod crypto;
pub mod store;
pub mod lock;
pub mod registry;
pub mod service;

// Re-export top-level items for convenience.
pub use types::*;
pub use secret::SecretKey;
pub use store::{EncryptedFileStore, JsonFileStore, MemoryStore, PersistedRegistry, SecretStore};
pub use lock::{AppLock, LockKind};
pub use registry::TokenRegistry;
pub use service::TokenService;

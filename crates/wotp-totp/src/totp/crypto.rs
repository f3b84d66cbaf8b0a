//! Encryption for the token file at rest.
//!
//! - **Key derivation**: PBKDF2-HMAC-SHA256 (600 000 iterations by default)
//! - **Encryption**: AES-256-GCM with random 96-bit nonce
//! - **Envelope**: JSON with salt, nonce, ciphertext (all hex)

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::totp::types::*;

/// PBKDF2 iteration count (OWASP 2023 recommendation for SHA-256).
pub const PBKDF2_ITERATIONS: u32 = 600_000;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const ENVELOPE_VERSION: u32 = 1;

/// Encrypted document stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    /// PBKDF2 iteration count used for this document.
    pub iterations: u32,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl Envelope {
    /// Cheap check that `text` looks like an envelope rather than plain JSON.
    pub fn sniff(text: &str) -> bool {
        serde_json::from_str::<Envelope>(text).is_ok()
    }
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    key
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

fn crypto_err(msg: impl Into<String>) -> TotpError {
    TotpError::new(TotpErrorKind::PersistenceFailure, msg)
}

/// Encrypt `plaintext` into a pretty-printed envelope.
pub fn encrypt_document(plaintext: &str, password: &str, iterations: u32) -> TotpResult<String> {
    let salt: [u8; SALT_LEN] = random_bytes();
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let key = derive_key(password, &salt, iterations);

    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| crypto_err(format!("AES init: {}", e)))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| crypto_err(format!("AES encrypt: {}", e)))?;

    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        iterations,
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    };
    serde_json::to_string_pretty(&envelope).map_err(|e| crypto_err(format!("JSON serialize: {}", e)))
}

/// Decrypt an envelope produced by [`encrypt_document`].
pub fn decrypt_document(envelope_json: &str, password: &str) -> TotpResult<String> {
    let envelope: Envelope = serde_json::from_str(envelope_json)
        .map_err(|e| crypto_err(format!("Invalid envelope: {}", e)))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(crypto_err(format!("Unsupported envelope version {}", envelope.version)));
    }

    let salt = hex::decode(&envelope.salt).map_err(|e| crypto_err(format!("Bad salt hex: {}", e)))?;
    let nonce = hex::decode(&envelope.nonce).map_err(|e| crypto_err(format!("Bad nonce hex: {}", e)))?;
    let ciphertext = hex::decode(&envelope.ciphertext)
        .map_err(|e| crypto_err(format!("Bad ciphertext hex: {}", e)))?;
    if nonce.len() != NONCE_LEN {
        return Err(crypto_err(format!(
            "Nonce length {} != expected {}",
            nonce.len(),
            NONCE_LEN
        )));
    }

    let key = derive_key(password, &salt, envelope.iterations);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| crypto_err(format!("AES init: {}", e)))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| crypto_err("Decryption failed: wrong password or corrupted data"))?;

    String::from_utf8(plaintext).map_err(|e| crypto_err(format!("UTF-8 decode: {}", e)))
}

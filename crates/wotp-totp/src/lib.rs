//! # WinOTP – token engine
//!
//! Time-based one-time password engine:
//!
//! - **RFC 4226 / 6238** – HOTP & TOTP generation with SHA-1, SHA-256, SHA-512
//! - **Base32** – tolerant secret decoding, secrets wiped on drop
//! - **otpauth:// URIs** – parsing & generation
//! - **Multi-format Import** – Google Authenticator migration, 2FAS, Aegis,
//!   WinOTP token files, Authenticator plugin URI lists
//! - **Export** – otpauth URI lists, JSON records, WinOTP token file
//! - **Registry** – concurrent token store with transactional persistence
//! - **Secret stores** – in-memory, JSON file, AES-256-GCM encrypted file

pub mod totp;

//! Cryptographic primitives for TaskSync.
//!
//! This module provides:
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Passphrase key derivation using Argon2id
//! - Server-derived auto-encryption keys (HMAC-SHA256)
//! - Operation payload encryption in manual and auto modes
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged

pub mod aead;
pub mod auto_key;
pub mod kdf;
pub mod keys;
pub mod payload;

pub use aead::{decrypt, encrypt};
pub use auto_key::derive_auto_encryption_key;
pub use kdf::{derive_key, KdfParams};
pub use keys::{EncryptionKey, Salt, KEY_LENGTH};
pub use payload::{is_available, payload_mode, EncryptionSecret, PayloadCipher, PayloadMode};

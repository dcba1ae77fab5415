//! Server-derived auto-encryption keys.
//!
//! The key for a user is HMAC-SHA256 over `auto-encrypt:<user id>` keyed with
//! a secret only the server holds. It is deterministic per user and distinct
//! across users, and the client fetches it once over an authenticated call.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use tasksync_common::{Error, Result};

const AUTO_KEY_DOMAIN: &str = "auto-encrypt:";

/// Derive the base64 auto-encryption key for `user_id`.
///
/// # Errors
/// - Returns error if the server secret is empty
pub fn derive_auto_encryption_key(server_secret: &[u8], user_id: &str) -> Result<String> {
    if server_secret.is_empty() {
        return Err(Error::Crypto("Server secret cannot be empty".to_string()));
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(server_secret)
        .map_err(|e| Error::Crypto(format!("Invalid HMAC key: {}", e)))?;
    mac.update(AUTO_KEY_DOMAIN.as_bytes());
    mac.update(user_id.as_bytes());

    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

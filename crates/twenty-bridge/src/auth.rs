//! Shared-secret handshake
//!
//! The relay sends a random nonce; the client answers with
//! HMAC-SHA256(secret, "<name>:<nonce>") in hex. Fresh nonces per connection
//! keep a captured answer from being replayed.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Random 128-bit nonce, hex-encoded
pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn keyed(secret: &str, name: &str, nonce: &str) -> HmacSha256 {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
    mac.update(name.as_bytes());
    mac.update(b":");
    mac.update(nonce.as_bytes());
    mac
}

/// Answer a challenge
pub fn sign(secret: &str, name: &str, nonce: &str) -> String {
    hex::encode(keyed(secret, name, nonce).finalize().into_bytes())
}

/// Check an answer in constant time
pub fn verify(secret: &str, name: &str, nonce: &str, mac_hex: &str) -> bool {
    match hex::decode(mac_hex) {
        Ok(expected) => keyed(secret, name, nonce).verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

// ABOUTME: Challenge/response authentication: random salt, HMAC-SHA256, constant-time verify
// ABOUTME: Timing is identical for wrong-password and malformed-hash failures

use rand::RngCore;
use ring::constant_time;
use ring::hmac;

/// Salt length in raw bytes; hex-encoded to 32 characters on the wire.
pub const SALT_LEN: usize = 16;

/// Mint a fresh challenge salt, hex-encoded for the `AUTH_CHALLENGE` line.
pub fn mint_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Compute the expected `AUTH_RESPONSE` hash:
/// `hex(hmac_sha256(password_utf8, salt_hex_utf8))`. The key is the
/// password; the message is the hex string exactly as sent on the wire.
pub fn response_hash(password: &str, salt_hex: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, password.as_bytes());
    let tag = hmac::sign(&key, salt_hex.as_bytes());
    hex::encode(tag.as_ref())
}

/// Verify a presented hash against the configured password. Comparison is
/// constant-time; undecodable hex fails the same way a wrong digest does.
pub fn verify_response(password: &str, salt_hex: &str, presented_hex: &str) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, password.as_bytes());
    let expected = hmac::sign(&key, salt_hex.as_bytes());

    let presented = hex::decode(presented_hex).unwrap_or_default();
    constant_time::verify_slices_are_equal(expected.as_ref(), &presented).is_ok()
}

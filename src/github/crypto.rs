//! Sealed-box encryption for GitHub Actions secrets.
//!
//! Uses libsodium's `crypto_box_seal` construction:
//! - fresh X25519 ephemeral keypair per call
//! - XSalsa20-Poly1305 keyed by DH(ephemeral, recipient)
//! - nonce derived from both public keys, so none is transmitted
//!
//! Output is `ephemeral_public || ciphertext`. Only the holder of the
//! recipient's secret key can open it, and the sender stays anonymous.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::PublicKey;
use rand::rngs::OsRng;
use thiserror::Error;

/// Curve25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid public key length: expected {PUBLIC_KEY_LEN} bytes, got {0}")]
    InvalidPublicKey(usize),

    #[error("Sealing failed")]
    SealFailed,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Parse a recipient public key from raw bytes.
pub fn parse_public_key(bytes: &[u8]) -> CryptoResult<PublicKey> {
    let arr: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey(bytes.len()))?;
    Ok(PublicKey::from(arr))
}

/// Parse a recipient public key from base64, as served by GitHub.
pub fn parse_public_key_base64(base64_key: &str) -> CryptoResult<PublicKey> {
    let bytes = BASE64.decode(base64_key)?;
    parse_public_key(&bytes)
}

/// Seal `plaintext` for `recipient_public_key` (raw 32 bytes).
pub fn seal(plaintext: &[u8], recipient_public_key: &[u8]) -> CryptoResult<Vec<u8>> {
    let recipient = parse_public_key(recipient_public_key)?;
    seal_for(&recipient, plaintext)
}

/// Seal with an already parsed key.
pub fn seal_for(recipient: &PublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    recipient
        .seal(&mut OsRng, plaintext)
        .map_err(|_| CryptoError::SealFailed)
}

/// Seal a string value and base64 the result for the GitHub API.
pub fn seal_base64(recipient: &PublicKey, secret_value: &str) -> CryptoResult<String> {
    seal_for(recipient, secret_value.as_bytes()).map(|sealed| BASE64.encode(sealed))
}

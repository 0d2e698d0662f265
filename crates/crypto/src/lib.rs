//! Cryptographic helpers shared across the Homeward backend.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::Signer;
use rand::rngs::OsRng;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn verifying_key_from(signing_key: &SigningKey) -> VerifyingKey {
    signing_key.verifying_key()
}

pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    verifying_key
        .verify_strict(message, signature)
        .map_err(|err| anyhow!(err))
}

/// Decode a base64url (unpadded) verifying key.
pub fn verifying_key_from_base64(raw: &str) -> Result<VerifyingKey> {
    let decoded = URL_SAFE_NO_PAD
        .decode(raw.trim())
        .map_err(|err| anyhow!("verifying key is not valid base64url: {err}"))?;
    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| anyhow!("verifying key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| anyhow!(err))
}

//! Webhook signature verification
//!
//! Medusa signs the raw request body with HMAC-SHA256 and sends the hex digest
//! in `X-Medusa-Signature`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-medusa-signature";

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Check `signature` against the body. An empty secret or signature never verifies.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    if secret.is_empty() || signature.is_empty() {
        return false;
    }

    let Ok(provided) = hex::decode(signature.to_ascii_lowercase()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.as_slice().ct_eq(provided.as_slice()).into()
}

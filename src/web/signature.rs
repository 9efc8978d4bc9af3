//! Webhook signature verification.
//!
//! GitHub signs each delivery with HMAC-SHA256 over the raw body using
//! the app's shared secret, and sends the result in
//! `X-Hub-Signature-256` as `sha256=<hex>`. Intake rejects a delivery
//! before parsing anything unless the signature checks out; the
//! comparison is constant-time via the HMAC library.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a delivery's signature was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The header is not `sha256=` followed by valid hex.
    #[error("signature header is not sha256=<hex>")]
    MalformedHeader,

    /// The header decoded fine but does not match the payload.
    #[error("signature does not match the payload")]
    Mismatch,
}

/// Verifies a delivery against the `X-Hub-Signature-256` header value.
///
/// Malformed headers are rejected before any HMAC work is done; a
/// well-formed header that fails the constant-time comparison is a
/// [`SignatureError::Mismatch`]. Never panics, whatever the header
/// contains.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &[u8],
) -> Result<(), SignatureError> {
    let presented = signature_header
        .strip_prefix("sha256=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(SignatureError::MalformedHeader)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::Mismatch)?;
    mac.update(payload);
    mac.verify_slice(&presented)
        .map_err(|_| SignatureError::Mismatch)
}

/// Signs a payload the way the provider does, returning the complete
/// header value (`sha256=<hex>`).
///
/// Test suites use this to build valid deliveries.
pub fn sign_payload(payload: &[u8], secret: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

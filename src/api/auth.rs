// =============================================================================
// Webhook Signature Verification — HMAC-SHA256 over the raw body
// =============================================================================
//
// Signal senders may sign the raw request body with a shared secret and put
// the lowercase hex digest in the `X-Signature` header. Verification only
// runs when the header is present AND a secret is configured; either side
// missing skips the check (unsigned senders keep working).
//
// The comparison is constant-time: every byte of both digests is examined
// even after a mismatch is found.
// =============================================================================

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Compare two byte slices in constant time. Returns `true` if identical.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Expected signature for `body` under `secret` (lowercase hex).
pub fn expected_signature(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an optional `X-Signature` header against the raw request body.
///
/// Returns `true` when the request should be accepted:
/// - no header present (sender does not sign), or
/// - no secret configured (verification disabled), or
/// - the signature matches.
pub fn verify_signature(secret: Option<&str>, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return true;
    };
    let Some(secret) = secret else {
        warn!("X-Signature present but no webhook secret configured, skipping check");
        return true;
    };
    let expected = expected_signature(secret, body);
    let ok = constant_time_eq(signature.as_bytes(), expected.as_bytes());
    if !ok {
        warn!("webhook signature mismatch");
    }
    ok
}

//! # Content Fingerprinting
//!
//! SHA-256 over the canonical encoding of a value. The resulting hex
//! digest uniquely identifies the value's content and is used for cache
//! keys, idempotency keys, rule-content hashes, and result checksums.
//!
//! Determinism contract: equal values under canonical encoding produce
//! bit-identical fingerprints, on every platform, forever.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::canonical_json;

/// Computes the SHA-256 fingerprint of a value's canonical encoding.
///
/// Returns 64 lower-case hex characters.
pub fn fingerprint(value: &Value) -> String {
    fingerprint_bytes(canonical_json(value).as_bytes())
}

/// Computes the SHA-256 fingerprint of raw bytes.
///
/// Only the canonicaliser's output should ever be passed here; any other
/// byte stream breaks the equal-values-equal-fingerprints contract.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================

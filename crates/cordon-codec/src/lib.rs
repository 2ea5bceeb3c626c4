// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-codec
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Authenticated, TTL-bounded, replay-resistant job transport.
//!
//! A [`SignedJob`] carries an HMAC-SHA256 over the canonical JSON bytes of
//! its payload. Verification recomputes the MAC in constant time, then
//! enforces the TTL deadline and the anti-replay freshness bound, in that
//! order, before any state mutation on the agent.

use chrono::Utc;
use cordon_core::{ContractError, JobPayload, SignedJob, canonical_json};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm tag stamped on every signature this codec produces.
pub const ALGORITHM: &str = "hmac-sha256";

/// Anti-replay upper bound on payload age, independent of the TTL.
pub const MAX_JOB_AGE_SECS: i64 = 300;

/// Failures raised while producing a signature.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// The payload could not be canonically serialized.
    #[error("canonicalize payload: {0}")]
    Canonicalize(#[from] ContractError),
    /// The secret was rejected by the MAC implementation.
    #[error("invalid signing key")]
    InvalidKey,
}

/// Failures raised while verifying a [`SignedJob`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The MAC did not match, the signature was malformed, or the
    /// algorithm tag is not one this codec produces.
    #[error("invalid signature")]
    InvalidSignature,
    /// `now` has passed the payload's TTL deadline.
    #[error("job expired: ttl {ttl} <= now {now}")]
    JobExpired {
        /// The payload's deadline.
        ttl: i64,
        /// The clock value used for the check.
        now: i64,
    },
    /// The payload was issued more than [`MAX_JOB_AGE_SECS`] ago.
    #[error("job too old: issued {age}s ago (limit {MAX_JOB_AGE_SECS}s)")]
    JobTooOld {
        /// Seconds since issuance.
        age: i64,
    },
    /// The payload could not be canonically serialized for verification.
    #[error("canonicalize payload for verification")]
    Canonicalize,
}

/// Compute the hex-encoded HMAC-SHA256 over the canonical bytes of `payload`.
///
/// # Errors
///
/// Returns [`SignError`] when canonicalization fails or the key is rejected.
pub fn signature_hex(payload: &JobPayload, secret: &[u8]) -> Result<String, SignError> {
    let canonical = canonical_json(payload)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignError::InvalidKey)?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sign a payload, producing the wire-ready [`SignedJob`].
///
/// # Examples
///
/// ```
/// use cordon_core::JobPayloadBuilder;
///
/// let payload = JobPayloadBuilder::new("echo hello").build();
/// let signed = cordon_codec::sign(payload, b"shared-secret").unwrap();
/// assert_eq!(signed.algorithm, cordon_codec::ALGORITHM);
/// assert_eq!(signed.signature.len(), 64);
/// ```
///
/// # Errors
///
/// Returns [`SignError`] when canonicalization fails or the key is rejected.
pub fn sign(payload: JobPayload, secret: &[u8]) -> Result<SignedJob, SignError> {
    let signature = signature_hex(&payload, secret)?;
    Ok(SignedJob {
        payload,
        algorithm: ALGORITHM.to_string(),
        signature,
    })
}

/// Verify a [`SignedJob`] against `secret` at clock value `now` (Unix secs).
///
/// Check order is fixed: signature first (constant-time MAC comparison),
/// then TTL, then the freshness bound. TTL exactly at `now` is expired;
/// age exactly at [`MAX_JOB_AGE_SECS`] is still fresh.
///
/// # Errors
///
/// Returns the first failing [`VerifyError`] in check order.
pub fn verify(signed: &SignedJob, secret: &[u8], now: i64) -> Result<(), VerifyError> {
    if signed.algorithm != ALGORITHM {
        return Err(VerifyError::InvalidSignature);
    }

    let canonical = canonical_json(&signed.payload).map_err(|_| VerifyError::Canonicalize)?;
    let expected = hex::decode(&signed.signature).map_err(|_| VerifyError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| VerifyError::InvalidSignature)?;
    mac.update(canonical.as_bytes());
    // verify_slice is a constant-time comparison; no early exit on the
    // first mismatching byte.
    mac.verify_slice(&expected)
        .map_err(|_| VerifyError::InvalidSignature)?;

    if now >= signed.payload.ttl {
        return Err(VerifyError::JobExpired {
            ttl: signed.payload.ttl,
            now,
        });
    }

    let age = now - signed.payload.timestamp;
    if age > MAX_JOB_AGE_SECS {
        return Err(VerifyError::JobTooOld { age });
    }

    Ok(())
}

/// [`verify`] against the system clock.
///
/// # Errors
///
/// Returns the first failing [`VerifyError`] in check order.
pub fn verify_now(signed: &SignedJob, secret: &[u8]) -> Result<(), VerifyError> {
    verify(signed, secret, Utc::now().timestamp())
}

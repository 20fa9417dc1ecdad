//! Event validation: structure, identity hash, signature, timestamp bound.

use std::time::{SystemTime, UNIX_EPOCH};

use hex::FromHex;
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use thiserror::Error;

use crate::event::{event_hash, Event, Tag};
use crate::kind::{self, KindClass};

/// Seconds an event's `created_at` may sit ahead of the relay clock.
const MAX_FUTURE_SECS: u64 = 900;

/// Rejection reasons surfaced to clients in `OK` frames.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid: id must be 64 lowercase hex characters")]
    IdFormat,
    #[error("invalid: pubkey must be 64 lowercase hex characters")]
    PubkeyFormat,
    #[error("invalid: sig must be 128 lowercase hex characters")]
    SigFormat,
    #[error("invalid: kind {0} is out of range")]
    KindRange(u32),
    #[error("invalid: tag {0} is empty")]
    EmptyTag(usize),
    #[error("invalid: id does not match event contents")]
    IdMismatch,
    #[error("invalid: signature verification failed")]
    BadSignature,
    #[error("invalid: created_at is too far in the future")]
    FutureTimestamp,
    #[error("invalid: unsupported kind {0}")]
    UnsupportedKind(u32),
    #[error("invalid: purge event requires a d tag")]
    PurgeMissingDocument,
    #[error("invalid: purge event requires a k tag naming a syncable kind")]
    PurgeBadKind,
}

/// Current Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn lowercase_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Validate an event against the relay clock `now`.
///
/// Checks run in order: field structure, recomputed identity hash,
/// Schnorr signature, future-timestamp bound. Pure apart from the caller
/// supplied clock.
pub fn validate_event(ev: &Event, now: u64) -> Result<(), ValidationError> {
    if !lowercase_hex(&ev.id, 64) {
        return Err(ValidationError::IdFormat);
    }
    if !lowercase_hex(&ev.pubkey, 64) {
        return Err(ValidationError::PubkeyFormat);
    }
    if !lowercase_hex(&ev.sig, 128) {
        return Err(ValidationError::SigFormat);
    }
    if ev.kind > 65535 {
        return Err(ValidationError::KindRange(ev.kind));
    }
    for (i, Tag(fields)) in ev.tags.iter().enumerate() {
        if fields.is_empty() {
            return Err(ValidationError::EmptyTag(i));
        }
    }

    let hash = event_hash(ev).map_err(|_| ValidationError::IdMismatch)?;
    if hex::encode(hash) != ev.id {
        return Err(ValidationError::IdMismatch);
    }
    verify_signature(ev, &hash)?;

    if ev.created_at > now + MAX_FUTURE_SECS {
        return Err(ValidationError::FutureTimestamp);
    }
    Ok(())
}

/// Verify the event's Schnorr signature over its hash.
fn verify_signature(ev: &Event, hash: &[u8; 32]) -> Result<(), ValidationError> {
    let sig_bytes =
        <[u8; 64]>::from_hex(&ev.sig).map_err(|_| ValidationError::SigFormat)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| ValidationError::SigFormat)?;
    let pk_bytes =
        <[u8; 32]>::from_hex(&ev.pubkey).map_err(|_| ValidationError::PubkeyFormat)?;
    let pk =
        XOnlyPublicKey::from_slice(&pk_bytes).map_err(|_| ValidationError::PubkeyFormat)?;
    let msg = Message::from_digest_slice(hash).map_err(|_| ValidationError::IdMismatch)?;
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| ValidationError::BadSignature)
}

/// Classify an event's kind, rejecting kinds the relay does not accept.
pub fn classify_kind(ev: &Event) -> Result<KindClass, ValidationError> {
    kind::classify(ev.kind).ok_or(ValidationError::UnsupportedKind(ev.kind))
}

/// Extract and check the document a purge event targets.
///
/// Returns the parsed `(kind, doc_id)` pair from the `k` and `d` tags.
pub fn purge_target(ev: &Event) -> Result<(u32, String), ValidationError> {
    let doc = ev
        .tag_value("d")
        .ok_or(ValidationError::PurgeMissingDocument)?;
    let target_kind: u32 = ev
        .tag_value("k")
        .and_then(|v| v.parse().ok())
        .ok_or(ValidationError::PurgeBadKind)?;
    if !kind::in_document_range(target_kind) {
        return Err(ValidationError::PurgeBadKind);
    }
    Ok((target_kind, doc.to_string()))
}

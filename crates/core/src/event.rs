//! Event structure, canonical serialization, hashing, and verification.
//!
//! The event id is the sha256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]`. That serialization is a
//! wire-compatibility requirement: tag arrays keep their original order and
//! the JSON is compact, so ids and signatures interoperate with the rest of
//! the network.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Message, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors from event construction and serialization.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A signed event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// 32-byte lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds (author-supplied, untrusted)
    pub created_at: u64,
    /// Kind number classifying event semantics
    pub kind: u16,
    /// Ordered tag arrays; first element of each is the tag name
    pub tags: Vec<Vec<String>>,
    /// Opaque string payload
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature over `id`
    pub sig: String,
}

/// An event before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey comes from the signer, and
/// `created_at` defaults to the current time when left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTemplate {
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub created_at: Option<u64>,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_REACTION: u16 = 7;

/// Event kind classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Stored by relays
    Regular,
    /// Only the latest event per pubkey+kind is kept
    Replaceable,
    /// Not expected to be stored
    Ephemeral,
    /// Only the latest event per pubkey+kind+d-tag is kept
    Addressable,
    Unknown,
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, EventError> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(EventError::Invalid(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))
}

/// Compute the event id: sha256 over the canonical serialization.
pub fn event_hash(event: &UnsignedEvent) -> Result<String, EventError> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

/// Structural validation of a signed event (hex field shapes only).
pub fn validate_event_shape(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Verify an event's id and signature.
///
/// Returns `false` on any structural malformation or mismatch; verification
/// failure is routine for multi-source input and is never an error.
pub fn verify_event(event: &Event) -> bool {
    if !validate_event_shape(event) {
        return false;
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };

    let computed_id = match event_hash(&unsigned) {
        Ok(id) => id,
        Err(_) => return false,
    };
    if computed_id != event.id {
        return false;
    }

    let Ok(id_bytes) = hex::decode(&event.id) else {
        return false;
    };
    let Ok(message) = Message::from_digest_slice(&id_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(&event.sig) else {
        return false;
    };
    let Ok(sig) = schnorr::Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(pubkey_bytes) = hex::decode(&event.pubkey) else {
        return false;
    };
    let Ok(pubkey) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
        return false;
    };

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &message, &pubkey).is_ok()
}

/// Classify an event kind.
pub fn classify_kind(kind: u16) -> KindClassification {
    let k = kind as u32;

    if (1000..10000).contains(&k) || (4..45).contains(&k) || k == 1 || k == 2 {
        return KindClassification::Regular;
    }
    if (10000..20000).contains(&k) || k == 0 || k == 3 {
        return KindClassification::Replaceable;
    }
    if (20000..30000).contains(&k) {
        return KindClassification::Ephemeral;
    }
    if (30000..40000).contains(&k) {
        return KindClassification::Addressable;
    }

    KindClassification::Unknown
}

pub fn is_regular_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Regular)
}

pub fn is_replaceable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

pub fn is_ephemeral_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

pub fn is_addressable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}

/// Sort events reverse-chronologically by `created_at`, breaking ties by id.
///
/// The pool makes no cross-relay ordering guarantee; callers that want
/// chronological order apply this after the fact.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

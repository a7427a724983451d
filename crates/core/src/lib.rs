//! Nostr protocol core for Agora.
//!
//! This crate provides the pure, I/O-free half of the client:
//! - Event structure, canonical serialization, hashing, and verification
//! - Signer abstraction (local key or external capability) and event building
//! - Thread resolution (reply/root/mention markers with legacy fallback)
//! - Profile metadata (kind 0) parsing

mod event;
mod profile;
mod signer;
mod thread;

pub use event::{
    Event, EventError, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_REACTION,
    KIND_TEXT_NOTE, KindClassification, UnsignedEvent, classify_kind, event_hash,
    is_addressable_kind, is_ephemeral_kind, is_regular_kind, is_replaceable_kind,
    serialize_event, sort_events, unix_now, validate_event_shape, verify_event,
};
pub use profile::Profile;
pub use signer::{
    ExternalSigner, LocalSigner, SignRequest, SignResponse, Signer, SignerError, build_event,
};
pub use thread::{
    EventPointer, ThreadMarker, ThreadNode, ThreadRef, build_threads, parse_thread, thread_depth,
};

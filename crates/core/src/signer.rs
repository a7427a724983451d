//! Signing capability abstraction.
//!
//! Two custody models sit behind one trait: [`LocalSigner`] holds raw secret
//! material in memory and signs synchronously; [`ExternalSigner`] delegates
//! to an out-of-process capability (a browser extension, a hardware signer)
//! where signing is asynchronous, user-confirmable, and may be rejected,
//! cancelled, or time out. Everything above the trait only ever sees
//! `dyn Signer`, so a deterministic local key substitutes for the external
//! path in tests.

use crate::event::{Event, EventTemplate, UnsignedEvent, event_hash, unix_now};
use async_trait::async_trait;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey};
use rand::RngCore;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Errors from signing identities.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no signing capability available")]
    NoKey,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signing request rejected: {0}")]
    Rejected(String),

    #[error("signing request cancelled")]
    Cancelled,

    #[error("signing request timed out after {0:?}")]
    Timeout(Duration),

    #[error("signature error: {0}")]
    Signature(String),
}

/// A signing capability: a public identity plus the ability to sign an
/// event id.
#[async_trait]
pub trait Signer: Send + Sync {
    /// The signer's x-only public key, lowercase hex.
    fn public_key(&self) -> &str;

    /// Produce a Schnorr signature (lowercase hex) over a 32-byte event id.
    async fn sign(&self, event_id: &[u8; 32]) -> Result<String, SignerError>;
}

/// Build a signed event from a template.
///
/// Computes the canonical serialization, derives the id hash, obtains a
/// signature from the capability, and returns a fully populated [`Event`].
/// `created_at` defaults to the current time when the template leaves it
/// unset.
pub async fn build_event(
    template: &EventTemplate,
    signer: &dyn Signer,
) -> Result<Event, SignerError> {
    let created_at = template.created_at.unwrap_or_else(unix_now);

    let unsigned = UnsignedEvent {
        pubkey: signer.public_key().to_string(),
        created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let id = event_hash(&unsigned).map_err(|e| SignerError::Signature(e.to_string()))?;

    let id_bytes =
        hex::decode(&id).map_err(|e| SignerError::Signature(format!("invalid id hex: {e}")))?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&id_bytes);

    let sig = signer.sign(&digest).await?;

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig,
    })
}

/// Raw secret key held in memory. Signing is synchronous and deterministic
/// (no auxiliary randomness).
pub struct LocalSigner {
    keypair: Keypair,
    public_key: String,
}

impl LocalSigner {
    /// Create a signer from 32 raw secret bytes.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, SignerError> {
        let secp = Secp256k1::new();
        let sk =
            SecretKey::from_slice(secret).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let (xonly, _parity) = keypair.x_only_public_key();
        Ok(Self {
            keypair,
            public_key: hex::encode(xonly.serialize()),
        })
    }

    /// Create a signer from a 64-character hex secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(secret).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::InvalidKey("secret key must be 32 bytes".to_string()))?;
        Self::from_secret_bytes(&arr)
    }

    /// Generate a signer with a fresh random key.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        loop {
            rand::rng().fill_bytes(&mut secret);
            if let Ok(signer) = Self::from_secret_bytes(&secret) {
                return signer;
            }
        }
    }

    fn sign_digest(&self, event_id: &[u8; 32]) -> Result<String, SignerError> {
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(event_id)
            .map_err(|e| SignerError::Signature(e.to_string()))?;
        let sig = secp.sign_schnorr_no_aux_rand(&message, &self.keypair);
        Ok(hex::encode(sig.serialize()))
    }

    /// Sign a template synchronously. Equivalent to [`build_event`] without
    /// requiring an async context.
    pub fn finalize(&self, template: &EventTemplate) -> Result<Event, SignerError> {
        let created_at = template.created_at.unwrap_or_else(unix_now);
        let unsigned = UnsignedEvent {
            pubkey: self.public_key.clone(),
            created_at,
            kind: template.kind,
            tags: template.tags.clone(),
            content: template.content.clone(),
        };
        let id = event_hash(&unsigned).map_err(|e| SignerError::Signature(e.to_string()))?;
        let id_bytes =
            hex::decode(&id).map_err(|e| SignerError::Signature(format!("invalid id hex: {e}")))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&id_bytes);
        let sig = self.sign_digest(&digest)?;
        Ok(Event {
            id,
            pubkey: unsigned.pubkey,
            created_at,
            kind: template.kind,
            tags: template.tags.clone(),
            content: template.content.clone(),
            sig,
        })
    }
}

// Secret material stays out of Debug output and logs.
impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    async fn sign(&self, event_id: &[u8; 32]) -> Result<String, SignerError> {
        self.sign_digest(event_id)
    }
}

/// A sign request delivered to an external capability.
#[derive(Debug)]
pub struct SignRequest {
    /// The 32-byte event id to sign.
    pub event_id: [u8; 32],
    /// Where the capability answers. Dropping the sender without answering
    /// is a cancellation (the user closed the prompt).
    pub respond: oneshot::Sender<SignResponse>,
}

/// The external capability's answer to a [`SignRequest`].
#[derive(Debug)]
pub enum SignResponse {
    /// Lowercase hex Schnorr signature.
    Signature(String),
    /// The user declined the request.
    Rejected(String),
}

/// Handle to an out-of-process signing capability.
///
/// The pool holds this handle, not key material. Signing suspends awaiting
/// a human/out-of-process response; the approval timeout is deliberately
/// separate from any network timeout, and other pool activity proceeds
/// while a request is pending.
#[derive(Debug, Clone)]
pub struct ExternalSigner {
    public_key: String,
    requests: mpsc::Sender<SignRequest>,
    approval_timeout: Duration,
}

impl ExternalSigner {
    pub fn new(
        public_key: impl Into<String>,
        requests: mpsc::Sender<SignRequest>,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            requests,
            approval_timeout,
        }
    }
}

#[async_trait]
impl Signer for ExternalSigner {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    async fn sign(&self, event_id: &[u8; 32]) -> Result<String, SignerError> {
        let (tx, rx) = oneshot::channel();
        let request = SignRequest {
            event_id: *event_id,
            respond: tx,
        };

        // The capability itself is gone, not merely unresponsive.
        self.requests
            .send(request)
            .await
            .map_err(|_| SignerError::NoKey)?;

        match timeout(self.approval_timeout, rx).await {
            Err(_) => Err(SignerError::Timeout(self.approval_timeout)),
            Ok(Err(_)) => Err(SignerError::Cancelled),
            Ok(Ok(SignResponse::Signature(sig))) => Ok(sig),
            Ok(Ok(SignResponse::Rejected(reason))) => Err(SignerError::Rejected(reason)),
        }
    }
}

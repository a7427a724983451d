//! High-level client: a relay pool plus a signing identity.
//!
//! This is the surface UI code talks to. Everything here delegates to the
//! pool after running templates through the signer; per-relay mechanics
//! stay below.

use crate::error::Result;
use crate::health::RelayRecord;
use crate::message::Filter;
use crate::pool::{PoolConfig, PublishOutcome, RelayPool};
use crate::subscription::PoolSubscription;
use agora_core::{Event, EventTemplate, KIND_METADATA, Profile, Signer, build_event};
use std::sync::Arc;
use tracing::debug;

pub struct Client {
    pool: RelayPool,
    signer: Arc<dyn Signer>,
}

impl Client {
    pub fn new(signer: Arc<dyn Signer>, config: PoolConfig) -> Self {
        Self {
            pool: RelayPool::new(config),
            signer,
        }
    }

    /// Construct a client and add an initial relay set. Individual relays
    /// that fail to connect are still added; their supervisors keep
    /// retrying.
    pub async fn with_relays(
        signer: Arc<dyn Signer>,
        config: PoolConfig,
        relay_urls: &[&str],
    ) -> Result<Self> {
        let client = Self::new(signer, config);
        for url in relay_urls {
            client.pool.add_relay(url).await?;
        }
        Ok(client)
    }

    /// The signing identity's public key.
    pub fn public_key(&self) -> &str {
        self.signer.public_key()
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub async fn add_relay(&self, url: &str) -> Result<()> {
        self.pool.add_relay(url).await
    }

    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        self.pool.remove_relay(url).await
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        self.pool.relay_urls().await
    }

    pub async fn relay_records(&self) -> Vec<RelayRecord> {
        self.pool.health().await
    }

    pub async fn score_relays(&self) -> Vec<(String, f64)> {
        self.pool.ranked_relays().await
    }

    /// One-shot query across the pool.
    pub async fn query(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.pool.query(filters, None).await
    }

    /// Live subscription across the pool.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<PoolSubscription> {
        self.pool.subscribe(filters, None).await
    }

    /// Sign a template and publish it. Succeeds once at least one relay
    /// acknowledges; the returned event is the signed, content-addressed
    /// form that went out.
    pub async fn publish(&self, template: EventTemplate) -> Result<Event> {
        let event = build_event(&template, self.signer.as_ref()).await?;
        let outcome = self.pool.publish(&event, None).await?;
        debug!(
            event_id = %event.id,
            acks = outcome.accepted_count(),
            "event published"
        );
        Ok(event)
    }

    /// Publish an already-signed event, exposing the per-relay outcome.
    pub async fn publish_signed(&self, event: &Event) -> Result<PublishOutcome> {
        self.pool.publish(event, None).await
    }

    /// Fetch a pubkey's profile metadata. The newest kind-0 event wins;
    /// a missing or malformed profile is `None`, not an error.
    pub async fn get_profile(&self, pubkey: &str) -> Result<Option<Profile>> {
        let filter = Filter::new()
            .kinds(vec![KIND_METADATA])
            .authors(vec![pubkey.to_string()]);
        let events = self.pool.query(vec![filter], None).await?;
        // Query results are sorted newest-first.
        Ok(events
            .iter()
            .find(|e| e.pubkey == pubkey && e.kind == KIND_METADATA)
            .and_then(Profile::from_event))
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

//! Relay pool client for Agora.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays
//! - Wire message parsing (NIP-01 relay protocol)
//! - A relay pool that fans queries, subscriptions, and publishes out to
//!   many relays with dedup, health tracking, and reconnection
//! - A facade [`Client`] pairing the pool with a signing identity
//!
//! # Example
//!
//! ```rust,no_run
//! use agora_client::{Client, Filter, PoolConfig};
//! use agora_core::{EventTemplate, KIND_TEXT_NOTE, LocalSigner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> agora_client::Result<()> {
//!     let signer = Arc::new(LocalSigner::generate());
//!     let client = Client::with_relays(
//!         signer,
//!         PoolConfig::default(),
//!         &["wss://relay.damus.io", "wss://nos.lol"],
//!     )
//!     .await?;
//!
//!     // Publish a text note.
//!     let event = client
//!         .publish(EventTemplate {
//!             kind: KIND_TEXT_NOTE,
//!             content: "hello".to_string(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("published {}", event.id);
//!
//!     // Stream text notes as they arrive.
//!     let mut sub = client.subscribe(vec![Filter::new().kinds(vec![1])]).await?;
//!     while let Some(event) = sub.recv().await {
//!         println!("{}: {}", event.pubkey, event.content);
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod client;
mod dedup;
mod error;
mod health;
mod message;
mod pool;
mod recovery;
mod relay;
mod subscription;

#[cfg(test)]
mod testutil;

pub use client::Client;
pub use dedup::DedupCache;
pub use error::{ClientError, Result};
pub use health::{RelayRecord, RelayStatus, rank_relays, score_relay};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{PoolConfig, PublishOutcome, RelayOutcome, RelayOutcomeStatus, RelayPool};
pub use recovery::ExponentialBackoff;
pub use relay::{Acknowledgement, ConnectionState, RelayConfig, RelayConnection};
pub use subscription::{
    PoolSubscription, SubscriptionHandle, SubscriptionTracker, generate_subscription_id,
};

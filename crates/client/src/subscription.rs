//! Subscription identity, tracking, and cancellation.
//!
//! A pool subscription owns an event receiver plus a [`SubscriptionHandle`].
//! Cancelling the handle is idempotent and guarantees no further deliveries
//! once it returns: the per-relay listener tasks are aborted and awaited
//! before CLOSE frames go out, so an event in flight from a relay at cancel
//! time is dropped, not delivered.

use crate::message::Filter;
use crate::relay::RelayConnection;
use agora_core::Event;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Tracks which relays carry a subscription and which have drained their
/// stored events. The pool keeps one per active subscription so filters can
/// be re-issued after a reconnect.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    pub id: String,
    pub filters: Vec<Filter>,
    /// Relays carrying this subscription.
    pub relays: HashSet<String>,
    /// Relays that have sent EOSE.
    pub eose_relays: HashSet<String>,
}

impl SubscriptionTracker {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: HashSet::new(),
            eose_relays: HashSet::new(),
        }
    }

    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
    }

    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
    }

    /// Record an EOSE. Returns `true` once every tracked relay has sent one.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) -> bool {
        self.eose_relays.insert(relay_url.into());
        self.all_eose()
    }

    pub fn all_eose(&self) -> bool {
        !self.relays.is_empty() && self.relays.is_subset(&self.eose_relays)
    }
}

type TrackerMap = Arc<RwLock<HashMap<String, SubscriptionTracker>>>;

/// Cancellation handle for one subscription.
pub struct SubscriptionHandle {
    id: String,
    cancelled: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    relays: Vec<Arc<RelayConnection>>,
    trackers: TrackerMap,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: String,
        tasks: Vec<JoinHandle<()>>,
        relays: Vec<Arc<RelayConnection>>,
        trackers: TrackerMap,
    ) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(tasks),
            relays,
            trackers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop deliveries and close the subscription on every relay. Safe to
    /// call any number of times; later calls are no-ops.
    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
            // Wait for the abort to land so nothing is mid-send when we
            // return.
            let _ = task.await;
        }

        self.trackers.write().await.remove(&self.id);

        for relay in &self.relays {
            let _ = relay.unsubscribe(&self.id).await;
        }
        debug!(subscription = %self.id, "subscription cancelled");
    }
}

/// An open subscription: a stream of deduplicated events plus its handle.
pub struct PoolSubscription {
    pub id: String,
    pub events: mpsc::Receiver<Event>,
    pub handle: SubscriptionHandle,
}

impl PoolSubscription {
    /// Receive the next event, or `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub async fn cancel(&self) {
        self.handle.cancel().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_are_short_and_unique() {
        let a = generate_subscription_id();
        let b = generate_subscription_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn tracker_reports_all_eose_only_when_every_relay_drained() {
        let mut tracker = SubscriptionTracker::new("sub1", vec![Filter::new().kinds(vec![1])]);
        assert!(!tracker.all_eose());

        tracker.add_relay("wss://a.example");
        tracker.add_relay("wss://b.example");

        assert!(!tracker.mark_eose("wss://a.example"));
        assert!(tracker.mark_eose("wss://b.example"));
        assert!(tracker.all_eose());
    }

    #[test]
    fn removing_a_relay_forgets_its_eose() {
        let mut tracker = SubscriptionTracker::new("sub1", vec![]);
        tracker.add_relay("wss://a.example");
        tracker.mark_eose("wss://a.example");
        tracker.remove_relay("wss://a.example");
        assert!(!tracker.all_eose());
        assert!(tracker.eose_relays.is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_tasks() {
        let trackers: TrackerMap = Arc::new(RwLock::new(HashMap::new()));
        trackers
            .write()
            .await
            .insert("sub1".to_string(), SubscriptionTracker::new("sub1", vec![]));

        let forever = tokio::spawn(async {
            std::future::pending::<()>().await;
        });

        let handle = SubscriptionHandle::new("sub1".to_string(), vec![forever], vec![], trackers.clone());

        assert!(!handle.is_cancelled());
        handle.cancel().await;
        assert!(handle.is_cancelled());
        assert!(!trackers.read().await.contains_key("sub1"));

        // Second cancel is a no-op.
        handle.cancel().await;
        assert!(handle.is_cancelled());
    }
}

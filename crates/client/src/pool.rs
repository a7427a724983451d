//! Relay pool: fan-out, merge, dedup, health.
//!
//! The pool owns one [`RelayConnection`] per managed relay and fans each
//! logical operation out to all of them, or to a caller-chosen subset:
//! - `publish` sends to every targeted relay and succeeds if at least one
//!   acknowledges; per-relay timeouts and rejections are recorded, not
//!   fatal.
//! - `query` opens an ephemeral subscription everywhere, collects until
//!   EOSE or the query deadline, then merges and deduplicates.
//! - `subscribe` streams live events over a channel, delivering each event
//!   id at most once across all relays.
//!
//! Unverifiable events are dropped at this boundary and never reach
//! callers. Each relay gets a supervisor task that reconnects with backoff
//! after an unexpected disconnect and re-issues active subscription filters
//! with `since` advanced to now; events published during the outage are
//! knowingly lost in exchange for never redelivering history.

use crate::dedup::DedupCache;
use crate::error::{ClientError, Result};
use crate::health::{RelayRecord, rank_relays};
use crate::message::{Filter, RelayMessage};
use crate::recovery::ExponentialBackoff;
use crate::relay::{RelayConfig, RelayConnection};
use crate::subscription::{
    PoolSubscription, SubscriptionHandle, SubscriptionTracker, generate_subscription_id,
};
use agora_core::{Event, sort_events, unix_now, validate_event_shape, verify_event};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub relay: RelayConfig,
    /// Overall deadline for `query`; slower relays contribute nothing.
    pub query_timeout: Duration,
    /// Cap on the per-connection close handshake during shutdown.
    pub close_timeout: Duration,
    /// Per-subscription dedup cache size.
    pub dedup_capacity: usize,
    /// Buffer of the per-subscription event channel.
    pub subscription_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            query_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            dedup_capacity: 4096,
            subscription_buffer: 256,
        }
    }
}

/// Outcome of a publish on one relay.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub relay: String,
    pub status: RelayOutcomeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcomeStatus {
    Acked,
    Rejected(String),
    TimedOut,
    Failed(String),
}

impl RelayOutcomeStatus {
    pub fn is_ack(&self) -> bool {
        matches!(self, RelayOutcomeStatus::Acked)
    }

    fn reason(&self) -> String {
        match self {
            RelayOutcomeStatus::Acked => "accepted".to_string(),
            RelayOutcomeStatus::Rejected(m) if !m.is_empty() => m.clone(),
            RelayOutcomeStatus::Rejected(_) => "rejected by relay".to_string(),
            RelayOutcomeStatus::TimedOut => "no acknowledgement before timeout".to_string(),
            RelayOutcomeStatus::Failed(m) => m.clone(),
        }
    }
}

/// Aggregate result of a multi-relay publish. Exists only when at least one
/// relay acknowledged.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub event_id: String,
    pub results: Vec<RelayOutcome>,
}

impl PublishOutcome {
    pub fn accepted_count(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_ack()).count()
    }
}

/// Collapse per-relay outcomes: one ack is success, zero acks is
/// `PublishFailed` with a reason per attempted relay.
fn aggregate_publish(event_id: String, results: Vec<RelayOutcome>) -> Result<PublishOutcome> {
    if results.iter().any(|r| r.status.is_ack()) {
        Ok(PublishOutcome { event_id, results })
    } else {
        Err(ClientError::PublishFailed {
            reasons: results
                .iter()
                .map(|r| format!("{}: {}", r.relay, r.status.reason()))
                .collect(),
        })
    }
}

/// Merge per-relay query results: first sighting of an id wins, then sort
/// reverse-chronologically.
fn merge_query_results(per_relay: Vec<Vec<Event>>) -> Vec<Event> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for batch in per_relay {
        for event in batch {
            if seen.insert(event.id.clone()) {
                merged.push(event);
            }
        }
    }
    sort_events(&mut merged);
    merged
}

struct RelayEntry {
    connection: Arc<RelayConnection>,
    supervisor: JoinHandle<()>,
}

type TrackerMap = Arc<RwLock<HashMap<String, SubscriptionTracker>>>;
type RecordMap = Arc<RwLock<HashMap<String, RelayRecord>>>;

/// A set of relay connections behaving as one logical relay.
///
/// Explicitly constructed and explicitly shut down; independent pools can
/// coexist.
pub struct RelayPool {
    config: PoolConfig,
    relays: RwLock<HashMap<String, RelayEntry>>,
    records: RecordMap,
    trackers: TrackerMap,
    shut_down: Arc<AtomicBool>,
    shutdown_signal: Arc<Notify>,
}

impl RelayPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            relays: RwLock::new(HashMap::new()),
            records: Arc::new(RwLock::new(HashMap::new())),
            trackers: Arc::new(RwLock::new(HashMap::new())),
            shut_down: Arc::new(AtomicBool::new(false)),
            shutdown_signal: Arc::new(Notify::new()),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(ClientError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Add a relay and immediately attempt a connection. A failed first
    /// attempt is not an error; the supervisor keeps retrying with backoff.
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        self.check_running()?;
        if self.relays.read().await.contains_key(url) {
            return Ok(());
        }

        let connection = Arc::new(RelayConnection::new(url, self.config.relay.clone())?);
        self.records
            .write()
            .await
            .insert(url.to_string(), RelayRecord::new(url));

        self.mark(url, |r| r.mark_connecting()).await;
        match connection.connect().await {
            Ok(latency) => self.mark(url, |r| r.mark_connected(latency)).await,
            Err(e) => {
                warn!(url, error = %e, "initial relay connection failed");
                self.mark(url, |r| r.mark_failed(e.to_string())).await;
            }
        }

        let supervisor = self.spawn_supervisor(url.to_string(), Arc::clone(&connection));
        self.relays.write().await.insert(
            url.to_string(),
            RelayEntry {
                connection,
                supervisor,
            },
        );
        info!(url, "relay added to pool");
        Ok(())
    }

    /// Drop a relay from the pool, closing its connection and detaching it
    /// from active subscriptions.
    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        let entry = self
            .relays
            .write()
            .await
            .remove(url)
            .ok_or_else(|| ClientError::UnknownRelay(url.to_string()))?;

        entry.supervisor.abort();
        for tracker in self.trackers.write().await.values_mut() {
            tracker.remove_relay(url);
        }
        entry.connection.close().await;
        self.records.write().await.remove(url);
        info!(url, "relay removed from pool");
        Ok(())
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        self.relays.read().await.keys().cloned().collect()
    }

    /// Snapshot of per-relay operational state.
    pub async fn health(&self) -> Vec<RelayRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Relays ranked best-first by connectivity, latency, and recency.
    pub async fn ranked_relays(&self) -> Vec<(String, f64)> {
        rank_relays(&self.health().await)
    }

    async fn mark<F: FnOnce(&mut RelayRecord)>(&self, url: &str, f: F) {
        if let Some(record) = self.records.write().await.get_mut(url) {
            f(record);
        }
    }

    /// Connected relays, restricted to `relay_urls` when given. URLs not in
    /// the managed set are ignored, not errors.
    async fn connected_relays(&self, relay_urls: Option<&[String]>) -> Vec<Arc<RelayConnection>> {
        let relays = self.relays.read().await;
        let mut connected = Vec::new();
        for (url, entry) in relays.iter() {
            if let Some(chosen) = relay_urls
                && !chosen.iter().any(|c| c == url)
            {
                continue;
            }
            if entry.connection.is_connected().await {
                connected.push(Arc::clone(&entry.connection));
            }
        }
        connected
    }

    /// Publish to every connected relay, or to `relay_urls` when given.
    /// Succeeds when at least one acknowledges; the outcome carries every
    /// targeted relay's individual verdict.
    pub async fn publish(
        &self,
        event: &Event,
        relay_urls: Option<&[String]>,
    ) -> Result<PublishOutcome> {
        self.check_running()?;
        if !validate_event_shape(event) || !verify_event(event) {
            return Err(ClientError::InvalidEvent(
                "event failed shape or signature validation".to_string(),
            ));
        }

        let connections = self.connected_relays(relay_urls).await;
        if connections.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let attempts = connections.iter().map(|conn| {
            let conn = Arc::clone(conn);
            let event = event.clone();
            async move {
                let url = conn.url().to_string();
                let status = match conn.publish(&event).await {
                    Ok(ack) if ack.accepted => RelayOutcomeStatus::Acked,
                    Ok(ack) => RelayOutcomeStatus::Rejected(ack.message),
                    Err(ClientError::Timeout(_)) => RelayOutcomeStatus::TimedOut,
                    Err(e) => RelayOutcomeStatus::Failed(e.to_string()),
                };
                RelayOutcome { relay: url, status }
            }
        });
        let results = join_all(attempts).await;

        for outcome in &results {
            match &outcome.status {
                RelayOutcomeStatus::Acked => self.mark(&outcome.relay, |r| r.record_activity()).await,
                RelayOutcomeStatus::TimedOut | RelayOutcomeStatus::Failed(_) => {
                    self.mark(&outcome.relay, |r| r.mark_failed(outcome.status.reason()))
                        .await;
                }
                // A rejection is a relay policy verdict, not a health
                // problem.
                RelayOutcomeStatus::Rejected(_) => {}
            }
        }

        debug!(
            event_id = %event.id,
            relays = results.len(),
            acks = results.iter().filter(|r| r.status.is_ack()).count(),
            "publish fan-out complete"
        );
        aggregate_publish(event.id.clone(), results)
    }

    /// One-shot query: fan the filters out to every connected relay (or to
    /// `relay_urls` when given), collect until every targeted relay signals
    /// EOSE or the deadline passes, merge and deduplicate.
    pub async fn query(
        &self,
        filters: Vec<Filter>,
        relay_urls: Option<&[String]>,
    ) -> Result<Vec<Event>> {
        self.check_running()?;
        let connections = self.connected_relays(relay_urls).await;
        if connections.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let sub_id = generate_subscription_id();
        let deadline = self.config.query_timeout;

        let collectors = connections.iter().map(|conn| {
            let conn = Arc::clone(conn);
            let sub_id = sub_id.clone();
            let filters = filters.clone();
            async move {
                let mut messages = conn.messages();
                if let Err(e) = conn.subscribe(&sub_id, &filters).await {
                    debug!(url = conn.url(), error = %e, "query subscribe failed");
                    return Vec::new();
                }
                let mut collected = Vec::new();
                let _ = timeout(
                    deadline,
                    collect_until_eose(&mut messages, &sub_id, &mut collected),
                )
                .await;
                let _ = conn.unsubscribe(&sub_id).await;
                collected
            }
        });
        let per_relay: Vec<Vec<Event>> = join_all(collectors).await;

        for (conn, batch) in connections.iter().zip(&per_relay) {
            if !batch.is_empty() {
                let url = conn.url().to_string();
                let count = batch.len() as u64;
                self.mark(&url, |r| {
                    r.events_received = r.events_received.saturating_add(count);
                    r.record_activity();
                })
                .await;
            }
        }

        Ok(merge_query_results(per_relay))
    }

    /// Open a long-lived subscription across all connected relays, or across
    /// `relay_urls` when given. Events arrive on the returned channel at
    /// most once each, in network order; no cross-relay chronological
    /// ordering is attempted.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        relay_urls: Option<&[String]>,
    ) -> Result<PoolSubscription> {
        self.check_running()?;
        let connections = self.connected_relays(relay_urls).await;
        if connections.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let sub_id = generate_subscription_id();
        let mut tracker = SubscriptionTracker::new(sub_id.clone(), filters.clone());
        for conn in &connections {
            tracker.add_relay(conn.url());
        }
        self.trackers
            .write()
            .await
            .insert(sub_id.clone(), tracker);

        let (tx, rx) = mpsc::channel(self.config.subscription_buffer);
        let dedup = Arc::new(Mutex::new(DedupCache::new(self.config.dedup_capacity)));

        let mut tasks = Vec::with_capacity(connections.len());
        for conn in &connections {
            let messages = conn.messages();
            if let Err(e) = conn.subscribe(&sub_id, &filters).await {
                debug!(url = conn.url(), error = %e, "subscribe failed on relay");
            }
            tasks.push(self.spawn_listener(
                conn.url().to_string(),
                messages,
                sub_id.clone(),
                tx.clone(),
                Arc::clone(&dedup),
            ));
        }
        drop(tx);

        debug!(subscription = %sub_id, relays = connections.len(), "subscription opened");
        let handle =
            SubscriptionHandle::new(sub_id.clone(), tasks, connections, Arc::clone(&self.trackers));
        Ok(PoolSubscription {
            id: sub_id,
            events: rx,
            handle,
        })
    }

    fn spawn_listener(
        &self,
        url: String,
        mut messages: broadcast::Receiver<RelayMessage>,
        sub_id: String,
        tx: mpsc::Sender<Event>,
        dedup: Arc<Mutex<DedupCache>>,
    ) -> JoinHandle<()> {
        let trackers = Arc::clone(&self.trackers);
        let records = Arc::clone(&self.records);
        let shut_down = Arc::clone(&self.shut_down);
        let shutdown_signal = Arc::clone(&self.shutdown_signal);

        tokio::spawn(async move {
            loop {
                let stop = shutdown_signal.notified();
                if shut_down.load(Ordering::SeqCst) {
                    break;
                }
                let message = tokio::select! {
                    _ = stop => break,
                    message = messages.recv() => message,
                };
                match message {
                    Ok(RelayMessage::Event {
                        subscription_id,
                        event,
                    }) if subscription_id == sub_id => {
                        if !validate_event_shape(&event) || !verify_event(&event) {
                            debug!(url = %url, event_id = %event.id, "dropping unverifiable event");
                            continue;
                        }
                        let first_sighting = dedup.lock().await.insert(&event.id);
                        if !first_sighting {
                            continue;
                        }
                        if let Some(record) = records.write().await.get_mut(&url) {
                            record.record_event();
                        }
                        if tx.send(event).await.is_err() {
                            // Receiver gone; the subscription is dead.
                            break;
                        }
                    }
                    Ok(RelayMessage::Eose { subscription_id })
                        if subscription_id == sub_id =>
                    {
                        if let Some(tracker) = trackers.write().await.get_mut(&sub_id)
                            && tracker.mark_eose(&url)
                        {
                            debug!(subscription = %sub_id, "all relays reached EOSE");
                        }
                    }
                    Ok(RelayMessage::Closed {
                        subscription_id,
                        message,
                    }) if subscription_id == sub_id => {
                        warn!(url = %url, subscription = %sub_id, reason = %message, "relay closed subscription");
                        if let Some(tracker) = trackers.write().await.get_mut(&sub_id) {
                            tracker.remove_relay(&url);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(url = %url, skipped, "subscription listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_supervisor(&self, url: String, conn: Arc<RelayConnection>) -> JoinHandle<()> {
        let records = Arc::clone(&self.records);
        let trackers = Arc::clone(&self.trackers);
        let shut_down = Arc::clone(&self.shut_down);
        let relay_config = self.config.relay.clone();

        tokio::spawn(async move {
            // Unlimited attempts; a relay is only dropped by explicit
            // removal.
            let mut backoff = ExponentialBackoff::new(
                relay_config.reconnect_delay,
                relay_config.max_reconnect_delay,
                0,
            );
            loop {
                conn.wait_disconnected().await;
                if shut_down.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(record) = records.write().await.get_mut(&url) {
                    if record.status == crate::health::RelayStatus::Connected {
                        record.mark_disconnected();
                    }
                }

                let Some(delay) = backoff.next_delay() else { break };
                debug!(url = %url, ?delay, attempt = backoff.attempt(), "reconnect backoff");
                tokio::time::sleep(delay).await;
                if shut_down.load(Ordering::SeqCst) {
                    break;
                }

                if let Some(record) = records.write().await.get_mut(&url) {
                    record.mark_connecting();
                }
                match conn.connect().await {
                    Ok(latency) => {
                        if let Some(record) = records.write().await.get_mut(&url) {
                            record.mark_connected(latency);
                        }
                        backoff.reset();
                        resubscribe_after_reconnect(&conn, &url, &trackers).await;
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, "reconnect attempt failed");
                        if let Some(record) = records.write().await.get_mut(&url) {
                            record.mark_failed(e.to_string());
                        }
                    }
                }
            }
        })
    }

    /// Tear the pool down: end all subscriptions, close every connection.
    /// Idempotent, and bounded by the close timeout even when relays stall.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down relay pool");
        self.shutdown_signal.notify_waiters();
        self.trackers.write().await.clear();

        let entries: Vec<RelayEntry> = {
            let mut relays = self.relays.write().await;
            relays.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.supervisor.abort();
        }
        let closes = entries.iter().map(|entry| {
            let conn = Arc::clone(&entry.connection);
            let close_timeout = self.config.close_timeout;
            async move {
                let _ = timeout(close_timeout, conn.close()).await;
            }
        });
        join_all(closes).await;

        for record in self.records.write().await.values_mut() {
            record.mark_disconnected();
        }
    }
}

async fn collect_until_eose(
    messages: &mut broadcast::Receiver<RelayMessage>,
    sub_id: &str,
    collected: &mut Vec<Event>,
) {
    loop {
        match messages.recv().await {
            Ok(RelayMessage::Event {
                subscription_id,
                event,
            }) if subscription_id == sub_id => {
                if validate_event_shape(&event) && verify_event(&event) {
                    collected.push(event);
                } else {
                    debug!(event_id = %event.id, "dropping unverifiable event from query");
                }
            }
            Ok(RelayMessage::Eose { subscription_id }) if subscription_id == sub_id => return,
            Ok(RelayMessage::Closed {
                subscription_id, ..
            }) if subscription_id == sub_id => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Re-issue every active subscription this relay carries, with `since`
/// advanced to now so stored history is not replayed after the gap.
async fn resubscribe_after_reconnect(
    conn: &Arc<RelayConnection>,
    url: &str,
    trackers: &TrackerMap,
) {
    let now = unix_now();
    let to_reissue: Vec<(String, Vec<Filter>)> = {
        let mut guard = trackers.write().await;
        guard
            .values_mut()
            .filter(|t| t.relays.contains(url))
            .map(|t| {
                // The relay will send a fresh EOSE for the reissued REQ.
                t.eose_relays.remove(url);
                let filters = t
                    .filters
                    .iter()
                    .cloned()
                    .map(|f| f.with_since(now))
                    .collect();
                (t.id.clone(), filters)
            })
            .collect()
    };

    for (sub_id, filters) in to_reissue {
        match conn.subscribe(&sub_id, &filters).await {
            Ok(()) => debug!(url, subscription = %sub_id, "re-issued subscription"),
            Err(e) => warn!(url, subscription = %sub_id, error = %e, "resubscribe failed"),
        }
    }
}

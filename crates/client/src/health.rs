//! Per-relay operational state and scoring.
//!
//! The pool keeps one [`RelayRecord`] per managed relay and updates it on
//! every connection attempt, publish acknowledgement, and received event.
//! Scores rank relays for "best relay" selection; a relay that keeps
//! failing sinks to the bottom of the ranking but is never removed. Removal
//! is always an explicit caller action.

use std::time::{Duration, Instant};

/// Connection status of one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Last attempt failed; the supervisor is backing off.
    Error,
}

/// Operational state for one relay in the pool.
#[derive(Debug, Clone)]
pub struct RelayRecord {
    pub url: String,
    pub status: RelayStatus,
    /// Time to establish the most recent connection.
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
    /// Most recent successful activity (connect, ack, or received event).
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub events_received: u64,
}

impl RelayRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: RelayStatus::Disconnected,
            last_latency: None,
            last_error: None,
            last_success: None,
            consecutive_failures: 0,
            events_received: 0,
        }
    }

    pub fn mark_connecting(&mut self) {
        self.status = RelayStatus::Connecting;
    }

    pub fn mark_connected(&mut self, latency: Duration) {
        self.status = RelayStatus::Connected;
        self.last_latency = Some(latency);
        self.last_error = None;
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
    }

    pub fn mark_disconnected(&mut self) {
        self.status = RelayStatus::Disconnected;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RelayStatus::Error;
        self.last_error = Some(error.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Note successful activity (an ack or a delivered event).
    pub fn record_activity(&mut self) {
        self.last_success = Some(Instant::now());
        self.consecutive_failures = 0;
    }

    pub fn record_event(&mut self) {
        self.events_received = self.events_received.saturating_add(1);
        self.record_activity();
    }

    pub fn is_connected(&self) -> bool {
        self.status == RelayStatus::Connected
    }
}

const LATENCY_CEILING: Duration = Duration::from_secs(2);
const RECENCY_WINDOW: Duration = Duration::from_secs(300);

/// Score a relay in `[0, 1]`: connectedness dominates, then connection
/// latency, then recency of successful activity, minus a penalty per
/// consecutive failure.
pub fn score_relay(record: &RelayRecord, now: Instant) -> f64 {
    let mut score: f64 = match record.status {
        RelayStatus::Connected => 0.5,
        RelayStatus::Connecting => 0.1,
        RelayStatus::Disconnected | RelayStatus::Error => 0.0,
    };

    if let Some(latency) = record.last_latency {
        let capped = latency.min(LATENCY_CEILING);
        score += 0.3 * (1.0 - capped.as_secs_f64() / LATENCY_CEILING.as_secs_f64());
    }

    if let Some(last) = record.last_success {
        let age = now.saturating_duration_since(last);
        if age < RECENCY_WINDOW {
            score += 0.2 * (1.0 - age.as_secs_f64() / RECENCY_WINDOW.as_secs_f64());
        }
    }

    score -= 0.05 * f64::from(record.consecutive_failures.min(10));
    score.clamp(0.0, 1.0)
}

/// Rank relay URLs best-first. Ties break alphabetically so the ordering is
/// stable across calls.
pub fn rank_relays(records: &[RelayRecord]) -> Vec<(String, f64)> {
    let now = Instant::now();
    let mut ranked: Vec<(String, f64)> = records
        .iter()
        .map(|r| (r.url.clone(), score_relay(r, now)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

// SPDX-License-Identifier: MIT
//! Per-key circuit breaker gating dispatch to the execution agent.
//!
//! When an agent key starts failing repeatedly, its circuit opens and the
//! dispatcher fast-fails with `circuit_breaker_open` instead of burning more
//! runs. State lives only in process memory; every key defaults to `Closed`
//! after a restart.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure_threshold consecutive failures)──► Open
//!   ▲                                                    │
//!   └──(probe succeeds)──── HalfOpen ◄──(cooldown elapsed, checked lazily)──┘
//!                              │
//!                              └──(probe fails)──► Open
//! ```
//!
//! - **Closed**: dispatch allowed, failures counted; a success resets the count.
//! - **Open**: dispatch blocked. After `open_duration` the *next read* promotes
//!   the key to HalfOpen — there is no background timer.
//! - **HalfOpen**: one probe dispatch allowed. Success closes the circuit and
//!   resets failures to 0; failure reopens it (failures keep incrementing).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::events::EventLog;
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Observable state of one breaker key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl BreakerSnapshot {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: BreakerState::Closed,
            failures: 0,
            last_failure_at: None,
            opened_at: None,
        }
    }
}

/// The Open → HalfOpen promotion, as a pure function of (snapshot, now).
///
/// Returns the state the snapshot should be in at `now`. Polling `state()`
/// any number of times before the cooldown elapses never promotes.
pub fn promote(
    snapshot: &BreakerSnapshot,
    now: DateTime<Utc>,
    open_duration: chrono::Duration,
) -> BreakerState {
    match snapshot.state {
        BreakerState::Open => match snapshot.opened_at {
            Some(opened_at) if now - opened_at >= open_duration => BreakerState::HalfOpen,
            // Open with no opened_at cannot happen through this module's
            // transitions; stay Open until a reset.
            _ => BreakerState::Open,
        },
        other => other,
    }
}

/// Table of per-key breakers. Keys are created lazily on first access.
pub struct CircuitBreakers {
    inner: RwLock<HashMap<String, BreakerSnapshot>>,
    config: BreakerConfig,
    events: Arc<EventLog>,
    notifier: Arc<dyn Notifier>,
}

impl CircuitBreakers {
    pub fn new(
        config: BreakerConfig,
        events: Arc<EventLog>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            config,
            events,
            notifier,
        })
    }

    /// Current state for `key`, lazily initializing it and applying the
    /// time-based Open → HalfOpen promotion.
    pub async fn state(&self, key: &str) -> BreakerSnapshot {
        self.state_at(key, Utc::now()).await
    }

    /// Like [`state`](Self::state) with an explicit clock, for tests.
    pub async fn state_at(&self, key: &str, now: DateTime<Utc>) -> BreakerSnapshot {
        let mut inner = self.inner.write().await;
        let snapshot = inner
            .entry(key.to_string())
            .or_insert_with(|| BreakerSnapshot::new(key));
        let promoted = promote(snapshot, now, self.config.open_duration());
        if promoted != snapshot.state {
            info!(key, from = %snapshot.state, to = %promoted, "circuit breaker promoted");
            snapshot.state = promoted;
        }
        snapshot.clone()
    }

    /// `true` unless the key's circuit is Open. HalfOpen allows the probe.
    pub async fn is_allowed(&self, key: &str) -> bool {
        self.state(key).await.state != BreakerState::Open
    }

    /// Record a successful run. Any prior state becomes Closed and the
    /// failure count resets; `circuit_closed` is emitted only when the
    /// success closed a HalfOpen probe.
    pub async fn record_success(&self, key: &str) {
        let previous = {
            let mut inner = self.inner.write().await;
            let snapshot = inner
                .entry(key.to_string())
                .or_insert_with(|| BreakerSnapshot::new(key));
            let previous = snapshot.state;
            snapshot.state = BreakerState::Closed;
            snapshot.failures = 0;
            snapshot.opened_at = None;
            previous
        };

        if previous == BreakerState::HalfOpen {
            info!(key, "circuit breaker closed (probe succeeded)");
            self.events
                .emit(
                    "circuit_closed",
                    "circuit_breaker",
                    serde_json::json!({ "key": key, "previous_state": previous.to_string() }),
                )
                .await;
            self.notifier
                .notify("circuit_closed", &format!("circuit for '{key}' recovered"))
                .await;
        }
    }

    /// Record a failed run. Opens the circuit at the failure threshold, or
    /// immediately when a HalfOpen probe fails.
    pub async fn record_failure(&self, key: &str) {
        let now = Utc::now();
        let opened_reason = {
            let mut inner = self.inner.write().await;
            let snapshot = inner
                .entry(key.to_string())
                .or_insert_with(|| BreakerSnapshot::new(key));
            snapshot.failures += 1;
            snapshot.last_failure_at = Some(now);
            match snapshot.state {
                BreakerState::Closed if snapshot.failures >= self.config.failure_threshold => {
                    snapshot.state = BreakerState::Open;
                    snapshot.opened_at = Some(now);
                    Some(("failure_threshold_reached", snapshot.failures))
                }
                BreakerState::HalfOpen => {
                    snapshot.state = BreakerState::Open;
                    snapshot.opened_at = Some(now);
                    Some(("half_open_probe_failed", snapshot.failures))
                }
                _ => None,
            }
        };

        if let Some((reason, failures)) = opened_reason {
            warn!(key, failures, reason, "circuit breaker opened");
            self.events
                .emit(
                    "circuit_open",
                    "circuit_breaker",
                    serde_json::json!({ "key": key, "reason": reason, "failures": failures }),
                )
                .await;
            self.notifier
                .notify(
                    "circuit_open",
                    &format!("circuit for '{key}' opened ({reason}, {failures} failures)"),
                )
                .await;
        }
    }

    /// Operator override: force the key back to Closed with 0 failures.
    pub async fn reset(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.insert(key.to_string(), BreakerSnapshot::new(key));
        info!(key, "circuit breaker force-reset");
    }

    /// Snapshot of every tracked key, promotions applied, for observability.
    pub async fn all_states(&self) -> Vec<BreakerSnapshot> {
        let now = Utc::now();
        let open_duration = self.config.open_duration();
        let mut inner = self.inner.write().await;
        let mut states: Vec<BreakerSnapshot> = inner
            .values_mut()
            .map(|snapshot| {
                let promoted = promote(snapshot, now, open_duration);
                snapshot.state = promoted;
                snapshot.clone()
            })
            .collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;

    fn table() -> Arc<CircuitBreakers> {
        CircuitBreakers::new(
            BreakerConfig::default(),
            EventLog::new(),
            Arc::new(NullNotifier),
        )
    }

    fn table_with_events() -> (Arc<CircuitBreakers>, Arc<EventLog>) {
        let events = EventLog::new();
        let table = CircuitBreakers::new(
            BreakerConfig::default(),
            events.clone(),
            Arc::new(NullNotifier),
        );
        (table, events)
    }

    #[tokio::test]
    async fn starts_closed_with_zero_failures() {
        let cb = table();
        let s = cb.state("fresh-key").await;
        assert_eq!(s.state, BreakerState::Closed);
        assert_eq!(s.failures, 0);
        assert!(s.last_failure_at.is_none());
        assert!(s.opened_at.is_none());
        assert!(cb.is_allowed("fresh-key").await);
    }

    #[tokio::test]
    async fn opens_after_three_consecutive_failures() {
        let (cb, events) = table_with_events();

        cb.record_failure("agent").await;
        assert_eq!(cb.state("agent").await.state, BreakerState::Closed);
        cb.record_failure("agent").await;
        assert_eq!(cb.state("agent").await.state, BreakerState::Closed);
        cb.record_failure("agent").await;

        let s = cb.state("agent").await;
        assert_eq!(s.state, BreakerState::Open);
        assert_eq!(s.failures, 3);
        assert!(!cb.is_allowed("agent").await);

        let opened = events.recent(10).await;
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].event_type, "circuit_open");
        assert_eq!(opened[0].payload["reason"], "failure_threshold_reached");
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let cb = table();
        for _ in 0..3 {
            cb.record_failure("a").await;
        }
        assert!(!cb.is_allowed("a").await);
        assert!(cb.is_allowed("b").await);
    }

    #[tokio::test]
    async fn promotion_is_lazy_and_exact() {
        let open_duration = chrono::Duration::milliseconds(30 * 60 * 1000);
        let opened_at = Utc::now();
        let snapshot = BreakerSnapshot {
            key: "k".into(),
            state: BreakerState::Open,
            failures: 3,
            last_failure_at: Some(opened_at),
            opened_at: Some(opened_at),
        };

        // Polling any number of times before the cooldown never promotes.
        for secs in [0, 1, 60, 29 * 60] {
            let now = opened_at + chrono::Duration::seconds(secs);
            assert_eq!(promote(&snapshot, now, open_duration), BreakerState::Open);
        }

        // Exactly at the boundary, and after it, the read promotes.
        let boundary = opened_at + open_duration;
        assert_eq!(
            promote(&snapshot, boundary, open_duration),
            BreakerState::HalfOpen
        );
        let later = boundary + chrono::Duration::hours(1);
        assert_eq!(
            promote(&snapshot, later, open_duration),
            BreakerState::HalfOpen
        );
    }

    #[tokio::test]
    async fn state_at_applies_promotion_to_the_table() {
        let cb = table();
        for _ in 0..3 {
            cb.record_failure("agent").await;
        }
        let opened_at = cb.state("agent").await.opened_at.unwrap();

        let before = opened_at + chrono::Duration::minutes(29);
        assert_eq!(cb.state_at("agent", before).await.state, BreakerState::Open);

        let after = opened_at + chrono::Duration::minutes(30);
        assert_eq!(
            cb.state_at("agent", after).await.state,
            BreakerState::HalfOpen
        );
        assert!(cb.is_allowed("agent").await);
    }

    #[tokio::test]
    async fn half_open_success_closes_and_emits() {
        let (cb, events) = table_with_events();
        for _ in 0..3 {
            cb.record_failure("agent").await;
        }
        let opened_at = cb.state("agent").await.opened_at.unwrap();
        cb.state_at("agent", opened_at + chrono::Duration::minutes(30))
            .await;

        cb.record_success("agent").await;
        let s = cb.state("agent").await;
        assert_eq!(s.state, BreakerState::Closed);
        assert_eq!(s.failures, 0);

        let closed = events
            .query(&crate::events::EventFilter {
                event_type: Some("circuit_closed".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].payload["previous_state"], "HALF_OPEN");
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_and_keeps_counting() {
        let (cb, events) = table_with_events();
        for _ in 0..3 {
            cb.record_failure("agent").await;
        }
        let opened_at = cb.state("agent").await.opened_at.unwrap();
        cb.state_at("agent", opened_at + chrono::Duration::minutes(31))
            .await;

        cb.record_failure("agent").await;
        let s = cb.state("agent").await;
        assert_eq!(s.state, BreakerState::Open);
        assert_eq!(s.failures, 4);

        let opened = events
            .query(&crate::events::EventFilter {
                event_type: Some("circuit_open".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[0].payload["reason"], "half_open_probe_failed");
    }

    #[tokio::test]
    async fn success_in_closed_resets_failures_without_event() {
        let (cb, events) = table_with_events();
        cb.record_failure("agent").await;
        cb.record_failure("agent").await;
        assert_eq!(cb.state("agent").await.failures, 2);

        cb.record_success("agent").await;
        let s = cb.state("agent").await;
        assert_eq!(s.state, BreakerState::Closed);
        assert_eq!(s.failures, 0);
        assert!(events.is_empty().await);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let cb = table();
        for _ in 0..3 {
            cb.record_failure("agent").await;
        }
        assert!(!cb.is_allowed("agent").await);

        cb.reset("agent").await;
        let s = cb.state("agent").await;
        assert_eq!(s.state, BreakerState::Closed);
        assert_eq!(s.failures, 0);
        assert!(cb.is_allowed("agent").await);
    }

    #[tokio::test]
    async fn all_states_lists_tracked_keys() {
        let cb = table();
        cb.record_failure("a").await;
        cb.record_failure("b").await;
        let all = cb.all_states().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "a");
        assert_eq!(all[0].failures, 1);
        assert_eq!(all[1].key, "b");
        assert_eq!(all[1].failures, 1);
    }
}

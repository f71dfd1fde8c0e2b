// SPDX-License-Identifier: MIT
//! Append-only event log — the audit sink every orchestration decision lands in.
//!
//! Emission never fails from the caller's perspective: observability must not
//! block the control path. The log is a capacity-bounded ring; when full, the
//! oldest events are evicted. Queries return newest-first with a default limit
//! of 50.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::model::Event;

pub const DEFAULT_QUERY_LIMIT: usize = 50;
const DEFAULT_CAPACITY: usize = 10_000;

/// Filter for [`EventLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub struct EventLog {
    inner: RwLock<VecDeque<Event>>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        })
    }

    /// Append an event. Infallible: the only failure mode is eviction of the
    /// oldest entry when the ring is full.
    pub async fn emit(&self, event_type: &str, source: &str, payload: Value) -> Event {
        let event = Event {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            payload,
            created_at: Utc::now(),
        };
        debug!(event_type, source, "event emitted");
        let mut inner = self.inner.write().await;
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(event.clone());
        event
    }

    /// Query events newest-first. `filter.limit` defaults to 50.
    pub async fn query(&self, filter: &EventFilter) -> Vec<Event> {
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let inner = self.inner.read().await;
        inner
            .iter()
            .rev()
            .filter(|e| {
                filter
                    .event_type
                    .as_ref()
                    .map_or(true, |t| &e.event_type == t)
                    && filter.source.as_ref().map_or(true, |s| &e.source == s)
                    && filter.since.map_or(true, |since| e.created_at >= since)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// The `n` most recent events, newest-first.
    pub async fn recent(&self, n: usize) -> Vec<Event> {
        self.query(&EventFilter {
            limit: Some(n),
            ..EventFilter::default()
        })
        .await
    }

    /// Totals per event type over everything still in the ring. Feeds the
    /// daily summary.
    pub async fn counts_by_type(&self) -> HashMap<String, u64> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for event in inner.iter() {
            *counts.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

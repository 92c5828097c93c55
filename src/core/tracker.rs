//! In-memory tracking of calls.
//!
//! Holds a summary of every accepted call for status queries, plus counters.
//! Every `Call` also carries a [`CallLease`]; dropping the lease counts the
//! call as destroyed, so a call destroyed twice or never shows up here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use super::call::CallState;
use super::dispatcher::Tag;

/// What the status procedure reports about one in-flight call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub tag: u64,
    pub procedure: &'static str,
    pub query_id: Option<String>,
    pub state: CallState,
    pub progress_messages: u64,
    pub accepted_at: DateTime<Utc>,
}

/// How a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEnd {
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    destroyed: AtomicU64,
    accepted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    drained: Notify,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub live_calls: usize,
    pub accepted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub aborted: u64,
    pub active: Vec<CallSummary>,
}

/// Shared via `AppContext`; cheap to clone.
#[derive(Clone)]
pub struct CallTracker {
    active: Arc<RwLock<HashMap<Tag, CallSummary>>>,
    counters: Arc<Counters>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTracker {
    pub fn new() -> Self {
        Self {
            active: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Count a new call into existence.
    pub fn lease(&self) -> CallLease {
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        CallLease {
            counters: self.counters.clone(),
        }
    }

    /// Calls that exist right now, idle acceptors included.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> u64 {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    pub fn ended(&self, end: CallEnd) -> u64 {
        let counter = match end {
            CallEnd::Succeeded => &self.counters.succeeded,
            CallEnd::Failed => &self.counters.failed,
            CallEnd::Aborted => &self.counters.aborted,
        };
        counter.load(Ordering::SeqCst)
    }

    pub async fn begin(&self, tag: Tag, summary: CallSummary) {
        self.counters.accepted.fetch_add(1, Ordering::SeqCst);
        self.active.write().await.insert(tag, summary);
    }

    pub async fn update(&self, tag: Tag, state: CallState, progress_messages: u64) {
        if let Some(summary) = self.active.write().await.get_mut(&tag) {
            summary.state = state;
            summary.progress_messages = progress_messages;
        }
    }

    pub async fn set_query_id(&self, tag: Tag, query_id: String) {
        if let Some(summary) = self.active.write().await.get_mut(&tag) {
            summary.query_id = Some(query_id);
        }
    }

    pub async fn end(&self, tag: Tag, end: CallEnd) {
        if self.active.write().await.remove(&tag).is_none() {
            return;
        }
        let counter = match end {
            CallEnd::Succeeded => &self.counters.succeeded,
            CallEnd::Failed => &self.counters.failed,
            CallEnd::Aborted => &self.counters.aborted,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn snapshot(&self) -> TrackerSnapshot {
        let mut active: Vec<CallSummary> = self.active.read().await.values().cloned().collect();
        active.sort_by_key(|summary| summary.tag);

        TrackerSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            started_at: self.started_at,
            live_calls: self.live(),
            accepted: self.accepted(),
            succeeded: self.ended(CallEnd::Succeeded),
            failed: self.ended(CallEnd::Failed),
            aborted: self.ended(CallEnd::Aborted),
            active,
        }
    }

    /// Wait until no call exists, or the timeout passes. Returns whether the
    /// tracker drained.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.counters.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.live() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Held by every call. Dropping it is the one place a call's destruction
/// is counted.
pub struct CallLease {
    counters: Arc<Counters>,
}

impl Drop for CallLease {
    fn drop(&mut self) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.counters.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counters.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(tag: u64) -> CallSummary {
        CallSummary {
            tag,
            procedure: "query",
            query_id: None,
            state: CallState::Parsed,
            progress_messages: 0,
            accepted_at: Utc::now(),
        }
    }

    #[test]
    fn test_leases_count_live_calls() {
        let tracker = CallTracker::new();
        let a = tracker.lease();
        let b = tracker.lease();
        assert_eq!(tracker.live(), 2);

        drop(a);
        assert_eq!(tracker.live(), 1);
        assert_eq!(tracker.destroyed(), 1);

        drop(b);
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.destroyed(), 2);
    }

    #[tokio::test]
    async fn test_tracks_active_calls() {
        let tracker = CallTracker::new();
        let tag = Tag::from_raw(1);

        tracker.begin(tag, summary(1)).await;
        tracker.set_query_id(tag, "q-1".into()).await;
        tracker.update(tag, CallState::Streaming, 3).await;

        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.active[0].state, CallState::Streaming);
        assert_eq!(snapshot.active[0].progress_messages, 3);
        assert_eq!(snapshot.active[0].query_id.as_deref(), Some("q-1"));

        tracker.end(tag, CallEnd::Succeeded).await;
        assert_eq!(tracker.active_count().await, 0);
        assert_eq!(tracker.ended(CallEnd::Succeeded), 1);

        // Ending twice is not counted twice
        tracker.end(tag, CallEnd::Failed).await;
        assert_eq!(tracker.ended(CallEnd::Failed), 0);
    }

    #[tokio::test]
    async fn test_wait_drained_wakes_on_last_lease() {
        let tracker = CallTracker::new();
        let lease = tracker.lease();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_drained(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_drained_times_out() {
        let tracker = CallTracker::new();
        let _lease = tracker.lease();
        assert!(!tracker.wait_drained(Duration::from_millis(20)).await);
    }
}

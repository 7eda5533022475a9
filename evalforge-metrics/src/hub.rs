// Copyright 2025 EvalForge (https://github.com/evalforge)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Subscription hub
//!
//! Relays aggregator snapshots to live subscribers. Each subscriber owns
//! a bounded queue with a keep-latest overflow policy: when full, the
//! oldest undelivered snapshot is dropped and a drop counter bumps; past
//! the drop threshold the subscriber is evicted. Broadcast holds only the
//! registry read lock and per-subscriber queue locks — a stalled consumer
//! can never stall the writer or its peers.

use crate::snapshot::MetricsSnapshot;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-subscriber outbound queue bound.
    pub queue_capacity: usize,
    /// Evict after this many dropped snapshots.
    pub drop_threshold: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            drop_threshold: 128,
        }
    }
}

struct SubscriberState {
    id: u64,
    /// When set, only snapshots mentioning this project are delivered.
    filter: Option<i64>,
    queue: Mutex<VecDeque<Arc<MetricsSnapshot>>>,
    notify: Notify,
    drops: AtomicU64,
    evicted: AtomicBool,
}

pub struct SubscriptionHub {
    config: HubConfig,
    subscribers: RwLock<HashMap<u64, Arc<SubscriberState>>>,
    next_id: AtomicU64,
    total_drops: AtomicU64,
    total_evictions: AtomicU64,
}

/// One subscriber's receiving end. Dropping the handle unsubscribes.
pub struct SubscriberHandle {
    state: Arc<SubscriberState>,
    hub: Arc<SubscriptionHub>,
}

impl SubscriptionHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            total_drops: AtomicU64::new(0),
            total_evictions: AtomicU64::new(0),
        }
    }

    pub fn subscribe(self: Arc<Self>, filter: Option<i64>) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriberState {
            id,
            filter,
            queue: Mutex::new(VecDeque::with_capacity(self.config.queue_capacity)),
            notify: Notify::new(),
            drops: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
        });
        self.subscribers.write().insert(id, state.clone());
        debug!(subscriber = id, ?filter, "subscriber registered");
        SubscriberHandle { state, hub: self }
    }

    /// Idempotent removal by id.
    pub fn unsubscribe(&self, id: u64) {
        if let Some(state) = self.subscribers.write().remove(&id) {
            state.evicted.store(true, Ordering::Release);
            state.notify.notify_waiters();
            debug!(subscriber = id, "subscriber removed");
        }
    }

    /// Enqueue on every matching subscriber. Never blocks on a slow
    /// consumer; delivery to each subscriber is in emission order.
    pub fn broadcast(&self, snapshot: Arc<MetricsSnapshot>) {
        let mut evicted: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for state in subscribers.values() {
                if let Some(project) = state.filter {
                    if !snapshot.mentions_project(project) {
                        continue;
                    }
                }

                let mut queue = state.queue.lock();
                if queue.len() >= self.config.queue_capacity {
                    // Keep-latest: shed the oldest undelivered snapshot.
                    queue.pop_front();
                    let drops = state.drops.fetch_add(1, Ordering::Relaxed) + 1;
                    self.total_drops.fetch_add(1, Ordering::Relaxed);
                    if drops >= self.config.drop_threshold {
                        state.evicted.store(true, Ordering::Release);
                        queue.clear();
                        evicted.push(state.id);
                        continue;
                    }
                }
                queue.push_back(snapshot.clone());
                drop(queue);
                state.notify.notify_one();
            }
        }

        if !evicted.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in evicted {
                if let Some(state) = subscribers.remove(&id) {
                    self.total_evictions.fetch_add(1, Ordering::Relaxed);
                    state.notify.notify_waiters();
                    warn!(subscriber = id, "slow subscriber evicted");
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn total_drops(&self) -> u64 {
        self.total_drops.load(Ordering::Relaxed)
    }

    pub fn total_evictions(&self) -> u64 {
        self.total_evictions.load(Ordering::Relaxed)
    }
}

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Next snapshot in emission order; `None` once evicted or
    /// unsubscribed (after the queue drains).
    pub async fn recv(&self) -> Option<Arc<MetricsSnapshot>> {
        loop {
            if let Some(snapshot) = self.state.queue.lock().pop_front() {
                return Some(snapshot);
            }
            if self.state.evicted.load(Ordering::Acquire) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.state.drops.load(Ordering::Relaxed)
    }

    pub fn is_evicted(&self) -> bool {
        self.state.evicted.load(Ordering::Acquire)
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.state.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn snapshot(seq: i64, project: Option<i64>) -> Arc<MetricsSnapshot> {
        let mut s = MetricsSnapshot {
            timestamp: Utc::now() + ChronoDuration::milliseconds(seq),
            total_events: seq as u64,
            ..Default::default()
        };
        if let Some(p) = project {
            s.per_project.insert(p, Default::default());
        }
        Arc::new(s)
    }

    #[tokio::test]
    async fn delivery_preserves_emission_order() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig::default()));
        let sub = hub.clone().subscribe(None);

        for i in 0..5 {
            hub.broadcast(snapshot(i, None));
        }
        for i in 0..5 {
            let s = sub.recv().await.unwrap();
            assert_eq!(s.total_events, i as u64);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_fast_one_unaffected() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig {
            queue_capacity: 2,
            drop_threshold: 3,
        }));
        let slow = hub.clone().subscribe(None);
        let fast = hub.clone().subscribe(None);
        assert_eq!(hub.subscriber_count(), 2);

        // The slow subscriber never reads; the fast one drains as we go.
        let mut prev = None;
        for i in 0..10 {
            hub.broadcast(snapshot(i, None));
            let s = fast.recv().await.unwrap();
            if let Some(p) = prev {
                assert!(s.timestamp > p, "fast subscriber sees monotonic snapshots");
            }
            prev = Some(s.timestamp);
        }

        assert!(slow.is_evicted());
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.total_evictions(), 1);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn project_filter_selects_snapshots() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig::default()));
        let sub = hub.clone().subscribe(Some(42));

        hub.broadcast(snapshot(1, Some(7)));
        hub.broadcast(snapshot(2, Some(42)));

        let s = sub.recv().await.unwrap();
        assert_eq!(s.total_events, 2);
        assert!(s.mentions_project(42));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig::default()));
        let sub = hub.clone().subscribe(None);
        let id = sub.id();

        hub.unsubscribe(id);
        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_handle_unsubscribes() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig::default()));
        {
            let _sub = hub.clone().subscribe(None);
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }
}

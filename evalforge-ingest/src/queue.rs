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

//! Bounded ingest queue
//!
//! Multiple request handlers produce, batch-writer workers consume
//! through a shared receiver. Producers only ever `try_send`: a full
//! queue is backpressure surfaced to the caller, never silent queueing
//! and never a blocked handler. The depth counter is advisory (it trails
//! the channel by a few events under contention) and exists for the
//! fail-fast admission check and observability.

use evalforge_core::{Error, Result, TraceEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Producer side. Cloneable; all clones share one depth counter.
#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<TraceEvent>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

/// Consumer side, shared by the writer workers.
#[derive(Clone)]
pub struct QueueReceiver {
    inner: Arc<Mutex<mpsc::Receiver<TraceEvent>>>,
    depth: Arc<AtomicUsize>,
}

pub fn bounded(capacity: usize) -> (EventQueue, QueueReceiver) {
    let (sender, receiver) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        EventQueue {
            sender,
            depth: depth.clone(),
            capacity,
        },
        QueueReceiver {
            inner: Arc::new(Mutex::new(receiver)),
            depth,
        },
    )
}

impl EventQueue {
    /// Non-blocking enqueue; `Backpressure` when full.
    pub fn try_push(&self, event: TraceEvent) -> Result<()> {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::Backpressure {
                queue_depth: self.depth(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Unavailable("ingest queue closed".into()))
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fail-fast admission check.
    pub fn is_saturated(&self) -> bool {
        self.depth() >= self.capacity
    }
}

impl QueueReceiver {
    /// Pull a chunk of up to `max` events, waiting at most `deadline` for
    /// the first one and draining whatever is immediately available after
    /// that. Returns `None` when the queue is closed and drained.
    pub async fn next_chunk(&self, max: usize, deadline: Duration) -> Option<Vec<TraceEvent>> {
        let mut receiver = self.inner.lock().await;
        let mut chunk = Vec::with_capacity(max);

        let first = tokio::time::timeout(deadline, receiver.recv()).await;
        match first {
            Ok(Some(event)) => chunk.push(event),
            Ok(None) => return None,
            Err(_) => return Some(chunk),
        }

        while chunk.len() < max {
            match receiver.try_recv() {
                Ok(event) => chunk.push(event),
                Err(_) => break,
            }
        }
        drop(receiver);

        self.depth.fetch_sub(chunk.len(), Ordering::Relaxed);
        Some(chunk)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evalforge_core::EventStatus;

    fn event(id: &str) -> TraceEvent {
        TraceEvent {
            event_id: id.into(),
            project_id: 1,
            trace_id: "t".into(),
            span_id: id.into(),
            parent_span_id: None,
            operation_type: "chat".into(),
            status: EventStatus::Success,
            start_time: Utc::now(),
            end_time: Utc::now(),
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            provider: String::new(),
            model: String::new(),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn saturation_boundary() {
        let (queue, receiver) = bounded(3);

        queue.try_push(event("a")).unwrap();
        queue.try_push(event("b")).unwrap();
        assert!(!queue.is_saturated());

        queue.try_push(event("c")).unwrap();
        assert!(queue.is_saturated());

        let err = queue.try_push(event("d")).unwrap_err();
        assert!(matches!(err, Error::Backpressure { queue_depth: 3 }));

        // Draining one chunk makes room again.
        let chunk = receiver
            .next_chunk(2, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(chunk.len(), 2);
        assert!(!queue.is_saturated());
        queue.try_push(event("d")).unwrap();
    }

    #[tokio::test]
    async fn chunk_respects_max_and_deadline() {
        let (queue, receiver) = bounded(100);
        for i in 0..5 {
            queue.try_push(event(&format!("e{i}"))).unwrap();
        }

        let chunk = receiver
            .next_chunk(3, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(chunk.len(), 3);

        let rest = receiver
            .next_chunk(10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);

        // Nothing left: deadline expires with an empty chunk.
        let empty = receiver
            .next_chunk(10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn closed_queue_yields_none() {
        let (queue, receiver) = bounded(4);
        queue.try_push(event("a")).unwrap();
        drop(queue);

        let chunk = receiver
            .next_chunk(10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(chunk.len(), 1);

        assert!(receiver
            .next_chunk(10, Duration::from_millis(20))
            .await
            .is_none());
    }
}

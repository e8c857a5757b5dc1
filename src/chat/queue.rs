//! Bounded streaming queue with an overflow tier.
//!
//! Chunks land in the primary queue; when it fills, writes spill into the
//! overflow queue; when both are full the producer waits (cooperative
//! backpressure, no drops). Draining the primary pulls overflow entries
//! forward so delivery order is preserved.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{AmritaError, ErrorKind};
use crate::types::Chunk;

/// One queue entry.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Chunk(Chunk),
    /// End of stream.
    Done,
    /// The turn failed; carries the error kind and rendered message.
    Failed(ErrorKind, String),
}

impl QueueItem {
    fn is_sentinel(&self) -> bool {
        matches!(self, QueueItem::Done | QueueItem::Failed(..))
    }
}

struct QueueState {
    primary: VecDeque<QueueItem>,
    overflow: VecDeque<QueueItem>,
    primary_cap: usize,
    overflow_cap: usize,
    closed: bool,
    drained: bool,
}

/// Single-producer/single-consumer bounded queue pair.
pub struct ResponseQueue {
    state: Mutex<QueueState>,
    space: Notify,
    items: Notify,
}

impl ResponseQueue {
    pub fn new(primary_cap: usize, overflow_cap: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                primary: VecDeque::with_capacity(primary_cap),
                overflow: VecDeque::new(),
                primary_cap: primary_cap.max(1),
                overflow_cap,
                closed: false,
                drained: false,
            }),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    /// Enqueue an item, waiting when both tiers are full.
    ///
    /// Fails `QueueClosed` once a sentinel has been enqueued.
    pub async fn push(&self, item: QueueItem) -> Result<(), AmritaError> {
        let mut slot = Some(item);
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if state.closed {
                    return Err(AmritaError::QueueClosed);
                }
                let item = slot.take().expect("push slot emptied");
                if state.primary.len() < state.primary_cap {
                    if item.is_sentinel() {
                        state.closed = true;
                    }
                    state.primary.push_back(item);
                    self.items.notify_one();
                    return Ok(());
                }
                if state.overflow.len() < state.overflow_cap {
                    if item.is_sentinel() {
                        state.closed = true;
                    }
                    state.overflow.push_back(item);
                    self.items.notify_one();
                    return Ok(());
                }
                slot = Some(item);
            }
            self.space.notified().await;
        }
    }

    /// Dequeue the next item, waiting while the queue is empty.
    ///
    /// After the sentinel has been consumed, further calls return
    /// [`QueueItem::Done`] immediately.
    pub async fn pop(&self) -> QueueItem {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(item) = state.primary.pop_front() {
                    while state.primary.len() < state.primary_cap {
                        match state.overflow.pop_front() {
                            Some(moved) => state.primary.push_back(moved),
                            None => break,
                        }
                    }
                    if item.is_sentinel() {
                        state.drained = true;
                    }
                    self.space.notify_one();
                    return item;
                }
                if let Some(item) = state.overflow.pop_front() {
                    if item.is_sentinel() {
                        state.drained = true;
                    }
                    self.space.notify_one();
                    return item;
                }
                if state.drained {
                    return QueueItem::Done;
                }
            }
            self.items.notified().await;
        }
    }

    /// Total queued items across both tiers.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().expect("queue lock poisoned");
        state.primary.len() + state.overflow.len()
    }

    /// Whether a sentinel has been enqueued.
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("queue lock poisoned").closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn chunk(s: &str) -> QueueItem {
        QueueItem::Chunk(Chunk::text(s))
    }

    #[tokio::test]
    async fn preserves_order_across_tiers() {
        let queue = ResponseQueue::new(2, 3);
        for i in 0..5 {
            queue.push(chunk(&i.to_string())).await.unwrap();
        }

        for i in 0..5 {
            match queue.pop().await {
                QueueItem::Chunk(c) => assert_eq!(c.content(), i.to_string()),
                other => panic!("unexpected item {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn producer_blocks_when_both_tiers_are_full() {
        let queue = Arc::new(ResponseQueue::new(2, 3));
        for i in 0..5 {
            queue.push(chunk(&i.to_string())).await.unwrap();
        }
        assert_eq!(queue.pending(), 5);

        let blocked = timeout(Duration::from_millis(50), queue.push(chunk("x"))).await;
        assert!(blocked.is_err(), "sixth push must block");

        // Draining one item frees the producer.
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(chunk("x")).await })
        };
        queue.pop().await;
        timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn push_after_sentinel_fails_queue_closed() {
        let queue = ResponseQueue::new(2, 2);
        queue.push(chunk("a")).await.unwrap();
        queue.push(QueueItem::Done).await.unwrap();

        let err = queue.push(chunk("b")).await.unwrap_err();
        assert!(matches!(err, AmritaError::QueueClosed));
    }

    #[tokio::test]
    async fn pop_after_drain_returns_done() {
        let queue = ResponseQueue::new(2, 2);
        queue.push(QueueItem::Done).await.unwrap();
        assert!(matches!(queue.pop().await, QueueItem::Done));
        assert!(matches!(queue.pop().await, QueueItem::Done));
    }

    #[tokio::test]
    async fn consumer_waits_for_items() {
        let queue = Arc::new(ResponseQueue::new(2, 2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(chunk("late")).await.unwrap();

        match timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap() {
            QueueItem::Chunk(c) => assert_eq!(c.content(), "late"),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_sentinel_carries_error() {
        let queue = ResponseQueue::new(2, 2);
        queue
            .push(QueueItem::Failed(
                ErrorKind::Cancelled,
                "cancelled by caller".to_string(),
            ))
            .await
            .unwrap();
        match queue.pop().await {
            QueueItem::Failed(kind, message) => {
                assert_eq!(kind, ErrorKind::Cancelled);
                assert!(message.contains("cancelled"));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }
}

//! The outbound packet queue.
//!
//! A three-class priority FIFO with a single consumer (the writer task).
//! Urgent packets (handshake, control) always precede normal traffic,
//! which precedes bulk; within a class, insertion order is preserved — the
//! wire ordering guarantee depends on it.
//!
//! The queue bounds memory with a high-water mark: a non-urgent push past
//! the mark fails with `PeerTooSlow` and the caller is expected to fail the
//! connection. Urgent pushes are exempt so that the closing `disconnect`
//! still goes out under pressure.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use tokio::sync::Notify;

use crate::error::{ConnectionError, Result};

/// Priority class of an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Handshake and control packets; always drained first, exempt from
    /// the high-water mark, and the only class that survives shutdown.
    Urgent,
    /// Ordinary traffic.
    #[default]
    Normal,
    /// Background transfers; drained last.
    Bulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    /// Shutdown requested: only urgent packets drain, the rest is dropped.
    Draining,
    Closed,
}

struct Inner<T> {
    urgent: VecDeque<T>,
    normal: VecDeque<T>,
    bulk: VecDeque<T>,
    state: QueueState,
}

/// Multi-producer, single-consumer priority FIFO.
pub struct OutboundQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    high_water: usize,
}

impl<T> OutboundQueue<T> {
    /// Queue failing non-urgent pushes beyond `high_water` queued packets.
    #[must_use]
    pub fn new(high_water: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                bulk: VecDeque::new(),
                state: QueueState::Open,
            }),
            notify: Notify::new(),
            high_water,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a packet.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Closed`] when the queue is shutting down (an
    ///   urgent push is still accepted while draining)
    /// - [`ConnectionError::PeerTooSlow`] when a non-urgent push would
    ///   exceed the high-water mark
    pub fn push(&self, item: T, priority: Priority) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            QueueState::Open => {},
            QueueState::Draining if priority == Priority::Urgent => {},
            _ => return Err(ConnectionError::Closed("outbound queue is shut down".into())),
        }

        let queued = inner.urgent.len() + inner.normal.len() + inner.bulk.len();
        if priority != Priority::Urgent && queued >= self.high_water {
            return Err(ConnectionError::PeerTooSlow { queued, high_water: self.high_water });
        }

        match priority {
            Priority::Urgent => inner.urgent.push_back(item),
            Priority::Normal => inner.normal.push_back(item),
            Priority::Bulk => inner.bulk.push_back(item),
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next packet in priority order.
    ///
    /// Returns the packet and whether the queue is now empty (the flush
    /// hint for the frame header). Returns `None` once the queue is closed
    /// — or draining with no urgent packets left.
    pub async fn pop(&self) -> Option<(T, bool)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                let drained = match inner.state {
                    QueueState::Open => false,
                    QueueState::Draining => true,
                    QueueState::Closed => return None,
                };

                if let Some(item) = inner.urgent.pop_front() {
                    let empty = inner.urgent.is_empty()
                        && (drained || (inner.normal.is_empty() && inner.bulk.is_empty()));
                    return Some((item, empty));
                }
                if drained {
                    return None;
                }
                if let Some(item) = inner.normal.pop_front() {
                    let empty = inner.normal.is_empty() && inner.bulk.is_empty();
                    return Some((item, empty));
                }
                if let Some(item) = inner.bulk.pop_front() {
                    return Some((item, inner.bulk.is_empty()));
                }
            }
            notified.await;
        }
    }

    /// Total queued packets across all classes.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.urgent.len() + inner.normal.len() + inner.bulk.len()
    }

    /// Queue holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Begin shutdown: the writer drains urgent packets only, then stops.
    pub fn drain_urgent_only(&self) {
        let mut inner = self.lock();
        if inner.state == QueueState::Open {
            inner.state = QueueState::Draining;
        }
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Hard close: nothing more is delivered.
    pub fn close(&self) {
        self.lock().state = QueueState::Closed;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn priority_order_with_fifo_tiebreak() {
        let queue = OutboundQueue::new(100);
        queue.push("bulk-1", Priority::Bulk).unwrap();
        queue.push("normal-1", Priority::Normal).unwrap();
        queue.push("urgent-1", Priority::Urgent).unwrap();
        queue.push("normal-2", Priority::Normal).unwrap();
        queue.push("urgent-2", Priority::Urgent).unwrap();

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(queue.pop().await.unwrap().0);
        }
        assert_eq!(order, ["urgent-1", "urgent-2", "normal-1", "normal-2", "bulk-1"]);
    }

    #[tokio::test]
    async fn flush_hint_set_only_on_last() {
        let queue = OutboundQueue::new(100);
        queue.push(1, Priority::Normal).unwrap();
        queue.push(2, Priority::Normal).unwrap();

        assert_eq!(queue.pop().await, Some((1, false)));
        assert_eq!(queue.pop().await, Some((2, true)));
    }

    #[tokio::test]
    async fn high_water_fails_non_urgent() {
        let queue = OutboundQueue::new(2);
        queue.push(1, Priority::Normal).unwrap();
        queue.push(2, Priority::Bulk).unwrap();

        let err = queue.push(3, Priority::Normal).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::PeerTooSlow { queued: 2, high_water: 2 }
        ));

        // Urgent control traffic is exempt.
        queue.push(4, Priority::Urgent).unwrap();
    }

    #[tokio::test]
    async fn draining_delivers_urgent_only() {
        let queue = OutboundQueue::new(100);
        queue.push("normal", Priority::Normal).unwrap();
        queue.push("urgent", Priority::Urgent).unwrap();
        queue.drain_urgent_only();

        assert_eq!(queue.pop().await, Some(("urgent", true)));
        assert_eq!(queue.pop().await, None);

        // New normal pushes are refused, urgent still accepted.
        assert!(queue.push("late", Priority::Normal).is_err());
        assert!(queue.push("late-urgent", Priority::Urgent).is_ok());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(10));
        let popper = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(7, Priority::Normal).unwrap();
        assert_eq!(popper.await.unwrap(), Some((7, true)));
    }

    #[tokio::test]
    async fn closed_queue_returns_none() {
        let queue: OutboundQueue<i32> = OutboundQueue::new(10);
        queue.push(1, Priority::Urgent).unwrap();
        queue.close();
        assert_eq!(queue.pop().await, None);
        assert!(queue.push(2, Priority::Urgent).is_err());
    }
}

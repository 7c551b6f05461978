//! Handles creating a bounded queue that logs
//! when its number of queued items approaches its capacity.
//! This is useful to constantly consume events from the gateway,
//! ensuring they are processed and dispatched as soon as possible.
//! When the queue is full, the oldest queued event is evicted to make room
//! for the newest one: stale reward announcements lose their value quickly,
//! so under sustained overload the recent finds are the ones worth keeping.
//! Evictions are loudly logged so an undersized queue is visible
//! before anyone notices missing notifications.

use crate::event::RewardEvent;
use futures::{Stream, StreamExt};
use slog::Logger;
use static_assertions::assert_impl_all;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub struct EventQueue {
    logger: Logger,
    config: EventQueueConfig,
    inner: Mutex<Inner>,
    available: Notify,
    closed_signal: Notify,
}

assert_impl_all!(EventQueue: Send, Sync);

pub struct EventQueueConfig {
    pub identifier: String,
    pub max_size: usize,
    pub warning_threshold: usize,
    pub watch_size_interval: Duration,
}

/// A queued event together with the instant it entered the queue,
/// so downstream consumers can report time-in-queue
#[derive(Debug)]
pub struct QueueSlot {
    pub event: RewardEvent,
    pub enqueued_at: Instant,
}

struct Inner {
    slots: VecDeque<QueueSlot>,
    closed: bool,
}

enum Enqueued {
    Accepted,
    AcceptedWithEviction(QueueSlot),
    Rejected,
}

impl EventQueue {
    pub fn new(config: EventQueueConfig, logger: &Logger) -> Self {
        Self {
            logger: logger.new(slog::o!(
                "queue_identifier" => config.identifier.clone(),
                "warn_threshold" => config.warning_threshold,
                "max_size" => config.max_size,
            )),
            config,
            inner: Mutex::new(Inner {
                slots: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
            closed_signal: Notify::new(),
        }
    }

    /// Pipes events into this bounded queue,
    /// evicting the oldest queued event whenever the queue is already full.
    /// Closes the queue once the source stream ends.
    pub async fn pipe_in(&self, in_stream: impl Stream<Item = RewardEvent>) {
        in_stream
            .for_each(|event| async move {
                match self.enqueue(event) {
                    Enqueued::Accepted => {}
                    Enqueued::AcceptedWithEviction(evicted) => {
                        slog::warn!(
                            self.logger,
                            "bounded queue is full; evicted oldest event to accept newest";
                            "evicted_username" => evicted.event.username,
                            "evicted_reward" => evicted.event.reward,
                            "evicted_age" => ?evicted.enqueued_at.elapsed(),
                        );
                    }
                    Enqueued::Rejected => {
                        slog::warn!(
                            self.logger,
                            "event arrived after queue close; dropping";
                        );
                    }
                }
            })
            .await;
        self.close();
    }

    /// Removes and returns the oldest queued event,
    /// waiting as long as needed for one to arrive.
    /// Returns `None` once the queue has been closed and fully drained.
    pub async fn dequeue(&self) -> Option<QueueSlot> {
        loop {
            {
                let mut inner = self.lock_inner();
                if let Some(slot) = inner.slots.pop_front() {
                    return Some(slot);
                }
                if inner.closed {
                    return None;
                }
            }
            self.available.notified().await;
        }
    }

    /// Marks the queue closed. Queued events remain consumable;
    /// new events are rejected.
    pub fn close(&self) {
        self.lock_inner().closed = true;
        self.available.notify_waiters();
        self.available.notify_one();
        // notify_one stores a permit, so a watcher that has not yet
        // reached its select still observes the close
        self.closed_signal.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock_inner().slots.len()
    }

    /// Asynchronously watches the queue length to ensure
    /// that it doesn't exceed a warning threshold.
    /// This is useful for reporting before the queue starts evicting events.
    /// Returns as soon as the queue is closed.
    pub async fn watch_size(&self) {
        let mut interval = tokio::time::interval(self.config.watch_size_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = self.closed_signal.notified() => break,
            }
            let inner = self.lock_inner();
            if inner.closed {
                break;
            }
            let current_length = inner.slots.len();
            drop(inner);
            if current_length > self.config.warning_threshold {
                slog::warn!(
                    self.logger,
                    "current queue length exceeds warning threshold";
                    "current_queue_length" => current_length,
                );
            }
        }
    }

    fn enqueue(&self, event: RewardEvent) -> Enqueued {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Enqueued::Rejected;
        }

        let evicted = if inner.slots.len() >= self.config.max_size {
            inner.slots.pop_front()
        } else {
            None
        };
        inner.slots.push_back(QueueSlot {
            event,
            enqueued_at: Instant::now(),
        });
        drop(inner);
        self.available.notify_one();

        match evicted {
            Some(slot) => Enqueued::AcceptedWithEviction(slot),
            None => Enqueued::Accepted,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The mutex only guards short critical sections with no panicking code
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EventQueue, EventQueueConfig};
    use crate::event::{Rarity, RewardEvent};
    use std::sync::Arc;
    use std::time::Duration;

    fn event(reward: &str) -> RewardEvent {
        RewardEvent {
            username: String::from("alice"),
            author_name: String::from("Alice(@alice)"),
            reward: String::from(reward),
            rarity: Rarity::Standard { chance: 1_000 },
            rolls: None,
            luck: None,
            discovered: None,
            icon_url: String::new(),
            source_url: String::new(),
            description: String::new(),
            color: 0,
            timestamp: String::from("2024-05-01T12:34:56.789Z"),
            ingress_ms: 0,
        }
    }

    fn queue(max_size: usize) -> EventQueue {
        EventQueue::new(
            EventQueueConfig {
                identifier: String::from("test-queue"),
                max_size,
                warning_threshold: max_size,
                watch_size_interval: Duration::from_secs(60),
            },
            &crate::testutils::logger("queue"),
        )
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let queue = queue(3);
        queue
            .pipe_in(futures::stream::iter(vec![
                event("a"),
                event("b"),
                event("c"),
                event("d"),
            ]))
            .await;

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().await.map(|s| s.event.reward).as_deref(), Some("b"));
        assert_eq!(queue.dequeue().await.map(|s| s.event.reward).as_deref(), Some("c"));
        assert_eq!(queue.dequeue().await.map(|s| s.event.reward).as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn test_dequeue_preserves_fifo_order() {
        let queue = queue(10);
        queue
            .pipe_in(futures::stream::iter(vec![
                event("a"),
                event("b"),
                event("c"),
            ]))
            .await;

        assert_eq!(queue.dequeue().await.map(|s| s.event.reward).as_deref(), Some("a"));
        assert_eq!(queue.dequeue().await.map(|s| s.event.reward).as_deref(), Some("b"));
        assert_eq!(queue.dequeue().await.map(|s| s.event.reward).as_deref(), Some("c"));
        // Queue is closed once the source stream ends
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_producer() {
        let queue = Arc::new(queue(10));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .pipe_in(futures::stream::iter(vec![event("late")]))
            .await;

        let slot = consumer.await.unwrap();
        assert_eq!(slot.map(|s| s.event.reward).as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_watch_size_exits_promptly_on_close() {
        // The watch interval is much longer than the test; the watcher
        // must still return as soon as the queue closes
        let queue = Arc::new(queue(10));
        let watcher = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.watch_size().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        tokio::time::timeout(Duration::from_millis(500), watcher)
            .await
            .expect("watcher did not exit after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = queue(10);
        queue
            .pipe_in(futures::stream::iter(vec![event("a")]))
            .await;
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
        assert!(queue.dequeue().await.is_none());
    }
}

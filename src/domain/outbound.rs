//! Per-connection outbound queue and the subscriber handle the registry
//! stores.
//!
//! Every connection owns one bounded [`OutboundQueue`]. Producers never
//! block on it: when it is full, the oldest queued frame is dropped and a
//! counter is incremented, so one slow consumer cannot stall delivery to
//! anyone else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use super::ConnectionId;

/// A serialized server frame, optionally with a compressed rendition.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    plain: Arc<str>,
    compressed: Option<Arc<str>>,
}

impl OutboundFrame {
    /// Creates a frame with a single plain rendition.
    #[must_use]
    pub fn text(plain: impl Into<Arc<str>>) -> Self {
        Self {
            plain: plain.into(),
            compressed: None,
        }
    }

    /// Creates a frame with both a plain and a compressed rendition.
    #[must_use]
    pub fn with_compressed(plain: impl Into<Arc<str>>, compressed: impl Into<Arc<str>>) -> Self {
        Self {
            plain: plain.into(),
            compressed: Some(compressed.into()),
        }
    }

    /// Returns the rendition appropriate for a connection's capabilities.
    ///
    /// Connections that did not advertise compression always get the plain
    /// rendition.
    #[must_use]
    pub fn for_capability(&self, accepts_compression: bool) -> Arc<str> {
        match (&self.compressed, accepts_compression) {
            (Some(compressed), true) => Arc::clone(compressed),
            _ => Arc::clone(&self.plain),
        }
    }

    /// Returns `true` if a compressed rendition is present.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }
}

/// Result of handing a frame to an outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The frame was queued.
    Enqueued,
    /// The frame was queued after evicting the oldest queued frame.
    DroppedOldest,
    /// The queue is closed; the frame was discarded.
    Closed,
}

/// Bounded, drop-oldest, single-consumer frame queue.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: Mutex<VecDeque<Arc<str>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    /// Creates an empty queue holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends a frame, evicting the oldest one when full.
    pub fn push(&self, frame: Arc<str>) -> DeliveryOutcome {
        if self.is_closed() {
            return DeliveryOutcome::Closed;
        }
        let outcome = {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = if frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::DroppedOldest
            } else {
                DeliveryOutcome::Enqueued
            };
            frames.push_back(frame);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next frame. Returns `None` once the queue is closed.
    ///
    /// Cancel safe: a frame is only removed in the same poll that returns it.
    pub async fn next_frame(&self) -> Option<Arc<str>> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(frame) = self
                .frames
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return Some(frame);
            }
            self.notify.notified().await;
        }
    }

    /// Closes the queue, discarding pending frames and waking the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.notify.notify_one();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the number of frames evicted by overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of frames waiting to be written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no frames are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry-side handle to one connection's delivery path.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    connection_id: ConnectionId,
    accepts_compression: bool,
    queue: Arc<OutboundQueue>,
}

impl SubscriberHandle {
    /// Creates a handle for a connection's queue.
    #[must_use]
    pub const fn new(
        connection_id: ConnectionId,
        accepts_compression: bool,
        queue: Arc<OutboundQueue>,
    ) -> Self {
        Self {
            connection_id,
            accepts_compression,
            queue,
        }
    }

    /// Returns the connection this handle delivers to.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns `true` if the connection accepts compressed payloads.
    #[must_use]
    pub const fn accepts_compression(&self) -> bool {
        self.accepts_compression
    }

    /// Enqueues the rendition of `frame` suited to this connection.
    pub fn deliver(&self, frame: &OutboundFrame) -> DeliveryOutcome {
        let outcome = self
            .queue
            .push(frame.for_capability(self.accepts_compression));
        if outcome == DeliveryOutcome::DroppedOldest {
            tracing::warn!(
                connection_id = %self.connection_id,
                dropped_total = self.queue.dropped(),
                "outbound queue full, dropped oldest frame"
            );
        }
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let queue = OutboundQueue::new(2);
        assert_eq!(queue.push("a".into()), DeliveryOutcome::Enqueued);
        assert_eq!(queue.push("b".into()), DeliveryOutcome::Enqueued);
        assert_eq!(queue.push("c".into()), DeliveryOutcome::DroppedOldest);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn consumer_sees_survivors_in_order() {
        let queue = OutboundQueue::new(2);
        queue.push("a".into());
        queue.push("b".into());
        queue.push("c".into());
        assert_eq!(queue.next_frame().await.as_deref(), Some("b"));
        assert_eq!(queue.next_frame().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let queue = Arc::new(OutboundQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_frame().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        let Ok(result) = waiter.await else {
            panic!("waiter task failed");
        };
        assert!(result.is_none());
        assert_eq!(queue.push("late".into()), DeliveryOutcome::Closed);
    }

    #[test]
    fn capability_selects_rendition() {
        let frame = OutboundFrame::with_compressed("plain", "packed");
        assert_eq!(&*frame.for_capability(true), "packed");
        assert_eq!(&*frame.for_capability(false), "plain");
        assert_eq!(&*OutboundFrame::text("only").for_capability(true), "only");
    }
}

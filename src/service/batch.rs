//! Per-widget event accumulator.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::DomainEvent;

/// Ordered buffer of events waiting to be flushed to one widget.
///
/// The window is measured from the first buffered event, not the last, so a
/// steady trickle cannot postpone delivery indefinitely.
#[derive(Debug)]
pub struct BatchBuffer {
    events: Vec<Arc<DomainEvent>>,
    first_buffered_at: Option<Instant>,
    max_size: usize,
}

impl BatchBuffer {
    /// Creates an empty buffer that reports full at `max_size` events.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            events: Vec::new(),
            first_buffered_at: None,
            max_size: max_size.max(1),
        }
    }

    /// Appends an event. Returns `true` if the buffer is now full.
    pub fn push(&mut self, event: Arc<DomainEvent>, now: Instant) -> bool {
        if self.events.is_empty() {
            self.first_buffered_at = Some(now);
        }
        self.events.push(event);
        self.is_full()
    }

    /// Returns `true` once `max_size` events are buffered.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.max_size
    }

    /// Returns `true` if the buffer is non-empty and its window has elapsed.
    #[must_use]
    pub fn is_due(&self, now: Instant, window: Duration) -> bool {
        self.first_buffered_at
            .is_some_and(|first| now.saturating_duration_since(first) >= window)
    }

    /// Drains the buffer, oldest event first.
    pub fn take(&mut self) -> Vec<Arc<DomainEvent>> {
        self.first_buffered_at = None;
        std::mem::take(&mut self.events)
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

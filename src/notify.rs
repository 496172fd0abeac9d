//! LISTEN/NOTIFY records and handler registries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::ErrorFields;

/// An asynchronous notification received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// Channel the notification was sent on
    pub channel: String,
    /// Payload passed to `NOTIFY`
    pub payload: String,
    /// PID of the backend that sent the notification
    pub pid: u32,
}

/// Token returned when registering a handler, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Callback invoked for each notification.
pub type NotifyHandler = Arc<dyn Fn(&Notify) + Send + Sync>;

/// Callback invoked for each server notice.
pub type NoticeHandler = Arc<dyn Fn(&ErrorFields) + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Ordered set of callbacks keyed by [`HandlerId`].
pub(crate) struct Registry<T: ?Sized> {
    handlers: Mutex<Vec<(HandlerId, Arc<dyn Fn(&T) + Send + Sync>)>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn add(&self, handler: Arc<dyn Fn(&T) + Send + Sync>) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push((id, handler));
        }
        id
    }

    /// Returns false if the id was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.handlers.lock() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().map_or(true, |h| h.is_empty())
    }

    /// Call every handler with `item`. The registry lock is not held while
    /// handlers run, so a handler may register or remove handlers.
    pub fn dispatch(&self, item: &T) {
        let snapshot: Vec<_> = match self.handlers.lock() {
            Ok(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => return,
        };
        for handler in snapshot {
            handler(item);
        }
    }
}

/// Bookkeeping for one `notifies()` sequence: when to poll next and when to
/// stop.
#[derive(Debug)]
pub(crate) struct Window {
    deadline: Option<Instant>,
    max_interval: Duration,
    stop_after: Option<usize>,
    received: usize,
    polled: bool,
}

impl Window {
    pub fn new(timeout: Option<Duration>, stop_after: Option<usize>, max_interval: Duration) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            max_interval,
            stop_after,
            received: 0,
            polled: false,
        }
    }

    pub fn record(&mut self) {
        self.received += 1;
    }

    /// Interval for the next poll, or None once the sequence is over.
    ///
    /// Called after the buffered records of the previous poll were handed
    /// out. The first poll always happens, even with a zero timeout.
    pub fn next_poll(&mut self) -> Option<Duration> {
        let now = Instant::now();
        if !self.polled {
            self.polled = true;
            let remaining = self
                .deadline
                .map_or(self.max_interval, |d| d.saturating_duration_since(now));
            return Some(remaining.min(self.max_interval));
        }
        if self.stop_after.is_some_and(|n| self.received >= n) {
            return None;
        }
        match self.deadline {
            None => Some(self.max_interval),
            Some(deadline) => match deadline.checked_duration_since(now) {
                Some(remaining) if !remaining.is_zero() => Some(remaining.min(self.max_interval)),
                _ => None,
            },
        }
    }
}

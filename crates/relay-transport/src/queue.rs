//! Bounded proxy queue
//!
//! The producer side never blocks past a caller-chosen bound: it either drops on a
//! full queue or waits for room with a timeout. The consumer side waits with a retry
//! budget rather than forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_common::QueueError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    /// Empty polls tolerated by `get`
    pub retry_times: usize,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retry_times: 1000,
            poll_interval_ms: 1,
        }
    }
}

impl QueueConfig {
    /// Longest a `get` will wait
    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.saturating_mul(self.retry_times as u64))
    }
}

/// What the producer does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail immediately with `QueueError::Full`
    DropOnFull,
    /// Wait for room, failing with `QueueError::Timeout` after the duration
    BlockWithTimeout(Duration),
}

/// Create a bounded queue
pub fn proxy_queue<T>(config: QueueConfig) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueueSender {
            tx,
            dropped: dropped.clone(),
        },
        QueueReceiver {
            rx,
            retry_times: config.retry_times,
            budget: config.wait_budget(),
            dropped,
        },
    )
}

/// Producer half; cheap to clone
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Non-blocking enqueue; a full or closed queue drops the item and returns `false`
    pub fn submit(&self, item: T) -> bool {
        match self.try_put(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Enqueue following `policy`
    pub async fn put(&self, item: T, policy: OverflowPolicy) -> Result<(), QueueError> {
        match policy {
            OverflowPolicy::DropOnFull => self.try_put(item),
            OverflowPolicy::BlockWithTimeout(timeout) => {
                self.tx.send_timeout(item, timeout).await.map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => QueueError::Timeout(timeout.as_millis() as u64),
                    SendTimeoutError::Closed(_) => QueueError::Closed,
                })
            }
        }
    }

    /// Wait up to `timeout` for room, handing the item back on timeout
    pub(crate) async fn send_within(&self, item: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.tx.send_timeout(item, timeout).await
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Items refused by `submit` so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    retry_times: usize,
    budget: Duration,
    dropped: Arc<AtomicU64>,
}

impl<T> QueueReceiver<T> {
    /// Wait for the next item within the retry budget
    pub async fn get(&mut self) -> Result<T, QueueError> {
        let (budget, retries) = (self.budget, self.retry_times);
        self.get_within(budget, retries).await
    }

    /// Wait at most `timeout` for the next item
    pub async fn get_within(&mut self, timeout: Duration, retries: usize) -> Result<T, QueueError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Empty { retries }),
        }
    }

    /// Take an item if one is ready
    pub fn try_get(&mut self) -> Result<T, QueueError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => QueueError::Empty { retries: 0 },
            TryRecvError::Disconnected => QueueError::Closed,
        })
    }

    /// Stop accepting new items; queued items can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Items refused by producers so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

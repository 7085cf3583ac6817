//! Bounded, lossy broadcast of probe results
//!
//! The collector produces one message per probe per round; the IPC
//! server, the WebSocket hub and any number of in-process consumers
//! subscribe. Delivery is strictly non-blocking: a subscriber whose
//! queue is full simply misses that message (the data is telemetry; the
//! next round replaces it). Consumer-facing façades layer their own
//! policy on top and drop subscribers that stop draining.
//!
//! A [`Subscription`] is an owning handle: dropping it (or the scope it
//! lives in) unregisters the subscriber, so the collector never holds a
//! dangling sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

/// Queue depth per subscriber
const SUBSCRIPTION_BUFFER: usize = 100;

/// Multi-producer broadcast with per-subscriber bounded queues.
pub struct Fanout<T> {
    inner: Arc<FanoutInner<T>>,
}

struct FanoutInner<T> {
    next_id: AtomicU64,
    senders: RwLock<HashMap<u64, mpsc::Sender<T>>>,
}

/// Receiving side of one subscription. Dropping the handle removes the
/// subscriber from the fanout.
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::Receiver<T>,
    inner: Arc<FanoutInner<T>>,
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Fanout {
            inner: Arc::new(FanoutInner {
                next_id: AtomicU64::new(0),
                senders: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new subscriber with a fresh bounded queue.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        Subscription {
            id,
            receiver: rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Send a message to every live subscriber without blocking.
    ///
    /// A full queue skips this message for that subscriber; a closed
    /// queue (receiver dropped mid-broadcast) gets the subscriber
    /// removed. Returns the number of deliveries.
    pub fn broadcast(&self, message: &T) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let senders = self.inner.senders.read().unwrap_or_else(|e| e.into_inner());
            for (id, tx) in senders.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow subscriber: skip, never block the round
                        debug!(subscriber = id, "subscriber queue full, message skipped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut senders = self.inner.senders.write().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                senders.remove(&id);
            }
        }

        delivered
    }

    /// Drop every sender, closing all subscriber queues.
    pub fn close_all(&self) {
        self.inner
            .senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .senders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Fanout {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for Fanout<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscription<T> {
    /// Receive the next message; `None` once the fanout closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Non-blocking receive for drain loops and tests.
    #[allow(dead_code)]
    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.inner
            .senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

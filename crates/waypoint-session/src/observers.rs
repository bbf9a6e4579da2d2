//! Explicit observer lists.
//!
//! Entities that fan events out (a game's membership changes, parent-link
//! loss) keep a [`Subscribers`] list. Each subscriber gets its own
//! unbounded receiver and an id it must hand back to
//! [`Subscribers::unsubscribe`] on teardown. Subscribers whose receiver was
//! dropped are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Subscribers<E> {
    next_id: AtomicU64,
    senders: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<E>)>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone + Send + 'static> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().await.push((id, tx));
        (id, rx)
    }

    /// Returns `false` if `id` was not subscribed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut senders = self.senders.lock().await;
        let before = senders.len();
        senders.retain(|(sid, _)| *sid != id);
        senders.len() != before
    }

    /// Delivers `event` to every live subscriber; returns how many got it.
    pub async fn publish(&self, event: E) -> usize {
        let mut senders = self.senders.lock().await;
        senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        senders.len()
    }

    pub async fn len(&self) -> usize {
        self.senders.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.senders.lock().await.is_empty()
    }
}

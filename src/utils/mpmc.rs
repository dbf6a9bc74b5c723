//! Multiple producers / multiple consumers broadcast channel.
//!
//! Same contract as [`mpsc`] except that [`Receiver`] can be cloned: each
//! clone becomes an independent listener that observes every message sent
//! after it subscribed. Used as the event bus between transport workers and
//! their subscribers (frame pipeline, link registry, bridge).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(0);

type Subscribers<T> = Arc<RwLock<Vec<(u64, mpsc::Sender<T>)>>>;

/// Broadcasting sender.
///
/// [`Sender::send`] delivers a clone of the message to every live receiver.
#[derive(Debug)]
pub struct Sender<T> {
    subscribers: Subscribers<T>,
}

impl<T> Sender<T> {
    /// Creates a sender with no subscribers yet.
    ///
    /// Messages sent before the first [`Sender::subscribe`] are lost, which is
    /// what an event source wants: subscribers attach before the source is
    /// started.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registers a new receiver that observes every subsequent message.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().unwrap().push((id, tx));
        Receiver {
            id,
            inner: rx,
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T> Default for Sender<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Sender<T> {
    /// Broadcasts a value to all subscribed receivers.
    ///
    /// Fails when no receiver is left, mirroring [`mpsc::Sender::send`].
    pub fn send(&self, value: T) -> Result<(), mpsc::SendError<T>> {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().unwrap();
            if subscribers.is_empty() {
                return Err(mpsc::SendError(value));
            }
            for (id, tx) in subscribers.iter() {
                if tx.send(value.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().unwrap();
            subscribers.retain(|(id, _)| !dead.contains(id));
            if subscribers.is_empty() {
                return Err(mpsc::SendError(value));
            }
        }
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

/// Broadcast receiver.
///
/// Cloning registers a new subscriber which receives its own copy of every
/// subsequent message.
#[derive(Debug)]
pub struct Receiver<T> {
    id: u64,
    inner: mpsc::Receiver<T>,
    subscribers: Subscribers<T>,
}

impl<T> Receiver<T> {
    /// Blocks until a message is available or every sender is gone.
    pub fn recv(&self) -> Result<T, mpsc::RecvError> {
        self.inner.recv()
    }

    /// Returns a pending message without blocking.
    pub fn try_recv(&self) -> Result<T, mpsc::TryRecvError> {
        self.inner.try_recv()
    }

    /// Blocks until a message is available, with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, mpsc::RecvTimeoutError> {
        self.inner.recv_timeout(timeout)
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        let (tx, rx) = mpsc::channel();
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().unwrap().push((id, tx));
        Self {
            id,
            inner: rx,
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.retain(|(id, _)| *id != self.id);
    }
}

/// Creates a broadcast channel, returning the sender/receiver halves.
#[must_use]
pub fn channel<T: Clone>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel();
    let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
    let subscribers: Subscribers<T> = Arc::new(RwLock::new(vec![(id, tx)]));

    (
        Sender {
            subscribers: subscribers.clone(),
        },
        Receiver {
            id,
            inner: rx,
            subscribers,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasts_to_every_receiver() {
        let (tx, rx_1) = channel();
        let rx_2 = rx_1.clone();

        tx.send(1).unwrap();
        tx.send(2).unwrap();

        assert_eq!(rx_1.recv().unwrap(), 1);
        assert_eq!(rx_2.recv().unwrap(), 1);
        assert_eq!(rx_1.recv().unwrap(), 2);
        assert_eq!(rx_2.recv().unwrap(), 2);
    }

    #[test]
    fn send_fails_once_all_receivers_are_gone() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(tx.send(1).is_err());
    }

    #[test]
    fn dropped_receiver_stops_listening() {
        let (tx, rx_1) = channel();
        let rx_2 = rx_1.clone();
        drop(rx_1);

        tx.send(7).unwrap();
        assert_eq!(rx_2.recv().unwrap(), 7);
    }

    #[test]
    fn late_subscriber_misses_earlier_messages() {
        let tx = Sender::new();
        assert!(tx.send(1).is_err());

        let rx = tx.subscribe();
        tx.send(2).unwrap();
        assert_eq!(rx.recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }
}

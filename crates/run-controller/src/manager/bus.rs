use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Consumer of bus events. Handlers own their error reporting.
#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static {
    async fn handle(&self, event: E);
}

/// Publishing side of a bounded event queue.
pub struct EventBus<E> {
    sender: mpsc::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Receiving side; either pumped by hand or spawned as a worker pool.
pub struct EventReceiver<E> {
    receiver: mpsc::Receiver<E>,
}

impl<E: Send + 'static> EventBus<E> {
    pub fn channel(capacity: usize) -> (Self, EventReceiver<E>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, EventReceiver { receiver })
    }

    /// Queue an event, waiting while the queue is full. Returns false once
    /// the receiving side is gone.
    pub async fn publish(&self, event: E) -> bool {
        if self.sender.send(event).await.is_err() {
            warn!("event bus closed, dropping event");
            return false;
        }
        true
    }
}

impl<E: Send + 'static> EventReceiver<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Hand events to `handler` with at most `workers` in flight. Events are
    /// not ordered relative to each other once dispatched.
    pub fn spawn(
        mut self,
        handler: Arc<dyn EventHandler<E>>,
        workers: usize,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = self.receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler.handle(event).await;
                    drop(permit);
                });
            }
            debug!("event dispatch loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler<u32> for Counter {
        async fn handle(&self, _event: u32) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn workers_bound_concurrency() {
        let (bus, receiver) = EventBus::channel(16);
        let counter = Arc::new(Counter::default());
        let cancel = CancellationToken::new();
        let handle = receiver.spawn(counter.clone(), 2, cancel.clone());

        for i in 0..8 {
            assert!(bus.publish(i).await);
        }
        for _ in 0..100 {
            if counter.seen.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(counter.seen.load(Ordering::SeqCst), 8);
        assert!(counter.peak.load(Ordering::SeqCst) <= 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn publish_fails_once_receiver_is_gone() {
        let (bus, receiver) = EventBus::<u32>::channel(1);
        drop(receiver);
        assert!(!bus.publish(1).await);
    }

    #[tokio::test]
    async fn receiver_can_be_pumped_by_hand() {
        let (bus, mut receiver) = EventBus::channel(4);
        bus.publish("a").await;
        bus.publish("b").await;
        assert_eq!(receiver.recv().await, Some("a"));
        assert_eq!(receiver.try_recv(), Some("b"));
        assert_eq!(receiver.try_recv(), None);
    }
}

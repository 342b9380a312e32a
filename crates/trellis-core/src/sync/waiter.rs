//! Wait registry
//!
//! Lets callers suspend until a specific entity change id has been fully
//! applied to the mirror, making read-after-write consistent. Waiters that
//! stay outstanding past a threshold are logged for observability; they
//! are never failed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::warn;

/// How long a waiter may be outstanding before it is logged
const STUCK_WAITER_THRESHOLD: Duration = Duration::from_secs(60);

struct Waiter {
    target_id: i64,
    registered_at: Instant,
    tx: oneshot::Sender<()>,
}

/// Registry of tasks waiting for the processed high-water mark
#[derive(Default)]
pub struct WaitRegistry {
    waiters: Mutex<Vec<Waiter>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `target_id`; the returned future resolves when
    /// the processed mark reaches it. Resolves immediately if `processed`
    /// is already there.
    pub fn wait_for(&self, target_id: i64, processed: i64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if target_id <= processed {
            let _ = tx.send(());
            return rx;
        }
        self.waiters
            .lock()
            .expect("wait registry lock poisoned")
            .push(Waiter {
                target_id,
                registered_at: Instant::now(),
                tx,
            });
        rx
    }

    /// Resolve every waiter satisfied by the new processed mark and log
    /// the ones that have been outstanding too long.
    pub fn advance(&self, processed: i64) {
        let mut waiters = self.waiters.lock().expect("wait registry lock poisoned");
        let mut remaining = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if waiter.target_id <= processed {
                let _ = waiter.tx.send(());
            } else {
                if waiter.registered_at.elapsed() > STUCK_WAITER_THRESHOLD {
                    warn!(
                        target_id = waiter.target_id,
                        processed,
                        elapsed_secs = waiter.registered_at.elapsed().as_secs(),
                        "waiter outstanding for a long time"
                    );
                }
                remaining.push(waiter);
            }
        }
        *waiters = remaining;
    }

    pub fn pending_count(&self) -> usize {
        self.waiters
            .lock()
            .expect("wait registry lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_resolution_when_satisfied() {
        let registry = WaitRegistry::new();
        let rx = registry.wait_for(5, 10);
        rx.await.unwrap();
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolves_on_advance() {
        let registry = WaitRegistry::new();
        let mut rx = registry.wait_for(5, 0);

        // Not yet satisfied
        assert!(rx.try_recv().is_err());
        registry.advance(4);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.pending_count(), 1);

        registry.advance(5);
        rx.await.unwrap();
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_advance_resolves_all_satisfied() {
        let registry = WaitRegistry::new();
        let rx1 = registry.wait_for(3, 0);
        let rx2 = registry.wait_for(7, 0);
        let rx3 = registry.wait_for(20, 0);

        registry.advance(10);
        rx1.await.unwrap();
        rx2.await.unwrap();
        assert_eq!(registry.pending_count(), 1);

        registry.advance(20);
        rx3.await.unwrap();
    }
}

//! Protected session gate
//!
//! Some notes are protected: their content depends on a session the user
//! unlocks explicitly. The reconciler must not compare ciphertext-dependent
//! state while that session is unavailable, and other subsystems may need
//! to wait for it. The "resolve from outside" deferred becomes an explicit
//! [`Completion`] handle with at-most-once fulfillment.

use thiserror::Error;
use tokio::sync::watch;

/// The slot was already fulfilled
#[derive(Error, Debug, PartialEq, Eq)]
#[error("completion already fulfilled")]
pub struct AlreadyFulfilled;

/// Single-slot completion handle.
///
/// Fulfilled from outside exactly once; any number of tasks can wait on it.
/// A second `fulfill` fails instead of overwriting.
pub struct Completion<T: Clone + Send + Sync> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Fulfill the slot. Fails if already fulfilled.
    pub fn fulfill(&self, value: T) -> Result<(), AlreadyFulfilled> {
        let mut won = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value.clone());
                won = true;
                true
            } else {
                false
            }
        });
        if won {
            Ok(())
        } else {
            Err(AlreadyFulfilled)
        }
    }

    /// Current value, if fulfilled.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the slot is fulfilled.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow().clone() {
                return value;
            }
            // Sender lives in self, so changed() cannot fail while we hold it.
            if rx.changed().await.is_err() {
                unreachable!("completion sender dropped while waiting");
            }
        }
    }
}

impl<T: Clone + Send + Sync> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Availability gate for the protected session.
///
/// `unlock` fulfills the current cycle's completion; `clear` starts a new
/// cycle (used by the handshake reset step, since ciphertext-dependent
/// state cannot be trusted across reconnects).
#[derive(Default)]
pub struct ProtectedSession {
    current: std::sync::Mutex<Completion<()>>,
}

impl ProtectedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the protected session as available. Idempotent per cycle.
    pub fn unlock(&self) {
        let guard = self.current.lock().expect("protected session lock poisoned");
        let _ = guard.fulfill(());
    }

    /// Whether the protected session is currently available.
    pub fn is_available(&self) -> bool {
        self.current
            .lock()
            .expect("protected session lock poisoned")
            .is_fulfilled()
    }

    /// Discard availability; the next `unlock` starts a fresh cycle.
    pub fn clear(&self) {
        let mut guard = self.current.lock().expect("protected session lock poisoned");
        *guard = Completion::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fulfill_at_most_once() {
        let completion: Completion<u32> = Completion::new();
        assert!(!completion.is_fulfilled());

        assert_eq!(completion.fulfill(7), Ok(()));
        assert_eq!(completion.fulfill(8), Err(AlreadyFulfilled));

        // The first value wins.
        assert_eq!(completion.get(), Some(7));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_fulfill() {
        let completion: std::sync::Arc<Completion<&'static str>> =
            std::sync::Arc::new(Completion::new());

        let waiter = {
            let completion = completion.clone();
            tokio::spawn(async move { completion.wait().await })
        };

        tokio::task::yield_now().await;
        completion.fulfill("ready").unwrap();

        assert_eq!(waiter.await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn test_wait_resolves_immediately_when_fulfilled() {
        let completion: Completion<u32> = Completion::new();
        completion.fulfill(1).unwrap();
        assert_eq!(completion.wait().await, 1);
    }

    #[test]
    fn test_protected_session_cycle() {
        let session = ProtectedSession::new();
        assert!(!session.is_available());

        session.unlock();
        assert!(session.is_available());

        // Unlocking twice within a cycle is fine.
        session.unlock();
        assert!(session.is_available());

        session.clear();
        assert!(!session.is_available());

        session.unlock();
        assert!(session.is_available());
    }
}

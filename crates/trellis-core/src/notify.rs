//! External collaborator traits
//!
//! The sync engine never renders UI. Toasts, the application reload, and
//! connection lifecycle callbacks are reduced to these traits; hosts plug
//! in their own implementations at startup. Subscriber dispatch is a plain
//! iteration over an ordered registration list.

use std::sync::Arc;

/// Presents notifications to the user
pub trait UserNotifier: Send + Sync {
    /// Transient message
    fn toast(&self, message: &str);

    /// Persistent "connection lost" notification. The supervisor
    /// deduplicates; implementations may assume at most one is active.
    fn connection_lost(&self);

    /// Clears the "connection lost" notification after a reconnect.
    fn connection_restored(&self);

    /// Non-dismissable error shown on permanent failure (auth expiry).
    fn permanent_failure(&self, message: &str);
}

/// Reloads the whole application, discarding all client state
pub trait AppReloader: Send + Sync {
    fn reload(&self);
}

/// Connection lifecycle callbacks
///
/// Registered once at startup as an ordered list; invoked only after a
/// handshake fully succeeds.
pub trait ConnectionSubscriber: Send + Sync {
    fn on_connect(&self) {}
    fn on_reconnect(&self) {}
    /// The mirror was reloaded wholesale after reconciliation.
    fn on_cache_reloaded(&self) {}
}

/// Ordered subscriber registry
pub type Subscribers = Vec<Arc<dyn ConnectionSubscriber>>;

/// Notifier that logs instead of displaying; useful for headless hosts.
pub struct LogNotifier;

impl UserNotifier for LogNotifier {
    fn toast(&self, message: &str) {
        tracing::info!(message, "toast");
    }

    fn connection_lost(&self) {
        tracing::warn!("connection lost");
    }

    fn connection_restored(&self) {
        tracing::info!("connection restored");
    }

    fn permanent_failure(&self, message: &str) {
        tracing::error!(message, "permanent connection failure");
    }
}

/// Reloader that only logs; embedding hosts replace it.
pub struct LogReloader;

impl AppReloader for LogReloader {
    fn reload(&self) {
        tracing::warn!("application reload requested");
    }
}

//! Synchronization engine
//!
//! Keeps the mirror graph consistent with the server over an unreliable
//! bidirectional channel.
//!
//! ## Control flow
//!
//! 1. The heartbeat supervisor opens a channel and runs the handshake
//!    pipeline (auth, clock resync, session gate; plus the conflict
//!    reconciler on reconnects).
//! 2. On success the connection is active: entity-change batches stream
//!    in and the consumer applies them to the mirror, one pass at a time.
//! 3. Pings flow every tick, carrying the accepted high-water mark;
//!    silence past the liveness timeout closes the channel and the
//!    supervisor reconnects with backoff.
//!
//! ## Usage
//!
//! ```ignore
//! let handle = spawn_supervisor(config, factory, pipeline, consumer, ...);
//! handle.subscribe_status();
//! ```

mod channel;
mod consumer;
mod handshake;
mod heartbeat;
mod message;
mod reconcile;
mod waiter;

pub use channel::{
    Channel, ChannelFactory, ChannelReceiver, ChannelSender, MemoryChannel, MemoryChannelRemote,
    WsChannel, WsChannelFactory,
};
pub use consumer::{ChangeStreamConsumer, ConsumerOptions};
pub use handshake::{
    AuthPhase, ClockSyncPhase, HandshakeOutcome, HandshakePhase, HandshakePipeline, HandshakeStep,
    PhaseContext, SessionGatePhase,
};
pub use heartbeat::{
    spawn_supervisor, ConnectionContext, SupervisorCommand, SupervisorConfig, SupervisorHandle,
    SyncStatus,
};
pub use message::{ClientMessage, ServerMessage};
pub use reconcile::{ConflictReconciler, ReconcileOutcome};
pub use waiter::WaitRegistry;

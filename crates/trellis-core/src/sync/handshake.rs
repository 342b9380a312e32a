//! Handshake pipeline
//!
//! Every (re)connection runs an ordered sequence of phase bundles before
//! the connection is considered active. Each bundle contributes up to four
//! sub-steps (reset, pre, main, post), run step-by-step across all bundles
//! in registration order. Reconnects run a second, reconnect-specific
//! bundle set after the first. Any sub-step returning `Ok(false)` vetoes
//! the connection: a graceful close is sent, the channel is closed, and
//! the supervisor retries. A sub-step that errors is a protocol bug and
//! propagates.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelSender};
use super::heartbeat::ConnectionContext;
use super::message::ClientMessage;
use crate::api::ServerApi;
use crate::error::SyncResult;
use crate::notify::{ConnectionSubscriber, Subscribers, UserNotifier};
use crate::session::ProtectedSession;

/// One of the four sub-steps of a phase bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Reset,
    Pre,
    Main,
    Post,
}

const STEP_ORDER: [HandshakeStep; 4] = [
    HandshakeStep::Reset,
    HandshakeStep::Pre,
    HandshakeStep::Main,
    HandshakeStep::Post,
];

/// State handed to every sub-step
pub struct PhaseContext<'a> {
    pub channel: &'a mut dyn Channel,
    pub is_reconnect: bool,
}

/// A subsystem's bundle of handshake sub-steps.
///
/// All sub-steps default to passing; implement only the ones needed.
#[async_trait]
pub trait HandshakePhase: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reset(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        Ok(true)
    }

    async fn pre(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        Ok(true)
    }

    async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        Ok(true)
    }

    async fn post(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        Ok(true)
    }
}

/// Result of running the pipeline
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// All applicable phases passed; subscribers were notified.
    Completed,
    /// A sub-step vetoed; the channel has been torn down.
    Aborted {
        phase: &'static str,
        step: HandshakeStep,
    },
}

/// Ordered registry of handshake bundles and connection subscribers
#[derive(Default)]
pub struct HandshakePipeline {
    connect: Vec<Arc<dyn HandshakePhase>>,
    reconnect: Vec<Arc<dyn HandshakePhase>>,
    subscribers: Subscribers,
}

impl HandshakePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bundle run on every connection.
    pub fn register(&mut self, phase: Arc<dyn HandshakePhase>) {
        self.connect.push(phase);
    }

    /// Register a bundle run only on reconnects, after the connect set.
    pub fn register_reconnect(&mut self, phase: Arc<dyn HandshakePhase>) {
        self.reconnect.push(phase);
    }

    /// Register a connection lifecycle subscriber.
    pub fn subscribe(&mut self, subscriber: Arc<dyn ConnectionSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    /// Run all applicable phases against a fresh channel.
    ///
    /// `last_accepted_id` is attached to the graceful close sent on veto.
    pub async fn run(
        &self,
        channel: &mut dyn Channel,
        is_reconnect: bool,
        last_accepted_id: i64,
    ) -> SyncResult<HandshakeOutcome> {
        if let Some((phase, step)) = self
            .run_bundles(&self.connect, &mut *channel, is_reconnect)
            .await?
        {
            self.teardown(channel, last_accepted_id).await;
            return Ok(HandshakeOutcome::Aborted { phase, step });
        }

        if is_reconnect {
            if let Some((phase, step)) = self
                .run_bundles(&self.reconnect, &mut *channel, is_reconnect)
                .await?
            {
                self.teardown(channel, last_accepted_id).await;
                return Ok(HandshakeOutcome::Aborted { phase, step });
            }
        }

        for subscriber in &self.subscribers {
            subscriber.on_connect();
        }
        if is_reconnect {
            for subscriber in &self.subscribers {
                subscriber.on_reconnect();
            }
        }

        Ok(HandshakeOutcome::Completed)
    }

    async fn run_bundles(
        &self,
        bundles: &[Arc<dyn HandshakePhase>],
        channel: &mut dyn Channel,
        is_reconnect: bool,
    ) -> SyncResult<Option<(&'static str, HandshakeStep)>> {
        for step in STEP_ORDER {
            for phase in bundles {
                let mut ctx = PhaseContext {
                    channel: &mut *channel,
                    is_reconnect,
                };
                let passed = match step {
                    HandshakeStep::Reset => phase.reset(&mut ctx).await?,
                    HandshakeStep::Pre => phase.pre(&mut ctx).await?,
                    HandshakeStep::Main => phase.main(&mut ctx).await?,
                    HandshakeStep::Post => phase.post(&mut ctx).await?,
                };
                if !passed {
                    info!(phase = phase.name(), ?step, "handshake vetoed");
                    return Ok(Some((phase.name(), step)));
                }
            }
        }
        Ok(None)
    }

    async fn teardown(&self, channel: &mut dyn Channel, last_accepted_id: i64) {
        channel
            .send(&ClientMessage::Close {
                last_entity_change_id: last_accepted_id,
            })
            .await
            .ok();
        channel.close().await;
    }
}

// ==================== Built-in bundles ====================

/// Verifies the session token, attempting one reauthentication.
///
/// A definitively rejected session escalates to permanent failure; the
/// supervisor stops reconnecting until the user logs in again.
pub struct AuthPhase {
    api: Arc<dyn ServerApi>,
    ctx: Arc<ConnectionContext>,
    notifier: Arc<dyn UserNotifier>,
}

impl AuthPhase {
    pub fn new(
        api: Arc<dyn ServerApi>,
        ctx: Arc<ConnectionContext>,
        notifier: Arc<dyn UserNotifier>,
    ) -> Self {
        Self {
            api,
            ctx,
            notifier,
        }
    }

    async fn try_reauthenticate(&self) -> SyncResult<bool> {
        match self.api.reauthenticate().await {
            Ok(true) => {
                info!("reauthentication succeeded");
                Ok(true)
            }
            Ok(false) => {
                self.ctx.fail_permanently();
                self.notifier
                    .permanent_failure("Session expired. Please log in again.");
                Ok(false)
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "reauthentication unreachable, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl HandshakePhase for AuthPhase {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        match self.api.verify_auth().await {
            Ok(true) => Ok(true),
            Ok(false) => self.try_reauthenticate().await,
            Err(crate::error::SyncError::AuthExpired) => self.try_reauthenticate().await,
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "auth verification unreachable, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Records the offset between server and client clocks.
///
/// Conflict decisions compare a local edit timestamp against a
/// server-reported one; a large drift is worth a warning.
pub struct ClockSyncPhase {
    api: Arc<dyn ServerApi>,
    offset: Mutex<chrono::Duration>,
}

impl ClockSyncPhase {
    pub fn new(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    /// Last measured server-minus-client offset.
    pub fn offset(&self) -> chrono::Duration {
        *self.offset.lock().expect("clock offset lock poisoned")
    }
}

#[async_trait]
impl HandshakePhase for ClockSyncPhase {
    fn name(&self) -> &'static str {
        "clock-sync"
    }

    async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        match self.api.server_time().await {
            Ok(server_now) => {
                let offset = server_now - Utc::now();
                if offset.num_seconds().abs() > 30 {
                    warn!(offset_secs = offset.num_seconds(), "large clock drift");
                } else {
                    debug!(offset_ms = offset.num_milliseconds(), "clock resynced");
                }
                *self.offset.lock().expect("clock offset lock poisoned") = offset;
                Ok(true)
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "server time unreachable, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Resets and re-queries protected session availability.
///
/// Ciphertext-dependent state cannot be trusted across reconnects, so the
/// reset step always clears the gate before any new decision is made.
pub struct SessionGatePhase {
    api: Arc<dyn ServerApi>,
    session: Arc<ProtectedSession>,
}

impl SessionGatePhase {
    pub fn new(api: Arc<dyn ServerApi>, session: Arc<ProtectedSession>) -> Self {
        Self { api, session }
    }
}

#[async_trait]
impl HandshakePhase for SessionGatePhase {
    fn name(&self) -> &'static str {
        "session-gate"
    }

    async fn reset(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        self.session.clear();
        Ok(true)
    }

    async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        match self.api.protected_status().await {
            Ok(available) => {
                if available {
                    self.session.unlock();
                }
                Ok(true)
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "protected status unreachable, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockServerApi;
    use crate::error::SyncError;
    use crate::notify::testing::{RecordingNotifier, RecordingSubscriber};
    use crate::sync::channel::MemoryChannel;
    use std::sync::atomic::Ordering;

    /// Records the order its sub-steps run in.
    struct TracingPhase {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TracingPhase {
        fn record(&self, step: &str) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, step));
        }
    }

    #[async_trait]
    impl HandshakePhase for TracingPhase {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn reset(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
            self.record("reset");
            Ok(true)
        }

        async fn pre(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
            self.record("pre");
            Ok(true)
        }

        async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
            self.record("main");
            Ok(true)
        }

        async fn post(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
            self.record("post");
            Ok(true)
        }
    }

    /// Vetoes at the given step.
    struct VetoPhase {
        step: HandshakeStep,
    }

    #[async_trait]
    impl HandshakePhase for VetoPhase {
        fn name(&self) -> &'static str {
            "veto"
        }

        async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
            Ok(self.step != HandshakeStep::Main)
        }

        async fn pre(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
            Ok(self.step != HandshakeStep::Pre)
        }
    }

    struct FailingPhase;

    #[async_trait]
    impl HandshakePhase for FailingPhase {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
            Err(SyncError::Protocol("missing expected field".to_string()))
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order_across_bundles() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HandshakePipeline::new();
        pipeline.register(Arc::new(TracingPhase {
            name: "one",
            log: log.clone(),
        }));
        pipeline.register(Arc::new(TracingPhase {
            name: "two",
            log: log.clone(),
        }));

        let (mut channel, _remote) = MemoryChannel::pair();
        let outcome = pipeline.run(&mut channel, false, 0).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::Completed);

        // reset of every bundle, then pre of every bundle, and so on.
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "one:reset", "two:reset", "one:pre", "two:pre", "one:main", "two:main",
                "one:post", "two:post",
            ]
        );
    }

    #[tokio::test]
    async fn test_reconnect_set_runs_only_on_reconnect() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HandshakePipeline::new();
        pipeline.register(Arc::new(TracingPhase {
            name: "connect",
            log: log.clone(),
        }));
        pipeline.register_reconnect(Arc::new(TracingPhase {
            name: "reconnect",
            log: log.clone(),
        }));

        let (mut channel, _remote) = MemoryChannel::pair();
        pipeline.run(&mut channel, false, 0).await.unwrap();
        assert!(!log.lock().unwrap().iter().any(|s| s.starts_with("reconnect")));

        log.lock().unwrap().clear();
        let (mut channel, _remote) = MemoryChannel::pair();
        pipeline.run(&mut channel, true, 0).await.unwrap();
        let entries = log.lock().unwrap();
        // The whole connect set completes before the reconnect set starts.
        let last_connect = entries
            .iter()
            .rposition(|s| s.starts_with("connect"))
            .unwrap();
        let first_reconnect = entries
            .iter()
            .position(|s| s.starts_with("reconnect"))
            .unwrap();
        assert!(last_connect < first_reconnect);
    }

    #[tokio::test]
    async fn test_veto_aborts_without_subscribers_and_closes_channel() {
        let mut pipeline = HandshakePipeline::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        pipeline.register(Arc::new(VetoPhase {
            step: HandshakeStep::Main,
        }));
        pipeline.subscribe(subscriber.clone());

        let (mut channel, mut remote) = MemoryChannel::pair();
        let outcome = pipeline.run(&mut channel, false, 17).await.unwrap();

        assert_eq!(
            outcome,
            HandshakeOutcome::Aborted {
                phase: "veto",
                step: HandshakeStep::Main,
            }
        );
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 0);
        assert!(!channel.is_open());

        // Graceful close carrying the accepted mark was sent first.
        let sent = remote.rx.recv().await.unwrap();
        assert_eq!(
            sent,
            ClientMessage::Close {
                last_entity_change_id: 17
            }
        );
    }

    #[tokio::test]
    async fn test_veto_in_pre_skips_later_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HandshakePipeline::new();
        pipeline.register(Arc::new(VetoPhase {
            step: HandshakeStep::Pre,
        }));
        pipeline.register(Arc::new(TracingPhase {
            name: "after",
            log: log.clone(),
        }));

        let (mut channel, _remote) = MemoryChannel::pair();
        let outcome = pipeline.run(&mut channel, false, 0).await.unwrap();
        assert!(matches!(outcome, HandshakeOutcome::Aborted { .. }));

        // "after" got its reset and nothing else; main/post never ran.
        assert_eq!(*log.lock().unwrap(), vec!["after:reset"]);
    }

    #[tokio::test]
    async fn test_phase_error_propagates() {
        let mut pipeline = HandshakePipeline::new();
        pipeline.register(Arc::new(FailingPhase));

        let (mut channel, _remote) = MemoryChannel::pair();
        let err = pipeline.run(&mut channel, false, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_subscriber_callbacks() {
        let mut pipeline = HandshakePipeline::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        pipeline.subscribe(subscriber.clone());

        let (mut channel, _remote) = MemoryChannel::pair();
        pipeline.run(&mut channel, false, 0).await.unwrap();
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.reconnects.load(Ordering::SeqCst), 0);

        let (mut channel, _remote) = MemoryChannel::pair();
        pipeline.run(&mut channel, true, 0).await.unwrap();
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 2);
        assert_eq!(subscriber.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_phase_reauthenticates_once() {
        let api = Arc::new(MockServerApi::new());
        {
            let mut state = api.state.lock().unwrap();
            state.auth_valid = false;
            state.reauth_succeeds = true;
        }
        let ctx = Arc::new(ConnectionContext::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let phase = AuthPhase::new(api, ctx.clone(), notifier);

        let (mut channel, _remote) = MemoryChannel::pair();
        let mut pctx = PhaseContext {
            channel: &mut channel,
            is_reconnect: false,
        };
        assert!(phase.main(&mut pctx).await.unwrap());
        assert!(!ctx.is_permanently_failed());
    }

    #[tokio::test]
    async fn test_auth_phase_escalates_to_permanent_failure() {
        let api = Arc::new(MockServerApi::new());
        {
            let mut state = api.state.lock().unwrap();
            state.auth_valid = false;
            state.reauth_succeeds = false;
        }
        let ctx = Arc::new(ConnectionContext::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let phase = AuthPhase::new(api, ctx.clone(), notifier.clone());

        let (mut channel, _remote) = MemoryChannel::pair();
        let mut pctx = PhaseContext {
            channel: &mut channel,
            is_reconnect: false,
        };
        assert!(!phase.main(&mut pctx).await.unwrap());
        assert!(ctx.is_permanently_failed());
        assert_eq!(notifier.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_gate_resets_then_requeries() {
        let api = Arc::new(MockServerApi::new());
        api.state.lock().unwrap().protected_available = true;
        let session = Arc::new(ProtectedSession::new());
        session.unlock();

        let phase = SessionGatePhase::new(api.clone(), session.clone());
        let (mut channel, _remote) = MemoryChannel::pair();
        let mut pctx = PhaseContext {
            channel: &mut channel,
            is_reconnect: true,
        };

        phase.reset(&mut pctx).await.unwrap();
        assert!(!session.is_available());

        phase.main(&mut pctx).await.unwrap();
        assert!(session.is_available());
    }
}

//! Heartbeat supervisor
//!
//! Owns the channel lifecycle: opens connections, runs the handshake
//! pipeline, then supervises the live connection with a fixed 1s tick.
//! Silence past the liveness timeout closes the channel and retries with
//! exponential backoff; every retry after a successful connection is a
//! reconnect and additionally runs the reconnect handshake bundles. Pings
//! carry the accepted high-water mark so the server can stop
//! retransmitting. Auth expiry escalated from anywhere turns into
//! permanent failure: a non-dismissable notification, no more retries.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelFactory, ChannelReceiver, ChannelSender};
use super::consumer::ChangeStreamConsumer;
use super::handshake::{HandshakeOutcome, HandshakePipeline};
use super::message::{ClientMessage, ServerMessage};
use crate::error::SyncResult;
use crate::notify::{AppReloader, UserNotifier};

/// Connection status visible to the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not connected, not trying
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Connected, handshake completed
    Connected,
    /// Lost the connection, attempting to get it back
    Reconnecting,
    /// Auth expired; no further attempts without user action
    PermanentlyFailed,
}

/// Commands sent to the supervisor task
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Close gracefully and stop.
    Shutdown,
    /// Auth expiry detected elsewhere in the system.
    AuthExpired,
    /// Forward an error to the server log.
    LogError { error: String, stack: String },
    /// Forward an info line to the server log.
    LogInfo { info: String },
}

/// Shared connection state; no ambient globals.
#[derive(Debug)]
pub struct ConnectionContext {
    inner: Mutex<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    connection_active: bool,
    is_reconnect_attempt: bool,
    permanently_failed: bool,
    last_liveness: Instant,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                connection_active: false,
                is_reconnect_attempt: false,
                permanently_failed: false,
                last_liveness: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        self.inner.lock().expect("connection context lock poisoned")
    }

    pub fn mark_liveness(&self) {
        self.lock().last_liveness = Instant::now();
    }

    pub fn liveness_elapsed(&self) -> Duration {
        self.lock().last_liveness.elapsed()
    }

    pub fn set_active(&self, active: bool) {
        let mut inner = self.lock();
        inner.connection_active = active;
        if active {
            // Every later attempt is a reconnect.
            inner.is_reconnect_attempt = true;
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().connection_active
    }

    pub fn is_reconnect_attempt(&self) -> bool {
        self.lock().is_reconnect_attempt
    }

    pub fn fail_permanently(&self) {
        let mut inner = self.lock();
        inner.permanently_failed = true;
        inner.connection_active = false;
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.lock().permanently_failed
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervisor timing knobs
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fixed tick period
    pub tick: Duration,
    /// Silence longer than this closes the channel
    pub liveness_timeout: Duration,
    /// Grace before the persistent "connection lost" notification
    pub lost_grace: Duration,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(15),
            lost_grace: Duration::from_secs(5),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Handle to control and monitor the supervisor task
pub struct SupervisorHandle {
    command_tx: mpsc::Sender<SupervisorCommand>,
    status_rx: watch::Receiver<SyncStatus>,
}

impl SupervisorHandle {
    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SupervisorCommand::Shutdown).await;
    }

    /// Escalate auth expiry detected during any request in the system.
    pub async fn auth_expired(&self) {
        let _ = self.command_tx.send(SupervisorCommand::AuthExpired).await;
    }

    pub async fn log_error(&self, error: impl Into<String>, stack: impl Into<String>) {
        let _ = self
            .command_tx
            .send(SupervisorCommand::LogError {
                error: error.into(),
                stack: stack.into(),
            })
            .await;
    }

    pub async fn log_info(&self, info: impl Into<String>) {
        let _ = self
            .command_tx
            .send(SupervisorCommand::LogInfo { info: info.into() })
            .await;
    }
}

/// Why a live session ended
enum SessionEnd {
    Shutdown,
    ConnectionLost,
    AuthExpired,
}

struct Supervisor {
    config: SupervisorConfig,
    factory: Arc<dyn ChannelFactory>,
    pipeline: Arc<HandshakePipeline>,
    consumer: Arc<ChangeStreamConsumer>,
    notifier: Arc<dyn UserNotifier>,
    reloader: Arc<dyn AppReloader>,
    ctx: Arc<ConnectionContext>,
    status_tx: watch::Sender<SyncStatus>,
}

/// Spawn the supervisor task.
///
/// Returns a handle to control and monitor it. The task reconnects
/// automatically until shut down or permanently failed.
#[allow(clippy::too_many_arguments)]
pub fn spawn_supervisor(
    config: SupervisorConfig,
    factory: Arc<dyn ChannelFactory>,
    pipeline: Arc<HandshakePipeline>,
    consumer: Arc<ChangeStreamConsumer>,
    notifier: Arc<dyn UserNotifier>,
    reloader: Arc<dyn AppReloader>,
    ctx: Arc<ConnectionContext>,
) -> SupervisorHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected);

    let supervisor = Supervisor {
        config,
        factory,
        pipeline,
        consumer,
        notifier,
        reloader,
        ctx,
        status_tx,
    };

    tokio::spawn(async move {
        if let Err(e) = supervisor_loop(supervisor, command_rx).await {
            // Protocol bugs are not recoverable by reconnecting.
            error!(error = %e, "supervisor stopped on protocol violation");
        }
    });

    SupervisorHandle {
        command_tx,
        status_rx,
    }
}

async fn supervisor_loop(
    sup: Supervisor,
    mut command_rx: mpsc::Receiver<SupervisorCommand>,
) -> SyncResult<()> {
    let mut reconnect_delay = sup.config.initial_reconnect_delay;
    let mut lost_since: Option<Instant> = None;
    let mut lost_notified = false;

    loop {
        if sup.ctx.is_permanently_failed() {
            sup.set_status(SyncStatus::PermanentlyFailed);
            // Only an explicit user action (out of scope here) can help;
            // wait for shutdown.
            match command_rx.recv().await {
                Some(SupervisorCommand::Shutdown) | None => return Ok(()),
                Some(_) => continue,
            }
        }

        let is_reconnect = sup.ctx.is_reconnect_attempt();
        sup.set_status(if is_reconnect {
            SyncStatus::Reconnecting
        } else {
            SyncStatus::Connecting
        });

        match sup.factory.open().await {
            Err(e) => {
                warn!(error = %e, "channel open failed");
            }
            Ok(channel) => {
                let mut channel = channel;
                let outcome = match sup
                    .pipeline
                    .run(&mut *channel, is_reconnect, sup.consumer.last_accepted_id())
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        sup.set_status(SyncStatus::Disconnected);
                        return Err(e);
                    }
                };
                match outcome {
                    HandshakeOutcome::Aborted { phase, step } => {
                        info!(phase, ?step, "handshake aborted, will retry");
                        sup.ctx.mark_liveness();
                    }
                    HandshakeOutcome::Completed => {
                        sup.ctx.set_active(true);
                        sup.ctx.mark_liveness();
                        reconnect_delay = sup.config.initial_reconnect_delay;
                        if lost_notified {
                            sup.notifier.connection_restored();
                            lost_notified = false;
                        }
                        lost_since = None;
                        sup.set_status(SyncStatus::Connected);
                        info!(is_reconnect, "connection active");

                        let (mut sender, mut receiver) = channel.split();
                        let end = sup
                            .run_session(&mut sender, &mut receiver, &mut command_rx)
                            .await;
                        sup.ctx.set_active(false);
                        let end = match end {
                            Ok(end) => end,
                            Err(e) => {
                                sup.set_status(SyncStatus::Disconnected);
                                return Err(e);
                            }
                        };

                        match end {
                            SessionEnd::Shutdown => {
                                sup.set_status(SyncStatus::Disconnected);
                                return Ok(());
                            }
                            SessionEnd::AuthExpired => continue,
                            SessionEnd::ConnectionLost => {
                                debug!("connection lost, entering reconnect loop");
                            }
                        }
                    }
                }
            }
        }

        // Persistent "connection lost" notification, once per outage,
        // after the grace period.
        match lost_since {
            None => lost_since = Some(Instant::now()),
            Some(since) => {
                if !lost_notified && since.elapsed() >= sup.config.lost_grace {
                    sup.notifier.connection_lost();
                    lost_notified = true;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {
                reconnect_delay = (reconnect_delay * 2).min(sup.config.max_reconnect_delay);
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SupervisorCommand::Shutdown) | None => {
                        sup.set_status(SyncStatus::Disconnected);
                        return Ok(());
                    }
                    Some(SupervisorCommand::AuthExpired) => sup.handle_auth_expired(),
                    Some(_) => {
                        // Nothing to forward logs over while disconnected.
                    }
                }
            }
        }
    }
}

impl Supervisor {
    fn set_status(&self, status: SyncStatus) {
        let _ = self.status_tx.send(status);
    }

    fn handle_auth_expired(&self) {
        self.ctx.fail_permanently();
        self.notifier
            .permanent_failure("Session expired. Please log in again.");
    }

    /// Supervise one live connection until it ends.
    async fn run_session(
        &self,
        sender: &mut Box<dyn ChannelSender>,
        receiver: &mut Box<dyn ChannelReceiver>,
        command_rx: &mut mpsc::Receiver<SupervisorCommand>,
    ) -> SyncResult<SessionEnd> {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.ctx.liveness_elapsed() > self.config.liveness_timeout {
                        warn!(
                            elapsed_secs = self.ctx.liveness_elapsed().as_secs(),
                            "no liveness signal, closing channel"
                        );
                        sender.close().await;
                        return Ok(SessionEnd::ConnectionLost);
                    }
                    if !sender.is_open() {
                        return Ok(SessionEnd::ConnectionLost);
                    }
                    let ping = ClientMessage::Ping {
                        last_entity_change_id: self.consumer.last_accepted_id(),
                    };
                    if sender.send(&ping).await.is_err() {
                        return Ok(SessionEnd::ConnectionLost);
                    }
                }

                message = receiver.recv() => {
                    match message {
                        Ok(Some(message)) => {
                            self.ctx.mark_liveness();
                            self.dispatch(message);
                        }
                        Ok(None) => return Ok(SessionEnd::ConnectionLost),
                        // Malformed frame: protocol bug, propagate.
                        Err(e) => return Err(e),
                    }
                }

                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SupervisorCommand::Shutdown) | None => {
                            self.graceful_close(sender).await;
                            return Ok(SessionEnd::Shutdown);
                        }
                        Some(SupervisorCommand::AuthExpired) => {
                            self.handle_auth_expired();
                            self.graceful_close(sender).await;
                            return Ok(SessionEnd::AuthExpired);
                        }
                        Some(SupervisorCommand::LogError { error, stack }) => {
                            sender
                                .send(&ClientMessage::LogError { error, stack })
                                .await
                                .ok();
                        }
                        Some(SupervisorCommand::LogInfo { info }) => {
                            sender.send(&ClientMessage::LogInfo { info }).await.ok();
                        }
                    }
                }
            }
        }
    }

    async fn graceful_close(&self, sender: &mut Box<dyn ChannelSender>) {
        sender
            .send(&ClientMessage::Close {
                last_entity_change_id: self.consumer.last_accepted_id(),
            })
            .await
            .ok();
        sender.close().await;
    }

    /// Route one server message.
    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Ping => {}
            ServerMessage::FrontendUpdate { entity_changes } => {
                debug!(count = entity_changes.len(), "entity changes received");
                self.consumer.submit(entity_changes);
            }
            ServerMessage::ReloadFrontend => {
                info!("server requested a full reload");
                self.reloader.reload();
            }
            ServerMessage::SyncHashCheckFailed => {
                warn!("server reports sync hash check failure");
                self.notifier
                    .toast("Sync consistency could not be verified by the server");
            }
            ServerMessage::ConsistencyChecksFailed => {
                warn!("server reports consistency check failure");
                self.notifier
                    .toast("Server-side consistency checks failed");
            }
            ServerMessage::Toast { message } => {
                self.notifier.toast(&message);
            }
            ServerMessage::TaskError {
                task_id,
                task_type,
                message,
            } => {
                warn!(task_id, task_type, message, "server task failed");
                self.notifier.toast(&message);
            }
            ServerMessage::TaskProgressCount {
                task_id,
                task_type,
                progress_count,
            } => {
                debug!(task_id, task_type, progress_count, "task progress");
            }
            ServerMessage::TaskSucceeded {
                task_id, task_type, ..
            } => {
                debug!(task_id, task_type, "task succeeded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockServerApi;
    use crate::error::SyncError;
    use crate::graph::MirrorGraph;
    use crate::models::{EntityChange, NoteRow, TreeResponse};
    use crate::notify::testing::{RecordingNotifier, RecordingReloader};
    use crate::sync::channel::{Channel, MemoryChannel, MemoryChannelRemote};
    use crate::sync::consumer::ConsumerOptions;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Factory producing in-memory channels, keeping the remote ends.
    struct TestChannelFactory {
        remotes: Arc<Mutex<Vec<MemoryChannelRemote>>>,
        opens: AtomicUsize,
        fail: AtomicBool,
    }

    impl TestChannelFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                remotes: Arc::new(Mutex::new(Vec::new())),
                opens: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn last_remote_tx(&self) -> mpsc::UnboundedSender<ServerMessage> {
            self.remotes
                .lock()
                .unwrap()
                .last()
                .expect("no channel opened yet")
                .tx
                .clone()
        }
    }

    #[async_trait::async_trait]
    impl ChannelFactory for TestChannelFactory {
        async fn open(&self) -> SyncResult<Box<dyn Channel>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("refused".to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (channel, remote) = MemoryChannel::pair();
            self.remotes.lock().unwrap().push(remote);
            Ok(Box::new(channel))
        }
    }

    struct Fixture {
        factory: Arc<TestChannelFactory>,
        handle: SupervisorHandle,
        consumer: Arc<ChangeStreamConsumer>,
        notifier: Arc<RecordingNotifier>,
        reloader: Arc<RecordingReloader>,
        ctx: Arc<ConnectionContext>,
        api: Arc<MockServerApi>,
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            tick: Duration::from_millis(10),
            liveness_timeout: Duration::from_millis(40),
            lost_grace: Duration::from_millis(20),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
        }
    }

    /// Like `fast_config` but with a liveness timeout that will not fire;
    /// for tests that are not about liveness.
    fn stable_config() -> SupervisorConfig {
        SupervisorConfig {
            liveness_timeout: Duration::from_secs(5),
            ..fast_config()
        }
    }

    fn start(config: SupervisorConfig) -> Fixture {
        let api = Arc::new(MockServerApi::with_tree(TreeResponse {
            notes: vec![NoteRow::new("root", "Root"), NoteRow::new("a", "A")],
            branches: vec![],
            attributes: vec![],
        }));
        let graph = Arc::new(Mutex::new(MirrorGraph::new()));
        let notifier = Arc::new(RecordingNotifier::default());
        let reloader = Arc::new(RecordingReloader::default());
        let consumer = ChangeStreamConsumer::new(
            graph,
            api.clone(),
            notifier.clone(),
            reloader.clone(),
            ConsumerOptions::default(),
        );
        let ctx = Arc::new(ConnectionContext::new());
        let factory = TestChannelFactory::new();
        let pipeline = Arc::new(HandshakePipeline::new());

        let handle = spawn_supervisor(
            config,
            factory.clone(),
            pipeline,
            consumer.clone(),
            notifier.clone(),
            reloader.clone(),
            ctx.clone(),
        );

        Fixture {
            factory,
            handle,
            consumer,
            notifier,
            reloader,
            ctx,
            api,
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connects_and_pings_with_accepted_mark() {
        let fx = start(stable_config());
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;
        assert!(fx.ctx.is_active());

        // Feed a change so the accepted mark moves, then expect a ping
        // carrying it.
        fx.factory
            .last_remote_tx()
            .send(ServerMessage::FrontendUpdate {
                entity_changes: vec![EntityChange::new(7, "notes", "a")],
            })
            .unwrap();
        wait_until(|| fx.consumer.last_accepted_id() == 7).await;

        let mut saw_marked_ping = false;
        {
            let mut remotes = fx.factory.remotes.lock().unwrap();
            let remote = remotes.last_mut().unwrap();
            while let Ok(message) = remote.rx.try_recv() {
                if message
                    == (ClientMessage::Ping {
                        last_entity_change_id: 7,
                    })
                {
                    saw_marked_ping = true;
                }
            }
        }
        if !saw_marked_ping {
            // Pings are periodic; wait for the next one.
            wait_until(|| {
                let mut remotes = fx.factory.remotes.lock().unwrap();
                let remote = remotes.last_mut().unwrap();
                while let Ok(message) = remote.rx.try_recv() {
                    if message
                        == (ClientMessage::Ping {
                            last_entity_change_id: 7,
                        })
                    {
                        return true;
                    }
                }
                false
            })
            .await;
        }

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_liveness_timeout_triggers_reconnect() {
        let fx = start(fast_config());
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;
        assert_eq!(fx.factory.opens(), 1);

        // Send nothing: liveness lapses, the supervisor reopens.
        wait_until(|| fx.factory.opens() >= 2).await;
        assert!(fx.ctx.is_reconnect_attempt());

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_messages_keep_liveness() {
        let fx = start(fast_config());
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;

        // Keep pinging for a while; no reconnect should happen.
        for _ in 0..10 {
            fx.factory.last_remote_tx().send(ServerMessage::Ping).unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(fx.factory.opens(), 1);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_notification_is_deduplicated() {
        let fx = start(fast_config());
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;

        // Kill the connection and refuse all reopens.
        fx.factory.fail.store(true, Ordering::SeqCst);
        drop(fx.factory.remotes.lock().unwrap().pop());

        // Several failed attempts accumulate, but one notification.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.notifier.lost.load(Ordering::SeqCst), 1);

        // Restore: the notification clears and does not repeat.
        fx.factory.fail.store(false, Ordering::SeqCst);
        wait_until(|| fx.notifier.restored.load(Ordering::SeqCst) == 1).await;
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_expiry_is_permanent() {
        let fx = start(stable_config());
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;

        fx.handle.auth_expired().await;
        wait_until(|| fx.handle.status() == SyncStatus::PermanentlyFailed).await;

        let opens_at_failure = fx.factory.opens();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // No reconnect attempts after permanent failure.
        assert_eq!(fx.factory.opens(), opens_at_failure);
        assert_eq!(fx.notifier.failures.lock().unwrap().len(), 1);
        assert!(fx.ctx.is_permanently_failed());

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_graceful_close() {
        let fx = start(stable_config());
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;

        fx.handle.shutdown().await;
        wait_until(|| fx.handle.status() == SyncStatus::Disconnected).await;

        let mut remotes = fx.factory.remotes.lock().unwrap();
        let remote = remotes.last_mut().unwrap();
        let mut saw_close = false;
        while let Ok(message) = remote.rx.try_recv() {
            if matches!(message, ClientMessage::Close { .. }) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_dispatch_routes_messages() {
        let fx = start(stable_config());
        wait_until(|| fx.handle.status() == SyncStatus::Connected).await;

        let tx = fx.factory.last_remote_tx();
        tx.send(ServerMessage::Toast {
            message: "hello".to_string(),
        })
        .unwrap();
        tx.send(ServerMessage::ReloadFrontend).unwrap();
        tx.send(ServerMessage::FrontendUpdate {
            entity_changes: vec![EntityChange::new(1, "notes", "a")],
        })
        .unwrap();

        wait_until(|| fx.reloader.reloads.load(Ordering::SeqCst) == 1).await;
        wait_until(|| fx.notifier.toasts.lock().unwrap().contains(&"hello".to_string())).await;
        wait_until(|| fx.consumer.processed_id() == 1).await;
        assert_eq!(fx.api.state.lock().unwrap().load_requests.len(), 1);

        fx.handle.shutdown().await;
    }
}

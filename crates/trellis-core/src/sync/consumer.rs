//! Change stream consumer
//!
//! Applies server entity-change batches to the mirror graph, exactly one
//! pass at a time. Accepted and processed high-water marks are tracked
//! separately: accepted advances the moment a batch is submitted (so pings
//! can tell the server what to stop retransmitting), processed only once a
//! pass has fully drained the queue. A per-id seen set makes at-least-once
//! redelivery idempotent.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::waiter::WaitRegistry;
use crate::api::ServerApi;
use crate::config::Config;
use crate::error::SyncResult;
use crate::graph::MirrorGraph;
use crate::models::EntityChange;
use crate::notify::{AppReloader, UserNotifier};

/// Consumer behavior knobs
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Hard wall-clock budget for applying one batch
    pub apply_timeout: Duration,
    /// Surface budget overruns instead of reloading the application
    pub debug: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

impl ConsumerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            apply_timeout: config.apply_timeout(),
            debug: config.debug_sync,
        }
    }
}

#[derive(Default)]
struct ConsumerState {
    pending: VecDeque<Vec<EntityChange>>,
    last_accepted_id: i64,
    last_synced_id: i64,
    processed_id: i64,
    seen: HashSet<i64>,
    in_flight: bool,
}

/// Serialized applier of entity-change batches
pub struct ChangeStreamConsumer {
    graph: Arc<Mutex<MirrorGraph>>,
    api: Arc<dyn ServerApi>,
    notifier: Arc<dyn UserNotifier>,
    reloader: Arc<dyn AppReloader>,
    options: ConsumerOptions,
    state: Mutex<ConsumerState>,
    waiters: WaitRegistry,
    active_passes: AtomicUsize,
    max_observed_passes: AtomicUsize,
    weak_self: Weak<ChangeStreamConsumer>,
}

impl ChangeStreamConsumer {
    pub fn new(
        graph: Arc<Mutex<MirrorGraph>>,
        api: Arc<dyn ServerApi>,
        notifier: Arc<dyn UserNotifier>,
        reloader: Arc<dyn AppReloader>,
        options: ConsumerOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            graph,
            api,
            notifier,
            reloader,
            options,
            state: Mutex::new(ConsumerState::default()),
            waiters: WaitRegistry::new(),
            active_passes: AtomicUsize::new(0),
            max_observed_passes: AtomicUsize::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// Submit a batch of entity changes.
    ///
    /// Returns immediately: the batch is queued, the accepted marks
    /// advance, and application is scheduled. If a pass is already in
    /// flight it will drain this batch too.
    pub fn submit(&self, batch: Vec<EntityChange>) {
        if batch.is_empty() {
            return;
        }
        let start_pass = {
            let mut state = self.state.lock().expect("consumer state lock poisoned");
            for change in &batch {
                state.last_accepted_id = state.last_accepted_id.max(change.id);
                if change.is_synced {
                    state.last_synced_id = state.last_synced_id.max(change.id);
                }
            }
            state.pending.push_back(batch);
            if state.in_flight {
                false
            } else {
                state.in_flight = true;
                true
            }
        };

        if start_pass {
            // The consumer always lives behind the Arc `new` returned.
            if let Some(consumer) = self.weak_self.upgrade() {
                tokio::spawn(async move { consumer.drain().await });
            }
        }
    }

    /// Highest change id accepted (submitted), regardless of processing
    pub fn last_accepted_id(&self) -> i64 {
        self.state
            .lock()
            .expect("consumer state lock poisoned")
            .last_accepted_id
    }

    /// Highest accepted change id flagged as synced
    pub fn last_synced_id(&self) -> i64 {
        self.state
            .lock()
            .expect("consumer state lock poisoned")
            .last_synced_id
    }

    /// Highest change id fully applied to the mirror
    pub fn processed_id(&self) -> i64 {
        self.state
            .lock()
            .expect("consumer state lock poisoned")
            .processed_id
    }

    /// Suspend until `target_id` has been fully applied.
    pub fn wait_for(&self, target_id: i64) -> oneshot::Receiver<()> {
        let processed = self.processed_id();
        self.waiters.wait_for(target_id, processed)
    }

    /// Largest number of simultaneously running application passes ever
    /// observed; stays at 1 when the single-flight guarantee holds.
    pub fn max_concurrent_passes(&self) -> usize {
        self.max_observed_passes.load(Ordering::SeqCst)
    }

    async fn drain(self: Arc<Self>) {
        let running = self.active_passes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed_passes
            .fetch_max(running, Ordering::SeqCst);

        let mut applied_max = 0i64;
        loop {
            let batch = {
                let mut state = self.state.lock().expect("consumer state lock poisoned");
                match state.pending.pop_front() {
                    Some(batch) => batch,
                    None => {
                        state.in_flight = false;
                        break;
                    }
                }
            };

            match tokio::time::timeout(self.options.apply_timeout, self.apply_batch(&batch)).await
            {
                Ok(Ok(max_id)) => {
                    applied_max = applied_max.max(max_id);
                }
                Ok(Err(e)) => {
                    // Server trouble mid-application. Requeue and stop; the
                    // batch is retried when the next submission arrives.
                    warn!(error = %e, "change application failed, requeueing batch");
                    let mut state = self.state.lock().expect("consumer state lock poisoned");
                    state.pending.push_front(batch);
                    state.in_flight = false;
                    break;
                }
                Err(_elapsed) => {
                    let stuck: Vec<i64> = batch.iter().map(|c| c.id).collect();
                    error!(
                        budget_secs = self.options.apply_timeout.as_secs(),
                        ?stuck,
                        "change application exceeded its budget"
                    );
                    if self.options.debug {
                        self.notifier.toast(&format!(
                            "Applying changes {:?} exceeded the {}s budget; they remain unapplied",
                            stuck,
                            self.options.apply_timeout.as_secs()
                        ));
                        // Deliberate diagnostic trade-off: keep going, the
                        // stuck ids are never marked applied.
                        continue;
                    }
                    let mut state = self.state.lock().expect("consumer state lock poisoned");
                    state.in_flight = false;
                    drop(state);
                    self.active_passes.fetch_sub(1, Ordering::SeqCst);
                    self.reloader.reload();
                    return;
                }
            }
        }

        let processed = {
            let mut state = self.state.lock().expect("consumer state lock poisoned");
            state.processed_id = state.processed_id.max(applied_max);
            state.processed_id
        };
        self.waiters.advance(processed);
        self.active_passes.fetch_sub(1, Ordering::SeqCst);
    }

    /// Apply one batch: filter already-seen ids, resolve affected notes,
    /// reload them from the server, merge. Returns the highest applied id.
    async fn apply_batch(&self, batch: &[EntityChange]) -> SyncResult<i64> {
        let fresh: Vec<EntityChange> = {
            let state = self.state.lock().expect("consumer state lock poisoned");
            batch
                .iter()
                .filter(|change| !state.seen.contains(&change.id))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        let note_ids: Vec<String> = {
            let graph = self.graph.lock().expect("mirror graph lock poisoned");
            let mut ids = BTreeSet::new();
            for change in &fresh {
                match change.entity_name.as_str() {
                    "notes" => {
                        ids.insert(change.entity_id.clone());
                    }
                    "branches" => {
                        if let Some(branch) = graph.branch(&change.entity_id) {
                            ids.insert(branch.note_id.clone());
                            ids.insert(branch.parent_note_id.clone());
                        }
                    }
                    "attributes" => {
                        if let Some(attribute) = graph.attribute(&change.entity_id) {
                            ids.insert(attribute.note_id.clone());
                        }
                    }
                    other => {
                        // Entity kinds this mirror does not track
                        debug!(entity_name = other, "skipping unmirrored entity change");
                    }
                }
            }
            ids.into_iter().collect()
        };

        if !note_ids.is_empty() {
            let resp = self.api.load_tree_data(&note_ids).await?;
            let mut graph = self.graph.lock().expect("mirror graph lock poisoned");
            graph.apply_response(&resp);
        }

        let mut state = self.state.lock().expect("consumer state lock poisoned");
        let mut max_id = 0i64;
        for change in &fresh {
            state.seen.insert(change.id);
            max_id = max_id.max(change.id);
        }
        Ok(max_id)
    }
}

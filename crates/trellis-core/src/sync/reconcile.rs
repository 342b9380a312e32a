//! Conflict reconciler
//!
//! Runs as the main reconnect handshake phase. For every note with edit
//! tracking data, compares the locally cached edit state against the
//! server's current content and decides: nothing, upload local, download
//! remote, or -- when both sides changed -- last-writer-wins by timestamp,
//! ties favoring remote. Conflicts are resolved silently; they are never
//! errors. If the server becomes unreachable mid-pass the whole
//! reconciliation aborts with a connection-error outcome, leaving the
//! cache untouched for the next reconnect to retry.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::handshake::{HandshakePhase, PhaseContext};
use crate::api::ServerApi;
use crate::error::{SyncError, SyncResult};
use crate::graph::{MirrorGraph, Note};
use crate::notify::Subscribers;
use crate::session::ProtectedSession;

/// Result of a reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every tracked note already agreed with the server.
    Clean,
    /// Some notes changed (or could not be checked safely); the mirror
    /// was fully resynced.
    Resynced { changed: Vec<String> },
    /// The server became unreachable; nothing was touched.
    ConnectionError,
}

enum NoteOutcome {
    Unchanged,
    Changed,
    /// Gone on the server, or not safely comparable right now.
    Skipped,
    Unsafe,
}

/// Reconciles offline edits against server state after a reconnect
pub struct ConflictReconciler {
    graph: Arc<Mutex<MirrorGraph>>,
    api: Arc<dyn ServerApi>,
    session: Arc<ProtectedSession>,
    subscribers: Subscribers,
}

impl ConflictReconciler {
    pub fn new(
        graph: Arc<Mutex<MirrorGraph>>,
        api: Arc<dyn ServerApi>,
        session: Arc<ProtectedSession>,
        subscribers: Subscribers,
    ) -> Self {
        Self {
            graph,
            api,
            session,
            subscribers,
        }
    }

    /// Run one reconciliation pass over all notes with edit data.
    pub async fn reconcile(&self) -> SyncResult<ReconcileOutcome> {
        let candidates = {
            let graph = self.graph.lock().expect("mirror graph lock poisoned");
            graph.notes_with_edit_data()
        };
        if candidates.is_empty() {
            return Ok(ReconcileOutcome::Clean);
        }

        let mut changed = Vec::new();
        let mut any_unsafe = false;
        for note_id in candidates {
            let note = {
                let graph = self.graph.lock().expect("mirror graph lock poisoned");
                graph.note(&note_id).cloned()
            };
            let Some(note) = note else { continue };

            match self.reconcile_note(&note).await {
                Ok(NoteOutcome::Unchanged) => {}
                Ok(NoteOutcome::Changed) => changed.push(note_id),
                Ok(NoteOutcome::Skipped) => {}
                Ok(NoteOutcome::Unsafe) => any_unsafe = true,
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, note_id, "server unreachable during reconciliation");
                    return Ok(ReconcileOutcome::ConnectionError);
                }
                Err(e) => return Err(e),
            }
        }

        if changed.is_empty() && !any_unsafe {
            return Ok(ReconcileOutcome::Clean);
        }

        info!(
            changed = changed.len(),
            any_unsafe, "reconciliation found divergence, resyncing mirror"
        );
        match self.full_resync(&changed).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "server unreachable during resync");
                return Ok(ReconcileOutcome::ConnectionError);
            }
            Err(e) => return Err(e),
        }

        for subscriber in &self.subscribers {
            subscriber.on_cache_reloaded();
        }
        Ok(ReconcileOutcome::Resynced { changed })
    }

    async fn reconcile_note(&self, note: &Note) -> SyncResult<NoteOutcome> {
        if note.is_protected && !self.session.is_available() {
            debug!(
                note_id = %note.note_id,
                "protected session unavailable, cannot compare safely"
            );
            return Ok(NoteOutcome::Unsafe);
        }

        let blob = match self.api.blob("notes", &note.note_id).await {
            Ok(blob) => blob,
            Err(SyncError::NotFound { .. }) => {
                debug!(note_id = %note.note_id, "note no longer present on server");
                return Ok(NoteOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let remote_changed = note.last_remote_data.as_deref() != Some(blob.content.as_str());
        let local_changed = note.last_local_data != note.last_remote_data;

        match (remote_changed, local_changed) {
            (false, false) => Ok(NoteOutcome::Unchanged),
            (false, true) => self.upload(note).await,
            (true, false) => {
                self.download(&note.note_id, &blob.content, blob.utc_date_modified);
                Ok(NoteOutcome::Changed)
            }
            (true, true) => {
                // Strictly newer side wins; a tie gives no evidence the
                // local edit is newer, so remote wins.
                let local_wins = note
                    .last_local_edit
                    .map(|at| at > blob.utc_date_modified)
                    .unwrap_or(false);
                if local_wins {
                    debug!(note_id = %note.note_id, "conflict: local edit is newer");
                    self.upload(note).await
                } else {
                    debug!(note_id = %note.note_id, "conflict: remote edit wins");
                    self.download(&note.note_id, &blob.content, blob.utc_date_modified);
                    Ok(NoteOutcome::Changed)
                }
            }
        }
    }

    async fn upload(&self, note: &Note) -> SyncResult<NoteOutcome> {
        let Some(ref content) = note.last_local_data else {
            return Ok(NoteOutcome::Skipped);
        };

        match self.api.put_note_data(&note.note_id, content).await {
            Ok(()) => {}
            Err(SyncError::NotFound { .. }) => return Ok(NoteOutcome::Skipped),
            Err(e) => return Err(e),
        }

        // Servers may normalize content; re-fetch the canonical stored
        // form so the tracking state matches it exactly.
        let blob = self.api.blob("notes", &note.note_id).await?;
        self.download(&note.note_id, &blob.content, blob.utc_date_modified);
        Ok(NoteOutcome::Changed)
    }

    fn download(&self, note_id: &str, content: &str, at: chrono::DateTime<chrono::Utc>) {
        let mut graph = self.graph.lock().expect("mirror graph lock poisoned");
        graph.record_synced_content(note_id, content, at);
    }

    /// Full tree reload, explicit reload of the changed notes, then a
    /// reload of everything cached, so no partially stale region survives.
    async fn full_resync(&self, changed: &[String]) -> SyncResult<()> {
        let tree = self.api.tree(None).await?;
        {
            let mut graph = self.graph.lock().expect("mirror graph lock poisoned");
            graph.apply_full_tree(&tree);
        }

        if !changed.is_empty() {
            let resp = self.api.load_tree_data(changed).await?;
            let mut graph = self.graph.lock().expect("mirror graph lock poisoned");
            graph.apply_response(&resp);
        }

        let cached = {
            let graph = self.graph.lock().expect("mirror graph lock poisoned");
            graph.cached_note_ids()
        };
        if !cached.is_empty() {
            let resp = self.api.load_tree_data(&cached).await?;
            let mut graph = self.graph.lock().expect("mirror graph lock poisoned");
            graph.apply_response(&resp);
        }
        Ok(())
    }
}

#[async_trait]
impl HandshakePhase for ConflictReconciler {
    fn name(&self) -> &'static str {
        "conflict-reconciler"
    }

    async fn main(&self, _ctx: &mut PhaseContext<'_>) -> SyncResult<bool> {
        match self.reconcile().await? {
            ReconcileOutcome::ConnectionError => Ok(false),
            _ => Ok(true),
        }
    }
}

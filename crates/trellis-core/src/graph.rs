//! Mirror graph
//!
//! The client-held copy of the server-owned note/branch/attribute graph.
//! `apply_response` is the single mutation entry point, used both for full
//! tree loads and for incremental change batches; presentation code only
//! reads. Branches are owned exclusively by the graph -- notes hold branch
//! ids, never branch objects, so there are no ownership cycles between
//! parents and children.
//!
//! Entities are deleted implicitly: absent from an authoritative response
//! for a region that is known to be loaded means gone, not pending. The
//! [`NoteLookup`] enum makes that distinction explicit for callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::api::ServerApi;
use crate::error::SyncResult;
use crate::models::{AttributeRow, BranchRow, NoteRow, TreeResponse};

/// A note in the mirror graph
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub note_id: String,
    pub title: String,
    pub note_type: String,
    pub is_protected: bool,

    /// Child note ids, ordered by branch position
    pub children: Vec<String>,
    /// Parent note ids, deterministically ordered
    pub parents: Vec<String>,
    /// child note id -> branch id
    pub child_to_branch: HashMap<String, String>,
    /// parent note id -> branch id
    pub parent_to_branch: HashMap<String, String>,
    /// Attribute ids owned by this note
    pub attributes: Vec<String>,
    /// Relation attribute ids pointing at this note (lookup only)
    pub target_relations: Vec<String>,

    /// Content as last edited locally
    pub last_local_data: Option<String>,
    pub last_local_edit: Option<DateTime<Utc>>,
    /// Content as last confirmed by the server
    pub last_remote_data: Option<String>,
    pub last_remote_edit: Option<DateTime<Utc>>,
    /// Whether edit tracking data exists for reconciliation
    pub edits_data_available: bool,
}

impl Note {
    fn from_row(row: &NoteRow) -> Self {
        Self {
            note_id: row.note_id.clone(),
            title: row.title.clone(),
            note_type: row.note_type.clone(),
            is_protected: row.is_protected,
            children: Vec::new(),
            parents: Vec::new(),
            child_to_branch: HashMap::new(),
            parent_to_branch: HashMap::new(),
            attributes: Vec::new(),
            target_relations: Vec::new(),
            last_local_data: None,
            last_local_edit: None,
            last_remote_data: None,
            last_remote_edit: None,
            edits_data_available: false,
        }
    }

    /// Whether this is a saved-search note whose children are virtual
    pub fn is_search(&self) -> bool {
        self.note_type == "search"
    }
}

/// The edge object linking a parent note to a child note
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub branch_id: String,
    pub note_id: String,
    pub parent_note_id: String,
    pub position: i64,
    /// Synthesized from saved-search results, never server-persisted
    pub from_search_note: bool,
}

impl Branch {
    fn from_row(row: &BranchRow) -> Self {
        Self {
            branch_id: row.branch_id.clone(),
            note_id: row.note_id.clone(),
            parent_note_id: row.parent_note_id.clone(),
            position: row.position,
            from_search_note: false,
        }
    }
}

/// An attribute attached to a note
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub attribute_id: String,
    pub note_id: String,
    pub kind: String,
    pub name: String,
    pub value: String,
}

impl Attribute {
    fn from_row(row: &AttributeRow) -> Self {
        Self {
            attribute_id: row.attribute_id.clone(),
            note_id: row.note_id.clone(),
            kind: row.kind.clone(),
            name: row.name.clone(),
            value: row.value.clone(),
        }
    }

    pub fn is_relation(&self) -> bool {
        self.kind == "relation"
    }
}

/// Result of a point lookup against the mirror
///
/// `Missing` is only reported once a full tree load has completed; before
/// that, an absent note is `NotYetLoaded` and should be fetched on demand.
#[derive(Debug, PartialEq)]
pub enum NoteLookup<'a> {
    Loaded(&'a Note),
    Missing,
    NotYetLoaded,
}

/// In-memory mirror of the server-owned entity graph
#[derive(Debug, Default, PartialEq)]
pub struct MirrorGraph {
    notes: HashMap<String, Note>,
    branches: HashMap<String, Branch>,
    attributes: HashMap<String, Attribute>,
    tree_loaded: bool,
}

impl MirrorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Lookups ====================

    pub fn note(&self, note_id: &str) -> Option<&Note> {
        self.notes.get(note_id)
    }

    pub fn branch(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.get(branch_id)
    }

    pub fn attribute(&self, attribute_id: &str) -> Option<&Attribute> {
        self.attributes.get(attribute_id)
    }

    /// Point lookup distinguishing "possibly deleted" from "not yet loaded"
    pub fn lookup_note(&self, note_id: &str) -> NoteLookup<'_> {
        match self.notes.get(note_id) {
            Some(note) => NoteLookup::Loaded(note),
            None if self.tree_loaded => NoteLookup::Missing,
            None => NoteLookup::NotYetLoaded,
        }
    }

    /// Whether a full tree load has completed
    pub fn is_tree_loaded(&self) -> bool {
        self.tree_loaded
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Ids of all currently cached notes
    pub fn cached_note_ids(&self) -> Vec<String> {
        self.notes.keys().cloned().collect()
    }

    /// Notes carrying edit-tracking data, for reconciliation
    pub fn notes_with_edit_data(&self) -> Vec<String> {
        self.notes
            .values()
            .filter(|n| n.edits_data_available)
            .map(|n| n.note_id.clone())
            .collect()
    }

    // ==================== Merge protocol ====================

    /// Merge a server response into the graph.
    ///
    /// The single mutation entry point: updates note scalars, severs and
    /// rewires edges, upserts attributes, then re-sorts affected parents.
    pub fn apply_response(&mut self, resp: &TreeResponse) {
        let branches = resp.branches.iter().map(Branch::from_row).collect();
        self.apply_rows(&resp.notes, branches, &resp.attributes);
    }

    /// Merge a full tree load and mark the tree as loaded.
    pub fn apply_full_tree(&mut self, resp: &TreeResponse) {
        self.apply_response(resp);
        self.tree_loaded = true;
    }

    fn apply_rows(&mut self, notes: &[NoteRow], branches: Vec<Branch>, attributes: &[AttributeRow]) {
        // 1. Note scalars, then sever the note's current real edges. Virtual
        //    search branches survive severance; only the search-note reload
        //    path rebuilds them.
        for row in notes {
            if let Some(note) = self.notes.get_mut(&row.note_id) {
                note.title = row.title.clone();
                note.note_type = row.note_type.clone();
                note.is_protected = row.is_protected;
                self.sever_real_edges(&row.note_id);
            } else {
                self.notes.insert(row.note_id.clone(), Note::from_row(row));
            }
        }

        // 2. Branches: replace and wire both sides, deferring wiring for
        //    notes not yet present in the graph.
        let mut touched_parents: Vec<String> = Vec::new();
        for branch in branches {
            if let Some(child) = self.notes.get_mut(&branch.note_id) {
                if !child.parents.contains(&branch.parent_note_id) {
                    child.parents.push(branch.parent_note_id.clone());
                }
                child
                    .parent_to_branch
                    .insert(branch.parent_note_id.clone(), branch.branch_id.clone());
            }
            if let Some(parent) = self.notes.get_mut(&branch.parent_note_id) {
                if !parent.children.contains(&branch.note_id) {
                    parent.children.push(branch.note_id.clone());
                }
                parent
                    .child_to_branch
                    .insert(branch.note_id.clone(), branch.branch_id.clone());
                if !touched_parents.contains(&branch.parent_note_id) {
                    touched_parents.push(branch.parent_note_id.clone());
                }
            }
            self.branches.insert(branch.branch_id.clone(), branch);
        }

        // 3. Attributes: upsert, attach to owner, register relation
        //    back-references on present targets.
        for row in attributes {
            if let Some(owner) = self.notes.get_mut(&row.note_id) {
                if !owner.attributes.contains(&row.attribute_id) {
                    owner.attributes.push(row.attribute_id.clone());
                }
            }
            if row.is_relation() {
                if let Some(target) = self.notes.get_mut(&row.value) {
                    if !target.target_relations.contains(&row.attribute_id) {
                        target.target_relations.push(row.attribute_id.clone());
                    }
                }
            }
            self.attributes
                .insert(row.attribute_id.clone(), Attribute::from_row(row));
        }

        // 4. One deferred sort per touched parent, not per edge.
        for parent_id in touched_parents {
            self.sort_children(&parent_id);
            self.sort_parents(&parent_id);
        }
    }

    /// Remove the note's server-persisted edges on both sides.
    ///
    /// Child branches go unconditionally; parent branches marked
    /// `from_search_note` are preserved.
    fn sever_real_edges(&mut self, note_id: &str) {
        let (child_entries, parent_entries) = match self.notes.get(note_id) {
            Some(note) => (
                note.child_to_branch
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>(),
                note.parent_to_branch
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>(),
            ),
            None => return,
        };

        for (child_id, branch_id) in &child_entries {
            self.branches.remove(branch_id);
            if let Some(child) = self.notes.get_mut(child_id) {
                child.parents.retain(|p| p != note_id);
                child.parent_to_branch.remove(note_id);
            }
        }

        let mut kept_parents: Vec<(String, String)> = Vec::new();
        for (parent_id, branch_id) in &parent_entries {
            let from_search = self
                .branches
                .get(branch_id)
                .map(|b| b.from_search_note)
                .unwrap_or(false);
            if from_search {
                kept_parents.push((parent_id.clone(), branch_id.clone()));
                continue;
            }
            self.branches.remove(branch_id);
            if let Some(parent) = self.notes.get_mut(parent_id) {
                parent.children.retain(|c| c != note_id);
                parent.child_to_branch.remove(note_id);
            }
        }

        if let Some(note) = self.notes.get_mut(note_id) {
            note.children.clear();
            note.child_to_branch.clear();
            note.parents = kept_parents.iter().map(|(p, _)| p.clone()).collect();
            note.parent_to_branch = kept_parents.into_iter().collect();
        }
    }

    fn sort_children(&mut self, parent_id: &str) {
        let keyed: Vec<(String, i64)> = match self.notes.get(parent_id) {
            Some(parent) => parent
                .children
                .iter()
                .map(|child_id| {
                    let position = parent
                        .child_to_branch
                        .get(child_id)
                        .and_then(|branch_id| self.branches.get(branch_id))
                        .map(|b| b.position)
                        .unwrap_or(i64::MAX);
                    (child_id.clone(), position)
                })
                .collect(),
            None => return,
        };

        // Stable sort: ties keep original order
        let mut keyed = keyed;
        keyed.sort_by_key(|(_, position)| *position);

        if let Some(parent) = self.notes.get_mut(parent_id) {
            parent.children = keyed.into_iter().map(|(id, _)| id).collect();
        }
    }

    fn sort_parents(&mut self, note_id: &str) {
        if let Some(note) = self.notes.get_mut(note_id) {
            note.parents.sort();
        }
    }

    // ==================== Search-note virtual branches ====================

    /// Rebuild a saved-search note's materialized child set.
    ///
    /// Discards the current child edges entirely and synthesizes one
    /// virtual branch per result with a reproducible id, so repeated
    /// reloads never create duplicates.
    pub fn reload_search_note(&mut self, search_note_id: &str, result_note_ids: &[String]) {
        let (row, real_parent_branches) = match self.notes.get(search_note_id) {
            Some(note) => {
                let mut row = NoteRow::new(&note.note_id, &note.title).with_type(&note.note_type);
                row.is_protected = note.is_protected;
                let parents: Vec<Branch> = note
                    .parent_to_branch
                    .values()
                    .filter_map(|branch_id| self.branches.get(branch_id))
                    .filter(|b| !b.from_search_note)
                    .cloned()
                    .collect();
                (row, parents)
            }
            None => {
                debug!(search_note_id, "search note not cached, skipping reload");
                return;
            }
        };

        let mut branches = real_parent_branches;
        for (index, result_id) in result_note_ids.iter().enumerate() {
            branches.push(Branch {
                branch_id: format!("virt-{}-{}", search_note_id, result_id),
                note_id: result_id.clone(),
                parent_note_id: search_note_id.to_string(),
                position: (index as i64 + 1) * 10,
                from_search_note: true,
            });
        }

        self.apply_rows(&[row], branches, &[]);
    }

    // ==================== Edit tracking ====================

    /// Record a local (possibly offline) edit to a note's content.
    pub fn record_local_edit(&mut self, note_id: &str, content: &str, at: DateTime<Utc>) -> bool {
        match self.notes.get_mut(note_id) {
            Some(note) => {
                note.last_local_data = Some(content.to_string());
                note.last_local_edit = Some(at);
                note.edits_data_available = true;
                true
            }
            None => false,
        }
    }

    /// Record content confirmed by the server, updating the local and
    /// remote tracking sides together.
    pub fn record_synced_content(
        &mut self,
        note_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> bool {
        match self.notes.get_mut(note_id) {
            Some(note) => {
                note.last_local_data = Some(content.to_string());
                note.last_local_edit = Some(at);
                note.last_remote_data = Some(content.to_string());
                note.last_remote_edit = Some(at);
                note.edits_data_available = true;
                true
            }
            None => false,
        }
    }
}

/// Shared graph handle with lazy load-on-miss.
///
/// Wraps the graph mutex together with the server API so callers can ask
/// for a note and have it fetched transparently when it was simply never
/// loaded. `Missing` notes are not fetched -- absence after a full load
/// means possibly deleted.
#[derive(Clone)]
pub struct MirrorHandle {
    graph: Arc<Mutex<MirrorGraph>>,
    api: Arc<dyn ServerApi>,
}

impl MirrorHandle {
    pub fn new(graph: Arc<Mutex<MirrorGraph>>, api: Arc<dyn ServerApi>) -> Self {
        Self { graph, api }
    }

    pub fn graph(&self) -> &Arc<Mutex<MirrorGraph>> {
        &self.graph
    }

    /// Get a note, fetching it from the server when not yet loaded.
    pub async fn note_or_load(&self, note_id: &str) -> SyncResult<Option<Note>> {
        {
            let graph = self.graph.lock().expect("mirror graph lock poisoned");
            match graph.lookup_note(note_id) {
                NoteLookup::Loaded(note) => return Ok(Some(note.clone())),
                NoteLookup::Missing => return Ok(None),
                NoteLookup::NotYetLoaded => {}
            }
        }

        let resp = self.api.load_tree_data(&[note_id.to_string()]).await?;
        let mut graph = self.graph.lock().expect("mirror graph lock poisoned");
        graph.apply_response(&resp);
        Ok(graph.note(note_id).cloned())
    }
}

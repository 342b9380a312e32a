//! Data models for Trellis
//!
//! Server-assigned entity change notifications and the row payloads the
//! server returns for tree loads. The mirror-side graph entities live in
//! `graph`; these types are the wire/HTTP shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A server-assigned, globally ordered notification that some entity was
/// created, updated, or removed.
///
/// Ids are monotonic across all entity kinds; reapplying a change with a
/// given id is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub id: i64,
    pub entity_name: String,
    pub entity_id: String,
    #[serde(default)]
    pub is_synced: bool,
}

impl EntityChange {
    pub fn new(id: i64, entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            id,
            entity_name: entity_name.into(),
            entity_id: entity_id.into(),
            is_synced: false,
        }
    }

    pub fn synced(mut self) -> Self {
        self.is_synced = true;
        self
    }
}

/// Note payload row from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRow {
    pub note_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_note_type")]
    pub note_type: String,
    #[serde(default)]
    pub is_protected: bool,
}

fn default_note_type() -> String {
    "text".to_string()
}

impl NoteRow {
    pub fn new(note_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            note_id: note_id.into(),
            title: title.into(),
            note_type: default_note_type(),
            is_protected: false,
        }
    }

    pub fn with_type(mut self, note_type: impl Into<String>) -> Self {
        self.note_type = note_type.into();
        self
    }

    pub fn protected(mut self) -> Self {
        self.is_protected = true;
        self
    }
}

/// Branch payload row from the server
///
/// A branch is the edge linking a parent note to a child note, carrying
/// ordering position. Server rows are always real (persisted) branches;
/// virtual search branches are synthesized client-side only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRow {
    pub branch_id: String,
    pub note_id: String,
    pub parent_note_id: String,
    #[serde(default)]
    pub position: i64,
}

impl BranchRow {
    pub fn new(
        branch_id: impl Into<String>,
        note_id: impl Into<String>,
        parent_note_id: impl Into<String>,
        position: i64,
    ) -> Self {
        Self {
            branch_id: branch_id.into(),
            note_id: note_id.into(),
            parent_note_id: parent_note_id.into(),
            position,
        }
    }
}

/// Attribute payload row from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRow {
    pub attribute_id: String,
    pub note_id: String,
    /// "relation" or "label"; relation values are target note ids
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl AttributeRow {
    pub fn label(
        attribute_id: impl Into<String>,
        note_id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            attribute_id: attribute_id.into(),
            note_id: note_id.into(),
            kind: "label".to_string(),
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn relation(
        attribute_id: impl Into<String>,
        note_id: impl Into<String>,
        name: impl Into<String>,
        target_note_id: impl Into<String>,
    ) -> Self {
        Self {
            attribute_id: attribute_id.into(),
            note_id: note_id.into(),
            kind: "relation".to_string(),
            name: name.into(),
            value: target_note_id.into(),
        }
    }

    pub fn is_relation(&self) -> bool {
        self.kind == "relation"
    }
}

/// Response shape of `GET tree` and `POST tree/load`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeResponse {
    #[serde(default)]
    pub notes: Vec<NoteRow>,
    #[serde(default)]
    pub branches: Vec<BranchRow>,
    #[serde(default)]
    pub attributes: Vec<AttributeRow>,
}

impl TreeResponse {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.branches.is_empty() && self.attributes.is_empty()
    }
}

/// Response shape of `GET <entity>/<id>/blob`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub content: String,
    pub utc_date_modified: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_change_deserialization() {
        let json = r#"{"id":42,"entityName":"notes","entityId":"abc","isSynced":true}"#;
        let change: EntityChange = serde_json::from_str(json).unwrap();
        assert_eq!(change.id, 42);
        assert_eq!(change.entity_name, "notes");
        assert_eq!(change.entity_id, "abc");
        assert!(change.is_synced);
    }

    #[test]
    fn test_entity_change_is_synced_defaults_false() {
        let json = r#"{"id":1,"entityName":"branches","entityId":"b1"}"#;
        let change: EntityChange = serde_json::from_str(json).unwrap();
        assert!(!change.is_synced);
    }

    #[test]
    fn test_note_row_defaults() {
        let json = r#"{"noteId":"n1"}"#;
        let row: NoteRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.note_type, "text");
        assert!(!row.is_protected);
        assert!(row.title.is_empty());
    }

    #[test]
    fn test_attribute_row_kind_tag() {
        let json = r#"{"attributeId":"a1","noteId":"n1","type":"relation","name":"template","value":"n2"}"#;
        let row: AttributeRow = serde_json::from_str(json).unwrap();
        assert!(row.is_relation());
        assert_eq!(row.value, "n2");
    }

    #[test]
    fn test_tree_response_roundtrip() {
        let resp = TreeResponse {
            notes: vec![NoteRow::new("n1", "Root")],
            branches: vec![BranchRow::new("b1", "n2", "n1", 10)],
            attributes: vec![AttributeRow::label("a1", "n1", "color", "red")],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: TreeResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(resp, parsed);
        assert!(!parsed.is_empty());
    }

    #[test]
    fn test_blob_parses_timestamp() {
        let json = r#"{"content":"hello","utcDateModified":"2026-01-15T10:30:00Z"}"#;
        let blob: Blob = serde_json::from_str(json).unwrap();
        assert_eq!(blob.content, "hello");
        assert_eq!(blob.utc_date_modified.timestamp(), 1768473000);
    }
}

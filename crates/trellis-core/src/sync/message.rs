//! Channel protocol message types
//!
//! Messages exchanged over the bidirectional channel as `type`-tagged JSON
//! text frames.

use serde::{Deserialize, Serialize};

use crate::models::EntityChange;

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Liveness signal
    Ping,

    /// Entity change batch
    FrontendUpdate {
        #[serde(rename = "entityChanges")]
        entity_changes: Vec<EntityChange>,
    },

    /// The server wants the whole client reloaded
    ReloadFrontend,

    /// Server-side sync hash verification failed
    SyncHashCheckFailed,

    /// Server-side consistency checks failed
    ConsistencyChecksFailed,

    /// Message to surface to the user
    Toast { message: String },

    /// A long-running server task failed
    TaskError {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "taskType")]
        task_type: String,
        #[serde(default)]
        message: String,
    },

    /// Progress tick from a long-running server task
    TaskProgressCount {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "taskType")]
        task_type: String,
        #[serde(rename = "progressCount", default)]
        progress_count: i64,
    },

    /// A long-running server task finished
    TaskSucceeded {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "taskType")]
        task_type: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Liveness signal carrying the accepted high-water mark, so the
    /// server knows what it can stop retransmitting.
    Ping {
        #[serde(rename = "lastEntityChangeId")]
        last_entity_change_id: i64,
    },

    /// Graceful close, final accepted mark attached
    Close {
        #[serde(rename = "lastEntityChangeId")]
        last_entity_change_id: i64,
    },

    /// Forward a client-side error to the server log
    LogError { error: String, stack: String },

    /// Forward a client-side info line to the server log
    LogInfo { info: String },
}

impl ServerMessage {
    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ClientMessage {
    /// Encode to a JSON text frame
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("client message serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_encoding() {
        let msg = ClientMessage::Ping {
            last_entity_change_id: 123,
        };
        let json = msg.encode();
        assert!(json.contains(r#""type":"ping""#));
        assert!(json.contains(r#""lastEntityChangeId":123"#));
    }

    #[test]
    fn test_frontend_update_decoding() {
        let json = r#"{
            "type": "frontend-update",
            "entityChanges": [
                {"id": 7, "entityName": "notes", "entityId": "n1", "isSynced": false}
            ]
        }"#;
        let msg = ServerMessage::decode(json).unwrap();
        match msg {
            ServerMessage::FrontendUpdate { entity_changes } => {
                assert_eq!(entity_changes.len(), 1);
                assert_eq!(entity_changes[0].id, 7);
                assert_eq!(entity_changes[0].entity_name, "notes");
            }
            other => panic!("expected frontend-update, got {:?}", other),
        }
    }

    #[test]
    fn test_kebab_case_tags() {
        assert_eq!(
            ServerMessage::decode(r#"{"type":"reload-frontend"}"#).unwrap(),
            ServerMessage::ReloadFrontend
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type":"sync-hash-check-failed"}"#).unwrap(),
            ServerMessage::SyncHashCheckFailed
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type":"consistency-checks-failed"}"#).unwrap(),
            ServerMessage::ConsistencyChecksFailed
        );
    }

    #[test]
    fn test_task_messages() {
        let json = r#"{"type":"task-progress-count","taskId":"t1","taskType":"export","progressCount":42}"#;
        let msg = ServerMessage::decode(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::TaskProgressCount {
                task_id: "t1".to_string(),
                task_type: "export".to_string(),
                progress_count: 42,
            }
        );

        let json = r#"{"type":"task-succeeded","taskId":"t1","taskType":"export","data":{"path":"/tmp/x"}}"#;
        let msg = ServerMessage::decode(json).unwrap();
        match msg {
            ServerMessage::TaskSucceeded { data, .. } => {
                assert_eq!(data["path"], "/tmp/x");
            }
            other => panic!("expected task-succeeded, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_a_protocol_error() {
        assert!(ServerMessage::decode(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn test_close_and_log_messages() {
        let close = ClientMessage::Close {
            last_entity_change_id: 9,
        };
        assert!(close.encode().contains(r#""type":"close""#));

        let log = ClientMessage::LogError {
            error: "boom".to_string(),
            stack: "trace".to_string(),
        };
        let json = log.encode();
        assert!(json.contains(r#""type":"log-error""#));
        assert!(json.contains("boom"));
    }
}

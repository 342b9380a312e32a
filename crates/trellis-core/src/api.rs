//! Server API collaborator
//!
//! HTTP-style endpoints consumed by the sync engine, behind the
//! [`ServerApi`] trait so the engine can be driven against an in-memory
//! fake in tests. [`HttpServerApi`] is the reqwest-backed implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::models::{Blob, TreeResponse};

/// HTTP endpoints of the note server consumed by the sync engine
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// `GET tree[?subTreeNoteId=]`
    async fn tree(&self, sub_tree_note_id: Option<&str>) -> SyncResult<TreeResponse>;

    /// `POST tree/load {noteIds}`
    async fn load_tree_data(&self, note_ids: &[String]) -> SyncResult<TreeResponse>;

    /// `GET <entity>/<id>/blob`
    async fn blob(&self, entity: &str, entity_id: &str) -> SyncResult<Blob>;

    /// `PUT notes/<id>/data {content}`
    async fn put_note_data(&self, note_id: &str, content: &str) -> SyncResult<()>;

    /// `GET protected/status` — whether the protected session is available
    async fn protected_status(&self) -> SyncResult<bool>;

    /// `GET auth/verify` — whether the current session token is accepted
    async fn verify_auth(&self) -> SyncResult<bool>;

    /// `GET auth/reauthenticate` — one-shot token refresh
    async fn reauthenticate(&self) -> SyncResult<bool>;

    /// `GET connectiontest` — cheap reachability probe
    async fn connection_test(&self) -> SyncResult<()>;

    /// `GET servertime`
    async fn server_time(&self) -> SyncResult<DateTime<Utc>>;
}

/// reqwest-backed [`ServerApi`] implementation
pub struct HttpServerApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpServerApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(
        &self,
        resp: reqwest::Response,
        entity: &str,
        id: &str,
    ) -> SyncResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(SyncError::from_status(status.as_u16(), entity, id, message))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(default)]
    available: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    #[serde(default)]
    valid: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    utc_date_time: DateTime<Utc>,
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn tree(&self, sub_tree_note_id: Option<&str>) -> SyncResult<TreeResponse> {
        let mut request = self.http.get(self.url("tree"));
        if let Some(note_id) = sub_tree_note_id {
            request = request.query(&[("subTreeNoteId", note_id)]);
        }
        let resp = self.check(request.send().await?, "tree", "").await?;
        Ok(resp.json().await?)
    }

    async fn load_tree_data(&self, note_ids: &[String]) -> SyncResult<TreeResponse> {
        debug!(count = note_ids.len(), "loading tree data");
        let resp = self
            .http
            .post(self.url("tree/load"))
            .json(&serde_json::json!({ "noteIds": note_ids }))
            .send()
            .await?;
        let resp = self.check(resp, "tree", "").await?;
        Ok(resp.json().await?)
    }

    async fn blob(&self, entity: &str, entity_id: &str) -> SyncResult<Blob> {
        let resp = self
            .http
            .get(self.url(&format!("{}/{}/blob", entity, entity_id)))
            .send()
            .await?;
        let resp = self.check(resp, entity, entity_id).await?;
        Ok(resp.json().await?)
    }

    async fn put_note_data(&self, note_id: &str, content: &str) -> SyncResult<()> {
        let resp = self
            .http
            .put(self.url(&format!("notes/{}/data", note_id)))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        self.check(resp, "notes", note_id).await?;
        Ok(())
    }

    async fn protected_status(&self) -> SyncResult<bool> {
        let resp = self.http.get(self.url("protected/status")).send().await?;
        let resp = self.check(resp, "protected", "").await?;
        let status: StatusResponse = resp.json().await?;
        Ok(status.available)
    }

    async fn verify_auth(&self) -> SyncResult<bool> {
        let resp = self.http.get(self.url("auth/verify")).send().await?;
        if resp.status().as_u16() == 401 {
            return Ok(false);
        }
        let resp = self.check(resp, "auth", "").await?;
        let auth: AuthResponse = resp.json().await?;
        Ok(auth.valid)
    }

    async fn reauthenticate(&self) -> SyncResult<bool> {
        let resp = self.http.get(self.url("auth/reauthenticate")).send().await?;
        if resp.status().as_u16() == 401 {
            return Ok(false);
        }
        let resp = self.check(resp, "auth", "").await?;
        let auth: AuthResponse = resp.json().await?;
        Ok(auth.valid)
    }

    async fn connection_test(&self) -> SyncResult<()> {
        let resp = self.http.get(self.url("connectiontest")).send().await?;
        self.check(resp, "connectiontest", "").await?;
        Ok(())
    }

    async fn server_time(&self) -> SyncResult<DateTime<Utc>> {
        let resp = self.http.get(self.url("servertime")).send().await?;
        let resp = self.check(resp, "servertime", "").await?;
        let time: ServerTimeResponse = resp.json().await?;
        Ok(time.utc_date_time)
    }
}

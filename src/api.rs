//! HTTP client for the karaoke backend.
//!
//! Single read/write calls only. Retry and refresh policy lives in the
//! [`reconciler`](crate::reconciler) and [`sync`](crate::sync) layers, never
//! here.

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::queue::{QueueEntry, QueueSnapshot, RequestStatus, Song};
use crate::session::Session;

/// Errors from a single backend call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Network-level failure: connect, timeout, broken body.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}")]
    Status { status: StatusCode },

    /// Body arrived but does not parse into the expected shape.
    #[error("malformed payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The server rejected a write with a validation detail.
    #[error("request rejected ({status}): {detail}")]
    Rejected { status: StatusCode, detail: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct CreateRequestBody<'a> {
    song_id: i64,
    requester_name: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateStatusBody {
    status: RequestStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: String,
}

/// Anything that can produce a fresh queue snapshot.
///
/// The sync driver only talks to this trait, so tests can substitute a
/// scripted source for the real backend.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, event_id: i64) -> ApiResult<QueueSnapshot>;
}

/// Thin client over the backend REST surface.
pub struct ApiClient {
    http: HttpClient,
    base_url: String,
    session: Option<Session>,
}

impl ApiClient {
    pub fn new(config: &Config) -> ApiResult<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.server.request_timeout_secs))
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: config.server.base_url.trim_end_matches('/').to_string(),
            session: None,
        })
    }

    /// Attach an authenticated session. Host-only endpoints require one.
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorized(self.http.get(self.url(path)))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session {
            Some(session) => builder.header("Authorization", session.authorization_header()),
            None => builder,
        }
    }

    /// Read the body as text, then parse, so transport failures and decode
    /// failures stay distinguishable.
    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> ApiResult<T> {
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ErrorDetail>(&body) {
                return Err(ApiError::Rejected {
                    status,
                    detail: err.detail,
                });
            }
            return Err(ApiError::Status { status });
        }

        serde_json::from_str(&body).map_err(ApiError::Decode)
    }

    /// Pull the full current queue for an event.
    pub async fn fetch_queue(&self, event_id: i64) -> ApiResult<QueueSnapshot> {
        let response = self
            .get(&format!("/events/{event_id}/queue"))
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let entries: Vec<QueueEntry> = Self::read_json(response).await?;
        Ok(QueueSnapshot::from_entries(entries))
    }

    /// Fetch the song catalog.
    pub async fn list_songs(&self) -> ApiResult<Vec<Song>> {
        let response = self
            .get("/songs")
            .send()
            .await
            .map_err(ApiError::Transport)?;

        Self::read_json(response).await
    }

    /// Submit a new song request. Returns the created entry with its
    /// server-assigned play order.
    pub async fn submit_request(
        &self,
        event_id: i64,
        song_id: i64,
        requester_name: &str,
    ) -> ApiResult<QueueEntry> {
        let response = self
            .authorized(self.http.post(self.url(&format!("/events/{event_id}/requests"))))
            .json(&CreateRequestBody {
                song_id,
                requester_name,
            })
            .send()
            .await
            .map_err(ApiError::Transport)?;

        Self::read_json(response).await
    }

    /// Move a request to a new status. Host-only.
    pub async fn update_request_status(
        &self,
        event_id: i64,
        request_id: i64,
        status: RequestStatus,
    ) -> ApiResult<QueueEntry> {
        let response = self
            .authorized(
                self.http
                    .put(self.url(&format!("/events/{event_id}/requests/{request_id}"))),
            )
            .json(&UpdateStatusBody { status })
            .send()
            .await
            .map_err(ApiError::Transport)?;

        Self::read_json(response).await
    }
}

#[async_trait]
impl SnapshotSource for ApiClient {
    async fn fetch_snapshot(&self, event_id: i64) -> ApiResult<QueueSnapshot> {
        self.fetch_queue(event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_payload_decodes_and_sorts() {
        let body = r#"[
            {"id": 2, "song_id": 20, "requester_name": "Luis", "status": "pending", "play_order": 1},
            {"id": 1, "song_id": 10, "requester_name": "Ana", "status": "playing", "play_order": 0}
        ]"#;

        let entries: Vec<QueueEntry> = serde_json::from_str(body).unwrap();
        let snapshot = QueueSnapshot::from_entries(entries);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entries()[0].id, 1);
        assert_eq!(snapshot.current().map(|e| e.id), Some(1));
    }

    #[test]
    fn test_song_catalog_payload_decodes() {
        let body = r#"[
            {"id": 1, "artist": "Queen", "title": "Bohemian Rhapsody", "language": "en", "duration_seconds": 354},
            {"id": 2, "artist": "Soda Stereo", "title": "De Música Ligera"}
        ]"#;

        let songs: Vec<Song> = serde_json::from_str(body).unwrap();
        assert_eq!(songs.len(), 2);
        assert_eq!(songs[0].duration_seconds, Some(354));
        assert!(songs[1].language.is_none());
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        let result: Result<Vec<QueueEntry>, _> =
            serde_json::from_str(r#"{"not": "an array"}"#).map_err(ApiError::Decode);

        match result {
            Err(ApiError::Decode(_)) => {}
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_detail_parses() {
        let err: ErrorDetail =
            serde_json::from_str(r#"{"detail": "requester_name is required"}"#).unwrap();
        assert_eq!(err.detail, "requester_name is required");
    }

    #[test]
    fn test_create_body_wire_shape() {
        let body = CreateRequestBody {
            song_id: 12,
            requester_name: "Ana",
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["song_id"], 12);
        assert_eq!(json["requester_name"], "Ana");
    }

    #[test]
    fn test_update_body_uses_lowercase_status() {
        let body = UpdateStatusBody {
            status: RequestStatus::Played,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "played");
    }
}

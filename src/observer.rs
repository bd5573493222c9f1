//! Viewer capability surfaces over the shared sync core.
//!
//! The host console and the public display watch the same queue through the
//! same reconciler; the only difference is that the host may also write.
//! [`QueueObserver::host`] therefore carries a [`QueueCommands`] handle and
//! [`QueueObserver::public`] does not.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::api::ApiClient;
use crate::config::Config;
use crate::projection::Projection;
use crate::queue::{QueueEntry, RequestStatus};
use crate::sync::{subscribe, Subscription};

/// One live viewer of an event's queue.
pub struct QueueObserver {
    subscription: Option<Subscription>,
    commands: Option<QueueCommands>,
}

impl QueueObserver {
    /// Read-only viewer for the public display.
    pub async fn public<F>(client: Arc<ApiClient>, config: &Config, event_id: i64, on_update: F) -> Self
    where
        F: FnMut(Projection) + Send + 'static,
    {
        let subscription = subscribe(Arc::clone(&client), config, event_id, on_update).await;
        Self {
            subscription: Some(subscription),
            commands: None,
        }
    }

    /// Read-write viewer for the host console.
    pub async fn host<F>(client: Arc<ApiClient>, config: &Config, event_id: i64, on_update: F) -> Self
    where
        F: FnMut(Projection) + Send + 'static,
    {
        let subscription = subscribe(Arc::clone(&client), config, event_id, on_update).await;
        Self {
            subscription: Some(subscription),
            commands: Some(QueueCommands { client, event_id }),
        }
    }

    /// The write surface, present only for hosts.
    pub fn commands(&self) -> Option<&QueueCommands> {
        self.commands.as_ref()
    }

    /// Stop observing. In-flight refreshes are discarded.
    pub async fn close(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe_and_wait().await;
        }
    }
}

/// Host-only write operations against one event's queue.
pub struct QueueCommands {
    client: Arc<ApiClient>,
    event_id: i64,
}

impl QueueCommands {
    /// Put a song into the rotation on behalf of a guest.
    pub async fn submit_request(&self, song_id: i64, requester_name: &str) -> Result<QueueEntry> {
        self.client
            .submit_request(self.event_id, song_id, requester_name)
            .await
            .context("Failed to submit song request")
    }

    /// Finish the current song and bring up the next singer: the playing
    /// entry becomes `played`, the first pending entry becomes `playing`.
    /// The resulting push broadcasts drive every viewer's refresh.
    pub async fn advance(&self) -> Result<Option<QueueEntry>> {
        let snapshot = self
            .client
            .fetch_queue(self.event_id)
            .await
            .context("Failed to read queue before advancing")?;

        if let Some(current) = snapshot.current() {
            self.client
                .update_request_status(self.event_id, current.id, RequestStatus::Played)
                .await
                .context("Failed to mark current request played")?;
        }

        let next = snapshot
            .entries()
            .iter()
            .find(|e| e.status == RequestStatus::Pending);

        match next {
            Some(next) => {
                let promoted = self
                    .client
                    .update_request_status(self.event_id, next.id, RequestStatus::Playing)
                    .await
                    .context("Failed to promote next request")?;
                Ok(Some(promoted))
            }
            None => Ok(None),
        }
    }

    /// Drop a request from the rotation without playing it.
    pub async fn skip(&self, request_id: i64) -> Result<QueueEntry> {
        let snapshot = self
            .client
            .fetch_queue(self.event_id)
            .await
            .context("Failed to read queue before skipping")?;

        let entry = snapshot
            .entries()
            .iter()
            .find(|e| e.id == request_id)
            .ok_or_else(|| anyhow!("Request {request_id} is not in the queue"))?;

        if entry.status != RequestStatus::Pending && entry.status != RequestStatus::Playing {
            return Err(anyhow!(
                "Request {request_id} is already {}, cannot skip",
                entry.status
            ));
        }

        self.client
            .update_request_status(self.event_id, request_id, RequestStatus::Skipped)
            .await
            .context("Failed to skip request")
    }
}

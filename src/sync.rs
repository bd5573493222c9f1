//! Async driver for live-queue synchronization.
//!
//! Wires one [`SnapshotSource`], one push listener and one [`Reconciler`]
//! into a background task. Fetches run as spawned tasks reporting into an
//! internal channel, so commits apply in completion order and the
//! reconciler's sequence guard decides which ones stick. The caller gets a
//! [`Projection`] callback on every commit and a [`Subscription`] handle to
//! tear the whole thing down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::{ApiClient, ApiError, SnapshotSource};
use crate::config::Config;
use crate::listener::{ConnectionState, ListenerEvent, QueueListener};
use crate::projection::{project, Projection};
use crate::queue::QueueSnapshot;
use crate::reconciler::{Action, Reconciler};

/// Timing knobs for the driver.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Interval between fallback polls while degraded or push-less.
    pub poll_interval: Duration,
    /// Delay before re-dialing a dead push connection.
    pub reconnect_backoff: Duration,
    /// Upper bound on a single push dial, so a black-holed handshake cannot
    /// stall the driver loop.
    pub connect_timeout: Duration,
    /// WebSocket base URL to re-dial after connection loss. `None` disables
    /// reconnection (the driver then lives on timed polling alone).
    pub ws_base_url: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            ws_base_url: None,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.sync.poll_interval_secs.max(1)),
            reconnect_backoff: Duration::from_secs(config.sync.reconnect_backoff_secs.max(1)),
            connect_timeout: Duration::from_secs(config.server.request_timeout_secs.max(1)),
            ws_base_url: Some(config.ws_base_url()),
        }
    }
}

/// Handle to a live subscription. Dropping it stops the driver; results of
/// any in-flight fetch are discarded on arrival and no further updates are
/// delivered.
pub struct Subscription {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Stop the subscription and wait for the driver task to wind down.
    pub async fn unsubscribe_and_wait(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Subscribe to an event's live queue.
///
/// Opens the push connection (a failed dial degrades to timed polling,
/// it is not fatal), issues the initial fetch, and invokes `on_update`
/// with a fresh projection on every committed snapshot.
pub async fn subscribe<F>(
    client: Arc<ApiClient>,
    config: &Config,
    event_id: i64,
    on_update: F,
) -> Subscription
where
    F: FnMut(Projection) + Send + 'static,
{
    let options = SyncOptions::from_config(config);

    let listener = dial(&config.ws_base_url(), event_id, options.connect_timeout).await;
    if listener.is_none() {
        tracing::warn!(event_id, "push connection unavailable, starting on timed polling");
    }

    spawn_driver(client, listener, event_id, options, on_update)
}

/// Spawn the driver task over an explicit source and listener.
pub fn spawn_driver<F>(
    source: Arc<dyn SnapshotSource>,
    listener: Option<QueueListener>,
    event_id: i64,
    options: SyncOptions,
    on_update: F,
) -> Subscription
where
    F: FnMut(Projection) + Send + 'static,
{
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run(
        source,
        listener,
        event_id,
        options,
        shutdown_rx,
        on_update,
    ));

    Subscription {
        shutdown,
        handle: Some(handle),
    }
}

async fn run<F>(
    source: Arc<dyn SnapshotSource>,
    mut listener: Option<QueueListener>,
    event_id: i64,
    options: SyncOptions,
    mut shutdown: watch::Receiver<bool>,
    mut on_update: F,
) where
    F: FnMut(Projection) + Send + 'static,
{
    let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel();
    let mut reconciler = Reconciler::new();

    // Starting without a listener (failed initial dial) gets the same
    // re-dial treatment as losing one mid-flight.
    let mut reconnect_at: Option<Instant> = if listener.is_none() && options.ws_base_url.is_some() {
        Some(Instant::now() + options.reconnect_backoff)
    } else {
        None
    };

    let mut poll = tokio::time::interval(options.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    apply(reconciler.start(), &source, event_id, &fetch_tx);

    loop {
        tokio::select! {
            // Shutdown wins over everything else, so a fetch completing in
            // the same poll as an unsubscribe can never commit.
            biased;

            _ = shutdown.changed() => break,

            event = next_event(&mut listener) => {
                let action = match event {
                    Some(ListenerEvent::Changed) => reconciler.on_signal(),
                    Some(ListenerEvent::State(state)) => {
                        if matches!(state, ConnectionState::Closed | ConnectionState::Errored) {
                            tracing::debug!(event_id, ?state, "push connection lost");
                            listener = None;
                            if options.ws_base_url.is_some() {
                                reconnect_at = Some(Instant::now() + options.reconnect_backoff);
                            }
                        }
                        reconciler.on_connection(state)
                    }
                    None => {
                        // Channel gone without a terminal state event
                        listener = None;
                        if options.ws_base_url.is_some() {
                            reconnect_at = Some(Instant::now() + options.reconnect_backoff);
                        }
                        reconciler.on_connection(ConnectionState::Closed)
                    }
                };
                apply(action, &source, event_id, &fetch_tx);
            }

            Some((seq, result)) = fetch_rx.recv() => {
                let action = match result {
                    Ok(snapshot) => {
                        let outcome = reconciler.on_fetch_ok(seq, snapshot);
                        if outcome.committed {
                            if let Some(snapshot) = reconciler.snapshot() {
                                if let Err(violation) = snapshot.check_invariants() {
                                    tracing::warn!(event_id, "server queue violates invariant: {violation}");
                                }
                                on_update(project(snapshot));
                            }
                        }
                        outcome.action
                    }
                    Err(e) => {
                        tracing::warn!(event_id, "queue refresh failed: {e}");
                        reconciler.on_fetch_err(seq)
                    }
                };
                apply(action, &source, event_id, &fetch_tx);
            }

            _ = poll.tick() => {
                apply(reconciler.on_tick(), &source, event_id, &fetch_tx);
            }

            _ = sleep_until_opt(reconnect_at), if reconnect_at.is_some() => {
                reconnect_at = None;
                if let Some(ref ws_base_url) = options.ws_base_url {
                    match dial(ws_base_url, event_id, options.connect_timeout).await {
                        Some(reopened) => listener = Some(reopened),
                        None => {
                            reconnect_at = Some(Instant::now() + options.reconnect_backoff);
                        }
                    }
                }
            }
        }
    }

    reconciler.close();
}

/// Execute a reconciler action: spawn the fetch it asks for, if any.
fn apply(
    action: Action,
    source: &Arc<dyn SnapshotSource>,
    event_id: i64,
    fetch_tx: &mpsc::UnboundedSender<(u64, Result<QueueSnapshot, ApiError>)>,
) {
    if let Action::Fetch(seq) = action {
        let source = Arc::clone(source);
        let fetch_tx = fetch_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch_snapshot(event_id).await;
            // Receiver gone means the subscription ended; suppression of the
            // result is exactly what teardown asks for.
            let _ = fetch_tx.send((seq, result));
        });
    }
}

/// One bounded push dial. Failure and timeout both come back as `None`;
/// the caller owns the retry schedule.
async fn dial(ws_base_url: &str, event_id: i64, connect_timeout: Duration) -> Option<QueueListener> {
    match tokio::time::timeout(connect_timeout, QueueListener::connect(ws_base_url, event_id)).await
    {
        Ok(Ok(listener)) => Some(listener),
        Ok(Err(e)) => {
            tracing::debug!(event_id, "push dial failed: {e}");
            None
        }
        Err(_) => {
            tracing::debug!(event_id, "push dial timed out");
            None
        }
    }
}

async fn next_event(listener: &mut Option<QueueListener>) -> Option<ListenerEvent> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiResult;
    use crate::queue::{QueueEntry, RequestStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn snapshot(ids: &[(i64, RequestStatus)]) -> QueueSnapshot {
        QueueSnapshot::from_entries(
            ids.iter()
                .enumerate()
                .map(|(i, (id, status))| QueueEntry {
                    id: *id,
                    song_id: id * 10,
                    requester_name: format!("singer-{id}"),
                    status: *status,
                    play_order: i as i64,
                    song: None,
                })
                .collect(),
        )
    }

    fn test_options() -> SyncOptions {
        SyncOptions {
            poll_interval: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(100),
            ws_base_url: None,
        }
    }

    /// Returns a bigger queue on every call.
    struct GrowingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSource for GrowingSource {
        async fn fetch_snapshot(&self, _event_id: i64) -> ApiResult<QueueSnapshot> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut entries = vec![(1, RequestStatus::Playing)];
            for id in 0..call as i64 {
                entries.push((id + 2, RequestStatus::Pending));
            }
            Ok(snapshot(&entries))
        }
    }

    /// Blocks until released, then returns an empty queue.
    struct GatedSource {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl SnapshotSource for GatedSource {
        async fn fetch_snapshot(&self, _event_id: i64) -> ApiResult<QueueSnapshot> {
            self.gate.notified().await;
            Ok(snapshot(&[(1, RequestStatus::Pending)]))
        }
    }

    /// Fails its first call, then succeeds.
    struct FlakySource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSource for FlakySource {
        async fn fetch_snapshot(&self, _event_id: i64) -> ApiResult<QueueSnapshot> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ApiError::Status {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                })
            } else {
                Ok(snapshot(&[(1, RequestStatus::Playing)]))
            }
        }
    }

    fn updates_channel() -> (
        impl FnMut(Projection) + Send + 'static,
        mpsc::UnboundedReceiver<Projection>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |projection| {
                let _ = tx.send(projection);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_initial_fetch_delivers_projection() {
        let source = Arc::new(GrowingSource {
            calls: AtomicUsize::new(0),
        });
        let (on_update, mut updates) = updates_channel();

        let sub = spawn_driver(source, None, 1, test_options(), on_update);

        let view = updates.recv().await.expect("initial projection");
        assert_eq!(view.current.map(|e| e.id), Some(1));

        sub.unsubscribe_and_wait().await;
    }

    #[tokio::test]
    async fn test_push_signal_triggers_refetch() {
        let source = Arc::new(GrowingSource {
            calls: AtomicUsize::new(0),
        });
        let (on_update, mut updates) = updates_channel();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let listener = QueueListener::from_channel(events_rx);
        events_tx
            .send(ListenerEvent::State(ConnectionState::Open))
            .unwrap();

        let sub = spawn_driver(source, Some(listener), 1, test_options(), on_update);

        let first = updates.recv().await.expect("initial projection");

        events_tx.send(ListenerEvent::Changed).unwrap();

        // Eventually a strictly larger queue arrives; the Open event racing
        // the initial fetch may produce an intermediate refresh first.
        let mut latest = updates.recv().await.expect("refreshed projection");
        while latest.upcoming.len() <= first.upcoming.len() {
            latest = updates.recv().await.expect("refreshed projection");
        }
        assert!(latest.upcoming.len() > first.upcoming.len());

        sub.unsubscribe_and_wait().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_suppresses_inflight_fetch() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(GatedSource { gate: gate.clone() });
        let (on_update, mut updates) = updates_channel();

        let sub = spawn_driver(source, None, 1, test_options(), on_update);

        // Give the driver a chance to start its fetch, then tear down while
        // the fetch is still parked on the gate.
        tokio::task::yield_now().await;
        sub.unsubscribe_and_wait().await;

        // Release the fetch after the fact.
        gate.notify_waiters();
        tokio::task::yield_now().await;

        assert!(
            updates.recv().await.is_none(),
            "no update may be delivered after unsubscribe"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_poll_recovers_after_backoff() {
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
        });
        let (on_update, mut updates) = updates_channel();

        let sub = spawn_driver(source, None, 1, test_options(), on_update);

        // First fetch fails, the poll interval elapses (auto-advanced under
        // paused time), the retry succeeds.
        let view = updates.recv().await.expect("recovered projection");
        assert_eq!(view.current.map(|e| e.id), Some(1));

        sub.unsubscribe_and_wait().await;
    }

    #[tokio::test]
    async fn test_failed_initial_dial_still_redials_push() {
        // Accepts connections but drops them at once, so every handshake
        // fails; we only care that dial attempts keep happening.
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let dials = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dials);
        tokio::spawn(async move {
            while let Ok((socket, _)) = tcp.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let source = Arc::new(GrowingSource {
            calls: AtomicUsize::new(0),
        });
        let (on_update, mut updates) = updates_channel();
        let options = SyncOptions {
            reconnect_backoff: Duration::from_millis(20),
            ws_base_url: Some(format!("ws://{addr}")),
            ..test_options()
        };

        // The initial dial already failed upstream: the driver starts
        // listener-less but must arm its own re-dial timer.
        let sub = spawn_driver(source, None, 1, options, on_update);

        updates.recv().await.expect("initial projection");

        tokio::time::timeout(Duration::from_secs(2), async {
            while dials.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("driver never re-dialed the push endpoint");

        sub.unsubscribe_and_wait().await;
    }

    #[tokio::test]
    async fn test_hung_push_dial_does_not_stall_driver() {
        // Accepts the TCP connection and then never answers the handshake.
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = tcp.accept().await {
                held.push(socket);
            }
        });

        let source = Arc::new(GrowingSource {
            calls: AtomicUsize::new(0),
        });
        let (on_update, mut updates) = updates_channel();
        let options = SyncOptions {
            poll_interval: Duration::from_millis(10),
            reconnect_backoff: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(50),
            ws_base_url: Some(format!("ws://{addr}")),
        };

        let sub = spawn_driver(source, None, 1, options, on_update);

        // Polling keeps delivering commits even while dials sit on the
        // unresponsive endpoint.
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), updates.recv())
                .await
                .expect("driver stalled while a push dial was hung")
                .expect("poll-driven projection");
        }

        // Teardown must not wait on the hung handshake either.
        tokio::time::timeout(Duration::from_secs(1), sub.unsubscribe_and_wait())
            .await
            .expect("unsubscribe hung behind the push dial");
    }

    #[tokio::test]
    async fn test_listener_loss_falls_back_to_polling() {
        let source = Arc::new(GrowingSource {
            calls: AtomicUsize::new(0),
        });
        let (on_update, mut updates) = updates_channel();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let listener = QueueListener::from_channel(events_rx);
        events_tx
            .send(ListenerEvent::State(ConnectionState::Open))
            .unwrap();

        let options = SyncOptions {
            poll_interval: Duration::from_millis(10),
            ..test_options()
        };
        let sub = spawn_driver(source, Some(listener), 1, options, on_update);

        updates.recv().await.expect("initial projection");

        events_tx
            .send(ListenerEvent::State(ConnectionState::Errored))
            .unwrap();

        // Timed polling keeps the queue moving without any push signal.
        updates.recv().await.expect("poll-driven projection");

        sub.unsubscribe_and_wait().await;
    }
}

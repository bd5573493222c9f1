//! Snapshot reconciliation state machine.
//!
//! This is the only place with refresh policy. Push signals carry no
//! payload, so the reconciler's whole job is deciding *when* to pull a
//! fresh snapshot and which completed pulls are allowed to commit:
//!
//! - At most one fetch is in flight per event. Signals that arrive during
//!   an in-flight fetch collapse into a single follow-up fetch
//!   (edge-triggered), so bursty signaling never amplifies into a request
//!   storm.
//! - Every fetch carries a monotonically increasing sequence number. A
//!   completion at or below the last committed sequence is discarded, so a
//!   slow fetch can never overwrite newer data.
//! - While degraded (a fetch failed, or the push connection is down) the
//!   driver's fixed-interval ticks stand in for signals.
//!
//! The type is deliberately synchronous: callers feed it events and execute
//! the [`Action`]s it returns. All timing and I/O lives in
//! [`sync`](crate::sync).

use crate::listener::ConnectionState;
use crate::queue::QueueSnapshot;

/// Where the reconciler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Created, nothing fetched yet.
    Idle,
    /// A fetch is in flight.
    Refreshing,
    /// Committed and trusting push signals.
    Synced,
    /// Showing the last committed snapshot; relying on timed polling.
    Degraded,
    /// Torn down. Terminal.
    Closed,
}

/// What the caller must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Start a fetch tagged with this sequence number.
    Fetch(u64),
}

/// Result of feeding a completed fetch back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// A new snapshot was committed; observers should be notified.
    pub committed: bool,
    pub action: Action,
}

#[derive(Debug)]
pub struct Reconciler {
    phase: SyncPhase,
    next_seq: u64,
    committed_seq: Option<u64>,
    inflight: Option<u64>,
    signal_pending: bool,
    push_healthy: bool,
    snapshot: Option<QueueSnapshot>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            next_seq: 1,
            committed_seq: None,
            inflight: None,
            signal_pending: false,
            // Pessimistic until the listener reports Open; keeps us polling
            // if the initial dial never succeeds.
            push_healthy: false,
            snapshot: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// The last committed snapshot. Stays available while degraded.
    pub fn snapshot(&self) -> Option<&QueueSnapshot> {
        self.snapshot.as_ref()
    }

    fn begin_fetch(&mut self) -> Action {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.inflight = Some(seq);
        self.phase = SyncPhase::Refreshing;
        Action::Fetch(seq)
    }

    /// Kick off the initial fetch. Only valid once, from `Idle`.
    pub fn start(&mut self) -> Action {
        match self.phase {
            SyncPhase::Idle => self.begin_fetch(),
            _ => Action::None,
        }
    }

    /// A push signal arrived: server state may have changed.
    pub fn on_signal(&mut self) -> Action {
        match self.phase {
            SyncPhase::Synced | SyncPhase::Degraded => self.begin_fetch(),
            SyncPhase::Refreshing => {
                // Absorbed, not queued. One follow-up at most.
                self.signal_pending = true;
                Action::None
            }
            SyncPhase::Idle | SyncPhase::Closed => Action::None,
        }
    }

    /// Fixed-interval tick from the driver. Only acts as a refresh trigger
    /// while push signals cannot be trusted.
    pub fn on_tick(&mut self) -> Action {
        match self.phase {
            SyncPhase::Degraded => self.begin_fetch(),
            SyncPhase::Synced if !self.push_healthy => self.begin_fetch(),
            _ => Action::None,
        }
    }

    /// The push connection changed state.
    pub fn on_connection(&mut self, state: ConnectionState) -> Action {
        match state {
            ConnectionState::Open => {
                self.push_healthy = true;
                // Frames may have been missed while down; treat the reopen
                // itself as a change hint.
                self.on_signal()
            }
            ConnectionState::Closed | ConnectionState::Errored => {
                self.push_healthy = false;
                if self.phase == SyncPhase::Synced {
                    self.phase = SyncPhase::Degraded;
                }
                Action::None
            }
            ConnectionState::Connecting => Action::None,
        }
    }

    /// A fetch completed successfully.
    pub fn on_fetch_ok(&mut self, seq: u64, snapshot: QueueSnapshot) -> FetchOutcome {
        if self.phase == SyncPhase::Closed {
            return FetchOutcome {
                committed: false,
                action: Action::None,
            };
        }

        // Ordering guard: never regress to an older snapshot.
        if self.committed_seq.is_some_and(|c| seq <= c) {
            tracing::debug!(seq, "discarding stale fetch completion");
            return FetchOutcome {
                committed: false,
                action: Action::None,
            };
        }

        self.snapshot = Some(snapshot);
        self.committed_seq = Some(seq);

        let action = if self.inflight == Some(seq) {
            self.inflight = None;
            if self.signal_pending {
                self.signal_pending = false;
                self.begin_fetch()
            } else {
                self.phase = if self.push_healthy {
                    SyncPhase::Synced
                } else {
                    SyncPhase::Degraded
                };
                Action::None
            }
        } else {
            Action::None
        };

        FetchOutcome {
            committed: true,
            action,
        }
    }

    /// A fetch failed. The last committed snapshot stays on display and the
    /// driver's ticks take over.
    pub fn on_fetch_err(&mut self, seq: u64) -> Action {
        if self.phase == SyncPhase::Closed {
            return Action::None;
        }

        if self.inflight == Some(seq) {
            self.inflight = None;
            self.signal_pending = false;
            self.phase = SyncPhase::Degraded;
        }
        Action::None
    }

    /// Explicit teardown. Everything after this is a no-op; in-flight
    /// completions are discarded on arrival.
    pub fn close(&mut self) {
        self.phase = SyncPhase::Closed;
        self.inflight = None;
        self.signal_pending = false;
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

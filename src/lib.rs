//! # Rotation
//!
//! Client-side synchronization for a live karaoke song-request queue.
//!
//! The backend owns the queue and broadcasts a content-free WebSocket frame
//! whenever it changes; clients pull full snapshots over REST. This crate
//! turns that into something dependable:
//!
//! - [`api::ApiClient`] pulls snapshots and submits requests.
//! - [`listener::QueueListener`] surfaces push frames as opaque change hints.
//! - [`reconciler::Reconciler`] decides when to refresh: coalesced signals,
//!   sequence-numbered commits, timed polling while degraded.
//! - [`projection::project`] derives the current singer and the upcoming
//!   rotation from the committed snapshot.
//! - [`observer::QueueObserver`] packages it all for the two viewer roles;
//!   only the host gets the command surface.

pub mod api;
pub mod config;
pub mod listener;
pub mod observer;
pub mod projection;
pub mod queue;
pub mod reconciler;
pub mod session;
pub mod sync;

pub use api::{ApiClient, ApiError, SnapshotSource};
pub use config::Config;
pub use listener::{ConnectionState, ListenerEvent, QueueListener};
pub use observer::{QueueCommands, QueueObserver};
pub use projection::{project, Projection};
pub use queue::{InvariantViolation, QueueEntry, QueueSnapshot, RequestStatus, Song};
pub use reconciler::{Reconciler, SyncPhase};
pub use session::Session;
pub use sync::{subscribe, Subscription, SyncOptions};

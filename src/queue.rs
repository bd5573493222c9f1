use serde::{Deserialize, Serialize};

/// A server-side queue invariant this client relies on was broken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("{count} entries marked playing, expected at most 1")]
    MultiplePlaying { count: usize },

    #[error("pending entry {pending_id} (order {pending_order}) precedes playing entry {playing_id} (order {playing_order})")]
    PendingBeforePlaying {
        pending_id: i64,
        pending_order: i64,
        playing_id: i64,
        playing_order: i64,
    },
}

/// A song in the catalog. Reference data owned by the backend; the client
/// never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub id: i64,
    pub artist: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
    /// Comma-separated tags as stored server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre_tags: Option<String>,
}

/// Lifecycle of a song request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Playing,
    Played,
    Skipped,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Playing => write!(f, "playing"),
            RequestStatus::Played => write!(f, "played"),
            RequestStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One song request in an event's queue. Owned by the server; the client
/// holds a read-only cached copy inside a [`QueueSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub song_id: i64,
    pub requester_name: String,
    pub status: RequestStatus,
    pub play_order: i64,
    /// Populated when the backend embeds the catalog record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song: Option<Song>,
}

/// A complete, point-in-time copy of an event's queue.
///
/// Entries are held in play-order ascending, ties broken by entry id.
/// Snapshots are replaced wholesale on every successful fetch and never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    entries: Vec<QueueEntry>,
}

impl QueueSnapshot {
    /// Build a snapshot from entries in any order.
    pub fn from_entries(mut entries: Vec<QueueEntry>) -> Self {
        entries.sort_by_key(|e| (e.play_order, e.id));
        Self { entries }
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry currently being performed, if any.
    pub fn current(&self) -> Option<&QueueEntry> {
        self.entries
            .iter()
            .find(|e| e.status == RequestStatus::Playing)
    }

    /// Verify the server-side invariants this client relies on: at most one
    /// entry is playing, and no pending entry precedes a playing one in
    /// play-order.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let playing = self
            .entries
            .iter()
            .filter(|e| e.status == RequestStatus::Playing)
            .count();
        if playing > 1 {
            return Err(InvariantViolation::MultiplePlaying { count: playing });
        }

        if let Some(current) = self.current() {
            for entry in &self.entries {
                if entry.status == RequestStatus::Pending && entry.play_order < current.play_order {
                    return Err(InvariantViolation::PendingBeforePlaying {
                        pending_id: entry.id,
                        pending_order: entry.play_order,
                        playing_id: current.id,
                        playing_order: current.play_order,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, status: RequestStatus, play_order: i64) -> QueueEntry {
        QueueEntry {
            id,
            song_id: id * 100,
            requester_name: format!("singer-{id}"),
            status,
            play_order,
            song: None,
        }
    }

    #[test]
    fn test_entries_sorted_by_play_order() {
        let snapshot = QueueSnapshot::from_entries(vec![
            entry(3, RequestStatus::Pending, 5),
            entry(1, RequestStatus::Pending, 2),
            entry(2, RequestStatus::Pending, 4),
        ]);

        let ids: Vec<i64> = snapshot.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_play_order_ties_break_by_id() {
        let snapshot = QueueSnapshot::from_entries(vec![
            entry(9, RequestStatus::Pending, 1),
            entry(4, RequestStatus::Pending, 1),
        ]);

        let ids: Vec<i64> = snapshot.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn test_current_finds_playing_entry() {
        let snapshot = QueueSnapshot::from_entries(vec![
            entry(1, RequestStatus::Played, 0),
            entry(2, RequestStatus::Playing, 1),
            entry(3, RequestStatus::Pending, 2),
        ]);

        assert_eq!(snapshot.current().map(|e| e.id), Some(2));
    }

    #[test]
    fn test_current_none_when_nothing_playing() {
        let snapshot = QueueSnapshot::from_entries(vec![entry(1, RequestStatus::Pending, 0)]);
        assert!(snapshot.current().is_none());
    }

    #[test]
    fn test_invariants_hold_for_well_formed_queue() {
        let snapshot = QueueSnapshot::from_entries(vec![
            entry(1, RequestStatus::Played, 0),
            entry(2, RequestStatus::Playing, 1),
            entry(3, RequestStatus::Pending, 2),
            entry(4, RequestStatus::Pending, 3),
        ]);

        assert!(snapshot.check_invariants().is_ok());
    }

    #[test]
    fn test_invariants_reject_two_playing() {
        let snapshot = QueueSnapshot::from_entries(vec![
            entry(1, RequestStatus::Playing, 0),
            entry(2, RequestStatus::Playing, 1),
        ]);

        assert_eq!(
            snapshot.check_invariants(),
            Err(InvariantViolation::MultiplePlaying { count: 2 })
        );
    }

    #[test]
    fn test_invariants_reject_pending_before_playing() {
        let snapshot = QueueSnapshot::from_entries(vec![
            entry(1, RequestStatus::Pending, 0),
            entry(2, RequestStatus::Playing, 1),
        ]);

        assert_eq!(
            snapshot.check_invariants(),
            Err(InvariantViolation::PendingBeforePlaying {
                pending_id: 1,
                pending_order: 0,
                playing_id: 2,
                playing_order: 1,
            })
        );
    }

    #[test]
    fn test_violation_message_names_the_offenders() {
        let violation = InvariantViolation::MultiplePlaying { count: 3 };
        assert_eq!(violation.to_string(), "3 entries marked playing, expected at most 1");
    }

    #[test]
    fn test_empty_snapshot_is_valid() {
        let snapshot = QueueSnapshot::default();
        assert!(snapshot.is_empty());
        assert!(snapshot.check_invariants().is_ok());
    }

    #[test]
    fn test_status_parses_from_wire_format() {
        let status: RequestStatus = serde_json::from_str("\"playing\"").unwrap();
        assert_eq!(status, RequestStatus::Playing);
        assert_eq!(status.to_string(), "playing");
    }

    #[test]
    fn test_entry_decodes_without_embedded_song() {
        let entry: QueueEntry = serde_json::from_str(
            r#"{"id": 7, "song_id": 12, "requester_name": "Ana", "status": "pending", "play_order": 3}"#,
        )
        .unwrap();

        assert_eq!(entry.id, 7);
        assert_eq!(entry.status, RequestStatus::Pending);
        assert!(entry.song.is_none());
    }
}

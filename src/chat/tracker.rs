//! Running-turn bookkeeping.
//!
//! The tracker keeps a per-session list of turn snapshots, capped so
//! long-lived sessions do not accumulate finished entries, and lets the
//! session registry terminate every running turn of a dropped session.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Metadata snapshot of one turn.
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    pub stream_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub done: bool,
}

struct TrackedTurn {
    snapshot: TurnSnapshot,
    cancel: CancellationToken,
}

/// Per-session registry of running turns.
pub struct TurnTracker {
    inner: Mutex<HashMap<String, Vec<TrackedTurn>>>,
    /// Maximum entries kept per session; finished turns are evicted first.
    cap: usize,
}

const DEFAULT_TRACKED_PER_SESSION: usize = 10;

static DEFAULT_TRACKER: LazyLock<Arc<TurnTracker>> =
    LazyLock::new(|| Arc::new(TurnTracker::new(DEFAULT_TRACKED_PER_SESSION)));

/// The process-wide turn tracker.
pub fn default_tracker() -> Arc<TurnTracker> {
    DEFAULT_TRACKER.clone()
}

impl TurnTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// Track a starting turn. Newest entries sit at the front.
    pub fn register(&self, session_id: &str, stream_id: &str, cancel: CancellationToken) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let turns = inner.entry(session_id.to_string()).or_default();
        turns.insert(
            0,
            TrackedTurn {
                snapshot: TurnSnapshot {
                    stream_id: stream_id.to_string(),
                    session_id: session_id.to_string(),
                    started_at: Utc::now(),
                    done: false,
                },
                cancel,
            },
        );
        if turns.len() > self.cap {
            let cap = self.cap;
            let mut kept = 0usize;
            turns.retain(|turn| {
                if kept < cap || !turn.snapshot.done {
                    kept += 1;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Mark a turn finished.
    pub fn finish(&self, session_id: &str, stream_id: &str) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if let Some(turns) = inner.get_mut(session_id)
            && let Some(turn) = turns
                .iter_mut()
                .find(|t| t.snapshot.stream_id == stream_id)
        {
            turn.snapshot.done = true;
        }
    }

    /// Snapshots of one session's tracked turns, newest first.
    pub fn snapshots(&self, session_id: &str) -> Vec<TurnSnapshot> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner
            .get(session_id)
            .map(|turns| turns.iter().map(|t| t.snapshot.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshots across all sessions.
    pub fn all(&self) -> Vec<TurnSnapshot> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner
            .values()
            .flat_map(|turns| turns.iter().map(|t| t.snapshot.clone()))
            .collect()
    }

    /// Cancel every running turn of a session and forget its entries.
    pub fn terminate_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if let Some(turns) = inner.remove(session_id) {
            for turn in turns {
                if !turn.snapshot.done {
                    turn.cancel.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_finish_turns() {
        let tracker = TurnTracker::new(10);
        tracker.register("s1", "t1", CancellationToken::new());
        tracker.register("s1", "t2", CancellationToken::new());

        let snapshots = tracker.snapshots("s1");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].stream_id, "t2", "newest first");
        assert!(!snapshots[0].done);

        tracker.finish("s1", "t2");
        assert!(tracker.snapshots("s1")[0].done);
    }

    #[test]
    fn cap_evicts_finished_entries_only() {
        let tracker = TurnTracker::new(2);
        for i in 0..4 {
            tracker.register("s1", &format!("t{i}"), CancellationToken::new());
            tracker.finish("s1", &format!("t{i}"));
        }
        tracker.register("s1", "live", CancellationToken::new());

        let snapshots = tracker.snapshots("s1");
        assert!(snapshots.len() <= 3);
        assert!(snapshots.iter().any(|s| s.stream_id == "live"));
    }

    #[test]
    fn terminate_session_cancels_running_turns() {
        let tracker = TurnTracker::new(10);
        let token = CancellationToken::new();
        tracker.register("s1", "t1", token.clone());
        tracker.register("s2", "t2", CancellationToken::new());

        tracker.terminate_session("s1");
        assert!(token.is_cancelled());
        assert!(tracker.snapshots("s1").is_empty());
        assert_eq!(tracker.snapshots("s2").len(), 1);
    }
}

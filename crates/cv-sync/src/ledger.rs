use cv_core::SyncAction;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct LedgerEntry {
    hash: String,
    action: SyncAction,
    at: Instant,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<String, LedgerEntry>,
    in_flight: HashSet<String>,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

/// Shared bookkeeping between the push and pull directions: per-path write
/// locks, paths the reconciler is currently writing, and the last content
/// hash seen for each path.
pub struct SyncLedger {
    state: StdMutex<LedgerState>,
    suppression_window: Duration,
}

impl SyncLedger {
    pub fn new(suppression_window: Duration) -> Self {
        Self {
            state: StdMutex::new(LedgerState::default()),
            suppression_window,
        }
    }

    pub fn suppression_window(&self) -> Duration {
        self.suppression_window
    }

    /// Serializes every read and write of one relative path. Locks nobody
    /// holds or waits on are pruned here, so the map tracks only live paths.
    pub async fn lock_path(&self, relative_path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut state = self.state();
            state.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            state
                .locks
                .entry(relative_path.to_string())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn begin_write(self: &Arc<Self>, relative_path: &str) -> InFlightWrite {
        self.state().in_flight.insert(relative_path.to_string());
        InFlightWrite {
            ledger: Arc::clone(self),
            relative_path: relative_path.to_string(),
        }
    }

    pub fn is_in_flight(&self, relative_path: &str) -> bool {
        self.state().in_flight.contains(relative_path)
    }

    pub fn record(&self, relative_path: &str, hash: &str, action: SyncAction) {
        self.state().entries.insert(
            relative_path.to_string(),
            LedgerEntry {
                hash: hash.to_string(),
                action,
                at: Instant::now(),
            },
        );
    }

    pub fn forget(&self, relative_path: &str) {
        self.state().entries.remove(relative_path);
    }

    pub fn last_hash(&self, relative_path: &str) -> Option<String> {
        self.state()
            .entries
            .get(relative_path)
            .map(|entry| entry.hash.clone())
    }

    /// True when pushing `hash` would only echo a pull: the path is being
    /// written right now, or it was just written with this exact content.
    pub fn is_echo(&self, relative_path: &str, hash: &str) -> bool {
        let state = self.state();
        if state.in_flight.contains(relative_path) {
            return true;
        }
        matches!(
            state.entries.get(relative_path),
            Some(entry) if entry.hash == hash
                && entry.action == SyncAction::Downloaded
                && entry.at.elapsed() < self.suppression_window
        )
    }

    /// Like [`SyncLedger::is_echo`], but also treats re-uploading the last
    /// uploaded content as a no-op.
    pub fn should_skip_push(&self, relative_path: &str, hash: &str) -> bool {
        if self.is_echo(relative_path, hash) {
            return true;
        }
        matches!(
            self.state().entries.get(relative_path),
            Some(entry) if entry.hash == hash && entry.action == SyncAction::Uploaded
        )
    }

    /// Number of path locks currently tracked.
    pub fn tracked_locks(&self) -> usize {
        self.state().locks.len()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SyncLedger {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPRESSION_WINDOW)
    }
}

/// Marks a path as being written by the reconciler until dropped.
pub struct InFlightWrite {
    ledger: Arc<SyncLedger>,
    relative_path: String,
}

impl Drop for InFlightWrite {
    fn drop(&mut self) {
        self.ledger.state().in_flight.remove(&self.relative_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_marker_clears_on_drop() {
        let ledger = Arc::new(SyncLedger::default());
        {
            let _write = ledger.begin_write("src/app.py");
            assert!(ledger.is_in_flight("src/app.py"));
            assert!(ledger.should_skip_push("src/app.py", "anything"));
        }
        assert!(!ledger.is_in_flight("src/app.py"));
    }

    #[test]
    fn downloaded_content_is_suppressed_only_inside_window() {
        let ledger = SyncLedger::new(Duration::from_millis(0));
        ledger.record("a.txt", "h1", SyncAction::Downloaded);
        assert!(!ledger.should_skip_push("a.txt", "h1"));

        let ledger = SyncLedger::new(Duration::from_secs(60));
        ledger.record("a.txt", "h1", SyncAction::Downloaded);
        assert!(ledger.should_skip_push("a.txt", "h1"));
        assert!(!ledger.should_skip_push("a.txt", "h2"));
    }

    #[test]
    fn unchanged_upload_is_a_no_op() {
        let ledger = SyncLedger::default();
        ledger.record("a.txt", "h1", SyncAction::Uploaded);
        assert!(!ledger.is_echo("a.txt", "h1"));
        assert!(ledger.should_skip_push("a.txt", "h1"));
        assert!(!ledger.should_skip_push("a.txt", "h2"));
        ledger.forget("a.txt");
        assert!(!ledger.should_skip_push("a.txt", "h1"));
        assert_eq!(ledger.last_hash("a.txt"), None);
    }

    #[tokio::test]
    async fn path_lock_serializes_same_path() {
        let ledger = Arc::new(SyncLedger::default());
        let guard = ledger.lock_path("a.txt").await;
        let contender = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let _guard = ledger.lock_path("a.txt").await;
            })
        };
        let other = ledger.lock_path("b.txt").await;
        drop(other);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.expect("contender joins");
    }

    #[tokio::test]
    async fn released_path_locks_are_pruned() {
        let ledger = SyncLedger::default();
        for index in 0..50 {
            let _guard = ledger.lock_path(&format!("file-{index}.txt")).await;
        }
        assert_eq!(ledger.tracked_locks(), 1);

        let held = ledger.lock_path("held.txt").await;
        let other = ledger.lock_path("other.txt").await;
        assert_eq!(ledger.tracked_locks(), 2);
        drop(held);
        drop(other);
        let _next = ledger.lock_path("next.txt").await;
        assert_eq!(ledger.tracked_locks(), 1);
    }
}

use crate::{ReconcileError, Reconciler};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

const WATCH_DEBOUNCE_MS: u64 = 300;
const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub channel_capacity: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(WATCH_DEBOUNCE_MS),
            channel_capacity: WATCH_CHANNEL_CAPACITY,
        }
    }
}

/// Running filesystem watch. Dropping the handle stops it too, but
/// [`WatchHandle::stop`] waits for the loop to finish its current batch.
pub struct WatchHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("watch_join_failed: {err}");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Watches the reconciler's root and pushes created or modified files after
/// a quiet period. Must be called inside a tokio runtime.
pub fn watch(
    reconciler: Arc<Reconciler>,
    options: WatchOptions,
) -> Result<WatchHandle, ReconcileError> {
    let (event_tx, event_rx) = mpsc::channel::<PathBuf>(options.channel_capacity.max(1));
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                debug!("watch_event_error: {err}");
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        // Runs on the notify thread, outside the runtime, so blocking is fine.
        for path in event.paths {
            if event_tx.blocking_send(path).is_err() {
                return;
            }
        }
    })?;
    watcher.watch(reconciler.root(), RecursiveMode::Recursive)?;
    info!("watch_started: {}", reconciler.root().display());

    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(watch_loop(watcher, reconciler, event_rx, stop_rx, options));
    Ok(WatchHandle {
        stop: Some(stop_tx),
        task: Some(task),
    })
}

async fn watch_loop(
    watcher: RecommendedWatcher,
    reconciler: Arc<Reconciler>,
    mut event_rx: mpsc::Receiver<PathBuf>,
    mut stop_rx: oneshot::Receiver<()>,
    options: WatchOptions,
) {
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    // Set by the first accepted path of a batch; filtered events never move it.
    let mut flush_at: Option<Instant> = None;
    loop {
        let deadline = flush_at.unwrap_or_else(|| Instant::now() + options.debounce);
        tokio::select! {
            _ = &mut stop_rx => break,
            received = event_rx.recv() => {
                let Some(path) = received else { break };
                if reconciler.is_ignored(&path) {
                    continue;
                }
                if let Some(relative) = reconciler.relative_path(&path) {
                    if reconciler.ledger().is_in_flight(&relative) {
                        continue;
                    }
                }
                pending.insert(path);
                if flush_at.is_none() {
                    flush_at = Some(Instant::now() + options.debounce);
                }
            }
            _ = sleep_until(deadline), if flush_at.is_some() => {
                flush_at = None;
                let batch = std::mem::take(&mut pending);
                push_batch(&reconciler, batch).await;
            }
        }
    }
    // Receiver first: a notify thread blocked on a full channel must wake
    // before the watcher shuts it down.
    drop(event_rx);
    drop(watcher);
    info!("watch_stopped: {}", reconciler.root().display());
}

async fn push_batch(reconciler: &Reconciler, batch: BTreeSet<PathBuf>) {
    for path in batch {
        if !path.is_file() {
            continue;
        }
        match reconciler.sync_file(&path).await {
            Ok(record) => debug!(
                "watch_sync: {} {}",
                record.relative_path, record.last_action
            ),
            Err(ReconcileError::NotText(relative)) => debug!("watch_not_text: {relative}"),
            Err(err) => warn!("watch_sync_failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileTransfer, TransferError};
    use async_trait::async_trait;
    use cv_core::{FileAction, FileChange};
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransfer {
        uploads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FileTransfer for RecordingTransfer {
        async fn upload(&self, relative_path: &str, _content: &str) -> Result<(), TransferError> {
            self.uploads
                .lock()
                .expect("uploads lock")
                .push(relative_path.to_string());
            Ok(())
        }
    }

    impl RecordingTransfer {
        fn uploaded(&self, path: &str) -> bool {
            self.uploads
                .lock()
                .expect("uploads lock")
                .iter()
                .any(|uploaded| uploaded == path)
        }
    }

    async fn wait_for_upload(transfer: &RecordingTransfer, path: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if transfer.uploaded(path) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn modified_file_is_pushed_after_debounce() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transfer = Arc::new(RecordingTransfer::default());
        let reconciler = Arc::new(Reconciler::load(dir.path(), transfer.clone()));
        let handle = watch(
            Arc::clone(&reconciler),
            WatchOptions {
                debounce: Duration::from_millis(50),
                ..WatchOptions::default()
            },
        )
        .expect("watch");

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(dir.path().join("app.py"), "print('hi')\n").expect("write");
        fs::write(dir.path().join("trace.log"), "noise\n").expect("write log");

        assert!(wait_for_upload(&transfer, "app.py").await);
        handle.stop().await;
        assert!(!transfer.uploaded("trace.log"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ignored_file_churn_does_not_starve_pending_push() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transfer = Arc::new(RecordingTransfer::default());
        let reconciler = Arc::new(Reconciler::load(dir.path(), transfer.clone()));
        let handle = watch(
            Arc::clone(&reconciler),
            WatchOptions {
                debounce: Duration::from_millis(100),
                ..WatchOptions::default()
            },
        )
        .expect("watch");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let running = Arc::new(AtomicBool::new(true));
        let churn = {
            let running = Arc::clone(&running);
            let log = dir.path().join("server.log");
            std::thread::spawn(move || {
                let mut line = 0u32;
                while running.load(Ordering::Relaxed) {
                    line += 1;
                    let _ = fs::write(&log, format!("request {line}\n"));
                    std::thread::sleep(std::time::Duration::from_millis(30));
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(dir.path().join("app.py"), "print('hi')\n").expect("write");

        let pushed = wait_for_upload(&transfer, "app.py").await;
        running.store(false, Ordering::Relaxed);
        churn.join().expect("churn thread");
        handle.stop().await;
        assert!(pushed);
        assert!(!transfer.uploaded("server.log"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pulled_file_is_not_pushed_back_by_watcher() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transfer = Arc::new(RecordingTransfer::default());
        let reconciler = Arc::new(Reconciler::load(dir.path(), transfer.clone()));
        let handle = watch(
            Arc::clone(&reconciler),
            WatchOptions {
                debounce: Duration::from_millis(50),
                ..WatchOptions::default()
            },
        )
        .expect("watch");
        tokio::time::sleep(Duration::from_millis(100)).await;

        reconciler
            .apply_file_change(&FileChange {
                path: "gen/model.py".to_string(),
                action: FileAction::Create,
                content: Some("class Model: ...\n".to_string()),
                is_base64: false,
            })
            .await
            .expect("pull");
        tokio::time::sleep(Duration::from_millis(500)).await;

        fs::write(dir.path().join("local.py"), "x = 1\n").expect("local edit");
        assert!(wait_for_upload(&transfer, "local.py").await);
        handle.stop().await;
        assert!(!transfer.uploaded("gen/model.py"));
    }
}

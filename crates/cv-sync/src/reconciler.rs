use crate::{FileTransfer, IgnoreRuleset, ReconcileError, SyncLedger};
use cv_core::{content_hash, FileAction, FileChange, SyncAction, SyncedFileRecord};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Written(SyncedFileRecord),
    Deleted { relative_path: String },
    AlreadyAbsent { relative_path: String },
}

impl PullOutcome {
    pub fn relative_path(&self) -> &str {
        match self {
            PullOutcome::Written(record) => &record.relative_path,
            PullOutcome::Deleted { relative_path } | PullOutcome::AlreadyAbsent { relative_path } => {
                relative_path
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushMode {
    /// Explicit full pass: re-upload everything except pull echoes.
    Full,
    /// Watch-driven: also skip content identical to the last upload.
    Incremental,
}

/// Keeps the workspace tree and the remote workspace in step, in both
/// directions, through one ignore ruleset and one ledger.
pub struct Reconciler {
    root: PathBuf,
    rules: IgnoreRuleset,
    ledger: Arc<SyncLedger>,
    transfer: Arc<dyn FileTransfer>,
}

impl Reconciler {
    pub fn new(
        root: impl Into<PathBuf>,
        rules: IgnoreRuleset,
        ledger: Arc<SyncLedger>,
        transfer: Arc<dyn FileTransfer>,
    ) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            rules,
            ledger,
            transfer,
        }
    }

    /// Reads the ignore ruleset from `root` once; later edits to the ignore
    /// file need a new reconciler.
    pub fn load(root: impl Into<PathBuf>, transfer: Arc<dyn FileTransfer>) -> Self {
        let root = root.into();
        let rules = IgnoreRuleset::load(&root);
        Self::new(root, rules, Arc::new(SyncLedger::default()), transfer)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &IgnoreRuleset {
        &self.rules
    }

    pub fn ledger(&self) -> &Arc<SyncLedger> {
        &self.ledger
    }

    /// Root-relative path with `/` separators, or `None` outside the root.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let stripped = match absolute.strip_prefix(&self.root) {
            Ok(stripped) => stripped.to_path_buf(),
            Err(_) => {
                let canonical = absolute.canonicalize().ok()?;
                canonical.strip_prefix(&self.root).ok()?.to_path_buf()
            }
        };
        join_components(&stripped)
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        match self.relative_path(path) {
            Some(relative) => {
                let is_dir = self.root.join(&relative).is_dir();
                self.rules.is_ignored_entry(Path::new(&relative), is_dir)
            }
            None => true,
        }
    }

    /// Uploads every non-ignored text file under `dir` and returns the
    /// root-relative paths actually uploaded. Per-file failures are logged
    /// and skipped.
    pub async fn sync_directory(&self, dir: &Path) -> Vec<String> {
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        };
        let candidates = self.collect_candidates(&dir);
        let mut uploaded = Vec::new();
        for (absolute, relative) in candidates {
            match self.push(&absolute, relative, PushMode::Full).await {
                Ok(record) if record.last_action == SyncAction::Uploaded => {
                    uploaded.push(record.relative_path);
                }
                Ok(record) => debug!("sync_skipped: {}", record.relative_path),
                Err(ReconcileError::NotText(relative)) => debug!("sync_not_text: {relative}"),
                Err(err) => warn!("sync_file_failed: {err}"),
            }
        }
        info!("sync_directory: {} uploaded from {}", uploaded.len(), dir.display());
        uploaded
    }

    /// Single-file push used by the watcher and by explicit file syncs.
    pub async fn sync_file(&self, path: &Path) -> Result<SyncedFileRecord, ReconcileError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let relative = self
            .relative_path(&absolute)
            .ok_or_else(|| ReconcileError::OutsideWorkspace(absolute.display().to_string()))?;
        if self.rules.is_ignored(Path::new(&relative)) {
            return Ok(SyncedFileRecord {
                relative_path: relative,
                content_hash: String::new(),
                last_action: SyncAction::Skipped,
            });
        }
        self.push(&absolute, relative, PushMode::Incremental).await
    }

    /// Applies a server-driven change. Writes overwrite unconditionally: the
    /// last writer wins and local edits racing a pull are not detected.
    pub async fn apply_file_change(
        &self,
        change: &FileChange,
    ) -> Result<PullOutcome, ReconcileError> {
        let relative = sanitize_relative(&change.path)?;
        let absolute = self.root.join(&relative);
        let _guard = self.ledger.lock_path(&relative).await;
        self.ensure_confined(&relative, &absolute).await?;
        match change.action {
            FileAction::Create | FileAction::Update => {
                let content = change.content.as_deref().unwrap_or_default();
                if is_symlink(&absolute).await {
                    return Err(ReconcileError::OutsideWorkspace(relative));
                }
                let _write = self.ledger.begin_write(&relative);
                if let Some(parent) = absolute.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| ReconcileError::io(parent, err))?;
                    self.ensure_confined(&relative, &absolute).await?;
                }
                tokio::fs::write(&absolute, content.as_bytes())
                    .await
                    .map_err(|err| ReconcileError::io(&absolute, err))?;
                let hash = content_hash(content.as_bytes());
                self.ledger.record(&relative, &hash, SyncAction::Downloaded);
                info!("pull_{}: {relative}", change.action);
                Ok(PullOutcome::Written(SyncedFileRecord {
                    relative_path: relative,
                    content_hash: hash,
                    last_action: SyncAction::Downloaded,
                }))
            }
            FileAction::Delete => match tokio::fs::remove_file(&absolute).await {
                Ok(()) => {
                    self.ledger.forget(&relative);
                    info!("pull_delete: {relative}");
                    Ok(PullOutcome::Deleted {
                        relative_path: relative,
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Ok(PullOutcome::AlreadyAbsent {
                        relative_path: relative,
                    })
                }
                Err(err) => Err(ReconcileError::io(&absolute, err)),
            },
        }
    }

    /// Resolves the nearest existing ancestor of `absolute` through any
    /// symlinks and rejects it unless it is still under the root.
    async fn ensure_confined(&self, relative: &str, absolute: &Path) -> Result<(), ReconcileError> {
        let mut ancestor = absolute.parent();
        while let Some(dir) = ancestor {
            match tokio::fs::canonicalize(dir).await {
                Ok(resolved) if resolved.starts_with(&self.root) => return Ok(()),
                Ok(resolved) => {
                    warn!("pull_escape: {relative} resolves to {}", resolved.display());
                    return Err(ReconcileError::OutsideWorkspace(relative.to_string()));
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    ancestor = dir.parent();
                }
                Err(err) => return Err(ReconcileError::io(dir, err)),
            }
        }
        Err(ReconcileError::OutsideWorkspace(relative.to_string()))
    }

    fn collect_candidates(&self, dir: &Path) -> Vec<(PathBuf, String)> {
        let mut candidates = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_ignored(entry.path()));
        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("sync_walk_error: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = self.relative_path(entry.path()) else {
                continue;
            };
            candidates.push((entry.into_path(), relative));
        }
        candidates
    }

    async fn push(
        &self,
        absolute: &Path,
        relative: String,
        mode: PushMode,
    ) -> Result<SyncedFileRecord, ReconcileError> {
        let _guard = self.ledger.lock_path(&relative).await;
        let bytes = tokio::fs::read(absolute)
            .await
            .map_err(|err| ReconcileError::io(absolute, err))?;
        let content =
            String::from_utf8(bytes).map_err(|_| ReconcileError::NotText(relative.clone()))?;
        let hash = content_hash(content.as_bytes());
        let skip = match mode {
            PushMode::Full => self.ledger.is_echo(&relative, &hash),
            PushMode::Incremental => self.ledger.should_skip_push(&relative, &hash),
        };
        if skip {
            debug!("push_suppressed: {relative}");
            return Ok(SyncedFileRecord {
                relative_path: relative,
                content_hash: hash,
                last_action: SyncAction::Skipped,
            });
        }
        self.transfer.upload(&relative, &content).await?;
        self.ledger.record(&relative, &hash, SyncAction::Uploaded);
        debug!("push_uploaded: {relative}");
        Ok(SyncedFileRecord {
            relative_path: relative,
            content_hash: hash,
            last_action: SyncAction::Uploaded,
        })
    }
}

async fn is_symlink(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Accepts only plain relative paths that stay inside the workspace.
fn sanitize_relative(raw: &str) -> Result<String, ReconcileError> {
    let path = Path::new(raw);
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ReconcileError::OutsideWorkspace(raw.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(ReconcileError::OutsideWorkspace(raw.to_string()));
    }
    Ok(parts.join("/"))
}

fn join_components(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

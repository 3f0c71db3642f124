pub mod ignore_rules;
pub mod ledger;
pub mod reconciler;
pub mod watch;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

pub use ignore_rules::{IgnoreRuleset, BUILTIN_IGNORE_PATTERNS, PROJECT_IGNORE_FILES};
pub use ledger::{SyncLedger, DEFAULT_SUPPRESSION_WINDOW};
pub use reconciler::{PullOutcome, Reconciler};
pub use watch::{watch, WatchHandle, WatchOptions};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("transfer failed: {0}")]
    Failed(String),
}

/// Upstream side of the push direction.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload(&self, relative_path: &str, content: &str) -> Result<(), TransferError>;
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path escapes workspace: {0}")]
    OutsideWorkspace(String),
    #[error("not a text file: {0}")]
    NotText(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl ReconcileError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReconcileError::Io {
            path: path.into(),
            source,
        }
    }
}

//! Error taxonomy for the auto-commit engine.
//!
//! Internal components return `Result<T, ErrorKind>`; boundary code (CLI
//! entry points, background task loops) wraps these in `anyhow::Result`
//! with `.context(...)`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ErrorKind {
    // Configuration errors — surfaced to the caller, never retried.
    #[error("{0} is not a git work tree")]
    NotAGitRepo(String),
    #[error("{0} is already registered")]
    DuplicateRepo(String),
    #[error("{0} is not a registered repository")]
    UnknownRepo(String),
    #[error("invalid exclusion pattern: {0}")]
    InvalidPattern(String),

    // Transient git errors — retried once after 500ms within the worker phase.
    /// Duration elapsed, plus whatever stdout/stderr the child had written
    /// before it was killed.
    #[error("git command timed out after {0:?}")]
    GitTimeout(std::time::Duration, String, String),
    #[error("git lock held")]
    GitLockHeld,

    // Benign skips — logged at debug, worker returns to Idle.
    #[error("original branch is already a shadow branch")]
    AlreadyShadow,
    #[error("HEAD is detached")]
    DetachedHead,
    #[error("nothing staged to commit")]
    EmptyCommit,

    // Safety stops — file excluded from batch, event published, batch continues.
    #[error("secret suspected in file content")]
    SecretSuspected,
    #[error("sensitive path: {0}")]
    SensitivePath(String),

    // Hard failures — worker transitions to Degraded and pauses.
    #[error("git subcommand not in allow-list: {0}")]
    DisallowedGitCommand(String),
    #[error("store write failed: {0}")]
    StoreWriteFailed(String),
    #[error("working tree corrupted: {0}")]
    WorkingTreeCorrupted(String),

    // Concurrency guards.
    #[error("a commit is already in flight for this repository")]
    CommitInFlight,

    // Catch-all for git invocations that fail without a more specific kind.
    #[error("git error: {0}")]
    GitFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ErrorKind {
    /// Kinds that M1 treats as a benign skip back to `Idle`.
    pub fn is_benign_skip(&self) -> bool {
        matches!(
            self,
            ErrorKind::AlreadyShadow | ErrorKind::DetachedHead | ErrorKind::EmptyCommit
        )
    }

    /// Kinds that warrant one retry after 500ms before degrading.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::GitTimeout(..) | ErrorKind::GitLockHeld)
    }

    /// Kinds that drive the worker to `Degraded`.
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::DisallowedGitCommand(_)
                | ErrorKind::StoreWriteFailed(_)
                | ErrorKind::WorkingTreeCorrupted(_)
        )
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(e.to_string())
    }
}

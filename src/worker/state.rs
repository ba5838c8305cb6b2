//! `RepoRuntimeState` and the M1 phase enum (spec §3, §4.6).

use crate::correlator::CorrelationMatch;
use crate::watcher::FileEvent;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Debouncing,
    Classifying,
    Correlating,
    Committing,
    Persisting,
    Cooldown,
    Degraded,
}

/// A coalesced set of `FileEvent`s belonging to one repository and one
/// debounce window. Covers exactly one repository; emission is gated by
/// the throttle clock and by the absence of another in-flight commit.
#[derive(Debug, Default)]
pub struct SaveBatch {
    pub events: Vec<FileEvent>,
}

impl SaveBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn push(&mut self, event: FileEvent) {
        self.events.push(event);
    }

    pub fn take(&mut self) -> Vec<FileEvent> {
        std::mem::take(&mut self.events)
    }
}

/// One resolved git commit, staged for the `Persisting` phase.
pub struct CommitResult {
    pub hash: String,
    pub shadow_branch: String,
    pub original_branch: String,
    pub additions: u64,
    pub deletions: u64,
    pub message: String,
}

pub struct RepoRuntimeState {
    pub phase: Phase,
    pub last_commit_wall: Option<chrono::DateTime<chrono::Utc>>,
    pub last_commit_monotonic: Option<Instant>,
    pub pending: SaveBatch,
    /// Paths accepted by the classifier for the batch currently in flight.
    pub accepted_files: Vec<String>,
    /// Most-recently-modified accepted file, used as the correlation probe.
    pub representative: Option<PathBuf>,
    pub correlation: Option<CorrelationMatch>,
    pub last_outcome: Option<CommitResult>,
}

impl RepoRuntimeState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_commit_wall: None,
            last_commit_monotonic: None,
            pending: SaveBatch::default(),
            accepted_files: Vec::new(),
            representative: None,
            correlation: None,
            last_outcome: None,
        }
    }
}

impl Default for RepoRuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

//! Persisted data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPreference {
    EveryCommit,
    BatchedN,
    HourlySummary,
    Disabled,
}

impl NotificationPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EveryCommit => "every_commit",
            Self::BatchedN => "batched_n",
            Self::HourlySummary => "hourly_summary",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "batched_n" => Self::BatchedN,
            "hourly_summary" => Self::HourlySummary,
            "disabled" => Self::Disabled,
            _ => Self::EveryCommit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub repo_root: String,
    pub enabled: bool,
    pub throttle_ms: u64,
    pub max_file_bytes: u64,
    pub notification: NotificationPreference,
    pub auto_add_untracked: bool,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOrigin {
    Correlation,
    Diff,
}

impl CommitOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correlation => "correlation",
            Self::Diff => "diff",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShadowCommit {
    pub hash: String,
    pub repo_root: String,
    pub shadow_branch: String,
    pub original_branch: String,
    pub committed_at: DateTime<Utc>,
    pub additions: u64,
    pub deletions: u64,
    pub message: String,
    pub files: Vec<String>,
    pub origin: CommitOrigin,
    pub session_id: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CorrelationRecord {
    pub hash: String,
    pub session_id: String,
    pub repo_root: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

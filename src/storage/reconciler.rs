//! Background reconciler: retries store writes that failed at commit time,
//! using the shadow branch itself (via `git log`/`git show`) as ground
//! truth for the fields the failed transaction would have recorded.
//!
//! Grounded on the reference daemon's dead-letter retry worker
//! (`events/dead_letter.rs`): a periodic `tokio::time::interval` loop, a
//! small attempt counter per entry, and a best-effort retry that drops the
//! entry once it succeeds.

use crate::git::GitExecutor;
use crate::storage::model::{CommitOrigin, ShadowCommit};
use crate::storage::Storage;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const MAX_RECONCILE_ATTEMPTS: i64 = 5;
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub repo_root: String,
    pub shadow_branch: String,
    pub hash: String,
    pub attempts: i64,
}

pub async fn run(storage: Arc<Storage>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconcile_once(&storage).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn reconcile_once(storage: &Storage) {
    let entries = match storage.list_pending_reconciliation().await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(err = %e, "failed to list pending reconciliation entries");
            return;
        }
    };

    for entry in entries {
        if entry.attempts >= MAX_RECONCILE_ATTEMPTS {
            continue;
        }
        match reconcile_entry(storage, &entry).await {
            Ok(true) => {
                let _ = storage.drop_reconciliation(&entry.id).await;
                info!(hash = %entry.hash, "reconciled shadow commit into store");
            }
            Ok(false) => {
                let _ = storage.bump_reconciliation_attempt(&entry.id).await;
            }
            Err(e) => {
                warn!(hash = %entry.hash, err = %e, "reconciliation attempt failed");
                let _ = storage.bump_reconciliation_attempt(&entry.id).await;
            }
        }
    }
}

/// Rebuilds the `shadow_commits` row for `entry` from `git show` against
/// the shadow branch and retries the insert. Returns `Ok(false)` if the
/// commit is no longer reachable (nothing to do) so the caller just bumps
/// the attempt counter.
async fn reconcile_entry(storage: &Storage, entry: &PendingEntry) -> Result<bool, crate::errors::ErrorKind> {
    let repo_root = std::path::PathBuf::from(&entry.repo_root);
    let git = GitExecutor::new(repo_root);

    // `show` and `diff-tree` aren't on the executor's allow-list; `log -1
    // --name-only` gives the same information (header lines, blank line,
    // then the changed paths) through an allowed subcommand.
    let out = git
        .execute("log", &["-1", "--format=%H%n%aI", "--name-only", &entry.hash])
        .await?;
    if !out.success() {
        return Ok(false);
    }
    let mut lines = out.stdout.lines();
    let hash = lines.next().unwrap_or(&entry.hash).to_string();
    let committed_at = lines
        .next()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let files: Vec<String> = lines
        .skip_while(|l| l.trim().is_empty())
        .filter(|l| !l.trim().is_empty())
        .map(|s| s.to_string())
        .collect();

    let commit = ShadowCommit {
        hash,
        repo_root: entry.repo_root.clone(),
        shadow_branch: entry.shadow_branch.clone(),
        original_branch: String::new(),
        committed_at,
        additions: 0,
        deletions: 0,
        message: "(reconciled)".to_string(),
        files,
        origin: CommitOrigin::Diff,
        session_id: None,
        confidence: None,
    };
    storage.insert_commit(&commit).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .unwrap();
        }
        std::fs::write(dir.join("README.md"), "init\n").unwrap();
        std::process::Command::new("git")
            .args(["add", "README.md"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "init"])
            .current_dir(dir)
            .status()
            .unwrap();
    }

    fn commit_on_shadow_branch(dir: &Path) -> String {
        std::process::Command::new("git")
            .args(["checkout", "-q", "-b", "shadow/master"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::fs::write(dir.join("a.ts"), "export const a = 1;\n").unwrap();
        std::process::Command::new("git")
            .args(["add", "a.ts"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "Auto-save"])
            .current_dir(dir)
            .status()
            .unwrap();
        let out = std::process::Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[tokio::test]
    async fn reconcile_entry_rebuilds_the_commit_from_shadow_branch_history() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let hash = commit_on_shadow_branch(dir.path());

        let storage = Storage::new(&dir.path().join(".shadowd-test.db")).await.unwrap();
        storage
            .queue_reconciliation(&dir.path().display().to_string(), "shadow/master", &hash)
            .await
            .unwrap();
        let entry = storage.list_pending_reconciliation().await.unwrap().into_iter().next().unwrap();

        let reconciled = reconcile_entry(&storage, &entry).await.unwrap();
        assert!(reconciled);
        assert_eq!(storage.count_commits().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reconcile_entry_reports_unreachable_hashes_as_not_yet_done() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let storage = Storage::new(&dir.path().join(".shadowd-test.db")).await.unwrap();
        storage
            .queue_reconciliation(&dir.path().display().to_string(), "shadow/master", "0".repeat(40).as_str())
            .await
            .unwrap();
        let entry = storage.list_pending_reconciliation().await.unwrap().into_iter().next().unwrap();

        let reconciled = reconcile_entry(&storage, &entry).await.unwrap();
        assert!(!reconciled);
        assert_eq!(storage.count_commits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_once_drops_the_entry_once_it_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let hash = commit_on_shadow_branch(dir.path());

        let storage = Storage::new(&dir.path().join(".shadowd-test.db")).await.unwrap();
        storage
            .queue_reconciliation(&dir.path().display().to_string(), "shadow/master", &hash)
            .await
            .unwrap();

        reconcile_once(&storage).await;

        assert_eq!(storage.count_commits().await.unwrap(), 1);
        assert!(storage.list_pending_reconciliation().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_once_bumps_the_attempt_counter_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let storage = Storage::new(&dir.path().join(".shadowd-test.db")).await.unwrap();
        storage
            .queue_reconciliation(&dir.path().display().to_string(), "shadow/master", "0".repeat(40).as_str())
            .await
            .unwrap();

        reconcile_once(&storage).await;

        let entries = storage.list_pending_reconciliation().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 1);
    }

    #[tokio::test]
    async fn entries_past_the_attempt_ceiling_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let storage = Storage::new(&dir.path().join(".shadowd-test.db")).await.unwrap();
        storage
            .queue_reconciliation(&dir.path().display().to_string(), "shadow/master", "0".repeat(40).as_str())
            .await
            .unwrap();
        let entry = storage.list_pending_reconciliation().await.unwrap().into_iter().next().unwrap();
        for _ in 0..MAX_RECONCILE_ATTEMPTS {
            storage.bump_reconciliation_attempt(&entry.id).await.unwrap();
        }

        reconcile_once(&storage).await;

        let entries = storage.list_pending_reconciliation().await.unwrap();
        assert_eq!(entries[0].attempts, MAX_RECONCILE_ATTEMPTS);
    }
}

//! L3 — Shadow Branch Manager: create/switch to `shadow/<branch>`, commit,
//! and restore the user's prior branch without disturbing what they see.

use crate::errors::ErrorKind;
use crate::git::executor::GitExecutor;

#[derive(Debug)]
pub struct CommitOutcome {
    pub hash: String,
    pub shadow_branch: String,
    pub original_branch: String,
    pub additions: u64,
    pub deletions: u64,
}

pub struct ShadowBranchManager<'a> {
    git: &'a GitExecutor,
}

impl<'a> ShadowBranchManager<'a> {
    pub fn new(git: &'a GitExecutor) -> Self {
        Self { git }
    }

    /// Reads `HEAD` via `symbolic-ref --short HEAD`; fails with
    /// `DetachedHead` if HEAD is detached.
    pub async fn current_branch(&self) -> Result<String, ErrorKind> {
        let out = self.git.execute("symbolic-ref", &["--short", "HEAD"]).await?;
        if !out.success() {
            return Err(ErrorKind::DetachedHead);
        }
        Ok(out.stdout.trim().to_string())
    }

    pub fn shadow_of(&self, branch: &str) -> Result<String, ErrorKind> {
        if branch.starts_with("shadow/") {
            return Err(ErrorKind::AlreadyShadow);
        }
        Ok(format!("shadow/{branch}"))
    }

    async fn rev_parse_head(&self) -> Result<String, ErrorKind> {
        let out = self.git.execute("rev-parse", &["HEAD"]).await?;
        if !out.success() {
            return Err(ErrorKind::GitFailed(out.stderr));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, ErrorKind> {
        let out = self
            .git
            .execute("show-ref", &["--verify", "--quiet", &format!("refs/heads/{name}")])
            .await?;
        Ok(out.success())
    }

    pub async fn ensure_shadow_exists(&self, shadow_name: &str, base_commit: &str) -> Result<(), ErrorKind> {
        if self.branch_exists(shadow_name).await? {
            return Ok(());
        }
        let out = self.git.execute("branch", &[shadow_name, base_commit]).await?;
        if !out.success() {
            return Err(ErrorKind::GitFailed(out.stderr));
        }
        Ok(())
    }

    async fn has_unstaged_changes_outside(&self, files: &[String]) -> Result<bool, ErrorKind> {
        let out = self.git.execute("status", &["--porcelain"]).await?;
        if !out.success() {
            return Err(ErrorKind::GitFailed(out.stderr));
        }
        let batch: std::collections::HashSet<&str> = files.iter().map(|s| s.as_str()).collect();
        Ok(out.stdout.lines().any(|line| {
            let path = line.get(3..).unwrap_or("").trim();
            !batch.contains(path)
        }))
    }

    async fn checkout(&self, branch: &str) -> Result<(), ErrorKind> {
        let out = self.git.execute("checkout", &[branch]).await?;
        if !out.success() {
            return Err(ErrorKind::GitFailed(out.stderr));
        }
        Ok(())
    }

    /// Atomic per-repository commit: see spec §4.3 for the exact 11-step
    /// sequence this implements, including rollback on any failure between
    /// the first checkout and the return to `original`. `message_builder` is
    /// invoked with the real additions/deletions after staging, once they're
    /// known, so the commit message (spec §4.6) can quote accurate stats
    /// instead of an estimate taken before `git add`.
    pub async fn commit_batch(
        &self,
        files: &[String],
        message_builder: impl Fn(u64, u64) -> String,
    ) -> Result<CommitOutcome, ErrorKind> {
        if files.is_empty() {
            return Err(ErrorKind::EmptyCommit);
        }

        let original = self.current_branch().await?;
        let shadow_name = self.shadow_of(&original)?;
        let base = self.rev_parse_head().await?;

        let needs_stash = self.has_unstaged_changes_outside(files).await?;
        let stash_token = if needs_stash {
            let stash_msg = format!("auto-commit-engine/{}", uuid::Uuid::new_v4());
            let out = self
                .git
                .execute("stash", &["push", "-u", "-m", &stash_msg])
                .await?;
            if !out.success() {
                return Err(ErrorKind::GitFailed(out.stderr));
            }
            Some(stash_msg)
        } else {
            None
        };

        let result = self
            .commit_batch_inner(&original, &shadow_name, &base, files, &message_builder)
            .await;

        match &result {
            Ok(_) => {
                if let Some(token) = &stash_token {
                    self.pop_named_stash(token).await;
                }
            }
            Err(_) => {
                self.rollback(&original, stash_token.as_deref()).await;
            }
        }
        result
    }

    async fn commit_batch_inner(
        &self,
        original: &str,
        shadow_name: &str,
        base: &str,
        files: &[String],
        message_builder: &impl Fn(u64, u64) -> String,
    ) -> Result<CommitOutcome, ErrorKind> {
        self.ensure_shadow_exists(shadow_name, base).await?;
        self.checkout(shadow_name).await?;

        let mut add_args: Vec<&str> = vec!["--"];
        add_args.extend(files.iter().map(|s| s.as_str()));
        let out = self.git.execute("add", &add_args).await?;
        if !out.success() {
            return Err(ErrorKind::GitFailed(out.stderr));
        }

        let diff_out = self
            .git
            .execute("diff", &["--cached", "--quiet"])
            .await?;
        if diff_out.exit_code == 0 {
            return Err(ErrorKind::EmptyCommit);
        }

        let (additions, deletions) = self.cached_stat().await?;
        let message = message_builder(additions, deletions);

        let commit_out = self
            .git
            .execute("commit", &["--no-verify", "-m", &message])
            .await?;
        if !commit_out.success() {
            return Err(ErrorKind::GitFailed(commit_out.stderr));
        }

        let hash = self.rev_parse_head().await?;
        self.checkout(original).await?;

        Ok(CommitOutcome {
            hash,
            shadow_branch: shadow_name.to_string(),
            original_branch: original.to_string(),
            additions,
            deletions,
        })
    }

    async fn cached_stat(&self) -> Result<(u64, u64), ErrorKind> {
        let out = self.git.execute("diff", &["--cached", "--numstat"]).await?;
        if !out.success() {
            return Err(ErrorKind::GitFailed(out.stderr));
        }
        let mut additions = 0u64;
        let mut deletions = 0u64;
        for line in out.stdout.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(a), Some(d)) = (parts.next(), parts.next()) {
                additions += a.parse::<u64>().unwrap_or(0);
                deletions += d.parse::<u64>().unwrap_or(0);
            }
        }
        Ok((additions, deletions))
    }

    async fn rollback(&self, original: &str, stash_token: Option<&str>) {
        let _ = self.checkout(original).await;
        if let Some(token) = stash_token {
            self.pop_named_stash(token).await;
        }
    }

    async fn pop_named_stash(&self, message: &str) {
        let list = self.git.execute("stash", &["list"]).await;
        if let Ok(list) = list {
            if let Some(entry) = list.stdout.lines().find(|l| l.contains(message)) {
                if let Some(stash_ref) = entry.split(':').next() {
                    let _ = self.git.execute("stash", &["pop", stash_ref]).await;
                }
            }
        }
    }
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

    #[tokio::test]
    async fn commits_single_file_to_shadow_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.ts"), "export const a = 1;\n").unwrap();

        let git = GitExecutor::new(dir.path().to_path_buf());
        let mgr = ShadowBranchManager::new(&git);
        let outcome = mgr
            .commit_batch(&["a.ts".to_string()], |add, del| {
                format!("Auto-save (1 files) — shadow/master\n\nChanges: +{add}/-{del}")
            })
            .await
            .unwrap();

        assert_eq!(outcome.shadow_branch, "shadow/master");
        assert_eq!(outcome.original_branch, "master");
        assert!(outcome.additions >= 1);

        let branch = mgr.current_branch().await.unwrap();
        assert_eq!(branch, "master");
    }

    #[tokio::test]
    async fn detached_head_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let head = std::process::Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        let hash = String::from_utf8_lossy(&head.stdout).trim().to_string();
        std::process::Command::new("git")
            .args(["checkout", "-q", &hash])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let git = GitExecutor::new(dir.path().to_path_buf());
        let mgr = ShadowBranchManager::new(&git);
        let result = mgr.current_branch().await;
        assert_eq!(result.unwrap_err(), ErrorKind::DetachedHead);
    }

    #[tokio::test]
    async fn empty_commit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let git = GitExecutor::new(dir.path().to_path_buf());
        let mgr = ShadowBranchManager::new(&git);
        // README.md already committed, nothing changed, so staging it adds no diff.
        let result = mgr
            .commit_batch(&["README.md".to_string()], |add, del| {
                format!("Auto-save (1 files) — shadow/master\n\nChanges: +{add}/-{del}")
            })
            .await;
        assert_eq!(result.unwrap_err(), ErrorKind::EmptyCommit);

        let branch = mgr.current_branch().await.unwrap();
        assert_eq!(branch, "master");
    }

    #[tokio::test]
    async fn failed_checkout_rolls_back_to_the_original_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        // Ignore conflict.txt so `git status --porcelain` never reports it
        // and `commit_batch` skips the stash step that would otherwise
        // clear it out of the way before the checkout.
        std::fs::write(dir.path().join(".gitignore"), "conflict.txt\n").unwrap();
        std::process::Command::new("git")
            .args(["add", ".gitignore"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "ignore conflict.txt"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        std::process::Command::new("git")
            .args(["branch", "shadow/master"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["checkout", "-q", "shadow/master"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::fs::write(dir.path().join("conflict.txt"), "from shadow\n").unwrap();
        std::process::Command::new("git")
            .args(["add", "-f", "conflict.txt"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "shadow-side conflict.txt"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["checkout", "-q", "master"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        // Untracked, ignored, and different from the shadow branch's
        // tracked copy — git refuses to check out over it.
        std::fs::write(dir.path().join("conflict.txt"), "from master, untracked\n").unwrap();
        std::fs::write(dir.path().join("a.ts"), "export const a = 1;\n").unwrap();

        let git = GitExecutor::new(dir.path().to_path_buf());
        let mgr = ShadowBranchManager::new(&git);
        let result = mgr
            .commit_batch(&["a.ts".to_string()], |add, del| {
                format!("Auto-save (1 files) — shadow/master\n\nChanges: +{add}/-{del}")
            })
            .await;
        assert!(result.is_err());

        let branch = mgr.current_branch().await.unwrap();
        assert_eq!(branch, "master");
        let contents = std::fs::read_to_string(dir.path().join("conflict.txt")).unwrap();
        assert_eq!(contents, "from master, untracked\n");
    }

    #[tokio::test]
    async fn unstaged_changes_outside_the_batch_survive_a_successful_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.ts"), "export const a = 1;\n").unwrap();
        // Tracked, but modified outside the batch — forces commit_batch to stash.
        std::fs::write(dir.path().join("README.md"), "unstaged edit\n").unwrap();

        let git = GitExecutor::new(dir.path().to_path_buf());
        let mgr = ShadowBranchManager::new(&git);
        mgr.commit_batch(&["a.ts".to_string()], |add, del| {
            format!("Auto-save (1 files) — shadow/master\n\nChanges: +{add}/-{del}")
        })
        .await
        .unwrap();

        let branch = mgr.current_branch().await.unwrap();
        assert_eq!(branch, "master");
        let readme = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert_eq!(readme, "unstaged edit\n");

        let stash_list = std::process::Command::new("git")
            .args(["stash", "list"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(
            String::from_utf8_lossy(&stash_list.stdout).trim().is_empty(),
            "stash should have been popped on the success path"
        );
    }
}

//! L2 — Git Executor: a serialized subprocess wrapper around `git`.
//!
//! Grounded on `cargo-rail`'s `SystemGit::git_cmd` — pre-tokenized args, a
//! cleared environment with only an explicit allow-list re-added, and `-C`
//! to pin the working directory instead of a `cwd()` call that could race
//! with another invocation.

use crate::errors::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;

const ALLOWED_SUBCOMMANDS: &[&str] = &[
    "status",
    "rev-parse",
    "branch",
    "checkout",
    "add",
    "commit",
    "stash",
    "diff",
    "log",
    "symbolic-ref",
    "show-ref",
    "cat-file",
    "check-ignore",
    "ls-files",
];

#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Owns the per-repository serialization mutex. One `GitExecutor` per
/// registered repository; `execute` blocks concurrent invocations for the
/// same repo but never across repos.
pub struct GitExecutor {
    repo_root: PathBuf,
    timeout: Duration,
    lock: Mutex<()>,
}

impl GitExecutor {
    pub fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            timeout: Duration::from_secs(crate::config::DEFAULT_GIT_TIMEOUT_SECS),
            lock: Mutex::new(()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run one allow-listed git subcommand. `args` excludes the subcommand
    /// name itself, e.g. `execute("commit", &["-m", "msg"])`.
    pub async fn execute(&self, subcommand: &str, args: &[&str]) -> Result<GitOutput, ErrorKind> {
        if !ALLOWED_SUBCOMMANDS.contains(&subcommand) {
            return Err(ErrorKind::DisallowedGitCommand(subcommand.to_string()));
        }

        let _guard = self.lock.lock().await;

        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.repo_root)
            .arg(subcommand)
            .args(args)
            .env_clear()
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_OPTIONAL_LOCKS", "0")
            .env("LC_ALL", "C")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ErrorKind::GitFailed(e.to_string()))?;
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let drive = async {
            let (stdout_result, stderr_result) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout_buf),
                stderr_pipe.read_to_end(&mut stderr_buf),
            );
            stdout_result.map_err(|e| ErrorKind::GitFailed(e.to_string()))?;
            stderr_result.map_err(|e| ErrorKind::GitFailed(e.to_string()))?;
            child.wait().await.map_err(|e| ErrorKind::GitFailed(e.to_string()))
        };

        let status = match tokio::time::timeout(self.timeout, drive).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let _ = child.kill().await;
                return Err(ErrorKind::GitTimeout(
                    self.timeout,
                    String::from_utf8_lossy(&stdout_buf).into_owned(),
                    String::from_utf8_lossy(&stderr_buf).into_owned(),
                ));
            }
        };

        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "test"])
            .current_dir(dir)
            .status()
            .unwrap();
    }

    #[tokio::test]
    async fn disallowed_subcommand_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let exec = GitExecutor::new(dir.path().to_path_buf());
        let result = exec.execute("push", &[]).await;
        assert_eq!(
            result.unwrap_err(),
            ErrorKind::DisallowedGitCommand("push".to_string())
        );
    }

    #[tokio::test]
    async fn status_succeeds_on_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let exec = GitExecutor::new(dir.path().to_path_buf());
        let output = exec.execute("status", &["--short"]).await.unwrap();
        assert!(output.success());
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_returns_captured_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "x\n").unwrap();
        std::process::Command::new("git")
            .args(["add", "a.txt"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        // A pre-commit hook that prints, then hangs well past the executor's
        // timeout, standing in for a wedged git process.
        let hooks_dir = dir.path().join(".git/hooks");
        std::fs::create_dir_all(&hooks_dir).unwrap();
        let hook_path = hooks_dir.join("pre-commit");
        std::fs::write(&hook_path, "#!/bin/sh\necho partial-output\nsleep 5\n").unwrap();
        let mut perms = std::fs::metadata(&hook_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&hook_path, perms).unwrap();

        let exec = GitExecutor::new(dir.path().to_path_buf()).with_timeout(Duration::from_millis(200));
        let start = std::time::Instant::now();
        let result = exec.execute("commit", &["-m", "test"]).await;
        let elapsed = start.elapsed();

        match result {
            Err(ErrorKind::GitTimeout(_, stdout, _)) => {
                assert!(stdout.contains("partial-output"));
            }
            other => panic!("expected GitTimeout, got {other:?}"),
        }
        assert!(
            elapsed < Duration::from_secs(2),
            "executor should kill the hung child instead of waiting out its hook"
        );
    }
}

//! M1 — Repo Worker: per-repository state machine (spec §4.6).

pub mod messages;
pub mod state;

use crate::classifier::{classify, ClassifyInput, GlobSet, Verdict};
use crate::config::{DEFAULT_MAX_DEBOUNCE_MS, MIN_THROTTLE_MS};
use crate::correlator::Correlator;
use crate::errors::ErrorKind;
use crate::events::{EngineEvent, EventBus};
use crate::git::{GitExecutor, ShadowBranchManager};
use crate::security;
use crate::storage::model::{CommitOrigin, RepositoryConfig, ShadowCommit};
use crate::storage::Storage;
use crate::watcher::FileEvent;
use chrono::Utc;
use state::{Phase, RepoRuntimeState};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

const CORRELATION_LOOKUP_BUDGET: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(500);

pub enum WorkerControl {
    UpdateSettings(RepositoryConfig),
    Resume,
    Shutdown,
}

struct AcceptedFile {
    rel_path: String,
    absolute: PathBuf,
    modified_at: Instant,
}

pub struct RepoWorker {
    repo_root: PathBuf,
    git: GitExecutor,
    correlator: Arc<Correlator>,
    storage: Arc<Storage>,
    events: Arc<EventBus>,
    commit_permits: Arc<Semaphore>,
    state: RepoRuntimeState,
    config: RepositoryConfig,
}

impl RepoWorker {
    pub fn new(
        repo_root: PathBuf,
        config: RepositoryConfig,
        correlator: Arc<Correlator>,
        storage: Arc<Storage>,
        events: Arc<EventBus>,
        commit_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            git: GitExecutor::new(repo_root.clone()),
            repo_root,
            correlator,
            storage,
            events,
            commit_permits,
            state: RepoRuntimeState::new(),
            config,
        }
    }

    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<FileEvent>,
        mut control_rx: mpsc::Receiver<WorkerControl>,
    ) {
        loop {
            match self.state.phase {
                Phase::Idle => {
                    tokio::select! {
                        maybe_event = event_rx.recv() => {
                            match maybe_event {
                                Some(event) => {
                                    self.state.pending.push(event);
                                    self.state.phase = Phase::Debouncing;
                                }
                                None => return,
                            }
                        }
                        maybe_ctrl = control_rx.recv() => {
                            if self.handle_control(maybe_ctrl).await { return; }
                        }
                    }
                }
                Phase::Debouncing => {
                    if self.debounce(&mut event_rx, &mut control_rx).await {
                        return;
                    }
                }
                Phase::Classifying => {
                    self.do_classify().await;
                }
                Phase::Correlating => {
                    self.do_correlate().await;
                }
                Phase::Committing => {
                    self.do_commit().await;
                }
                Phase::Persisting => {
                    self.do_persist().await;
                }
                Phase::Cooldown => {
                    self.do_cooldown(&mut control_rx).await;
                }
                Phase::Degraded => {
                    match control_rx.recv().await {
                        Some(WorkerControl::Resume) => self.state.phase = Phase::Idle,
                        Some(WorkerControl::UpdateSettings(cfg)) => self.config = cfg,
                        Some(WorkerControl::Shutdown) | None => return,
                    }
                }
            }
        }
    }

    /// Returns `true` if the worker should stop.
    async fn handle_control(&mut self, ctrl: Option<WorkerControl>) -> bool {
        match ctrl {
            Some(WorkerControl::UpdateSettings(cfg)) => {
                self.config = cfg;
                false
            }
            Some(WorkerControl::Resume) => false,
            Some(WorkerControl::Shutdown) | None => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    /// Collapses bursts of saves; resets the timer on each new event unless
    /// the cap (throttle × 2) has been reached.
    async fn debounce(
        &mut self,
        event_rx: &mut mpsc::Receiver<FileEvent>,
        control_rx: &mut mpsc::Receiver<WorkerControl>,
    ) -> bool {
        let debounce = Duration::from_millis(crate::config::DEFAULT_DEBOUNCE_MS);
        let cap = Duration::from_millis(self.config.throttle_ms.max(MIN_THROTTLE_MS) * 2)
            .max(Duration::from_millis(DEFAULT_MAX_DEBOUNCE_MS));
        let started = Instant::now();
        let mut sleep = Box::pin(tokio::time::sleep(debounce));

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    self.state.phase = Phase::Classifying;
                    return false;
                }
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.state.pending.push(event);
                            if started.elapsed() < cap {
                                sleep.as_mut().reset(tokio::time::Instant::now() + debounce);
                            }
                        }
                        None => return true,
                    }
                }
                maybe_ctrl = control_rx.recv() => {
                    if self.handle_control(maybe_ctrl).await { return true; }
                }
            }
        }
    }

    async fn do_classify(&mut self) {
        let batch = self.state.pending.take();
        let mut accepted: Vec<AcceptedFile> = Vec::new();

        let glob_set = match GlobSet::new(&self.config.patterns) {
            Ok(set) => set,
            Err(e) => {
                warn!(repo = %self.repo_root.display(), err = %e, "invalid user pattern; treating as empty set");
                GlobSet::new(&[]).expect("empty pattern set is always valid")
            }
        };

        let mut candidate_rel_paths: Vec<String> = Vec::new();
        let mut rel_path_for_event: Vec<(FileEvent, String)> = Vec::new();
        for event in batch {
            let Ok(rel) = event.path.strip_prefix(&self.repo_root) else {
                continue;
            };
            let rel_path = rel.to_string_lossy().replace('\\', "/");
            candidate_rel_paths.push(rel_path.clone());
            rel_path_for_event.push((event, rel_path));
        }

        let ignored = self.batch_check_ignore(&candidate_rel_paths).await;

        for (event, rel_path) in rel_path_for_event {
            let ancestors = ancestor_components(&rel_path);
            if ancestors
                .iter()
                .any(|a| crate::classifier::is_submodule_dir(&self.repo_root, a))
            {
                debug!(repo = %self.repo_root.display(), path = %rel_path, "path under a submodule mount; excluded");
                continue;
            }
            let (file_size, content) = read_for_classification(&event.path);
            let input = ClassifyInput {
                repo_root: &self.repo_root,
                path: &event.path,
                rel_path: &rel_path,
                ancestors: &ancestors,
                file_size,
                content: content.as_deref(),
                max_file_size: self.config.max_file_bytes,
                user_patterns: &glob_set,
                git_ignored: ignored.contains(&rel_path),
            };

            match classify(&input) {
                Verdict::Accept => accepted.push(AcceptedFile {
                    rel_path,
                    absolute: event.path,
                    modified_at: event.detected_at,
                }),
                Verdict::Reject(reason) => {
                    debug!(repo = %self.repo_root.display(), path = %rel_path, ?reason, "path rejected");
                    if matches!(reason, crate::classifier::RejectReason::SecretSuspected) {
                        self.events.publish(EngineEvent::SecretSuspected {
                            repo_root: self.repo_root.display().to_string(),
                        });
                    }
                }
            }
        }

        if accepted.is_empty() {
            self.events.publish(EngineEvent::CommitSkipped {
                repo_root: self.repo_root.display().to_string(),
                reason: "no_eligible_files".to_string(),
            });
            self.state.phase = Phase::Idle;
            return;
        }

        self.state.representative = accepted
            .iter()
            .max_by_key(|f| f.modified_at)
            .map(|f| f.absolute.clone());
        self.state.accepted_files = accepted.into_iter().map(|f| f.rel_path).collect();
        self.state.phase = Phase::Correlating;
    }

    async fn batch_check_ignore(&self, rel_paths: &[String]) -> HashSet<String> {
        if rel_paths.is_empty() {
            return HashSet::new();
        }
        let mut args: Vec<&str> = vec!["-v", "--"];
        let refs: Vec<&str> = rel_paths.iter().map(|s| s.as_str()).collect();
        args.extend(refs.iter());
        match self.git.execute("check-ignore", &args).await {
            Ok(out) => out
                .stdout
                .lines()
                .filter_map(|line| line.rsplit('\t').next())
                .map(|s| s.to_string())
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    async fn do_correlate(&mut self) {
        let lookup = match &self.state.representative {
            Some(path) => {
                let correlator = self.correlator.clone();
                let path = path.clone();
                tokio::time::timeout(CORRELATION_LOOKUP_BUDGET, async move {
                    correlator.find(&path, Utc::now()).await
                })
                .await
                .ok()
                .flatten()
            }
            None => None,
        };
        self.state.correlation = lookup;
        self.state.phase = Phase::Committing;
    }

    async fn do_commit(&mut self) {
        let _permit = self.commit_permits.clone().acquire_owned().await;

        let files = self.state.accepted_files.clone();
        let shadow_mgr = ShadowBranchManager::new(&self.git);
        let correlation = self.state.correlation.clone();

        let outcome = self
            .commit_with_retry(&shadow_mgr, &files, correlation.as_ref())
            .await;

        match outcome {
            Ok(result) => {
                self.state.last_outcome = Some(result);
                self.state.phase = Phase::Persisting;
            }
            Err(e) if e.is_benign_skip() => {
                debug!(repo = %self.repo_root.display(), ?e, "benign commit skip");
                let reason = match e {
                    ErrorKind::AlreadyShadow => "already_shadow",
                    ErrorKind::DetachedHead => "detached_head",
                    ErrorKind::EmptyCommit => "empty_commit",
                    _ => "unknown",
                };
                self.events.publish(EngineEvent::CommitSkipped {
                    repo_root: self.repo_root.display().to_string(),
                    reason: reason.to_string(),
                });
                self.reset_batch_state();
                self.state.phase = Phase::Idle;
            }
            Err(e) => {
                error!(repo = %self.repo_root.display(), err = %e, "commit failed; degrading worker");
                self.events.publish(EngineEvent::CommitFailed {
                    repo_root: self.repo_root.display().to_string(),
                    kind: e.to_string(),
                });
                self.events.publish(EngineEvent::RepoDegraded {
                    repo_root: self.repo_root.display().to_string(),
                });
                self.reset_batch_state();
                self.state.phase = Phase::Degraded;
            }
        }
    }

    async fn commit_with_retry(
        &self,
        shadow_mgr: &ShadowBranchManager<'_>,
        files: &[String],
        correlation: Option<&crate::correlator::CorrelationMatch>,
    ) -> Result<state::CommitResult, ErrorKind> {
        let branch_guess = shadow_mgr.current_branch().await.ok();
        let shadow_branch_guess = branch_guess
            .as_deref()
            .and_then(|b| shadow_mgr.shadow_of(b).ok())
            .unwrap_or_else(|| "shadow/unknown".to_string());

        let attempt = || {
            shadow_mgr.commit_batch(files, |additions, deletions| {
                messages::compose(files, additions, deletions, &shadow_branch_guess, correlation)
            })
        };

        match attempt().await {
            Ok(outcome) => Ok(into_commit_result(outcome, files, correlation, &shadow_branch_guess)),
            Err(e) if e.is_transient() => {
                tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                attempt()
                    .await
                    .map(|outcome| into_commit_result(outcome, files, correlation, &shadow_branch_guess))
            }
            Err(e) => Err(e),
        }
    }

    async fn do_persist(&mut self) {
        let Some(result) = self.state.last_outcome.take() else {
            self.state.phase = Phase::Idle;
            return;
        };

        let (origin, session_id, confidence) = match &self.state.correlation {
            Some(m) => (CommitOrigin::Correlation, Some(m.session_id.clone()), Some(m.confidence)),
            None => (CommitOrigin::Diff, None, None),
        };

        let commit = ShadowCommit {
            hash: result.hash.clone(),
            repo_root: self.repo_root.display().to_string(),
            shadow_branch: result.shadow_branch.clone(),
            original_branch: result.original_branch,
            committed_at: Utc::now(),
            additions: result.additions,
            deletions: result.deletions,
            message: result.message,
            files: self.state.accepted_files.clone(),
            origin,
            session_id,
            confidence,
        };

        match self.storage.insert_commit(&commit).await {
            Ok(()) => {
                self.events.publish(EngineEvent::CommitCreated {
                    repo_root: self.repo_root.display().to_string(),
                    hash: commit.hash,
                    shadow_branch: commit.shadow_branch,
                });
            }
            Err(e) => {
                warn!(repo = %self.repo_root.display(), err = %e, "store write failed; queued for reconciliation");
                let _ = self
                    .storage
                    .queue_reconciliation(&commit.repo_root, &commit.shadow_branch, &commit.hash)
                    .await;
            }
        }

        self.state.last_commit_wall = Some(Utc::now());
        self.state.last_commit_monotonic = Some(Instant::now());
        self.reset_batch_state();
        self.state.phase = Phase::Cooldown;
    }

    async fn do_cooldown(&mut self, control_rx: &mut mpsc::Receiver<WorkerControl>) {
        let throttle = Duration::from_millis(self.config.throttle_ms.max(MIN_THROTTLE_MS));
        let elapsed = self
            .state
            .last_commit_monotonic
            .map(|t| t.elapsed())
            .unwrap_or(throttle);
        let remaining = throttle.saturating_sub(elapsed);

        tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                self.state.phase = Phase::Idle;
            }
            maybe_ctrl = control_rx.recv() => {
                if self.handle_control(maybe_ctrl).await {
                    self.state.phase = Phase::Idle;
                }
            }
        }
    }

    fn reset_batch_state(&mut self) {
        self.state.accepted_files.clear();
        self.state.representative = None;
        self.state.correlation = None;
    }

    /// Drains any in-flight commit within `DRAIN_TIMEOUT`, used by the
    /// supervisor when a worker is removed or the engine shuts down.
    pub fn drain_timeout() -> Duration {
        DRAIN_TIMEOUT
    }
}

fn into_commit_result(
    outcome: crate::git::CommitOutcome,
    files: &[String],
    correlation: Option<&crate::correlator::CorrelationMatch>,
    shadow_branch_guess: &str,
) -> state::CommitResult {
    // The branch name used while staging and the one `commit_batch` actually
    // resolved agree unless the branch changed underfoot mid-commit; prefer
    // the resolved one for the stored record, but the message embedded in
    // the git commit itself was built from `shadow_branch_guess`.
    let message = messages::compose(
        files,
        outcome.additions,
        outcome.deletions,
        shadow_branch_guess,
        correlation,
    );
    state::CommitResult {
        hash: outcome.hash,
        shadow_branch: outcome.shadow_branch,
        original_branch: outcome.original_branch,
        additions: outcome.additions,
        deletions: outcome.deletions,
        message,
    }
}

fn ancestor_components(rel_path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    let parts: Vec<&str> = rel_path.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        out.push(acc.clone());
    }
    out
}

fn read_for_classification(path: &Path) -> (u64, Option<Vec<u8>>) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return (0, None);
    };
    let size = metadata.len();
    let content = std::fs::read(path).ok().map(|bytes| {
        let sanitized = String::from_utf8_lossy(&bytes);
        security::strip_null_bytes(&sanitized);
        bytes
    });
    (size, content)
}

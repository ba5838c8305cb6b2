//! T1 — Engine Supervisor: owns the live set of `RepoWorker`s, the global
//! commit concurrency cap, and the periodic reconciliation of that set
//! against the `repository_settings` table a separate CLI invocation may
//! have edited underfoot.
//!
//! Grounded on the reference daemon's `repo::RepoRegistry` (an
//! `RwLock<HashMap<String, Arc<RepoEntry>>>` keyed by canonicalized path,
//! each entry holding the live watcher alive for as long as it's
//! registered), extended here with one background worker task per entry
//! instead of a plain status cache.

use crate::errors::ErrorKind;
use crate::storage::model::RepositoryConfig;
use crate::watcher::{self, FileEvent};
use crate::worker::{RepoWorker, WorkerControl};
use crate::AppContext;
use notify_debouncer_full::notify::RecommendedWatcher;
use notify_debouncer_full::{Debouncer, FileIdMap};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct WorkerHandle {
    control_tx: mpsc::Sender<WorkerControl>,
    task: JoinHandle<()>,
    _watcher: Debouncer<RecommendedWatcher, FileIdMap>,
    applied_config: RepositoryConfig,
}

pub struct Supervisor {
    ctx: AppContext,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    commit_permits: Arc<Semaphore>,
}

impl Supervisor {
    pub fn new(ctx: AppContext) -> Self {
        let commit_permits = Arc::new(Semaphore::new(ctx.config.global_concurrency));
        Self {
            ctx,
            workers: RwLock::new(HashMap::new()),
            commit_permits,
        }
    }

    /// Starts one worker per row already present in `repository_settings`,
    /// called once at startup after `AppContext::bootstrap`.
    pub async fn restore_from_store(&self) -> Result<(), ErrorKind> {
        for config in self.ctx.storage.list_settings().await? {
            if !config.enabled {
                continue;
            }
            let repo_root = PathBuf::from(&config.repo_root);
            if let Err(e) = self.spawn_worker(repo_root.clone(), config).await {
                warn!(repo = %repo_root.display(), err = %e, "failed to restore worker from store");
            }
        }
        Ok(())
    }

    async fn spawn_worker(&self, repo_root: PathBuf, config: RepositoryConfig) -> Result<(), ErrorKind> {
        let key = repo_root.to_string_lossy().to_string();
        let (event_tx, event_rx) = mpsc::channel::<FileEvent>(256);
        let (control_tx, control_rx) = mpsc::channel::<WorkerControl>(8);

        let debouncer = watcher::start_watcher(repo_root.clone(), event_tx)
            .map_err(|e| ErrorKind::WorkingTreeCorrupted(e.to_string()))?;

        let applied_config = config.clone();
        let worker = RepoWorker::new(
            repo_root,
            config,
            self.ctx.correlator.clone(),
            self.ctx.storage.clone(),
            self.ctx.events.clone(),
            self.commit_permits.clone(),
        );
        let task = tokio::spawn(worker.run(event_rx, control_rx));

        self.workers.write().await.insert(
            key,
            WorkerHandle {
                control_tx,
                task,
                _watcher: debouncer,
                applied_config,
            },
        );
        Ok(())
    }

    async fn drain(&self, handle: WorkerHandle) {
        let _ = handle.control_tx.send(WorkerControl::Shutdown).await;
        drop(handle.control_tx);
        if tokio::time::timeout(crate::worker::RepoWorker::drain_timeout(), handle.task)
            .await
            .is_err()
        {
            warn!("worker did not drain within timeout; abandoning task");
        }
    }

    /// Periodically reconciles the live worker set against
    /// `repository_settings`, picking up edits made by a separate CLI
    /// invocation operating directly against the shared store.
    pub async fn run_settings_poll(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.ctx.config.settings_poll_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(err = %e, "settings poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    }

    async fn reconcile_once(&self) -> Result<(), ErrorKind> {
        let rows = self.ctx.storage.list_settings().await?;
        let mut live: HashMap<String, RepositoryConfig> = rows.into_iter().map(|c| (c.repo_root.clone(), c)).collect();

        let stale: Vec<String> = {
            let workers = self.workers.read().await;
            workers
                .keys()
                .filter(|k| !live.get(*k).is_some_and(|c| c.enabled))
                .cloned()
                .collect()
        };
        for key in &stale {
            if let Some(handle) = self.workers.write().await.remove(key) {
                info!(repo = %key, "repository disabled or removed; draining worker");
                self.drain(handle).await;
            }
        }

        let changed: Vec<RepositoryConfig> = {
            let workers = self.workers.read().await;
            live.values()
                .filter(|c| workers.get(&c.repo_root).is_some_and(|h| h.applied_config != **c))
                .cloned()
                .collect()
        };
        for config in changed {
            let mut workers = self.workers.write().await;
            if let Some(handle) = workers.get_mut(&config.repo_root) {
                if handle.control_tx.send(WorkerControl::UpdateSettings(config.clone())).await.is_ok() {
                    handle.applied_config = config;
                }
            }
        }

        let to_add: Vec<RepositoryConfig> = {
            let workers = self.workers.read().await;
            live.retain(|k, v| v.enabled && !workers.contains_key(k));
            live.into_values().collect()
        };
        for config in to_add {
            let repo_root = PathBuf::from(&config.repo_root);
            if let Err(e) = self.spawn_worker(repo_root.clone(), config).await {
                warn!(repo = %repo_root.display(), err = %e, "failed to spawn worker during reconciliation");
            }
        }

        Ok(())
    }

    pub async fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.write().await;
            workers.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            self.drain(handle).await;
        }
    }
}

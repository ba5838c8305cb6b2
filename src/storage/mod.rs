//! L5 — Store: embedded relational store in WAL/multi-reader mode.

pub mod model;
pub mod reconciler;

use crate::errors::ErrorKind;
use chrono::Utc;
use model::{CommitOrigin, NotificationPreference, RepositoryConfig, ShadowCommit};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const MIGRATION_SQL: &str = include_str!("migrations/001_init.sql");
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(path: &Path) -> Result<Self, ErrorKind> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), ErrorKind> {
        for statement in MIGRATION_SQL.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;
        }
        info!("storage migrations applied");
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, ErrorKind> {
        match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ErrorKind::StoreWriteFailed(e.to_string())),
            Err(_) => Err(ErrorKind::StoreWriteFailed("query timed out".to_string())),
        }
    }

    // ── repository_settings ────────────────────────────────────────────

    pub async fn upsert_settings(&self, config: &RepositoryConfig) -> Result<(), ErrorKind> {
        let patterns_json = serde_json::to_string(&config.patterns)
            .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.with_timeout(
            sqlx::query(
                "INSERT INTO repository_settings
                    (repo_root, enabled, throttle_ms, max_file_bytes, notification, auto_add_untracked, patterns_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(repo_root) DO UPDATE SET
                    enabled = excluded.enabled,
                    throttle_ms = excluded.throttle_ms,
                    max_file_bytes = excluded.max_file_bytes,
                    notification = excluded.notification,
                    auto_add_untracked = excluded.auto_add_untracked,
                    patterns_json = excluded.patterns_json",
            )
            .bind(&config.repo_root)
            .bind(config.enabled)
            .bind(config.throttle_ms as i64)
            .bind(config.max_file_bytes as i64)
            .bind(config.notification.as_str())
            .bind(config.auto_add_untracked)
            .bind(&patterns_json)
            .bind(&now)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn get_settings(&self, repo_root: &str) -> Result<Option<RepositoryConfig>, ErrorKind> {
        let row = self
            .with_timeout(
                sqlx::query(
                    "SELECT repo_root, enabled, throttle_ms, max_file_bytes, notification, auto_add_untracked, patterns_json
                     FROM repository_settings WHERE repo_root = ?1",
                )
                .bind(repo_root)
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(|r| row_to_config(&r)))
    }

    pub async fn list_settings(&self) -> Result<Vec<RepositoryConfig>, ErrorKind> {
        let rows = self
            .with_timeout(
                sqlx::query(
                    "SELECT repo_root, enabled, throttle_ms, max_file_bytes, notification, auto_add_untracked, patterns_json
                     FROM repository_settings ORDER BY repo_root",
                )
                .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows.iter().map(row_to_config).collect())
    }

    pub async fn remove_settings(&self, repo_root: &str) -> Result<bool, ErrorKind> {
        let result = self
            .with_timeout(
                sqlx::query("DELETE FROM repository_settings WHERE repo_root = ?1")
                    .bind(repo_root)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── shadow_commits / shadow_commit_files / correlations ────────────

    /// One transaction per spec §4.5's write discipline: the commit row,
    /// its file rows, and an optional correlation row all succeed or all
    /// roll back together.
    pub async fn insert_commit(&self, commit: &ShadowCommit) -> Result<(), ErrorKind> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;

        let committed_at = commit.committed_at.to_rfc3339();
        sqlx::query(
            "INSERT INTO shadow_commits
                (hash, repo_root, shadow_branch, original_branch, committed_at, additions, deletions, message, origin, session_id, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&commit.hash)
        .bind(&commit.repo_root)
        .bind(&commit.shadow_branch)
        .bind(&commit.original_branch)
        .bind(&committed_at)
        .bind(commit.additions as i64)
        .bind(commit.deletions as i64)
        .bind(&commit.message)
        .bind(commit.origin.as_str())
        .bind(&commit.session_id)
        .bind(commit.confidence)
        .execute(&mut *tx)
        .await
        .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;

        for file in &commit.files {
            sqlx::query("INSERT INTO shadow_commit_files (hash, relative_path) VALUES (?1, ?2)")
                .bind(&commit.hash)
                .bind(file)
                .execute(&mut *tx)
                .await
                .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;
        }

        if commit.origin == CommitOrigin::Correlation {
            let (Some(session_id), Some(confidence)) = (&commit.session_id, commit.confidence) else {
                return Err(ErrorKind::StoreWriteFailed(
                    "correlation commit missing session_id/confidence".to_string(),
                ));
            };
            sqlx::query(
                "INSERT INTO correlations (hash, session_id, repo_root, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&commit.hash)
            .bind(session_id)
            .bind(&commit.repo_root)
            .bind(confidence)
            .bind(&committed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| ErrorKind::StoreWriteFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn count_commits(&self) -> Result<i64, ErrorKind> {
        let row = self
            .with_timeout(sqlx::query("SELECT COUNT(*) AS n FROM shadow_commits").fetch_one(&self.pool))
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn count_active_repositories(&self) -> Result<i64, ErrorKind> {
        let row = self
            .with_timeout(
                sqlx::query("SELECT COUNT(*) AS n FROM repository_settings WHERE enabled = 1")
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    // ── pending_reconciliation ──────────────────────────────────────────

    pub async fn queue_reconciliation(
        &self,
        repo_root: &str,
        shadow_branch: &str,
        hash: &str,
    ) -> Result<(), ErrorKind> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.with_timeout(
            sqlx::query(
                "INSERT INTO pending_reconciliation (id, repo_root, shadow_branch, hash, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            )
            .bind(&id)
            .bind(repo_root)
            .bind(shadow_branch)
            .bind(hash)
            .bind(&now)
            .execute(&self.pool),
        )
        .await?;
        warn!(repo_root, hash, "queued store write for reconciliation");
        Ok(())
    }

    pub async fn list_pending_reconciliation(&self) -> Result<Vec<reconciler::PendingEntry>, ErrorKind> {
        let rows = self
            .with_timeout(
                sqlx::query("SELECT id, repo_root, shadow_branch, hash, attempts FROM pending_reconciliation")
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| reconciler::PendingEntry {
                id: r.get("id"),
                repo_root: r.get("repo_root"),
                shadow_branch: r.get("shadow_branch"),
                hash: r.get("hash"),
                attempts: r.get::<i64, _>("attempts"),
            })
            .collect())
    }

    pub async fn drop_reconciliation(&self, id: &str) -> Result<(), ErrorKind> {
        self.with_timeout(
            sqlx::query("DELETE FROM pending_reconciliation WHERE id = ?1")
                .bind(id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn bump_reconciliation_attempt(&self, id: &str) -> Result<(), ErrorKind> {
        let now = Utc::now().to_rfc3339();
        self.with_timeout(
            sqlx::query(
                "UPDATE pending_reconciliation SET attempts = attempts + 1, last_attempt_at = ?2 WHERE id = ?1",
            )
            .bind(id)
            .bind(&now)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

fn row_to_config(row: &sqlx::sqlite::SqliteRow) -> RepositoryConfig {
    let patterns_json: String = row.get("patterns_json");
    let patterns: Vec<String> = serde_json::from_str(&patterns_json).unwrap_or_default();
    RepositoryConfig {
        repo_root: row.get("repo_root"),
        enabled: row.get::<i64, _>("enabled") != 0,
        throttle_ms: row.get::<i64, _>("throttle_ms") as u64,
        max_file_bytes: row.get::<i64, _>("max_file_bytes") as u64,
        notification: NotificationPreference::parse(&row.get::<String, _>("notification")),
        auto_add_untracked: row.get::<i64, _>("auto_add_untracked") != 0,
        patterns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::NotificationPreference as NP;

    #[tokio::test]
    async fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("shadow.db")).await.unwrap();

        let config = RepositoryConfig {
            repo_root: "/repo".to_string(),
            enabled: true,
            throttle_ms: 2000,
            max_file_bytes: 1024,
            notification: NP::EveryCommit,
            auto_add_untracked: false,
            patterns: vec!["*.log".to_string()],
        };
        storage.upsert_settings(&config).await.unwrap();

        let fetched = storage.get_settings("/repo").await.unwrap().unwrap();
        assert_eq!(fetched.repo_root, "/repo");
        assert_eq!(fetched.throttle_ms, 2000);
        assert_eq!(fetched.patterns, vec!["*.log".to_string()]);
    }

    #[tokio::test]
    async fn commit_insert_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("shadow.db")).await.unwrap();
        storage
            .upsert_settings(&RepositoryConfig {
                repo_root: "/repo".to_string(),
                enabled: true,
                throttle_ms: 2000,
                max_file_bytes: 1024,
                notification: NP::EveryCommit,
                auto_add_untracked: false,
                patterns: vec![],
            })
            .await
            .unwrap();

        let commit = ShadowCommit {
            hash: "a".repeat(40),
            repo_root: "/repo".to_string(),
            shadow_branch: "shadow/main".to_string(),
            original_branch: "main".to_string(),
            committed_at: Utc::now(),
            additions: 3,
            deletions: 1,
            message: "Auto-save (1 files) — shadow/main".to_string(),
            files: vec!["src/a.ts".to_string()],
            origin: CommitOrigin::Diff,
            session_id: None,
            confidence: None,
        };
        storage.insert_commit(&commit).await.unwrap();
        assert_eq!(storage.count_commits().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_settings_retains_historical_commits() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("shadow.db")).await.unwrap();
        storage
            .upsert_settings(&RepositoryConfig {
                repo_root: "/repo".to_string(),
                enabled: true,
                throttle_ms: 2000,
                max_file_bytes: 1024,
                notification: NP::EveryCommit,
                auto_add_untracked: false,
                patterns: vec![],
            })
            .await
            .unwrap();
        storage
            .insert_commit(&ShadowCommit {
                hash: "b".repeat(40),
                repo_root: "/repo".to_string(),
                shadow_branch: "shadow/main".to_string(),
                original_branch: "main".to_string(),
                committed_at: Utc::now(),
                additions: 1,
                deletions: 0,
                message: "Auto-save (1 files) — shadow/main".to_string(),
                files: vec!["src/a.ts".to_string()],
                origin: CommitOrigin::Diff,
                session_id: None,
                confidence: None,
            })
            .await
            .unwrap();

        let removed = storage.remove_settings("/repo").await.unwrap();
        assert!(removed);
        assert!(storage.get_settings("/repo").await.unwrap().is_none());
        assert_eq!(storage.count_commits().await.unwrap(), 1);
    }
}

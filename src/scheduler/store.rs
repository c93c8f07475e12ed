//! Cron job persistence.
//!
//! Dynamic jobs (from the `schedule` tool) and run bookkeeping live in a
//! `cron_jobs` table inside the agent's session database. A malformed
//! persisted job is logged and skipped, never fatal.

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use std::time::Duration;

use crate::config::CronJobConfig;

/// One persisted cron job row.
#[derive(Debug, Clone)]
pub struct CronJobRow {
    pub job_id: String,
    /// "one-shot" | "recurring"
    pub job_type: String,
    pub config: CronJobConfig,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
    pub status: String,
    pub retry_count: i64,
    pub created_at: String,
}

#[derive(Clone)]
pub struct CronStore {
    pool: Pool<SqliteConnectionManager>,
    slug: String,
}

impl CronStore {
    pub fn open(slug: &str, agent_root: &Path) -> Result<Self, String> {
        let db_path = agent_root.join("sessions.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }
        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA busy_timeout=5000;
                 PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;",
            )
        });
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .map_err(|e| format!("failed to open cron store for '{}': {}", slug, e))?;

        let store = CronStore {
            pool,
            slug: slug.to_string(),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cron_jobs (
                job_id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                config TEXT,
                last_run TEXT,
                next_run TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );",
        )
        .map_err(|e| format!("failed to init cron schema: {}", e))?;
        Ok(())
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, String> {
        self.pool
            .get_timeout(Duration::from_secs(5))
            .map_err(|e| format!("cron store connection timeout: {}", e))
    }

    /// Insert or replace a job row.
    pub fn upsert_job(
        &self,
        job: &CronJobConfig,
        job_type: &str,
        next_run: Option<&str>,
    ) -> Result<(), String> {
        let config_json = serde_json::to_string(job)
            .map_err(|e| format!("failed to serialize job config: {}", e))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cron_jobs (job_id, type, config, next_run, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)
             ON CONFLICT(job_id) DO UPDATE SET
               type = excluded.type,
               config = excluded.config,
               next_run = excluded.next_run,
               status = 'active'",
            params![
                &job.id,
                job_type,
                &config_json,
                next_run,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| format!("failed to upsert cron job {}: {}", job.id, e))?;
        Ok(())
    }

    /// All persisted jobs; rows whose config no longer parses are logged
    /// and skipped.
    pub fn list_jobs(&self) -> Result<Vec<CronJobRow>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, type, config, last_run, next_run, status, retry_count, created_at
                 FROM cron_jobs",
            )
            .map_err(|e| format!("failed to query cron jobs: {}", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(|e| format!("failed to read cron jobs: {}", e))?;

        let mut jobs = Vec::new();
        for row in rows {
            let (job_id, job_type, config, last_run, next_run, status, retry_count, created_at) =
                match row {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("[CRON:{}] unreadable job row: {}", self.slug, e);
                        continue;
                    }
                };
            let config: CronJobConfig = match config.as_deref().map(serde_json::from_str) {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    log::warn!("[CRON:{}] job {} has malformed config, skipping: {}", self.slug, job_id, e);
                    continue;
                }
                None => {
                    log::warn!("[CRON:{}] job {} has no config, skipping", self.slug, job_id);
                    continue;
                }
            };
            jobs.push(CronJobRow {
                job_id,
                job_type,
                config,
                last_run,
                next_run,
                status,
                retry_count,
                created_at,
            });
        }
        Ok(jobs)
    }

    pub fn delete_job(&self, job_id: &str) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cron_jobs WHERE job_id = ?1", [job_id])
            .map_err(|e| format!("failed to delete cron job {}: {}", job_id, e))?;
        Ok(())
    }

    /// Update bookkeeping after a fire.
    pub fn record_run(&self, job_id: &str, success: bool) -> Result<(), String> {
        let conn = self.conn()?;
        if success {
            conn.execute(
                "UPDATE cron_jobs SET last_run = ?1, retry_count = 0, status = 'active'
                 WHERE job_id = ?2",
                params![Utc::now().to_rfc3339(), job_id],
            )
        } else {
            conn.execute(
                "UPDATE cron_jobs SET last_run = ?1, retry_count = retry_count + 1,
                 status = 'failed' WHERE job_id = ?2",
                params![Utc::now().to_rfc3339(), job_id],
            )
        }
        .map_err(|e| format!("failed to record run for {}: {}", job_id, e))?;
        Ok(())
    }
}

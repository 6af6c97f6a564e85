use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use super::models::*;

/// File type used for the artifacts the pipeline produces. Persistence is
/// scoped to `(project_id, file_type)` so re-runs replace rather than append.
pub const GENERATED_FILE_TYPE: &str = "generated";

/// Prefix of build leases taken by queue workers. Only these (or no lease at
/// all) can be taken over by a later job claim; inline leases never can.
pub const JOB_LEASE_PREFIX: &str = "job:";

const BUILD_COLUMNS: &str = "id, project_id, user_id, prompt, model, status, phase, error, \
     started_at, completed_at, validation_summary, created_at";

const JOB_COLUMNS: &str =
    "job_id, payload, attempts, max_attempts, state, progress, last_error, lease, created_at, updated_at";

const KEY_COLUMNS: &str = "id, provider, secret, position, rate_limited_until, failure_count";

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Async-safe handle to the build database.
///
/// Wraps `BuildDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BuildDb>>,
}

impl DbHandle {
    pub fn new(db: BuildDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BuildDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used for CLI commands,
    /// startup seeding and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BuildDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct BuildDb {
    conn: Connection,
}

impl BuildDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        // Several processes may share the file: wait on locks instead of failing.
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL journal")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS builds (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    model TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    phase TEXT NOT NULL DEFAULT 'queued',
                    lease TEXT,
                    error TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    validation_summary TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS generated_files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    build_id TEXT NOT NULL,
                    file_type TEXT NOT NULL DEFAULT 'generated',
                    path TEXT NOT NULL,
                    content TEXT NOT NULL,
                    language TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    UNIQUE(project_id, file_type, path)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    job_id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    state TEXT NOT NULL DEFAULT 'waiting',
                    progress INTEGER NOT NULL DEFAULT 0,
                    available_at INTEGER NOT NULL,
                    locked_until INTEGER,
                    lease TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS provider_keys (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider TEXT NOT NULL,
                    secret TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    rate_limited_until INTEGER,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(provider, secret)
                );

                CREATE TABLE IF NOT EXISTS user_plans (
                    user_id TEXT PRIMARY KEY,
                    plan TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS usage_daily (
                    user_id TEXT NOT NULL,
                    day TEXT NOT NULL,
                    count INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY(user_id, day)
                );

                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    build_id TEXT,
                    user_id TEXT,
                    action TEXT NOT NULL,
                    detail TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                CREATE INDEX IF NOT EXISTS idx_builds_user_status ON builds(user_id, status);
                CREATE INDEX IF NOT EXISTS idx_files_build ON generated_files(build_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, available_at);
                CREATE INDEX IF NOT EXISTS idx_keys_provider ON provider_keys(provider, position);
                CREATE INDEX IF NOT EXISTS idx_audit_build ON audit_log(build_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Builds ────────────────────────────────────────────────────────

    /// Atomically admit a build: ownership, re-run and concurrency checks run
    /// in one immediate transaction so two admissions cannot both squeeze
    /// under the same concurrency limit.
    pub fn admit_build(
        &self,
        new: &NewBuild,
        concurrent_limit: Option<u32>,
        allow_pending: bool,
    ) -> Result<AdmitOutcome> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin admission transaction")?;

        let existing = query_build(&tx, &new.id)?;
        if let Some(build) = &existing {
            if build.user_id != new.user_id {
                return Ok(AdmitOutcome::NotOwner);
            }
            if !build.status.is_terminal() {
                return Ok(if allow_pending && queue_owns_build(&tx, &new.id)? {
                    AdmitOutcome::Pending(build.clone())
                } else {
                    AdmitOutcome::AlreadyRunning
                });
            }
        }

        let active = count_active_builds(&tx, &new.user_id)?;
        if matches!(concurrent_limit, Some(limit) if active >= limit) {
            return Ok(AdmitOutcome::LimitReached { active });
        }

        let outcome_is_reset = existing.is_some();
        if outcome_is_reset {
            tx.execute(
                "UPDATE builds SET project_id = ?1, prompt = ?2, model = ?3, status = 'queued',
                    phase = 'queued', lease = NULL, error = NULL, started_at = NULL,
                    completed_at = NULL, validation_summary = NULL
                 WHERE id = ?4",
                params![new.project_id, new.prompt, new.model, new.id],
            )
            .context("Failed to reset build for re-run")?;
        } else {
            tx.execute(
                "INSERT INTO builds (id, project_id, user_id, prompt, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.id,
                    new.project_id,
                    new.user_id,
                    new.prompt,
                    new.model,
                    now_rfc3339()
                ],
            )
            .context("Failed to insert build")?;
        }

        let build = query_build(&tx, &new.id)?.context("Build not found after admission")?;
        tx.commit().context("Failed to commit admission")?;
        Ok(if outcome_is_reset {
            AdmitOutcome::Reset(build)
        } else {
            AdmitOutcome::Created(build)
        })
    }

    pub fn get_build(&self, id: &str) -> Result<Option<Build>> {
        query_build(&self.conn, id)
    }

    /// Take ownership of a build. Inline callers only take a freshly queued,
    /// unowned build. Workers (`takeover`) may also replace a lease left by an
    /// earlier job claim, since the claim guarantees a single live worker,
    /// but never a lease held by an inline run.
    pub fn acquire_build_lease(&self, id: &str, lease: &str, takeover: bool) -> Result<bool> {
        let changed = if takeover {
            self.conn.execute(
                "UPDATE builds SET lease = ?1, status = 'running',
                    started_at = COALESCE(started_at, ?2)
                 WHERE id = ?3 AND status IN ('queued', 'running')
                   AND (lease IS NULL OR substr(lease, 1, length(?4)) = ?4)",
                params![lease, now_rfc3339(), id, JOB_LEASE_PREFIX],
            )
        } else {
            self.conn.execute(
                "UPDATE builds SET lease = ?1, status = 'running',
                    started_at = COALESCE(started_at, ?2)
                 WHERE id = ?3 AND status = 'queued' AND lease IS NULL",
                params![lease, now_rfc3339(), id],
            )
        }
        .context("Failed to acquire build lease")?;
        Ok(changed == 1)
    }

    /// Record a phase transition. Returns false if the lease is no longer held.
    pub fn update_build_phase(&self, id: &str, lease: &str, phase: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE builds SET phase = ?1
                 WHERE id = ?2 AND lease = ?3 AND status IN ('queued', 'running')",
                params![phase, id, lease],
            )
            .context("Failed to update build phase")?;
        Ok(changed == 1)
    }

    /// Hand a build back to the queue for a retry without a terminal write.
    pub fn release_build_lease(&self, id: &str, lease: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE builds SET status = 'queued', phase = 'queued', lease = NULL
                 WHERE id = ?1 AND lease = ?2 AND status IN ('queued', 'running')",
                params![id, lease],
            )
            .context("Failed to release build lease")?;
        Ok(changed == 1)
    }

    /// The single terminal write for a build. Guarded by the lease and by the
    /// build still being non-terminal, so a second writer always loses.
    pub fn finish_build(
        &self,
        id: &str,
        lease: &str,
        status: BuildStatus,
        error: Option<&str>,
        summary: Option<&ValidationSummary>,
    ) -> Result<bool> {
        anyhow::ensure!(status.is_terminal(), "finish_build requires a terminal status");
        let summary_json = summary.map(serde_json::to_string).transpose()?;
        let phase = if status == BuildStatus::Failed {
            "failed"
        } else {
            "complete"
        };
        let changed = self
            .conn
            .execute(
                "UPDATE builds SET status = ?1, phase = ?2, error = ?3, validation_summary = ?4,
                    completed_at = ?5, lease = NULL
                 WHERE id = ?6 AND lease = ?7 AND status IN ('queued', 'running')",
                params![
                    status.as_str(),
                    phase,
                    error,
                    summary_json,
                    now_rfc3339(),
                    id,
                    lease
                ],
            )
            .context("Failed to finish build")?;
        Ok(changed == 1)
    }

    /// Fail a build nobody owns any more (queue exhausted on redelivery).
    pub fn fail_unowned_build(&self, id: &str, error: &str) -> Result<bool> {
        fail_unowned_build(&self.conn, id, error)
    }

    pub fn active_build_count(&self, user_id: &str) -> Result<u32> {
        count_active_builds(&self.conn, user_id)
    }

    /// Durations in milliseconds of the most recently completed builds.
    pub fn recent_build_durations(&self, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT started_at, completed_at FROM builds
                 WHERE status IN ('completed', 'completed_with_warnings')
                   AND started_at IS NOT NULL AND completed_at IS NOT NULL
                 ORDER BY completed_at DESC LIMIT ?1",
            )
            .context("Failed to prepare recent_build_durations")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query build durations")?;
        let mut durations = Vec::new();
        for row in rows {
            let (started, completed) = row.context("Failed to read duration row")?;
            let (Ok(started), Ok(completed)) = (
                DateTime::parse_from_rfc3339(&started),
                DateTime::parse_from_rfc3339(&completed),
            ) else {
                continue;
            };
            durations.push((completed - started).num_milliseconds().max(0));
        }
        Ok(durations)
    }

    // ── Generated files ───────────────────────────────────────────────

    /// Delete-then-insert all files of `file_type` for a project. Running the
    /// same build twice leaves exactly one row per path.
    pub fn replace_project_files(
        &self,
        project_id: &str,
        build_id: &str,
        file_type: &str,
        files: &[GeneratedFile],
    ) -> Result<usize> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin file transaction")?;
        tx.execute(
            "DELETE FROM generated_files WHERE project_id = ?1 AND file_type = ?2",
            params![project_id, file_type],
        )
        .context("Failed to delete previous files")?;
        let mut written = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO generated_files (project_id, build_id, file_type, path, content, language)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(project_id, file_type, path) DO UPDATE SET
                        build_id = excluded.build_id,
                        content = excluded.content,
                        language = excluded.language",
                )
                .context("Failed to prepare file insert")?;
            for file in files {
                stmt.execute(params![
                    project_id,
                    build_id,
                    file_type,
                    file.path,
                    file.content,
                    file.language
                ])
                .with_context(|| format!("Failed to insert file {}", file.path))?;
                written += 1;
            }
        }
        tx.commit().context("Failed to commit files")?;
        Ok(written)
    }

    pub fn files_for_build(&self, build_id: &str) -> Result<Vec<GeneratedFile>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT path, content, language FROM generated_files
                 WHERE build_id = ?1 ORDER BY path",
            )
            .context("Failed to prepare files_for_build")?;
        let rows = stmt
            .query_map(params![build_id], read_file_row)
            .context("Failed to query files")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read file row")?);
        }
        Ok(files)
    }

    pub fn files_for_project(&self, project_id: &str, file_type: &str) -> Result<Vec<GeneratedFile>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT path, content, language FROM generated_files
                 WHERE project_id = ?1 AND file_type = ?2 ORDER BY path",
            )
            .context("Failed to prepare files_for_project")?;
        let rows = stmt
            .query_map(params![project_id, file_type], read_file_row)
            .context("Failed to query project files")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read file row")?);
        }
        Ok(files)
    }

    pub fn count_files_for_build(&self, build_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM generated_files WHERE build_id = ?1",
                params![build_id],
                |row| row.get(0),
            )
            .context("Failed to count files")?;
        Ok(count as usize)
    }

    // ── Provider keys ─────────────────────────────────────────────────

    /// Add a credential at the end of its provider's order. Adding an
    /// existing secret returns the stored key unchanged.
    pub fn add_provider_key(&self, provider: ProviderKind, secret: &str) -> Result<ProviderKey> {
        let next_position: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM provider_keys WHERE provider = ?1",
                params![provider.as_str()],
                |row| row.get(0),
            )
            .context("Failed to compute key position")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO provider_keys (provider, secret, position) VALUES (?1, ?2, ?3)",
                params![provider.as_str(), secret, next_position],
            )
            .context("Failed to insert provider key")?;
        let sql = format!(
            "SELECT {} FROM provider_keys WHERE provider = ?1 AND secret = ?2",
            KEY_COLUMNS
        );
        self.conn
            .query_row(&sql, params![provider.as_str(), secret], read_key_row)
            .context("Provider key not found after insert")?
    }

    pub fn list_provider_keys(&self, provider: Option<ProviderKind>) -> Result<Vec<ProviderKey>> {
        let sql = format!(
            "SELECT {} FROM provider_keys WHERE (?1 IS NULL OR provider = ?1) ORDER BY provider, position, id",
            KEY_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_provider_keys")?;
        let rows = stmt
            .query_map(params![provider.map(|p| p.as_str())], read_key_row)
            .context("Failed to query provider keys")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("Failed to read key row")??);
        }
        Ok(keys)
    }

    pub fn get_provider_key(&self, id: i64) -> Result<Option<ProviderKey>> {
        let sql = format!("SELECT {} FROM provider_keys WHERE id = ?1", KEY_COLUMNS);
        let key = self
            .conn
            .query_row(&sql, params![id], read_key_row)
            .optional()
            .context("Failed to query provider key")?;
        key.transpose()
    }

    /// Extend a key's cooldown. Never shortens an existing, later cooldown.
    pub fn set_key_cooldown(&self, id: i64, until: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE provider_keys
                 SET rate_limited_until = MAX(COALESCE(rate_limited_until, 0), ?1)
                 WHERE id = ?2",
                params![until.timestamp_millis(), id],
            )
            .context("Failed to set key cooldown")?;
        Ok(())
    }

    pub fn record_key_failure(&self, id: i64) -> Result<u32> {
        self.conn
            .execute(
                "UPDATE provider_keys SET failure_count = failure_count + 1 WHERE id = ?1",
                params![id],
            )
            .context("Failed to record key failure")?;
        let count: i64 = self
            .conn
            .query_row(
                "SELECT failure_count FROM provider_keys WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to read key failure count")?;
        Ok(count as u32)
    }

    pub fn record_key_success(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE provider_keys SET failure_count = 0 WHERE id = ?1",
                params![id],
            )
            .context("Failed to reset key failures")?;
        Ok(())
    }

    pub fn reset_key_cooldowns(&self) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE provider_keys SET rate_limited_until = NULL, failure_count = 0",
                [],
            )
            .context("Failed to reset key cooldowns")?;
        Ok(changed)
    }

    // ── Plans and usage ───────────────────────────────────────────────

    pub fn get_user_plan(&self, user_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT plan FROM user_plans WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query user plan")
    }

    pub fn set_user_plan(&self, user_id: &str, plan: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_plans (user_id, plan, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET plan = excluded.plan, updated_at = excluded.updated_at",
                params![user_id, plan, now_rfc3339()],
            )
            .context("Failed to set user plan")?;
        Ok(())
    }

    /// Returns `(today, this_month)` build counts. `day` is `YYYY-MM-DD`,
    /// `month` is `YYYY-MM`.
    pub fn usage_counts(&self, user_id: &str, day: &str, month: &str) -> Result<(u32, u32)> {
        let today: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(count), 0) FROM usage_daily WHERE user_id = ?1 AND day = ?2",
                params![user_id, day],
                |row| row.get(0),
            )
            .context("Failed to read daily usage")?;
        let month_total: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(count), 0) FROM usage_daily
                 WHERE user_id = ?1 AND substr(day, 1, 7) = ?2",
                params![user_id, month],
                |row| row.get(0),
            )
            .context("Failed to read monthly usage")?;
        Ok((today as u32, month_total as u32))
    }

    pub fn increment_usage(&self, user_id: &str, day: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO usage_daily (user_id, day, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(user_id, day) DO UPDATE SET count = count + 1",
                params![user_id, day],
            )
            .context("Failed to increment usage")?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Enqueue keyed by build id. A waiting job is updated in place, an
    /// active job is left alone, a finished job is reset for a re-run.
    pub fn upsert_job(
        &self,
        payload: &JobPayload,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<EnqueueOutcome> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin enqueue transaction")?;
        let payload_json = serde_json::to_string(payload).context("Failed to encode job payload")?;
        let now = now_rfc3339();
        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM jobs WHERE job_id = ?1",
                params![payload.build_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up job")?;

        let outcome = match state.as_deref().map(JobState::from_str) {
            None => {
                tx.execute(
                    "INSERT INTO jobs (job_id, payload, max_attempts, state, available_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'waiting', ?4, ?5, ?5)",
                    params![payload.build_id, payload_json, max_attempts as i64, now_ms, now],
                )
                .context("Failed to insert job")?;
                EnqueueOutcome::Created
            }
            Some(Ok(JobState::Waiting)) => {
                tx.execute(
                    "UPDATE jobs SET payload = ?1, updated_at = ?2 WHERE job_id = ?3",
                    params![payload_json, now, payload.build_id],
                )
                .context("Failed to update waiting job")?;
                EnqueueOutcome::Updated
            }
            Some(Ok(JobState::Active)) => EnqueueOutcome::AlreadyActive,
            Some(Ok(JobState::Completed | JobState::Failed)) => {
                tx.execute(
                    "UPDATE jobs SET payload = ?1, state = 'waiting', attempts = 0, max_attempts = ?2,
                        progress = 0, available_at = ?3, locked_until = NULL, lease = NULL,
                        last_error = NULL, updated_at = ?4
                     WHERE job_id = ?5",
                    params![payload_json, max_attempts as i64, now_ms, now, payload.build_id],
                )
                .context("Failed to requeue job")?;
                EnqueueOutcome::Requeued
            }
            Some(Err(e)) => anyhow::bail!(e),
        };
        tx.commit().context("Failed to commit enqueue")?;
        Ok(outcome)
    }

    /// Claim the next runnable job: a waiting job whose backoff has elapsed,
    /// or an active job whose lease expired (worker died). Expired jobs that
    /// already used their last attempt are failed instead of redelivered.
    pub fn claim_next_job(&self, now_ms: i64, visibility_ms: i64, lease: &str) -> Result<Option<Job>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;
        loop {
            let candidate: Option<(String, String, i64, i64)> = tx
                .query_row(
                    "SELECT job_id, state, attempts, max_attempts FROM jobs
                     WHERE (state = 'waiting' AND available_at <= ?1)
                        OR (state = 'active' AND locked_until IS NOT NULL AND locked_until <= ?1)
                     ORDER BY available_at ASC, created_at ASC
                     LIMIT 1",
                    params![now_ms],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .context("Failed to select next job")?;

            let Some((job_id, state, attempts, max_attempts)) = candidate else {
                tx.commit().context("Failed to commit empty claim")?;
                return Ok(None);
            };

            if state == JobState::Active.as_str() && attempts >= max_attempts {
                let message = format!("Lease expired on final attempt {}/{}", attempts, max_attempts);
                tx.execute(
                    "UPDATE jobs SET state = 'failed', lease = NULL, locked_until = NULL,
                        last_error = ?1, updated_at = ?2
                     WHERE job_id = ?3",
                    params![message, now_rfc3339(), job_id],
                )
                .context("Failed to fail exhausted job")?;
                fail_unowned_build(&tx, &job_id, &message)?;
                continue;
            }

            tx.execute(
                "UPDATE jobs SET state = 'active', attempts = attempts + 1, lease = ?1,
                    locked_until = ?2, progress = 0, updated_at = ?3
                 WHERE job_id = ?4",
                params![lease, now_ms + visibility_ms, now_rfc3339(), job_id],
            )
            .context("Failed to claim job")?;
            let job = query_job(&tx, &job_id)?.context("Job vanished during claim")?;
            tx.commit().context("Failed to commit claim")?;
            return Ok(Some(job));
        }
    }

    /// Extend the job lease and optionally record progress.
    pub fn heartbeat_job(
        &self,
        job_id: &str,
        lease: &str,
        progress: Option<u8>,
        locked_until_ms: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET locked_until = ?1, progress = COALESCE(?2, progress), updated_at = ?3
                 WHERE job_id = ?4 AND lease = ?5 AND state = 'active'",
                params![
                    locked_until_ms,
                    progress.map(|p| p as i64),
                    now_rfc3339(),
                    job_id,
                    lease
                ],
            )
            .context("Failed to heartbeat job")?;
        Ok(changed == 1)
    }

    pub fn complete_job(&self, job_id: &str, lease: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'completed', progress = 100, lease = NULL,
                    locked_until = NULL, updated_at = ?1
                 WHERE job_id = ?2 AND lease = ?3 AND state = 'active'",
                params![now_rfc3339(), job_id, lease],
            )
            .context("Failed to complete job")?;
        Ok(changed == 1)
    }

    /// Requeue an active job. `refund_attempt` undoes the claim's increment.
    pub fn retry_job(
        &self,
        job_id: &str,
        lease: &str,
        available_at_ms: i64,
        error: &str,
        refund_attempt: bool,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'waiting', available_at = ?1, lease = NULL,
                    locked_until = NULL, last_error = ?2, updated_at = ?3,
                    attempts = MAX(attempts - ?6, 0)
                 WHERE job_id = ?4 AND lease = ?5 AND state = 'active'",
                params![available_at_ms, error, now_rfc3339(), job_id, lease, refund_attempt as i64],
            )
            .context("Failed to schedule job retry")?;
        Ok(changed == 1)
    }

    pub fn fail_job(&self, job_id: &str, lease: &str, error: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'failed', lease = NULL, locked_until = NULL,
                    last_error = ?1, updated_at = ?2
                 WHERE job_id = ?3 AND lease = ?4 AND state = 'active'",
                params![error, now_rfc3339(), job_id, lease],
            )
            .context("Failed to fail job")?;
        Ok(changed == 1)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        query_job(&self.conn, job_id)
    }

    pub fn job_counts(&self) -> Result<JobCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .context("Failed to prepare job_counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query job counts")?;
        let mut counts = JobCounts::default();
        for row in rows {
            let (state, count) = row.context("Failed to read job count row")?;
            let count = count.max(0) as u64;
            match JobState::from_str(&state) {
                Ok(JobState::Waiting) => counts.waiting = count,
                Ok(JobState::Active) => counts.active = count,
                Ok(JobState::Completed) => counts.completed = count,
                Ok(JobState::Failed) => counts.failed = count,
                Err(_) => {}
            }
        }
        Ok(counts)
    }

    // ── Audit log ─────────────────────────────────────────────────────

    pub fn insert_audit(
        &self,
        build_id: Option<&str>,
        user_id: Option<&str>,
        action: &str,
        detail: &serde_json::Value,
        created_at: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO audit_log (build_id, user_id, action, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![build_id, user_id, action, detail.to_string(), created_at],
            )
            .context("Failed to insert audit entry")?;
        Ok(())
    }

    pub fn list_audit(&self, build_id: &str) -> Result<Vec<AuditRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, build_id, user_id, action, detail, created_at FROM audit_log
                 WHERE build_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_audit")?;
        let rows = stmt
            .query_map(params![build_id], |row| {
                let detail: String = row.get(4)?;
                Ok(AuditRecord {
                    id: row.get(0)?,
                    build_id: row.get(1)?,
                    user_id: row.get(2)?,
                    action: row.get(3)?,
                    detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query audit log")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read audit row")?);
        }
        Ok(records)
    }
}

// ── Row helpers (shared by plain connections and transactions) ───────

fn read_build_row(row: &Row<'_>) -> rusqlite::Result<BuildRow> {
    Ok(BuildRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        prompt: row.get(3)?,
        model: row.get(4)?,
        status: row.get(5)?,
        phase: row.get(6)?,
        error: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        validation_summary: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn read_file_row(row: &Row<'_>) -> rusqlite::Result<GeneratedFile> {
    Ok(GeneratedFile {
        path: row.get(0)?,
        content: row.get(1)?,
        language: row.get(2)?,
    })
}

fn read_key_row(row: &Row<'_>) -> rusqlite::Result<Result<ProviderKey>> {
    let provider: String = row.get(1)?;
    let until: Option<i64> = row.get(4)?;
    let failure_count: i64 = row.get(5)?;
    let id: i64 = row.get(0)?;
    let secret: String = row.get(2)?;
    let position: i64 = row.get(3)?;
    Ok(ProviderKind::from_str(&provider)
        .map_err(|e| anyhow::anyhow!(e))
        .map(|provider| ProviderKey {
            id,
            provider,
            secret,
            position,
            rate_limited_until: until.filter(|ms| *ms > 0).and_then(millis_to_datetime),
            failure_count: failure_count.max(0) as u32,
        }))
}

fn query_build(conn: &Connection, id: &str) -> Result<Option<Build>> {
    let sql = format!("SELECT {} FROM builds WHERE id = ?1", BUILD_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], read_build_row)
        .optional()
        .context("Failed to query build")?;
    row.map(BuildRow::into_build).transpose()
}

fn query_job(conn: &Connection, job_id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS);
    let row = conn
        .query_row(&sql, params![job_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })
        .optional()
        .context("Failed to query job")?;
    let Some((job_id, payload, attempts, max_attempts, state, progress, last_error, lease, created_at, updated_at)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(Job {
        job_id,
        payload: serde_json::from_str(&payload).context("Failed to decode job payload")?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        state: JobState::from_str(&state).map_err(|e| anyhow::anyhow!(e))?,
        progress: progress.clamp(0, 100) as u8,
        last_error,
        lease,
        created_at,
        updated_at,
    }))
}

fn count_active_builds(conn: &Connection, user_id: &str) -> Result<u32> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM builds WHERE user_id = ?1 AND status IN ('queued', 'running')",
            params![user_id],
            |row| row.get(0),
        )
        .context("Failed to count active builds")?;
    Ok(count as u32)
}

/// A non-terminal build belongs to the queue when nobody has leased it yet
/// or a job for it is still waiting or running.
fn queue_owns_build(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM builds WHERE id = ?1 AND status = 'queued' AND lease IS NULL)
             OR EXISTS(SELECT 1 FROM jobs WHERE job_id = ?1 AND state IN ('waiting', 'active'))",
        params![id],
        |row| row.get(0),
    )
    .context("Failed to check queue ownership")
}

fn fail_unowned_build(conn: &Connection, id: &str, error: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE builds SET status = 'failed', phase = 'failed', error = ?1,
                completed_at = ?2, lease = NULL
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![error, now_rfc3339(), id],
        )
        .context("Failed to fail unowned build")?;
    Ok(changed == 1)
}

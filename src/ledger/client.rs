use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ledger::models::*;
use crate::ledger::process_probe::{self, Ownership};
use crate::ledger::LedgerError;
use crate::process::{signal, ProcessBook};
use crate::workspace;
use async_trait::async_trait;

/// Thresholds used by startup reconciliation
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub workspace_root: PathBuf,
    /// A workspace untouched for this long may be reclaimed even if a recorded
    /// pid is alive under another owner
    pub stale_after: Duration,
    /// How long a parked job waits for a retry
    pub parked_retention: Duration,
}

impl ReconcilePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            stale_after: config.stale_workspace_after,
            parked_retention: config.parked_retention,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobLedger {
    pool: SqlitePool,
}

impl JobLedger {
    /// Open (or create) the ledger.
    ///
    /// A file that SQLite refuses to read is moved aside as
    /// `<name>.corrupt-<timestamp>` and a fresh ledger is created in its place.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match Self::connect(path).await {
            Ok(ledger) => Ok(ledger),
            Err(e) if path.exists() && is_unreadable_database(&e) => {
                let aside = corrupt_path(path);
                error!(
                    "LedgerCorruption: {:?} is not a readable ledger ({}); moved to {:?}",
                    path, e, aside
                );
                tokio::fs::rename(path, &aside).await?;
                for suffix in ["-wal", "-shm"] {
                    let sidecar = PathBuf::from(format!("{}{}", path.display(), suffix));
                    let _ = tokio::fs::remove_file(sidecar).await;
                }
                Self::connect(path).await
            }
            Err(e) => Err(e),
        }
    }

    async fn connect(path: &Path) -> Result<Self, LedgerError> {
        info!("Opening ledger {:?}", path);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let ledger = JobLedger { pool };
        ledger.create_tables().await?;
        Ok(ledger)
    }

    async fn create_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                job_id TEXT PRIMARY KEY,
                workspace TEXT NOT NULL,
                stage TEXT NOT NULL DEFAULT '{}',
                input TEXT NOT NULL,
                variant TEXT NOT NULL,
                artist_hint TEXT NOT NULL,
                album_hint TEXT NOT NULL,
                library_root TEXT NOT NULL,
                owner_pid INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL,
                release_json TEXT,
                metadata_json TEXT,
                last_error TEXT
            )
            "#,
            STAGE_REGISTERED
        ))
        .execute(&self.pool)
        .await?;

        // One row per running tool; gone once the tool exits
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_processes (
                job_id TEXT NOT NULL,
                pid INTEGER NOT NULL,
                tool TEXT NOT NULL,
                started_at TEXT NOT NULL,
                PRIMARY KEY (job_id, pid),
                FOREIGN KEY (job_id) REFERENCES ledger_entries (job_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a new job. Must happen before its workspace is created and
    /// before any tool is spawned for it.
    pub async fn register(&self, job: &JobRegistration) -> Result<LedgerEntry, LedgerError> {
        let now = Utc::now();
        let owner_pid = std::process::id();
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                job_id, workspace, stage, input, variant, artist_hint, album_hint,
                library_root, owner_pid, created_at, heartbeat_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(path_text(&job.workspace))
        .bind(Stage::Registered)
        .bind(&job.input)
        .bind(serde_json::to_string(&job.variant)?)
        .bind(&job.artist_hint)
        .bind(&job.album_hint)
        .bind(path_text(&job.library_root))
        .bind(owner_pid as i64)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!("Registered job {} ({})", job.job_id, job.variant.name());
        Ok(LedgerEntry {
            job_id: job.job_id.clone(),
            workspace: job.workspace.clone(),
            stage: Stage::Registered,
            input: job.input.clone(),
            variant: job.variant.clone(),
            artist_hint: job.artist_hint.clone(),
            album_hint: job.album_hint.clone(),
            library_root: job.library_root.clone(),
            owner_pid,
            processes: Vec::new(),
            created_at: now,
            heartbeat_at: now,
            release: None,
            metadata: None,
            last_error: None,
        })
    }

    /// Book a tool pid against a job
    pub async fn record_child_process(
        &self,
        job_id: &str,
        tool: &str,
        pid: u32,
    ) -> Result<(), LedgerError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let known = sqlx::query("SELECT 1 FROM ledger_entries WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        if known.is_none() {
            return Err(LedgerError::UnknownJob(job_id.to_string()));
        }

        sqlx::query(
            "INSERT OR REPLACE INTO ledger_processes (job_id, pid, tool, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(pid as i64)
        .bind(tool)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE ledger_entries SET heartbeat_at = ? WHERE job_id = ?")
            .bind(&now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!("Job {}: booked {} pid {}", job_id, tool, pid);
        Ok(())
    }

    pub async fn forget_child_process(&self, job_id: &str, pid: u32) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM ledger_processes WHERE job_id = ? AND pid = ?")
            .bind(job_id)
            .bind(pid as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn advance_stage(&self, job_id: &str, stage: Stage) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET stage = ?, heartbeat_at = ? WHERE job_id = ?",
        )
        .bind(stage)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UnknownJob(job_id.to_string()));
        }
        debug!("Job {} -> {}", job_id, stage);
        Ok(())
    }

    pub async fn heartbeat(&self, job_id: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE ledger_entries SET heartbeat_at = ? WHERE job_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Take over an existing entry for this process, e.g. before retrying a
    /// job parked by an earlier carat. Reconciliation in other instances then
    /// sees a live owner and leaves the job alone.
    pub async fn claim(&self, job_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET owner_pid = ?, heartbeat_at = ? WHERE job_id = ?",
        )
        .bind(std::process::id() as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UnknownJob(job_id.to_string()));
        }
        debug!("Job {} claimed by pid {}", job_id, std::process::id());
        Ok(())
    }

    /// Persist the extraction result and move to `Extracted` in one step
    pub async fn save_release(
        &self,
        job_id: &str,
        release: &crate::models::ExtractedRelease,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET release_json = ?, stage = ?, heartbeat_at = ? WHERE job_id = ?",
        )
        .bind(serde_json::to_string(release)?)
        .bind(Stage::Extracted)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UnknownJob(job_id.to_string()));
        }
        Ok(())
    }

    pub async fn save_metadata(
        &self,
        job_id: &str,
        metadata: &crate::models::ResolvedMetadata,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE ledger_entries SET metadata_json = ? WHERE job_id = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Park a job after a transcode failure: the entry and workspace stay for
    /// a retry, and no tool is left running for it.
    pub async fn park(&self, job_id: &str, reason: &str) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE ledger_entries SET stage = ?, last_error = ?, heartbeat_at = ? WHERE job_id = ?",
        )
        .bind(Stage::TranscodeFailed)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::UnknownJob(job_id.to_string()));
        }
        sqlx::query("DELETE FROM ledger_processes WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        warn!("Job {} parked after transcode failure: {}", job_id, reason);
        Ok(())
    }

    /// Delete the job's workspace, then its entry
    pub async fn complete(&self, job_id: &str) -> Result<(), LedgerError> {
        let entry = self
            .entry(job_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownJob(job_id.to_string()))?;
        workspace::nuke_dir(&entry.workspace).await?;
        self.remove(job_id).await?;
        info!("Job {} closed", job_id);
        Ok(())
    }

    /// Drop the entry and its process rows
    pub async fn remove(&self, job_id: &str) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ledger_processes WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM ledger_entries WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(LedgerError::UnknownJob(job_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn entry(&self, job_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query("SELECT * FROM ledger_entries WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let processes = sqlx::query("SELECT * FROM ledger_processes WHERE job_id = ? ORDER BY started_at")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(process_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        entry_from_row(&row, processes).map(Some)
    }

    /// Every row, parsed independently so one bad row cannot hide the others
    pub async fn load(&self) -> Result<Vec<Result<LedgerEntry, LedgerError>>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM ledger_entries ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        let process_rows = sqlx::query("SELECT * FROM ledger_processes ORDER BY started_at")
            .fetch_all(&self.pool)
            .await?;

        let mut processes: HashMap<String, Vec<LedgerProcess>> = HashMap::new();
        for row in &process_rows {
            let job_id: String = match row.try_get("job_id") {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping unreadable process row: {}", e);
                    continue;
                }
            };
            match process_from_row(row) {
                Ok(process) => processes.entry(job_id).or_default().push(process),
                Err(e) => warn!("Skipping process row of job {}: {}", job_id, e),
            }
        }

        Ok(rows
            .iter()
            .map(|row| {
                let job_id: String = row.try_get("job_id").unwrap_or_default();
                let procs = processes.remove(&job_id).unwrap_or_default();
                entry_from_row(row, procs)
            })
            .collect())
    }

    /// Readable entries; malformed ones are logged and skipped
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    error!("LedgerCorruption: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Find and clean up jobs left behind by a carat process that died.
    ///
    /// Runs before any job is accepted. See `ReconcileReport` for outcomes.
    pub async fn reconcile_on_startup(
        &self,
        policy: &ReconcilePolicy,
    ) -> Result<ReconcileReport, LedgerError> {
        let mut report = ReconcileReport::default();
        let mut referenced: HashSet<PathBuf> = HashSet::new();

        for loaded in self.load().await? {
            let entry = match loaded {
                Ok(entry) => entry,
                Err(e) => {
                    error!("LedgerCorruption: {} (skipped)", e);
                    report.corrupt += 1;
                    continue;
                }
            };

            if process_probe::is_live_instance(entry.owner_pid) {
                info!(
                    "Job {} belongs to running carat pid {}, leaving it",
                    entry.job_id, entry.owner_pid
                );
                referenced.insert(entry.workspace.clone());
                report.kept.push(entry.job_id);
                continue;
            }

            if entry.is_parked() {
                let age = since(entry.heartbeat_at);
                if age < policy.parked_retention && entry.workspace.exists() {
                    referenced.insert(entry.workspace.clone());
                    report.parked.push(entry.job_id);
                    continue;
                }
                info!("Parked job {} expired", entry.job_id);
            }

            let mut ours = false;
            let mut foreign = false;
            for process in &entry.processes {
                match process_probe::classify(process.pid, &process.tool, &entry.workspace) {
                    Ownership::Dead => {}
                    Ownership::Ours => {
                        warn!(
                            "Job {}: {} (pid {}) outlived its carat, stopping it",
                            entry.job_id, process.tool, process.pid
                        );
                        process_probe::stop_tool(process.pid).await;
                        report.killed.push(process.pid);
                        ours = true;
                    }
                    Ownership::Foreign => {
                        debug!(
                            "Job {}: pid {} now belongs to an unrelated process",
                            entry.job_id, process.pid
                        );
                        foreign = true;
                    }
                }
            }

            // Tools spawned but never booked still work inside the workspace
            for pid in signal::processes_working_in(&entry.workspace) {
                if pid != std::process::id() && !report.killed.contains(&pid) {
                    warn!("Job {}: stopping unbooked pid {}", entry.job_id, pid);
                    process_probe::stop_tool(pid).await;
                    report.killed.push(pid);
                    ours = true;
                }
            }

            if foreign && !ours && !is_stale(&entry.workspace, policy.stale_after) {
                info!(
                    "Job {}: recorded pid is alive under another owner and the workspace is fresh, keeping it",
                    entry.job_id
                );
                referenced.insert(entry.workspace.clone());
                report.kept.push(entry.job_id);
                continue;
            }

            if let Err(e) = workspace::nuke_dir(&entry.workspace).await {
                warn!("Job {}: workspace not removed: {}", entry.job_id, e);
                referenced.insert(entry.workspace.clone());
                report.kept.push(entry.job_id);
                continue;
            }
            self.remove(&entry.job_id).await?;
            info!("Reclaimed orphaned job {} ({})", entry.job_id, entry.stage);
            report.reclaimed.push(entry.job_id);
        }

        report.swept = sweep_stray_workspaces(policy, &referenced).await;

        info!(
            "Reconciliation: {} reclaimed, {} parked, {} kept, {} tool(s) stopped, {} stray workspace(s), {} corrupt",
            report.reclaimed.len(),
            report.parked.len(),
            report.kept.len(),
            report.killed.len(),
            report.swept.len(),
            report.corrupt
        );
        Ok(report)
    }
}

/// Remove stale `carat_*` directories that no entry refers to
async fn sweep_stray_workspaces(policy: &ReconcilePolicy, referenced: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut swept = Vec::new();
    let Ok(entries) = std::fs::read_dir(&policy.workspace_root) else {
        return swept;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_candidate = entry
            .file_name()
            .to_str()
            .map(workspace::is_workspace_name)
            .unwrap_or(false)
            && path.is_dir()
            && !referenced.contains(&path);
        if !is_candidate || !is_stale(&path, policy.stale_after) {
            continue;
        }
        match workspace::nuke_dir(&path).await {
            Ok(()) => {
                info!("Removed stray workspace {:?}", path);
                swept.push(path);
            }
            Err(e) => warn!("Could not remove stray workspace {:?}: {}", path, e),
        }
    }
    swept
}

/// A missing workspace is stale: there is nothing left to protect
fn is_stale(path: &Path, stale_after: Duration) -> bool {
    match workspace::idle_for(path) {
        Ok(idle) => idle >= stale_after,
        Err(_) => true,
    }
}

fn since(time: DateTime<Utc>) -> Duration {
    (Utc::now() - time).to_std().unwrap_or(Duration::ZERO)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger.db".to_string());
    path.with_file_name(format!("{}.corrupt-{}", name, stamp))
}

/// SQLITE_NOTADB (26) and SQLITE_CORRUPT (11)
fn is_unreadable_database(error: &LedgerError) -> bool {
    match error {
        LedgerError::Database(sqlx::Error::Database(db)) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            code == "26"
                || code == "11"
                || db.message().contains("not a database")
                || db.message().contains("malformed")
        }
        _ => false,
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn corrupt(job_id: &str, reason: impl std::fmt::Display) -> LedgerError {
    LedgerError::Corrupt {
        job_id: job_id.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_time(job_id: &str, column: &str, raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(job_id, format!("{}: {}", column, e)))
}

fn process_from_row(row: &SqliteRow) -> Result<LedgerProcess, LedgerError> {
    let job_id: String = row.try_get("job_id")?;
    let pid: i64 = row.try_get("pid")?;
    let started_at: String = row.try_get("started_at")?;
    Ok(LedgerProcess {
        pid: u32::try_from(pid).map_err(|_| corrupt(&job_id, format!("pid {}", pid)))?,
        tool: row.try_get("tool")?,
        started_at: parse_time(&job_id, "started_at", &started_at)?,
    })
}

fn entry_from_row(row: &SqliteRow, processes: Vec<LedgerProcess>) -> Result<LedgerEntry, LedgerError> {
    let job_id: String = row.try_get("job_id")?;
    let field = |column: &str| -> Result<String, LedgerError> {
        row.try_get::<String, _>(column)
            .map_err(|e| corrupt(&job_id, format!("{}: {}", column, e)))
    };
    let optional_json = |column: &str| -> Result<Option<String>, LedgerError> {
        row.try_get::<Option<String>, _>(column)
            .map_err(|e| corrupt(&job_id, format!("{}: {}", column, e)))
    };

    let stage: Stage = field("stage")?
        .parse()
        .map_err(|e: String| corrupt(&job_id, e))?;
    let variant = serde_json::from_str(&field("variant")?)
        .map_err(|e| corrupt(&job_id, format!("variant: {}", e)))?;
    let owner_pid: i64 = row
        .try_get("owner_pid")
        .map_err(|e| corrupt(&job_id, format!("owner_pid: {}", e)))?;
    let release = optional_json("release_json")?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| corrupt(&job_id, format!("release: {}", e)))?;
    let metadata = optional_json("metadata_json")?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| corrupt(&job_id, format!("metadata: {}", e)))?;

    let workspace = PathBuf::from(field("workspace")?);
    if workspace.as_os_str().is_empty() {
        return Err(corrupt(&job_id, "empty workspace path"));
    }

    Ok(LedgerEntry {
        workspace,
        stage,
        input: field("input")?,
        variant,
        artist_hint: field("artist_hint")?,
        album_hint: field("album_hint")?,
        library_root: PathBuf::from(field("library_root")?),
        owner_pid: u32::try_from(owner_pid).unwrap_or(0),
        processes,
        created_at: parse_time(&job_id, "created_at", &field("created_at")?)?,
        heartbeat_at: parse_time(&job_id, "heartbeat_at", &field("heartbeat_at")?)?,
        release,
        metadata,
        last_error: optional_json("last_error")?,
        job_id: job_id.clone(),
    })
}

/// Books a job's tool pids in the ledger
#[derive(Clone)]
pub struct JobBook {
    ledger: JobLedger,
    job_id: String,
}

impl JobBook {
    pub fn new(ledger: JobLedger, job_id: &str) -> Self {
        Self {
            ledger,
            job_id: job_id.to_string(),
        }
    }
}

#[async_trait]
impl ProcessBook for JobBook {
    async fn child_started(&self, tool: &str, pid: u32) -> Result<(), String> {
        self.ledger
            .record_child_process(&self.job_id, tool, pid)
            .await
            .map_err(|e| e.to_string())
    }

    async fn child_exited(&self, pid: u32) {
        if let Err(e) = self.ledger.forget_child_process(&self.job_id, pid).await {
            warn!("Job {}: could not forget pid {}: {}", self.job_id, pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format_detector::InputVariant;
    use crate::models::{ExtractedRelease, ResolvedMetadata, Track};

    async fn ledger(dir: &Path) -> JobLedger {
        JobLedger::open(&dir.join("ledger.db")).await.unwrap()
    }

    fn registration(root: &Path, job_id: &str) -> JobRegistration {
        JobRegistration {
            job_id: job_id.to_string(),
            input: "/music/album.mkv".to_string(),
            variant: InputVariant::SingleContainerFile {
                file: PathBuf::from("/music/album.mkv"),
            },
            artist_hint: "Artist".to_string(),
            album_hint: "Album".to_string(),
            library_root: PathBuf::from("/library"),
            workspace: workspace::path_for(root, job_id),
        }
    }

    #[tokio::test]
    async fn test_entry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = ledger(dir.path()).await;
            ledger.register(&registration(dir.path(), "j1")).await.unwrap();
            ledger.record_child_process("j1", "makemkvcon", 4242).await.unwrap();
            ledger.advance_stage("j1", Stage::Extracting).await.unwrap();
        }

        let ledger = ledger(dir.path()).await;
        let entry = ledger.entry("j1").await.unwrap().unwrap();
        assert_eq!(entry.stage, Stage::Extracting);
        assert_eq!(entry.pids(), vec![4242]);
        assert_eq!(entry.owner_pid, std::process::id());
        assert_eq!(entry.artist_hint, "Artist");
    }

    #[tokio::test]
    async fn test_release_and_metadata_persist_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path()).await;
        ledger.register(&registration(dir.path(), "j1")).await.unwrap();

        let release = ExtractedRelease {
            sources: vec![PathBuf::from("/ws/raw/title_t00.mkv")],
            tracks: Track::sequence(&[Duration::from_secs(3), Duration::from_secs(4)]),
        };
        ledger.save_release("j1", &release).await.unwrap();
        ledger
            .save_metadata("j1", &ResolvedMetadata::from_hints("A", "B"))
            .await
            .unwrap();
        ledger.record_child_process("j1", "ffmpeg", 77).await.unwrap();
        ledger.park("j1", "ffmpeg exited with code 1").await.unwrap();

        let entry = ledger.entry("j1").await.unwrap().unwrap();
        assert!(entry.is_parked());
        assert_eq!(entry.release, Some(release));
        assert!(entry.metadata.unwrap().is_fallback());
        assert!(entry.processes.is_empty());
        assert_eq!(entry.last_error.as_deref(), Some("ffmpeg exited with code 1"));
    }

    #[tokio::test]
    async fn test_complete_removes_entry_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path()).await;
        ledger.register(&registration(dir.path(), "j1")).await.unwrap();
        let ws = workspace::create(dir.path(), "j1").unwrap();

        ledger.complete("j1").await.unwrap();
        assert!(!ws.exists());
        assert!(ledger.entry("j1").await.unwrap().is_none());
        assert!(matches!(
            ledger.advance_stage("j1", Stage::Transcoding).await,
            Err(LedgerError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_takes_over_entry_from_exited_owner() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path()).await;
        ledger.register(&registration(dir.path(), "j1")).await.unwrap();
        ledger.park("j1", "ffmpeg exited with code 1").await.unwrap();
        sqlx::query("UPDATE ledger_entries SET owner_pid = 4194305 WHERE job_id = 'j1'")
            .execute(&ledger.pool)
            .await
            .unwrap();

        ledger.claim("j1").await.unwrap();
        let entry = ledger.entry("j1").await.unwrap().unwrap();
        assert_eq!(entry.owner_pid, std::process::id());
        assert!(entry.is_parked());
    }

    #[tokio::test]
    async fn test_writes_to_a_lost_entry_fail() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path()).await;
        for result in [
            ledger.claim("gone").await,
            ledger.park("gone", "ffmpeg exited with code 1").await,
            ledger.remove("gone").await,
            ledger.complete("gone").await,
        ] {
            assert!(matches!(result, Err(LedgerError::UnknownJob(_))));
        }
    }

    #[tokio::test]
    async fn test_booking_unknown_job_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path()).await;
        assert!(matches!(
            ledger.record_child_process("nope", "ffmpeg", 1).await,
            Err(LedgerError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_row_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path()).await;
        ledger.register(&registration(dir.path(), "good")).await.unwrap();
        ledger.register(&registration(dir.path(), "bad")).await.unwrap();
        sqlx::query("UPDATE ledger_entries SET stage = 'exploded', variant = '{' WHERE job_id = 'bad'")
            .execute(&ledger.pool)
            .await
            .unwrap();

        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, "good");
    }

    #[tokio::test]
    async fn test_unreadable_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let ledger = JobLedger::open(&path).await.unwrap();
        assert!(ledger.entries().await.unwrap().is_empty());

        let moved: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("ledger.db.corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);
    }
}

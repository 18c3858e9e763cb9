//! HistoryStore: durable catalogue of jobs on SQLite.
//!
//! One `jobs` table. Every mutation runs in its own transaction, and terminal
//! writes only apply to rows that are still pending or processing, so a
//! completion racing a delete either lands on the full row or on nothing.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::job::{format_processing_time, Job, JobState, JobStatus, JobSummary};
use crate::schema::{FileType, JobResult, ProcessingMode};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        file_type TEXT NOT NULL,
        mode TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        page_count INTEGER,
        processing_time_ms INTEGER,
        result TEXT,
        error_message TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at DESC, id DESC);
    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
";

const JOB_COLUMNS: &str = "id, filename, file_type, mode, created_at, status, page_count, \
                           processing_time_ms, result, error_message";

/// One page of the history listing. `total` counts every matching job, not
/// just this slice.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<JobSummary>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the database at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        info!("History store ready at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Run store operations on the blocking thread pool. Async callers go
    /// through here; the methods below block on SQLite I/O and the lock.
    pub async fn call<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&HistoryStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Record a freshly created job.
    pub fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (id, filename, file_type, mode, created_at, status, page_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id,
                job.filename,
                job.file_type.as_str(),
                job.mode.as_str(),
                job.created_at.timestamp_micros(),
                job.status().as_str(),
                job.page_count,
            ],
        )?;
        tx.commit()?;
        debug!("Job {} recorded as {}", job.id, job.status());
        Ok(())
    }

    /// Persist `pending → processing`.
    pub fn mark_processing(&self, job: &Job) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status = ?2 WHERE id = ?1 AND status = 'pending'",
            params![job.id, JobStatus::Processing.as_str()],
        )?;
        if changed == 0 {
            return Err(missing_or_terminal(&tx, &job.id)?);
        }
        tx.commit()?;
        Ok(())
    }

    /// Persist a terminal job: status, result or error, processing time and
    /// page count in one write. Rejected once the row is terminal.
    pub fn finish(&self, job: &Job) -> Result<(), StoreError> {
        let (processing_time, result, error_message) = match job.state() {
            JobState::Completed {
                processing_time,
                result,
            } => (*processing_time, Some(serde_json::to_string(result)?), None),
            JobState::Failed {
                processing_time,
                error_message,
            } => (*processing_time, None, Some(error_message.as_str())),
            _ => {
                return Err(StoreError::Corrupt {
                    id: job.id.clone(),
                    reason: format!("finish called on a {} job", job.status()),
                })
            }
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs
             SET status = ?2, page_count = ?3, processing_time_ms = ?4, result = ?5, error_message = ?6
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![
                job.id,
                job.status().as_str(),
                job.page_count,
                processing_time.as_millis() as i64,
                result,
                error_message,
            ],
        )?;
        if changed == 0 {
            return Err(missing_or_terminal(&tx, &job.id)?);
        }
        tx.commit()?;
        debug!("Job {} stored as {}", job.id, job.status());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Job, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                StoredJob::from_row,
            )
            .optional()?;
        raw.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .into_job()
    }

    /// Newest first; `page` is 1-based. Count and slice are read in one
    /// transaction so they agree with each other.
    pub fn list(
        &self,
        page: u32,
        page_size: u32,
        status: Option<JobStatus>,
    ) -> Result<HistoryPage, StoreError> {
        let status = status.map(|s| s.as_str());
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE (?1 IS NULL OR status = ?1)",
            params![status],
            |r| r.get(0),
        )?;

        let items = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM jobs
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![status, i64::from(page_size), offset],
                StoredJob::from_row,
            )?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?.into_summary()?);
            }
            items
        };
        tx.commit()?;

        Ok(HistoryPage {
            items,
            total: total as u64,
            page,
            page_size,
        })
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tx.commit()?;
        info!("Deleted job {}", id);
        Ok(())
    }

    /// Remove every job; returns how many were removed.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM jobs", [])?;
        tx.commit()?;
        info!("Deleted all {} jobs", removed);
        Ok(removed)
    }
}

/// Explain why a guarded update touched no row.
fn missing_or_terminal(tx: &Transaction<'_>, id: &str) -> Result<StoreError, StoreError> {
    let status: Option<String> = tx
        .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    Ok(match status.as_deref().and_then(JobStatus::parse) {
        None => StoreError::NotFound(id.to_string()),
        Some(status) => StoreError::AlreadyTerminal {
            id: id.to_string(),
            status,
        },
    })
}

/// A `jobs` row as stored, before validation.
struct StoredJob {
    id: String,
    filename: String,
    file_type: String,
    mode: String,
    created_at: i64,
    status: String,
    page_count: Option<u32>,
    processing_time_ms: Option<i64>,
    result: Option<String>,
    error_message: Option<String>,
}

impl StoredJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            file_type: row.get(2)?,
            mode: row.get(3)?,
            created_at: row.get(4)?,
            status: row.get(5)?,
            page_count: row.get(6)?,
            processing_time_ms: row.get(7)?,
            result: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            id: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn file_type(&self) -> Result<FileType, StoreError> {
        FileType::parse(&self.file_type)
            .ok_or_else(|| self.corrupt(format!("unknown file type '{}'", self.file_type)))
    }

    fn mode(&self) -> Result<ProcessingMode, StoreError> {
        ProcessingMode::parse(&self.mode)
            .ok_or_else(|| self.corrupt(format!("unknown mode '{}'", self.mode)))
    }

    fn status(&self) -> Result<JobStatus, StoreError> {
        JobStatus::parse(&self.status)
            .ok_or_else(|| self.corrupt(format!("unknown status '{}'", self.status)))
    }

    fn created_at(&self) -> Result<DateTime<Utc>, StoreError> {
        DateTime::from_timestamp_micros(self.created_at)
            .ok_or_else(|| self.corrupt("created_at out of range"))
    }

    fn processing_time(&self) -> Option<Duration> {
        self.processing_time_ms
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
    }

    fn into_summary(self) -> Result<JobSummary, StoreError> {
        Ok(JobSummary {
            file_type: self.file_type()?,
            mode: self.mode()?,
            created_at: self.created_at()?,
            processing_time: self.processing_time().map(format_processing_time),
            status: self.status()?,
            page_count: self.page_count,
            id: self.id,
            filename: self.filename,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let file_type = self.file_type()?;
        let mode = self.mode()?;
        let created_at = self.created_at()?;
        let processing_time = self.processing_time().unwrap_or_default();

        let state = match self.status()? {
            JobStatus::Pending => JobState::Pending,
            JobStatus::Processing => JobState::Processing,
            JobStatus::Completed => {
                let raw = self
                    .result
                    .as_deref()
                    .ok_or_else(|| self.corrupt("completed job without result"))?;
                let result: JobResult = serde_json::from_str(raw)?;
                if result.mode() != mode {
                    return Err(self.corrupt("result does not match job mode"));
                }
                JobState::Completed {
                    processing_time,
                    result,
                }
            }
            JobStatus::Failed => JobState::Failed {
                processing_time,
                error_message: self
                    .error_message
                    .clone()
                    .ok_or_else(|| self.corrupt("failed job without error message"))?,
            },
        };

        Ok(Job::restore(
            self.id,
            self.filename,
            file_type,
            mode,
            created_at,
            self.page_count,
            state,
        ))
    }
}

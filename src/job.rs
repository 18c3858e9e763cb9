//! Job entity and its lifecycle.
//!
//! `pending → processing → {completed, failed}`. The outcome fields live
//! inside the terminal states, so a completed job always has a result and
//! never an error message, and vice versa. Terminal states accept no further
//! transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::schema::{Document, FileType, JobResult, OcrResult, ProcessingMode, StructureResult};

/// Wire-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state with its state-specific data.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Processing,
    Completed {
        processing_time: Duration,
        result: JobResult,
    },
    Failed {
        processing_time: Duration,
        error_message: String,
    },
}

/// A transition the state machine does not allow. Always a bug in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} runs in {expected:?} mode but got a {actual:?} result")]
    ModeMismatch {
        id: String,
        expected: ProcessingMode,
        actual: ProcessingMode,
    },
}

/// The persisted unit of one processing request.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub mode: ProcessingMode,
    pub created_at: DateTime<Utc>,
    pub page_count: Option<u32>,
    state: JobState,
}

impl Job {
    /// A new pending job for an accepted document. The job takes the
    /// document's id.
    pub fn new(document: &Document, mode: ProcessingMode) -> Self {
        Self {
            id: document.id.clone(),
            filename: document.filename.clone(),
            file_type: document.file_type,
            mode,
            created_at: document.created_at,
            page_count: None,
            state: JobState::Pending,
        }
    }

    /// Rebuild a job from storage. The caller vouches that `state` matches
    /// `mode`.
    pub fn restore(
        id: String,
        filename: String,
        file_type: FileType,
        mode: ProcessingMode,
        created_at: DateTime<Utc>,
        page_count: Option<u32>,
        state: JobState,
    ) -> Self {
        Self {
            id,
            filename,
            file_type,
            mode,
            created_at,
            page_count,
            state,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn result(&self) -> Option<&JobResult> {
        match &self.state {
            JobState::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error_message, .. } => Some(error_message),
            _ => None,
        }
    }

    pub fn processing_time(&self) -> Option<Duration> {
        match &self.state {
            JobState::Completed { processing_time, .. }
            | JobState::Failed { processing_time, .. } => Some(*processing_time),
            _ => None,
        }
    }

    /// `pending → processing`, entered when page extraction begins.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            JobState::Pending => {
                self.state = JobState::Processing;
                Ok(())
            }
            _ => Err(self.invalid(JobStatus::Processing)),
        }
    }

    /// Page count is learned during processing and frozen afterwards.
    pub fn set_page_count(&mut self, count: u32) -> Result<(), LifecycleError> {
        match self.state {
            JobState::Processing => {
                self.page_count = Some(count);
                Ok(())
            }
            _ => Err(self.invalid(self.status())),
        }
    }

    /// `processing → completed`, setting result and time together.
    pub fn complete(&mut self, result: JobResult, processing_time: Duration) -> Result<(), LifecycleError> {
        if !matches!(self.state, JobState::Processing) {
            return Err(self.invalid(JobStatus::Completed));
        }
        if result.mode() != self.mode {
            return Err(LifecycleError::ModeMismatch {
                id: self.id.clone(),
                expected: self.mode,
                actual: result.mode(),
            });
        }
        self.state = JobState::Completed {
            processing_time: truncate_millis(processing_time),
            result,
        };
        Ok(())
    }

    /// `processing → failed` with the originating error's message.
    pub fn fail(&mut self, error_message: impl Into<String>, processing_time: Duration) -> Result<(), LifecycleError> {
        if !matches!(self.state, JobState::Processing) {
            return Err(self.invalid(JobStatus::Failed));
        }
        let mut error_message = error_message.into();
        if error_message.trim().is_empty() {
            error_message = "Processing failed".to_string();
        }
        self.state = JobState::Failed {
            processing_time: truncate_millis(processing_time),
            error_message,
        };
        Ok(())
    }

    fn invalid(&self, to: JobStatus) -> LifecycleError {
        LifecycleError::InvalidTransition {
            id: self.id.clone(),
            from: self.status(),
            to,
        }
    }
}

/// Storage keeps milliseconds; truncate up front so the in-memory job and
/// its stored copy render identically.
fn truncate_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// `"1.42s"`, as the history views display it.
pub fn format_processing_time(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}

// ---------------------------------------------------------------------------
// Response views
// ---------------------------------------------------------------------------

/// Flat OCR view of a Job. Structure-mode jobs are projected into OCR shape.
#[derive(Debug, Serialize)]
pub struct OcrResultResponse {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub created_at: DateTime<Utc>,
    pub processing_time: Option<String>,
    pub status: JobStatus,
    pub page_count: Option<u32>,
    pub ocr_result: Option<OcrResult>,
    pub error_message: Option<String>,
}

impl From<&Job> for OcrResultResponse {
    fn from(job: &Job) -> Self {
        let ocr_result = job.result().map(|r| match r {
            JobResult::Ocr(ocr) => ocr.clone(),
            JobResult::Structure(structure) => structure.to_ocr_view(),
        });
        Self {
            id: job.id.clone(),
            filename: job.filename.clone(),
            file_type: job.file_type,
            created_at: job.created_at,
            processing_time: job.processing_time().map(format_processing_time),
            status: job.status(),
            page_count: job.page_count,
            ocr_result,
            error_message: job.error_message().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StructureResultResponse {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub created_at: DateTime<Utc>,
    pub processing_time: Option<String>,
    pub status: JobStatus,
    pub page_count: Option<u32>,
    pub structure_result: Option<StructureResult>,
    pub error_message: Option<String>,
}

impl From<&Job> for StructureResultResponse {
    fn from(job: &Job) -> Self {
        let structure_result = match job.result() {
            Some(JobResult::Structure(structure)) => Some(structure.clone()),
            _ => None,
        };
        Self {
            id: job.id.clone(),
            filename: job.filename.clone(),
            file_type: job.file_type,
            created_at: job.created_at,
            processing_time: job.processing_time().map(format_processing_time),
            status: job.status(),
            page_count: job.page_count,
            structure_result,
            error_message: job.error_message().map(str::to_string),
        }
    }
}

/// The processing response matching the Job's mode.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum JobResponse {
    Ocr(OcrResultResponse),
    Structure(StructureResultResponse),
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        match job.mode {
            ProcessingMode::Ocr => JobResponse::Ocr(job.into()),
            ProcessingMode::Structure => JobResponse::Structure(job.into()),
        }
    }
}

/// One row of the history listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub mode: ProcessingMode,
    pub created_at: DateTime<Utc>,
    pub processing_time: Option<String>,
    pub status: JobStatus,
    pub page_count: Option<u32>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn document(id: &str) -> Document {
        Document {
            id: id.to_string(),
            filename: format!("{}.png", id),
            file_type: FileType::Image,
            size: 10,
            content_hash: "0".repeat(64),
            created_at: crate::ingest::now_micros(),
        }
    }

    pub fn ocr_result(text: &str) -> JobResult {
        JobResult::Ocr(OcrResult {
            text: text.to_string(),
            blocks: vec![],
            markdown: None,
            quality: None,
            warnings: vec![],
        })
    }

    #[test]
    fn test_happy_path() {
        let mut job = Job::new(&document("a"), ProcessingMode::Ocr);
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.result().is_none() && job.error_message().is_none());

        job.start().unwrap();
        job.set_page_count(3).unwrap();
        job.complete(ocr_result("hello"), Duration::from_micros(1_234_567)).unwrap();

        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.result().is_some());
        assert!(job.error_message().is_none());
        assert_eq!(job.processing_time(), Some(Duration::from_millis(1234)));
        assert_eq!(job.page_count, Some(3));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = Job::new(&document("b"), ProcessingMode::Ocr);
        job.start().unwrap();
        job.fail("Corrupt document: no xref", Duration::from_millis(5)).unwrap();
        let snapshot = job.clone();

        assert!(job.complete(ocr_result("late"), Duration::from_secs(1)).is_err());
        assert!(job.fail("again", Duration::from_secs(1)).is_err());
        assert!(job.start().is_err());
        assert!(job.set_page_count(9).is_err());
        assert_eq!(job, snapshot);
        assert_eq!(job.error_message(), Some("Corrupt document: no xref"));
        assert!(job.result().is_none());
    }

    #[test]
    fn test_no_skipping_processing() {
        let mut job = Job::new(&document("c"), ProcessingMode::Ocr);
        let err = job.complete(ocr_result("x"), Duration::ZERO).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                id: "c".to_string(),
                from: JobStatus::Pending,
                to: JobStatus::Completed,
            }
        );
        assert!(job.fail("x", Duration::ZERO).is_err());
    }

    #[test]
    fn test_result_must_match_mode() {
        let mut job = Job::new(&document("d"), ProcessingMode::Structure);
        job.start().unwrap();
        assert!(matches!(
            job.complete(ocr_result("x"), Duration::ZERO),
            Err(LifecycleError::ModeMismatch { .. })
        ));
        let structure = JobResult::Structure(StructureResult {
            blocks: vec![],
            markdown: String::new(),
            tables: vec![],
            warnings: vec![],
        });
        job.complete(structure, Duration::ZERO).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_failed_job_view() {
        let mut job = Job::new(&document("e"), ProcessingMode::Ocr);
        job.start().unwrap();
        job.fail("Unsupported format: not a PDF", Duration::from_millis(42)).unwrap();

        let json = serde_json::to_value(JobResponse::from(&job)).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json["ocr_result"].is_null());
        assert_eq!(json["error_message"], "Unsupported format: not a PDF");
        assert_eq!(json["processing_time"], "0.04s");
    }

    #[test]
    fn test_structure_job_views() {
        let mut job = Job::new(&document("f"), ProcessingMode::Structure);
        job.start().unwrap();
        job.complete(
            JobResult::Structure(StructureResult {
                blocks: vec![],
                markdown: "# Title".to_string(),
                tables: vec![],
                warnings: vec![],
            }),
            Duration::from_millis(10),
        )
        .unwrap();

        let json = serde_json::to_value(JobResponse::from(&job)).unwrap();
        assert_eq!(json["structure_result"]["markdown"], "# Title");
        assert!(json.get("ocr_result").is_none());

        let projected = OcrResultResponse::from(&job);
        assert_eq!(
            projected.ocr_result.and_then(|r| r.markdown),
            Some("# Title".to_string())
        );
    }

    #[test]
    fn test_processing_time_format() {
        assert_eq!(format_processing_time(Duration::from_millis(1420)), "1.42s");
        assert_eq!(format_processing_time(Duration::ZERO), "0.00s");
    }
}

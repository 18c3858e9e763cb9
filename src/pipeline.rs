//! One processing request, start to finish.
//!
//! The Job is recorded as pending, moved to processing when extraction
//! starts, and written back terminal before the call returns. Processing
//! failures end up on the Job; only store and lifecycle errors escape.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::aggregate::aggregate;
use crate::error::{ApiError, EngineError, ExtractError, StoreError};
use crate::history::HistoryStore;
use crate::job::Job;
use crate::ocr::adapter::{InferenceAdapter, PageOutcome};
use crate::pages::{Page, PageExtractor, PageInfo, PageSource};
use crate::schema::{Document, FileType, JobResult, PageWarning, ProcessingMode};
use crate::structure::StructureSynthesizer;

/// Anything that turns a job `failed`.
#[derive(Debug, Error)]
enum ProcessingError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Page extraction task failed: {0}")]
    Task(String),
}

pub struct Pipeline {
    extractor: PageExtractor,
    adapter: InferenceAdapter,
    synthesizer: StructureSynthesizer,
    history: Arc<HistoryStore>,
    language: String,
    page_workers: usize,
}

impl Pipeline {
    pub fn new(
        extractor: PageExtractor,
        adapter: InferenceAdapter,
        synthesizer: StructureSynthesizer,
        history: Arc<HistoryStore>,
        language: impl Into<String>,
        page_workers: usize,
    ) -> Self {
        Self {
            extractor,
            adapter,
            synthesizer,
            history,
            language: language.into(),
            page_workers: page_workers.max(1),
        }
    }

    /// Process an accepted document and return the terminal Job.
    pub async fn run(
        &self,
        document: Document,
        bytes: Vec<u8>,
        mode: ProcessingMode,
    ) -> Result<Job, ApiError> {
        let mut job = Job::new(&document, mode);
        self.store(&job, HistoryStore::insert).await?;
        info!(
            "Job {} created for {} ({}, {} bytes, {:?} mode)",
            job.id,
            document.filename,
            document.file_type.as_str(),
            document.size,
            mode
        );

        let started = Instant::now();
        job.start()?;
        tolerate_deleted(&job, self.store(&job, HistoryStore::mark_processing).await)?;

        let outcome = match self.open(document.file_type, bytes).await {
            Ok(source) => {
                if document.file_type == FileType::Pdf {
                    job.set_page_count(source.page_count() as u32)?;
                }
                self.analyze(source, mode).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                job.complete(result, started.elapsed())?;
                info!("Job {} completed in {:.2}s", job.id, started.elapsed().as_secs_f64());
            }
            Err(e) => {
                error!("Job {} failed: {}", job.id, e);
                job.fail(e.to_string(), started.elapsed())?;
            }
        }

        tolerate_deleted(&job, self.store(&job, HistoryStore::finish).await)?;
        Ok(job)
    }

    async fn store<F>(&self, job: &Job, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&HistoryStore, &Job) -> Result<(), StoreError> + Send + 'static,
    {
        let job = job.clone();
        self.history.call(move |h| write(h, &job)).await
    }

    async fn open(&self, file_type: FileType, bytes: Vec<u8>) -> Result<PageSource, ProcessingError> {
        let extractor = self.extractor.clone();
        let source = tokio::task::spawn_blocking(move || extractor.open(bytes, file_type))
            .await
            .map_err(|e| ProcessingError::Task(e.to_string()))??;
        Ok(source)
    }

    async fn render(&self, source: Arc<PageSource>, index: usize) -> Result<Page, ProcessingError> {
        let extractor = self.extractor.clone();
        let page = tokio::task::spawn_blocking(move || extractor.render(&source, index))
            .await
            .map_err(|e| ProcessingError::Task(e.to_string()))??;
        Ok(page)
    }

    /// Render and infer every page on a bounded worker set, restore page
    /// order, then build the mode's result. A worker holds at most one
    /// raster, released once the page is encoded for the engine.
    async fn analyze(&self, source: PageSource, mode: ProcessingMode) -> Result<JobResult, ProcessingError> {
        let source = Arc::new(source);
        let language = self.language.as_str();
        let mut results: Vec<(PageInfo, Result<PageOutcome, EngineError>)> =
            stream::iter(0..source.page_count())
                .map(|index| {
                    let source = source.clone();
                    async move {
                        let page = self.render(source, index).await?;
                        let info = page.info();
                        let outcome = self.adapter.infer(page, language, mode).await;
                        Ok::<_, ProcessingError>((info, outcome))
                    }
                })
                .buffer_unordered(self.page_workers)
                .try_collect()
                .await?;
        results.sort_by_key(|(info, _)| info.index);

        let mut infos = Vec::with_capacity(results.len());
        let mut outcomes = Vec::with_capacity(results.len());
        let mut unavailable = None;
        for (info, result) in results {
            infos.push(info);
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!("Page {}: {}", info.index, e);
                    outcomes.push(PageOutcome::Skipped(PageWarning {
                        page: info.index,
                        message: e.to_string(),
                    }));
                    unavailable.get_or_insert(e);
                }
            }
        }

        // Work already done on other pages is kept; the engine being down
        // only fails the document when it produced nothing at all.
        if let Some(e) = unavailable {
            if !outcomes.iter().any(|o| matches!(o, PageOutcome::Detected(_))) {
                return Err(e.into());
            }
        }

        Ok(match mode {
            ProcessingMode::Ocr => JobResult::Ocr(aggregate(&infos, &outcomes)),
            ProcessingMode::Structure => {
                JobResult::Structure(self.synthesizer.synthesize(&infos, &outcomes))
            }
        })
    }
}

/// A job deleted while it was processing keeps going in memory; the caller
/// still gets its outcome, but nothing is written back.
fn tolerate_deleted(job: &Job, write: Result<(), StoreError>) -> Result<(), StoreError> {
    match write {
        Err(StoreError::NotFound(_)) => {
            warn!("Job {} was deleted during processing; not storing it", job.id);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ingest::{Accept, IngestionGate, Upload};
    use crate::job::JobStatus;
    use crate::ocr::pool::EnginePool;
    use crate::ocr::{EngineProfile, EngineRequest, OcrEngine, RawDetection, RawPoints};
    use crate::pages::tests::{build_pdf, build_png, BlankRasterizer};
    use crate::pages::PdfRasterizer;
    use crate::schema::BBoxFormat;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replies with fixed detections, except for pages of one height.
    pub struct TestEngine {
        pub lines: Vec<RawDetection>,
        pub failing_height: Option<(u32, EngineError)>,
        pub down: bool,
    }

    impl TestEngine {
        pub fn lines(lines: Vec<RawDetection>) -> Self {
            Self {
                lines,
                failing_height: None,
                down: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl OcrEngine for TestEngine {
        fn name(&self) -> &str {
            "test"
        }

        fn profile(&self) -> EngineProfile {
            EngineProfile {
                confidence_scale: 1.0,
                max_side: 4096,
            }
        }

        async fn health(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn detect(&self, request: &EngineRequest) -> Result<Vec<RawDetection>, EngineError> {
            if self.down {
                return Err(EngineError::Unavailable("model weights missing".to_string()));
            }
            match &self.failing_height {
                Some((height, err)) if *height == request.height => Err(err.clone()),
                _ => Ok(self.lines.clone()),
            }
        }
    }

    /// Rasterizes page `n` with height `100 * (n + 1)` so the engine can tell
    /// pages apart.
    struct SteppedRasterizer;

    impl PdfRasterizer for SteppedRasterizer {
        fn page_count(&self, _: &[u8]) -> Result<usize, ExtractError> {
            Err(ExtractError::Rasterizer("no page count available".to_string()))
        }

        fn render_page(&self, _: &[u8], index: usize, _dpi: u32) -> Result<DynamicImage, ExtractError> {
            Ok(DynamicImage::ImageRgb8(RgbImage::new(400, 100 * (index as u32 + 1))))
        }
    }

    pub fn line(text: &str, rect: [f32; 4], label: Option<&str>) -> RawDetection {
        RawDetection {
            text: text.to_string(),
            confidence: 0.93,
            points: RawPoints::Flat(rect.to_vec()),
            label: label.map(String::from),
        }
    }

    pub fn pipeline_with(engine: TestEngine, rasterizer: Arc<dyn PdfRasterizer>) -> (Pipeline, Arc<HistoryStore>) {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let pool = Arc::new(EnginePool::new(vec![Box::new(engine)]));
        let pipeline = Pipeline::new(
            PageExtractor::new(rasterizer, 200),
            InferenceAdapter::new(pool, BBoxFormat::Rect),
            StructureSynthesizer::new(24.0),
            history.clone(),
            "en",
            4,
        );
        (pipeline, history)
    }

    fn pipeline(engine: TestEngine) -> (Pipeline, Arc<HistoryStore>) {
        pipeline_with(engine, Arc::new(BlankRasterizer { width: 400, height: 500 }))
    }

    fn admit(filename: &str, content_type: &str, data: Vec<u8>) -> (Document, Vec<u8>) {
        IngestionGate::new(10 * 1024 * 1024)
            .admit(
                Upload {
                    filename: filename.to_string(),
                    content_type: Some(content_type.to_string()),
                    data,
                },
                Accept::Any,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_page_png() {
        let (pipeline, history) = pipeline(TestEngine::lines(vec![line(
            "Hello, world",
            [10.0, 10.0, 200.0, 30.0],
            None,
        )]));
        let (doc, bytes) = admit("hello.png", "image/png", build_png(400, 300));

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.page_count, None);
        let Some(JobResult::Ocr(result)) = job.result() else {
            panic!("expected an OCR result");
        };
        assert!(!result.blocks.is_empty());
        assert_eq!(result.text, "Hello, world");
        assert!(result.markdown.is_none());

        assert_eq!(history.get(&job.id).unwrap(), job);
    }

    #[tokio::test]
    async fn test_three_page_pdf() {
        let (pipeline, _) = pipeline(TestEngine::lines(vec![line("Page text", [0.0, 0.0, 50.0, 10.0], None)]));
        let (doc, bytes) = admit("report.pdf", "application/pdf", build_pdf(3));

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.page_count, Some(3));
        let Some(JobResult::Ocr(result)) = job.result() else {
            panic!("expected an OCR result");
        };
        assert_eq!(result.text.matches("\n\n").count(), 2);
        assert!(result
            .blocks
            .iter()
            .all(|b| matches!(b.page, Some(0) | Some(1) | Some(2))));
    }

    #[tokio::test]
    async fn test_structure_two_by_two_table() {
        let cells = vec![
            line("30", [220.0, 140.0, 320.0, 170.0], Some("table_cell")),
            line("Name", [100.0, 100.0, 200.0, 130.0], Some("table_cell")),
            line("Alice", [100.0, 140.0, 200.0, 170.0], Some("table_cell")),
            line("Age", [220.0, 100.0, 320.0, 130.0], Some("table_cell")),
        ];
        let (pipeline, history) = pipeline(TestEngine::lines(cells));
        let (doc, bytes) = admit("table.png", "image/png", build_png(400, 300));

        let job = pipeline.run(doc, bytes, ProcessingMode::Structure).await.unwrap();
        let Some(JobResult::Structure(result)) = job.result() else {
            panic!("expected a structure result");
        };
        assert_eq!(result.tables.len(), 1);
        assert_eq!(result.tables[0].rows, vec![vec!["Name", "Age"], vec!["Alice", "30"]]);
        assert!(result.markdown.contains("| --- | --- |"));

        let stored = history.get(&job.id).unwrap();
        assert_eq!(stored.mode, ProcessingMode::Structure);
    }

    #[tokio::test]
    async fn test_corrupted_pdf_fails_job() {
        let (pipeline, history) = pipeline(TestEngine::lines(vec![]));
        let (doc, bytes) = admit("broken.pdf", "application/pdf", b"%PDF-1.4\nnot really a pdf".to_vec());

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.result().is_none());
        assert!(!job.error_message().unwrap_or_default().is_empty());
        assert_eq!(history.get(&job.id).unwrap().status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_image_upload_that_is_not_an_image_fails_job() {
        let (pipeline, _) = pipeline(TestEngine::lines(vec![]));
        let (doc, bytes) = admit("fake.png", "image/png", b"definitely not png".to_vec());

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error_message().unwrap_or_default().starts_with("Unsupported format"));
    }

    #[tokio::test]
    async fn test_unavailable_engine_fails_job() {
        let engine = TestEngine {
            lines: vec![],
            failing_height: None,
            down: true,
        };
        let (pipeline, _) = pipeline(engine);
        let (doc, bytes) = admit("a.png", "image/png", build_png(10, 10));

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error_message().unwrap_or_default().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_bad_page_downgrades_to_warning() {
        let engine = TestEngine {
            lines: vec![line("text", [0.0, 0.0, 40.0, 10.0], None)],
            failing_height: Some((200, EngineError::Page("timeout".to_string()))),
            down: false,
        };
        let (pipeline, _) = pipeline_with(engine, Arc::new(SteppedRasterizer));
        let (doc, bytes) = admit("three.pdf", "application/pdf", build_pdf(3));

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        let Some(JobResult::Ocr(result)) = job.result() else {
            panic!("expected an OCR result");
        };
        let pages: Vec<Option<usize>> = result.blocks.iter().map(|b| b.page).collect();
        assert_eq!(pages, vec![Some(0), Some(2)]);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].page, 1);
        // Empty middle page still keeps both separators.
        assert_eq!(result.text, "text\n\n\n\ntext");
    }

    #[tokio::test]
    async fn test_engine_lost_mid_document_keeps_finished_pages() {
        let engine = TestEngine {
            lines: vec![line("kept", [0.0, 0.0, 40.0, 10.0], None)],
            failing_height: Some((300, EngineError::Unavailable("sidecar restarted".to_string()))),
            down: false,
        };
        let (pipeline, _) = pipeline_with(engine, Arc::new(SteppedRasterizer));
        let (doc, bytes) = admit("three.pdf", "application/pdf", build_pdf(3));

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        let Some(JobResult::Ocr(result)) = job.result() else {
            panic!("expected an OCR result");
        };
        assert_eq!(result.blocks.len(), 2);
        assert_eq!(result.warnings[0].page, 2);
    }

    #[tokio::test]
    async fn test_jobs_are_listed_newest_first() {
        let (pipeline, history) = pipeline(TestEngine::lines(vec![line("x", [0.0, 0.0, 5.0, 5.0], None)]));
        let mut ids = Vec::new();
        for n in 0..3 {
            let (doc, bytes) = admit(&format!("{}.png", n), "image/png", build_png(8, 8));
            ids.push(pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap().id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let listed: Vec<String> = history
            .list(1, 10, None)
            .unwrap()
            .items
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    /// Counts rasters rendered and pages whose inference finished, so the
    /// engine can see how many rasters are alive at once.
    struct Flight {
        rendered: AtomicUsize,
        finished: AtomicUsize,
        peak: AtomicUsize,
    }

    struct CountingRasterizer(Arc<Flight>);

    impl PdfRasterizer for CountingRasterizer {
        fn page_count(&self, _: &[u8]) -> Result<usize, ExtractError> {
            Err(ExtractError::Rasterizer("no page count available".to_string()))
        }

        fn render_page(&self, _: &[u8], _: usize, _: u32) -> Result<DynamicImage, ExtractError> {
            self.0.rendered.fetch_add(1, Ordering::SeqCst);
            Ok(DynamicImage::ImageRgb8(RgbImage::new(64, 64)))
        }
    }

    struct SlowEngine(Arc<Flight>);

    #[async_trait::async_trait]
    impl OcrEngine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }

        fn profile(&self) -> EngineProfile {
            EngineProfile::default()
        }

        async fn health(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn detect(&self, _: &EngineRequest) -> Result<Vec<RawDetection>, EngineError> {
            let in_flight = self.0.rendered.load(Ordering::SeqCst) - self.0.finished.load(Ordering::SeqCst);
            self.0.peak.fetch_max(in_flight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.0.finished.fetch_add(1, Ordering::SeqCst);
            Ok(vec![line("p", [0.0, 0.0, 10.0, 10.0], None)])
        }
    }

    #[tokio::test]
    async fn test_rasters_bounded_by_page_workers() {
        let flight = Arc::new(Flight {
            rendered: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let pool = Arc::new(EnginePool::new(vec![Box::new(SlowEngine(flight.clone()))]));
        let pipeline = Pipeline::new(
            PageExtractor::new(Arc::new(CountingRasterizer(flight.clone())), 200),
            InferenceAdapter::new(pool, BBoxFormat::Rect),
            StructureSynthesizer::new(24.0),
            history,
            "en",
            2,
        );
        let (doc, bytes) = admit("long.pdf", "application/pdf", build_pdf(12));

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.page_count, Some(12));
        assert_eq!(flight.rendered.load(Ordering::SeqCst), 12);
        assert!(flight.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_page_render_failure_fails_job() {
        struct BrokenPage;
        impl PdfRasterizer for BrokenPage {
            fn page_count(&self, _: &[u8]) -> Result<usize, ExtractError> {
                Err(ExtractError::Rasterizer("no page count available".to_string()))
            }
            fn render_page(&self, _: &[u8], index: usize, _: u32) -> Result<DynamicImage, ExtractError> {
                if index == 1 {
                    return Err(ExtractError::Rasterizer("pdftoppm failed on page 1".to_string()));
                }
                Ok(DynamicImage::ImageRgb8(RgbImage::new(32, 32)))
            }
        }

        let (pipeline, history) =
            pipeline_with(TestEngine::lines(vec![line("x", [0.0, 0.0, 5.0, 5.0], None)]), Arc::new(BrokenPage));
        let (doc, bytes) = admit("two.pdf", "application/pdf", build_pdf(2));

        let job = pipeline.run(doc, bytes, ProcessingMode::Ocr).await.unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.page_count, Some(2));
        assert!(job.error_message().unwrap_or_default().contains("pdftoppm failed"));
        assert_eq!(history.get(&job.id).unwrap(), job);
    }
}

//! OCR Service - document OCR and layout analysis server with job history.

mod aggregate;
mod config;
mod error;
mod history;
mod ingest;
mod job;
mod ocr;
mod pages;
mod pipeline;
mod schema;
mod structure;

use anyhow::Context;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use config::Settings;
use error::{ApiError, ValidationError};
use history::{HistoryPage, HistoryStore};
use ingest::{Accept, IngestionGate, Upload};
use job::{JobResponse, JobStatus, OcrResultResponse, StructureResultResponse};
use ocr::adapter::InferenceAdapter;
use ocr::paddle::PaddleSidecarEngine;
use ocr::pool::EnginePool;
use ocr::OcrEngine;
use pages::{PageExtractor, PopplerRasterizer};
use pipeline::Pipeline;
use schema::ProcessingMode;
use std::sync::Arc;
use structure::StructureSynthesizer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Room for multipart framing on top of the file itself, so an oversized file
/// reaches the ingestion gate and gets a proper 413.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    gate: IngestionGate,
    pipeline: Arc<Pipeline>,
    history: Arc<HistoryStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ocr_service=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    info!("Using OCR engine at {} (lang={})", settings.engine.url, settings.language);

    // Engine pool: N equivalent sidecar clients, each leased exclusively
    let engines = (0..settings.engine.instances)
        .map(|_| {
            PaddleSidecarEngine::new(&settings.engine).map(|e| Box::new(e) as Box<dyn OcrEngine>)
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to create OCR engine clients")?;
    let pool = Arc::new(EnginePool::new(engines));
    info!("Engine pool ready with {} instance(s)", pool.size());
    pool.warm_up().await;

    let history = Arc::new(
        HistoryStore::open(&settings.database_path)
            .with_context(|| format!("Failed to open {}", settings.database_path.display()))?,
    );

    let pipeline = Pipeline::new(
        PageExtractor::new(
            Arc::new(PopplerRasterizer::new(
                settings.pdftoppm_path.clone(),
                settings.pdfinfo_path.clone(),
            )),
            settings.pdf_dpi,
        ),
        InferenceAdapter::new(pool.clone(), settings.bbox_format),
        StructureSynthesizer::new(settings.table_adjacency_px),
        history.clone(),
        settings.language.clone(),
        settings.page_workers,
    );

    let gate = IngestionGate::new(settings.max_file_size);
    let body_limit = gate.max_file_size() + MULTIPART_OVERHEAD;
    let state = AppState {
        gate,
        pipeline: Arc::new(pipeline),
        history,
    };

    // Build router
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/ocr/image", post(ocr_image))
        .route("/api/ocr/pdf", post(ocr_pdf))
        .route("/api/ocr/structure", post(ocr_structure))
        .route("/api/ocr/result/:id", get(get_result))
        .route("/api/history", get(list_history).delete(delete_all_history))
        .route("/api/history/:id", get(get_history).delete(delete_history))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    pool.close();
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Service name and version.
async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Health check endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Flat OCR of a single image.
async fn ocr_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<OcrResultResponse>, ApiError> {
    let job = process(&state, multipart, Accept::Image, ProcessingMode::Ocr).await?;
    Ok(Json((&job).into()))
}

/// Flat OCR of every page of a PDF.
async fn ocr_pdf(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<OcrResultResponse>, ApiError> {
    let job = process(&state, multipart, Accept::Pdf, ProcessingMode::Ocr).await?;
    Ok(Json((&job).into()))
}

/// Layout analysis of an image or PDF.
async fn ocr_structure(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<StructureResultResponse>, ApiError> {
    let job = process(&state, multipart, Accept::Any, ProcessingMode::Structure).await?;
    Ok(Json((&job).into()))
}

async fn process(
    state: &AppState,
    multipart: Multipart,
    accept: Accept,
    mode: ProcessingMode,
) -> Result<job::Job, ApiError> {
    let upload = read_upload(multipart, state.gate.max_file_size()).await?;
    info!("Received file: {} ({} bytes)", upload.filename, upload.data.len());
    let (document, bytes) = state.gate.admit(upload, accept)?;
    state.pipeline.run(document, bytes, mode).await
}

/// Pull the `file` part out of the multipart body.
async fn read_upload(mut multipart: Multipart, limit: usize) -> Result<Upload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| upload_error(e, limit, ""))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("document").to_string();
            let content_type = field.content_type().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| upload_error(e, limit, "Failed to read file: "))?
                .to_vec();
            return Ok(Upload {
                filename,
                content_type,
                data,
            });
        }
    }
    Err(ValidationError::MissingFile.into())
}

/// A body cut off by the request size limit is an oversized upload, not a
/// malformed one.
fn upload_error(e: MultipartError, limit: usize, context: &str) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ValidationError::BodyTooLarge { limit }.into()
    } else {
        ApiError::Multipart(format!("{}{}", context, e.body_text()))
    }
}

/// Re-fetch a job in flat OCR shape.
async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OcrResultResponse>, ApiError> {
    let job = state.history.call(move |h| h.get(&id)).await?;
    Ok(Json((&job).into()))
}

/// Raw history query. Every field is optional and may be blank
/// (`?page=&page_size=&status=`), which means the default.
#[derive(Debug, Default, serde::Deserialize)]
struct HistoryQuery {
    page: Option<String>,
    page_size: Option<String>,
    status: Option<String>,
}

impl HistoryQuery {
    fn resolve(&self) -> Result<(u32, u32, Option<JobStatus>), ValidationError> {
        let page = query_number("page", self.page.as_deref(), 1)?;
        if page == 0 {
            return Err(ValidationError::Query("page must be at least 1".to_string()));
        }
        let page_size = query_number("page_size", self.page_size.as_deref(), DEFAULT_PAGE_SIZE)?;
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ValidationError::Query(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let status = match non_blank(self.status.as_deref()) {
            Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
                ValidationError::Query(format!(
                    "status must be one of pending, processing, completed, failed; got '{}'",
                    raw
                ))
            })?),
            None => None,
        };
        Ok((page, page_size, status))
    }
}

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

fn query_number(name: &str, raw: Option<&str>, default: u32) -> Result<u32, ValidationError> {
    match non_blank(raw) {
        Some(raw) => raw.parse().map_err(|_| {
            ValidationError::Query(format!("{} must be a positive integer, got '{}'", name, raw))
        }),
        None => Ok(default),
    }
}

/// Paginated job history, newest first.
async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ApiError> {
    let (page, page_size, status) = query.resolve()?;
    let listing = state
        .history
        .call(move |h| h.list(page, page_size, status))
        .await?;
    Ok(Json(listing))
}

/// Full job detail in the shape of its processing response.
async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.history.call(move |h| h.get(&id)).await?;
    Ok(Json((&job).into()))
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.history.call(move |h| h.delete(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_history(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.history.call(|h| h.delete_all()).await?;
    Ok(StatusCode::NO_CONTENT)
}

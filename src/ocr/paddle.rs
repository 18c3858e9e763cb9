//! PaddleOCR sidecar engine.
//!
//! The sidecar wraps a loaded PaddleOCR / PP-Structure model behind a small
//! HTTP API:
//!
//! - `GET  /health` → 200 once models are loaded
//! - `POST /ocr` (multipart: `file`, `lang`, `mode`) →
//!   `{ "results": [{ "text", "score", "box", "label"? }] }`

use super::{EngineProfile, EngineRequest, OcrEngine, RawDetection};
use crate::config::EngineSettings;
use crate::error::EngineError;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

/// Sidecar response (private deserialization type).
#[derive(Debug, Deserialize)]
struct PaddleResponse {
    #[serde(default)]
    results: Vec<RawDetection>,
}

pub struct PaddleSidecarEngine {
    url: String,
    client: reqwest::Client,
    profile: EngineProfile,
}

impl PaddleSidecarEngine {
    pub fn new(settings: &EngineSettings) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| EngineError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: settings.url.clone(),
            client,
            profile: EngineProfile {
                confidence_scale: settings.confidence_scale,
                max_side: settings.max_side,
            },
        })
    }
}

/// Connection-level failures mean the engine cannot be reached at all;
/// anything after a connection was made is specific to the page.
fn classify_send_error(e: reqwest::Error) -> EngineError {
    if e.is_connect() {
        EngineError::Unavailable(format!("Cannot reach OCR sidecar: {}", e))
    } else {
        EngineError::Page(format!("OCR sidecar request failed: {}", e))
    }
}

#[async_trait::async_trait]
impl OcrEngine for PaddleSidecarEngine {
    fn name(&self) -> &str {
        "paddle_sidecar"
    }

    fn profile(&self) -> EngineProfile {
        self.profile
    }

    async fn health(&self) -> Result<(), EngineError> {
        let response = self
            .client
            .get(format!("{}/health", self.url))
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(format!("Cannot reach OCR sidecar: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::Unavailable(format!(
                "OCR sidecar health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn detect(&self, request: &EngineRequest) -> Result<Vec<RawDetection>, EngineError> {
        use reqwest::multipart::{Form, Part};

        let part = Part::bytes(request.png.clone())
            .file_name("page.png")
            .mime_str("image/png")
            .map_err(|e| EngineError::Page(format!("Invalid multipart part: {}", e)))?;

        let form = Form::new()
            .part("file", part)
            .text("lang", request.language.clone())
            .text("mode", request.mode.as_str());

        let response = self
            .client
            .post(format!("{}/ocr", self.url))
            .multipart(form)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            // 503 is how the sidecar reports models that failed to load.
            return Err(if status == StatusCode::SERVICE_UNAVAILABLE {
                EngineError::Unavailable(format!("OCR sidecar not ready: {}", error_text))
            } else {
                EngineError::Page(format!("OCR sidecar error ({}): {}", status, error_text))
            });
        }

        let body: PaddleResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Page(format!("Unreadable OCR sidecar response: {}", e)))?;

        debug!(
            "PaddleSidecarEngine: {} results for {}x{} page",
            body.results.len(),
            request.width,
            request.height
        );
        Ok(body.results)
    }
}

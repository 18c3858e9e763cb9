//! OCR engine abstraction.
//!
//! Defines the [`OcrEngine`] trait and the engine-native detection types. The
//! engine is a black box ("given a raster page, return text with boxes and
//! confidence"); everything downstream of [`adapter::InferenceAdapter`] works
//! on canonical blocks instead of these raw shapes.

pub mod adapter;
pub mod paddle;
pub mod pool;

use serde::Deserialize;

use crate::error::EngineError;
use crate::schema::ProcessingMode;

/// A page encoded for the engine.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Engine-native language name.
    pub language: String,
    pub mode: ProcessingMode,
}

/// One detection as the engine reports it, in the coordinates of the image
/// it was sent and on its own confidence scale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawDetection {
    pub text: String,
    #[serde(alias = "score")]
    pub confidence: f32,
    #[serde(alias = "box", alias = "bbox")]
    pub points: RawPoints,
    /// Layout class, present in layout mode.
    #[serde(default, alias = "type")]
    pub label: Option<String>,
}

/// Box conventions engines are known to emit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawPoints {
    /// `[[x, y], ...]` with 2 (opposite corners) or 4 (quadrilateral) points.
    Points(Vec<[f32; 2]>),
    /// `[x0, y0, x1, y1]` or eight flat quadrilateral coordinates.
    Flat(Vec<f32>),
}

/// Engine-specific conventions the adapter has to undo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineProfile {
    /// Maximum native confidence value (1.0, or 100.0 for percent engines).
    pub confidence_scale: f32,
    /// Longest image side the engine should receive.
    pub max_side: u32,
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self {
            confidence_scale: 1.0,
            max_side: 2048,
        }
    }
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    fn profile(&self) -> EngineProfile;

    /// Cheap readiness probe.
    async fn health(&self) -> Result<(), EngineError>;

    async fn detect(&self, request: &EngineRequest) -> Result<Vec<RawDetection>, EngineError>;
}

/// Maps an ISO-639-1 code to the language name PaddleOCR expects.
pub fn engine_language(code: &str) -> String {
    let code = code.trim().to_ascii_lowercase();
    let mapped = match code.as_str() {
        "ko" | "kor" => "korean",
        "ja" | "jpn" => "japan",
        "zh" | "zh-cn" | "chi_sim" => "ch",
        "zh-tw" | "chi_tra" => "chinese_cht",
        "en" | "eng" => "en",
        "fr" | "fra" => "french",
        "de" | "deu" => "german",
        "ru" | "rus" => "ru",
        _ => return code,
    };
    mapped.to_string()
}

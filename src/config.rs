//! Service configuration.
//!
//! Values come from the process environment (a `.env` file is loaded first by
//! `main`). Every setting has a default so a bare `cargo run` works against a
//! local engine sidecar.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::schema::BBoxFormat;

/// Runtime settings for the whole service.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub engine: EngineSettings,
    /// ISO-639-1 code; the inference adapter maps it to engine-native names.
    pub language: String,
    pub bbox_format: BBoxFormat,
    /// Upper bound on pages inferred concurrently within one document.
    pub page_workers: usize,
    pub pdf_dpi: u32,
    pub pdftoppm_path: PathBuf,
    /// Page count fallback for PDFs lopdf cannot parse.
    pub pdfinfo_path: PathBuf,
    pub max_file_size: usize,
    pub table_adjacency_px: f32,
}

/// Connection and quirk settings for the OCR sidecar.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub url: String,
    pub instances: usize,
    pub timeout: Duration,
    pub max_side: u32,
    pub confidence_scale: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            database_path: PathBuf::from("ocr_history.db"),
            engine: EngineSettings {
                url: "http://localhost:8866".to_string(),
                instances: 1,
                timeout: Duration::from_secs(120),
                max_side: 2048,
                confidence_scale: 1.0,
            },
            language: "ko".to_string(),
            bbox_format: BBoxFormat::Rect,
            page_workers: 4,
            pdf_dpi: 200,
            pdftoppm_path: PathBuf::from("pdftoppm"),
            pdfinfo_path: PathBuf::from("pdfinfo"),
            max_file_size: 50 * 1024 * 1024,
            table_adjacency_px: 24.0,
        }
    }
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bbox_format = match lookup("BBOX_FORMAT") {
            Some(raw) => BBoxFormat::parse(&raw)
                .with_context(|| format!("BBOX_FORMAT must be 'rect' or 'quad', got '{}'", raw))?,
            None => defaults.bbox_format,
        };

        let settings = Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            engine: EngineSettings {
                url: lookup("OCR_ENGINE_URL")
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.engine.url),
                instances: parse_var(&lookup, "OCR_ENGINE_INSTANCES", defaults.engine.instances)?,
                timeout: Duration::from_secs(parse_var(
                    &lookup,
                    "OCR_ENGINE_TIMEOUT_SECS",
                    defaults.engine.timeout.as_secs(),
                )?),
                max_side: parse_var(&lookup, "OCR_ENGINE_MAX_SIDE", defaults.engine.max_side)?,
                confidence_scale: parse_var(
                    &lookup,
                    "OCR_ENGINE_CONFIDENCE_SCALE",
                    defaults.engine.confidence_scale,
                )?,
            },
            language: lookup("OCR_LANG").unwrap_or(defaults.language),
            bbox_format,
            page_workers: parse_var(&lookup, "PAGE_WORKERS", defaults.page_workers)?,
            pdf_dpi: parse_var(&lookup, "PDF_DPI", defaults.pdf_dpi)?,
            pdftoppm_path: lookup("PDFTOPPM_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.pdftoppm_path),
            pdfinfo_path: lookup("PDFINFO_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.pdfinfo_path),
            max_file_size: parse_var(&lookup, "MAX_FILE_SIZE", defaults.max_file_size)?,
            table_adjacency_px: parse_var(
                &lookup,
                "TABLE_ADJACENCY_PX",
                defaults.table_adjacency_px,
            )?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.instances == 0 {
            anyhow::bail!("OCR_ENGINE_INSTANCES must be at least 1");
        }
        if self.page_workers == 0 {
            anyhow::bail!("PAGE_WORKERS must be at least 1");
        }
        if self.pdf_dpi == 0 {
            anyhow::bail!("PDF_DPI must be positive");
        }
        if self.engine.max_side < 32 {
            anyhow::bail!("OCR_ENGINE_MAX_SIDE must be at least 32");
        }
        if !(self.engine.confidence_scale > 0.0) {
            anyhow::bail!("OCR_ENGINE_CONFIDENCE_SCALE must be positive");
        }
        if self.language.trim().is_empty() {
            anyhow::bail!("OCR_LANG must not be empty");
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Failed to parse {}={:?}", key, raw)),
        None => Ok(default),
    }
}

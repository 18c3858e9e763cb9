//! Page extraction: turn an uploaded document into rasters, one page at a time.
//!
//! Opening a document only establishes its page count: images have one page,
//! PDFs are counted with `lopdf` (poppler's `pdfinfo` when lopdf cannot parse
//! the file). Pages are rendered on demand at a fixed DPI by a
//! [`PdfRasterizer`], so every page of one document shares a coordinate scale
//! and only pages currently in flight hold a raster.

use image::io::Reader as ImageReader;
use image::DynamicImage;
use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ExtractError;
use crate::schema::FileType;

/// A raster page; lives only while its inference is in flight.
#[derive(Debug, Clone)]
pub struct Page {
    pub index: usize,
    pub image: DynamicImage,
}

impl Page {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            index: self.index,
            width: self.width(),
            height: self.height(),
        }
    }
}

/// Page geometry without the pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
}

/// Renders single PDF pages at a fixed resolution.
pub trait PdfRasterizer: Send + Sync {
    /// Page count as the renderer sees it. Only consulted when lopdf cannot
    /// parse the file.
    fn page_count(&self, pdf: &[u8]) -> Result<usize, ExtractError>;

    /// Render the zero-based page `index`.
    fn render_page(&self, pdf: &[u8], index: usize, dpi: u32)
        -> Result<DynamicImage, ExtractError>;
}

/// Rasterizer backed by poppler's `pdftoppm` and `pdfinfo`.
pub struct PopplerRasterizer {
    pdftoppm: PathBuf,
    pdfinfo: PathBuf,
}

impl PopplerRasterizer {
    pub fn new(pdftoppm: impl Into<PathBuf>, pdfinfo: impl Into<PathBuf>) -> Self {
        Self {
            pdftoppm: pdftoppm.into(),
            pdfinfo: pdfinfo.into(),
        }
    }

    fn stage(pdf: &[u8]) -> Result<(tempfile::TempDir, PathBuf), ExtractError> {
        let workdir = tempfile::tempdir()
            .map_err(|e| ExtractError::Rasterizer(format!("Failed to create temp dir: {}", e)))?;
        let pdf_path = workdir.path().join("input.pdf");
        std::fs::write(&pdf_path, pdf)
            .map_err(|e| ExtractError::Rasterizer(format!("Failed to write temp PDF: {}", e)))?;
        Ok((workdir, pdf_path))
    }
}

impl PdfRasterizer for PopplerRasterizer {
    fn page_count(&self, pdf: &[u8]) -> Result<usize, ExtractError> {
        let (_workdir, pdf_path) = Self::stage(pdf)?;

        let output = Command::new(&self.pdfinfo)
            .arg(&pdf_path)
            .output()
            .map_err(|e| {
                ExtractError::Rasterizer(format!(
                    "Failed to run {}: {}. Make sure poppler-utils is installed.",
                    self.pdfinfo.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(ExtractError::Rasterizer(format!(
                "pdfinfo failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_pdfinfo_pages(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ExtractError::Rasterizer("pdfinfo reported no page count".to_string())
        })
    }

    fn render_page(
        &self,
        pdf: &[u8],
        index: usize,
        dpi: u32,
    ) -> Result<DynamicImage, ExtractError> {
        let (workdir, pdf_path) = Self::stage(pdf)?;
        let prefix = workdir.path().join("page");
        let number = (index + 1).to_string();

        let output = Command::new(&self.pdftoppm)
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .args(["-f", &number, "-l", &number])
            .arg("-singlefile")
            .arg(&pdf_path)
            .arg(&prefix)
            .output()
            .map_err(|e| {
                ExtractError::Rasterizer(format!(
                    "Failed to run {}: {}. Make sure poppler-utils is installed.",
                    self.pdftoppm.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(ExtractError::Rasterizer(format!(
                "pdftoppm failed on page {}: {}",
                index,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // -singlefile writes `<prefix>.png` with no page suffix.
        image::open(prefix.with_extension("png")).map_err(|e| {
            ExtractError::Rasterizer(format!("Failed to decode rendered page {}: {}", index, e))
        })
    }
}

/// `pdfinfo` prints one `Key: value` pair per line.
fn parse_pdfinfo_pages(stdout: &str) -> Option<usize> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|count| count.trim().parse().ok())
}

/// An accepted document with a known page count. Pages are rendered from it
/// on demand by [`PageExtractor::render`].
#[derive(Debug)]
pub struct PageSource {
    data: Vec<u8>,
    file_type: FileType,
    page_count: usize,
}

impl PageSource {
    pub fn page_count(&self) -> usize {
        self.page_count
    }
}

/// Normalizes documents into pages. Stateless between calls.
#[derive(Clone)]
pub struct PageExtractor {
    rasterizer: Arc<dyn PdfRasterizer>,
    dpi: u32,
}

impl PageExtractor {
    pub fn new(rasterizer: Arc<dyn PdfRasterizer>, dpi: u32) -> Self {
        Self { rasterizer, dpi }
    }

    /// Validate the document and count its pages without rendering any.
    pub fn open(&self, data: Vec<u8>, file_type: FileType) -> Result<PageSource, ExtractError> {
        let page_count = match file_type {
            FileType::Image => {
                let (width, height) = image_dimensions(&data)?;
                debug!("Image page {}x{}", width, height);
                1
            }
            FileType::Pdf => self.pdf_page_count(&data)?,
        };
        Ok(PageSource {
            data,
            file_type,
            page_count,
        })
    }

    /// Render page `index` of an opened document.
    pub fn render(&self, source: &PageSource, index: usize) -> Result<Page, ExtractError> {
        if index >= source.page_count {
            return Err(ExtractError::CorruptDocument(format!(
                "Page {} requested from a {} page document",
                index, source.page_count
            )));
        }
        let image = match source.file_type {
            FileType::Image => image::load_from_memory(&source.data).map_err(|e| {
                ExtractError::UnsupportedFormat(format!("Could not decode image: {}", e))
            })?,
            FileType::Pdf => self.rasterizer.render_page(&source.data, index, self.dpi)?,
        };
        debug!("Rendered page {} at {}x{}", index, image.width(), image.height());
        Ok(Page { index, image })
    }

    fn pdf_page_count(&self, data: &[u8]) -> Result<usize, ExtractError> {
        if !looks_like_pdf(data) {
            return Err(ExtractError::UnsupportedFormat(
                "File does not start with a PDF header".to_string(),
            ));
        }

        let count = match lopdf::Document::load_mem(data) {
            Ok(doc) => doc.get_pages().len(),
            Err(e) => {
                warn!("lopdf failed to parse PDF: {}. Asking the rasterizer for the page count.", e);
                self.rasterizer.page_count(data).map_err(|fallback| {
                    ExtractError::CorruptDocument(format!(
                        "Failed to load PDF: {} ({})",
                        e, fallback
                    ))
                })?
            }
        };

        if count == 0 {
            return Err(ExtractError::CorruptDocument(
                "PDF contains no pages".to_string(),
            ));
        }
        info!("PDF has {} pages, rendering at {} dpi", count, self.dpi);
        Ok(count)
    }
}

/// Reads only the header; the full decode happens when the page is rendered.
fn image_dimensions(data: &[u8]) -> Result<(u32, u32), ExtractError> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ExtractError::UnsupportedFormat(format!("Could not read image: {}", e)))?
        .into_dimensions()
        .map_err(|e| ExtractError::UnsupportedFormat(format!("Could not decode image: {}", e)))
}

/// The header may be preceded by a little garbage; readers accept it within
/// the first kilobyte.
fn looks_like_pdf(data: &[u8]) -> bool {
    let head = &data[..data.len().min(1024)];
    head.windows(5).any(|w| w == b"%PDF-")
}

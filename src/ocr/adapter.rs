//! Translation between the engine's native output and canonical blocks.
//!
//! Downstream stages assume confidence in `[0, 1]` and boxes in pixel
//! coordinates of the original page, in one convention per document. This is
//! the only place that knows how far that is from what the engine returns.

use image::imageops::FilterType;
use image::ImageOutputFormat;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

use super::pool::EnginePool;
use super::{engine_language, EngineProfile, EngineRequest, RawDetection, RawPoints};
use crate::error::EngineError;
use crate::pages::Page;
use crate::schema::{BBox, BBoxFormat, BlockType, PageWarning, ProcessingMode, Rect};

/// A canonical detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub text: String,
    pub confidence: f32,
    pub bbox: BBox,
    /// Layout class reported by the engine; `None` in flat mode or when the
    /// engine gave no usable label.
    pub kind: Option<BlockType>,
}

/// Per-page result: either detections or a warning explaining why there are none.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Detected(Vec<Detection>),
    Skipped(PageWarning),
}

impl PageOutcome {
    pub fn detections(&self) -> &[Detection] {
        match self {
            PageOutcome::Detected(d) => d,
            PageOutcome::Skipped(_) => &[],
        }
    }

    pub fn warning(&self) -> Option<&PageWarning> {
        match self {
            PageOutcome::Detected(_) => None,
            PageOutcome::Skipped(w) => Some(w),
        }
    }
}

/// Wraps the engine pool behind one uniform call.
pub struct InferenceAdapter {
    pool: Arc<EnginePool>,
    bbox_format: BBoxFormat,
}

impl InferenceAdapter {
    pub fn new(pool: Arc<EnginePool>, bbox_format: BBoxFormat) -> Self {
        Self { pool, bbox_format }
    }

    /// Run one page through the engine.
    ///
    /// The page is encoded on the blocking pool and its raster dropped before
    /// an engine is checked out. Only an unavailable engine is an error;
    /// anything else that goes wrong on this page comes back as
    /// [`PageOutcome::Skipped`].
    pub async fn infer(
        &self,
        page: Page,
        language: &str,
        mode: ProcessingMode,
    ) -> Result<PageOutcome, EngineError> {
        let profile = self.pool.profile()?;
        let index = page.index;
        let (page_width, page_height) = (page.width() as f32, page.height() as f32);

        let max_side = profile.max_side;
        let prepared = match tokio::task::spawn_blocking(move || prepare_page(&page, max_side)).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => return Ok(skipped(index, e)),
            Err(e) => return Ok(skipped(index, format!("Page encoding task failed: {}", e))),
        };

        let request = EngineRequest {
            png: prepared.png,
            width: prepared.width,
            height: prepared.height,
            language: engine_language(language),
            mode,
        };

        let lease = self.pool.acquire().await?;
        let engine = lease.engine();
        debug!(
            "Page {}: sending {}x{} raster to {} (scale {:.3})",
            index,
            prepared.width,
            prepared.height,
            engine.name(),
            prepared.scale
        );

        match engine.detect(&request).await {
            Ok(raw) => {
                let detections = canonicalize(
                    raw,
                    &profile,
                    prepared.scale,
                    page_width,
                    page_height,
                    self.bbox_format,
                    mode,
                );
                debug!("Page {}: {} detections", index, detections.len());
                Ok(PageOutcome::Detected(detections))
            }
            Err(EngineError::Unavailable(msg)) => Err(EngineError::Unavailable(msg)),
            Err(EngineError::Page(msg)) => {
                warn!("Page {}: inference failed: {}", index, msg);
                Ok(skipped(index, msg))
            }
        }
    }
}

fn skipped(page: usize, message: String) -> PageOutcome {
    PageOutcome::Skipped(PageWarning { page, message })
}

struct PreparedPage {
    png: Vec<u8>,
    width: u32,
    height: u32,
    /// Sent size divided by original size.
    scale: f32,
}

fn prepare_page(page: &Page, max_side: u32) -> Result<PreparedPage, String> {
    let (width, height) = (page.width(), page.height());
    let longest = width.max(height);
    let mut bytes = Cursor::new(Vec::new());

    let (sent_w, sent_h, scale) = if longest > max_side {
        let resized = page.image.resize(max_side, max_side, FilterType::Triangle);
        let scale = resized.width() as f32 / width as f32;
        resized
            .write_to(&mut bytes, ImageOutputFormat::Png)
            .map_err(|e| format!("Failed to encode page: {}", e))?;
        (resized.width(), resized.height(), scale)
    } else {
        page.image
            .write_to(&mut bytes, ImageOutputFormat::Png)
            .map_err(|e| format!("Failed to encode page: {}", e))?;
        (width, height, 1.0)
    };

    Ok(PreparedPage {
        png: bytes.into_inner(),
        width: sent_w,
        height: sent_h,
        scale,
    })
}

/// Normalize raw engine output into canonical detections, preserving the
/// engine's order.
pub fn canonicalize(
    raw: Vec<RawDetection>,
    profile: &EngineProfile,
    scale: f32,
    page_width: f32,
    page_height: f32,
    format: BBoxFormat,
    mode: ProcessingMode,
) -> Vec<Detection> {
    let inverse = if scale > 0.0 { 1.0 / scale } else { 1.0 };

    raw.into_iter()
        .filter_map(|d| {
            let text = d.text.trim();
            if text.is_empty() {
                return None;
            }
            // Text with unusable geometry is kept at the page origin.
            let corners = corners(&d.points).unwrap_or_else(|| {
                warn!("Unrecognised point layout for '{}', placing at origin", text);
                rect_corners(0.0, 0.0, 0.0, 0.0)
            });
            let corners = corners.map(|[x, y]| {
                [
                    (x * inverse).clamp(0.0, page_width),
                    (y * inverse).clamp(0.0, page_height),
                ]
            });
            let bbox = match format {
                BBoxFormat::Quad => BBox::quad(corners),
                BBoxFormat::Rect => BBox::rect(enclosing(&corners)),
            };
            let kind = match mode {
                ProcessingMode::Structure => d.label.as_deref().and_then(block_type_for_label),
                ProcessingMode::Ocr => None,
            };
            Some(Detection {
                text: text.to_string(),
                confidence: normalize_confidence(d.confidence, profile.confidence_scale),
                bbox,
                kind,
            })
        })
        .collect()
}

pub fn normalize_confidence(value: f32, scale: f32) -> f32 {
    if !value.is_finite() || !(scale > 0.0) {
        return 0.0;
    }
    (value / scale).clamp(0.0, 1.0)
}

/// Four corners, clockwise from top-left.
fn corners(points: &RawPoints) -> Option<[[f32; 2]; 4]> {
    match points {
        RawPoints::Points(p) if p.len() == 4 => Some([p[0], p[1], p[2], p[3]]),
        RawPoints::Points(p) if p.len() == 2 => Some(rect_corners(p[0][0], p[0][1], p[1][0], p[1][1])),
        RawPoints::Flat(v) if v.len() == 8 => Some([[v[0], v[1]], [v[2], v[3]], [v[4], v[5]], [v[6], v[7]]]),
        RawPoints::Flat(v) if v.len() == 4 => Some(rect_corners(v[0], v[1], v[2], v[3])),
        _ => None,
    }
}

fn rect_corners(xa: f32, ya: f32, xb: f32, yb: f32) -> [[f32; 2]; 4] {
    let (x0, x1) = (xa.min(xb), xa.max(xb));
    let (y0, y1) = (ya.min(yb), ya.max(yb));
    [[x0, y0], [x1, y0], [x1, y1], [x0, y1]]
}

fn enclosing(corners: &[[f32; 2]; 4]) -> Rect {
    let mut r = Rect {
        x0: f32::MAX,
        y0: f32::MAX,
        x1: f32::MIN,
        y1: f32::MIN,
    };
    for [x, y] in corners {
        r.x0 = r.x0.min(*x);
        r.y0 = r.y0.min(*y);
        r.x1 = r.x1.max(*x);
        r.y1 = r.y1.max(*y);
    }
    r
}

/// Layout labels used by PP-Structure style engines.
pub fn block_type_for_label(label: &str) -> Option<BlockType> {
    let label = label.trim().to_ascii_lowercase();
    let kind = match label.as_str() {
        "" => return None,
        "title" | "doc_title" | "paragraph_title" | "heading" => BlockType::Heading,
        "text" | "paragraph" | "plain_text" | "abstract" | "content" => BlockType::Paragraph,
        "list" | "list_item" => BlockType::List,
        "table" | "table_cell" | "cell" => BlockType::TableCell,
        "figure" | "image" | "chart" | "figure_caption" => BlockType::Figure,
        _ => BlockType::Other,
    };
    Some(kind)
}

//! Merge per-page detections into one document-level OCR result.
//!
//! Pure functions, no async. Reading order inside a page is whatever the
//! engine emitted; pages are joined in page order with a blank line.

use tracing::debug;

use crate::ocr::adapter::PageOutcome;
use crate::pages::PageInfo;
use crate::schema::{OcrResult, PageWarning, QualityAssessment, TextBlock};

/// Separator between the transcripts of consecutive pages.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Blocks below this confidence count as low-confidence in the assessment.
const LOW_CONFIDENCE: f32 = 0.5;

/// Build the flat OCR result. `outcomes[i]` belongs to `pages[i]`.
pub fn aggregate(pages: &[PageInfo], outcomes: &[PageOutcome]) -> OcrResult {
    let multi_page = pages.len() > 1;
    let mut page_texts = Vec::with_capacity(pages.len());
    let mut blocks = Vec::new();

    for (page, outcome) in pages.iter().zip(outcomes) {
        let detections = outcome.detections();
        debug!(
            "Page {} ({}x{}): {} blocks",
            page.index,
            page.width,
            page.height,
            detections.len()
        );
        page_texts.push(
            detections
                .iter()
                .map(|d| single_line(&d.text))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        blocks.extend(detections.iter().map(|d| TextBlock {
            text: d.text.clone(),
            confidence: d.confidence,
            bbox: d.bbox.clone(),
            page: multi_page.then_some(page.index),
        }));
    }

    let text = page_texts.join(PAGE_SEPARATOR);
    let quality = assess(&blocks, outcomes, pages);
    debug!(
        "Aggregated {} blocks over {} pages (mean confidence {:.3})",
        blocks.len(),
        pages.len(),
        quality.mean_confidence
    );

    OcrResult {
        text,
        blocks,
        markdown: None,
        quality: Some(quality),
        warnings: collect_warnings(outcomes),
    }
}

pub fn collect_warnings(outcomes: &[PageOutcome]) -> Vec<PageWarning> {
    outcomes
        .iter()
        .filter_map(|o| o.warning().cloned())
        .collect()
}

/// Engines occasionally return multi-line text for one box; the transcript
/// keeps one line per block so the page separator stays unambiguous.
fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn assess(blocks: &[TextBlock], outcomes: &[PageOutcome], pages: &[PageInfo]) -> QualityAssessment {
    let empty_pages = pages
        .iter()
        .zip(outcomes)
        .filter(|(_, o)| o.detections().is_empty())
        .map(|(p, _)| p.index)
        .collect();

    if blocks.is_empty() {
        return QualityAssessment {
            mean_confidence: 0.0,
            weighted_confidence: 0.0,
            low_confidence_blocks: 0,
            empty_pages,
        };
    }

    let mean = blocks.iter().map(|b| b.confidence).sum::<f32>() / blocks.len() as f32;
    let (weighted_sum, weight) = blocks.iter().fold((0.0f32, 0usize), |(sum, w), b| {
        let chars = b.text.chars().count();
        (sum + b.confidence * chars as f32, w + chars)
    });
    let weighted = if weight == 0 {
        mean
    } else {
        weighted_sum / weight as f32
    };

    QualityAssessment {
        mean_confidence: round4(mean),
        weighted_confidence: round4(weighted),
        low_confidence_blocks: blocks.iter().filter(|b| b.confidence < LOW_CONFIDENCE).count(),
        empty_pages,
    }
}

fn round4(v: f32) -> f32 {
    (v * 10_000.0).round() / 10_000.0
}

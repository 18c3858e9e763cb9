//! Document, block and result types shared by every pipeline stage.
//!
//! Everything here is plain data: the pipeline stages own the behaviour, this
//! module owns the shapes that cross stage boundaries and the HTTP boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of uploaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    Pdf,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Pdf => "pdf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(FileType::Image),
            "pdf" => Some(FileType::Pdf),
            _ => None,
        }
    }
}

/// Flat OCR or layout-aware structure analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Ocr,
    Structure,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Ocr => "ocr",
            ProcessingMode::Structure => "structure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ocr" => Some(ProcessingMode::Ocr),
            "structure" => Some(ProcessingMode::Structure),
            _ => None,
        }
    }
}

/// Immutable record of an accepted upload.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub size: usize,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Box convention used for every block of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BBoxFormat {
    /// `[x0, y0, x1, y1]`
    #[default]
    Rect,
    /// `[x0, y0, x1, y1, x2, y2, x3, y3]`, clockwise from top-left.
    Quad,
}

impl BBoxFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rect" | "4" => Some(BBoxFormat::Rect),
            "quad" | "8" => Some(BBoxFormat::Quad),
            _ => None,
        }
    }
}

/// Axis-aligned rectangle in page pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn center_x(&self) -> f32 {
        (self.x0 + self.x1) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) / 2.0
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Horizontal and vertical gap to `other`; zero on an axis where they overlap.
    pub fn gap(&self, other: &Rect) -> (f32, f32) {
        let dx = (other.x0 - self.x1).max(self.x0 - other.x1).max(0.0);
        let dy = (other.y0 - self.y1).max(self.y0 - other.y1).max(0.0);
        (dx, dy)
    }

    pub fn horizontal_overlap(&self, other: &Rect) -> f32 {
        (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0)
    }
}

/// Bounding box as emitted on the wire: 4 numbers (rectangle) or 8 (quadrilateral).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BBox(Vec<f32>);

impl BBox {
    pub fn rect(r: Rect) -> Self {
        BBox(vec![r.x0, r.y0, r.x1, r.y1])
    }

    pub fn quad(points: [[f32; 2]; 4]) -> Self {
        BBox(points.iter().flat_map(|p| [p[0], p[1]]).collect())
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Enclosing rectangle regardless of the stored convention.
    pub fn bounds(&self) -> Rect {
        let xs = self.0.iter().step_by(2);
        let ys = self.0.iter().skip(1).step_by(2);
        let (mut x0, mut x1) = (f32::MAX, f32::MIN);
        for &x in xs {
            x0 = x0.min(x);
            x1 = x1.max(x);
        }
        let (mut y0, mut y1) = (f32::MAX, f32::MIN);
        for &y in ys {
            y0 = y0.min(y);
            y1 = y1.max(y);
        }
        if self.0.is_empty() {
            return Rect { x0: 0.0, y0: 0.0, x1: 0.0, y1: 0.0 };
        }
        Rect { x0, y0, x1, y1 }
    }
}

/// One OCR detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub confidence: f32,
    pub bbox: BBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
}

/// Layout class of a structure block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Paragraph,
    Heading,
    List,
    TableCell,
    Figure,
    Other,
}

/// A classified block in structure mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureBlock {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub content: String,
    pub bbox: BBox,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
}

/// A table recovered from clustered `table_cell` blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub page: usize,
    pub bbox: BBox,
    pub rows: Vec<Vec<String>>,
    /// Cell text that could not be placed in the grid.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unassigned: Vec<String>,
}

/// Why a page contributed no detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageWarning {
    pub page: usize,
    pub message: String,
}

/// Confidence-weighted view of how trustworthy a transcript is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub mean_confidence: f32,
    /// Mean confidence weighted by each block's character count.
    pub weighted_confidence: f32,
    pub low_confidence_blocks: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub empty_pages: Vec<usize>,
}

/// Flat OCR result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub blocks: Vec<TextBlock>,
    pub markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityAssessment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<PageWarning>,
}

/// Layout-aware result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureResult {
    pub blocks: Vec<StructureBlock>,
    pub markdown: String,
    pub tables: Vec<Table>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<PageWarning>,
}

impl StructureResult {
    /// Flat OCR view of a structure result, used when a structure job is
    /// fetched through the OCR result endpoint.
    pub fn to_ocr_view(&self) -> OcrResult {
        let blocks: Vec<TextBlock> = self
            .blocks
            .iter()
            .map(|b| TextBlock {
                text: b.content.clone(),
                confidence: b.confidence,
                bbox: b.bbox.clone(),
                page: b.page,
            })
            .collect();
        let text = blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        OcrResult {
            text,
            blocks,
            markdown: Some(self.markdown.clone()),
            quality: None,
            warnings: self.warnings.clone(),
        }
    }
}

/// The payload of a completed job; the variant always matches the job's mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum JobResult {
    Ocr(OcrResult),
    Structure(StructureResult),
}

impl JobResult {
    pub fn mode(&self) -> ProcessingMode {
        match self {
            JobResult::Ocr(_) => ProcessingMode::Ocr,
            JobResult::Structure(_) => ProcessingMode::Structure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_bounds() {
        let bbox = BBox::quad([[10.0, 5.0], [50.0, 7.0], [48.0, 20.0], [9.0, 18.0]]);
        assert_eq!(bbox.values().len(), 8);
        let r = bbox.bounds();
        assert_eq!((r.x0, r.y0, r.x1, r.y1), (9.0, 5.0, 50.0, 20.0));
    }

    #[test]
    fn test_rect_gap() {
        let a = Rect { x0: 0.0, y0: 0.0, x1: 10.0, y1: 10.0 };
        let b = Rect { x0: 15.0, y0: 5.0, x1: 30.0, y1: 12.0 };
        assert_eq!(a.gap(&b), (5.0, 0.0));
        assert_eq!(b.gap(&a), (5.0, 0.0));
    }

    #[test]
    fn test_structure_block_wire_shape() {
        let block = StructureBlock {
            block_type: BlockType::TableCell,
            content: "Total".to_string(),
            bbox: BBox::rect(Rect { x0: 1.0, y0: 2.0, x1: 3.0, y1: 4.0 }),
            confidence: 0.5,
            page: None,
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "table_cell");
        assert_eq!(json["bbox"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert!(json.get("page").is_none());
    }

    #[test]
    fn test_job_result_tagged_by_mode() {
        let result = JobResult::Ocr(OcrResult {
            text: "hi".to_string(),
            blocks: vec![],
            markdown: None,
            quality: None,
            warnings: vec![],
        });
        let json = serde_json::to_string(&result).unwrap();
        let back: JobResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode(), ProcessingMode::Ocr);
        assert_eq!(back, result);
    }
}

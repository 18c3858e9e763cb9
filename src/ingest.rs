//! Upload validation at the ingestion boundary.
//!
//! Rejections here never create a Job.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::schema::{Document, FileType};

const IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp"];
const PDF_TYPES: &[&str] = &["application/pdf"];

/// Which file types an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Image,
    Pdf,
    Any,
}

impl Accept {
    fn allowed(&self) -> Vec<&'static str> {
        match self {
            Accept::Image => IMAGE_TYPES.to_vec(),
            Accept::Pdf => PDF_TYPES.to_vec(),
            Accept::Any => IMAGE_TYPES.iter().chain(PDF_TYPES).copied().collect(),
        }
    }
}

/// Raw multipart file part.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Validates uploads and stamps accepted ones as [`Document`]s.
#[derive(Debug, Clone)]
pub struct IngestionGate {
    max_file_size: usize,
}

impl IngestionGate {
    pub fn new(max_file_size: usize) -> Self {
        Self { max_file_size }
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Check type and size; on success return the document record and its bytes.
    pub fn admit(&self, upload: Upload, accept: Accept) -> Result<(Document, Vec<u8>), ValidationError> {
        if upload.data.is_empty() {
            return Err(ValidationError::Empty(upload.filename));
        }
        if upload.data.len() > self.max_file_size {
            return Err(ValidationError::TooLarge {
                size: upload.data.len(),
                limit: self.max_file_size,
            });
        }

        let content_type = effective_content_type(&upload);
        let allowed = accept.allowed();
        if !allowed.contains(&content_type.as_str()) {
            return Err(ValidationError::UnsupportedType {
                content_type,
                allowed,
            });
        }
        let file_type = if PDF_TYPES.contains(&content_type.as_str()) {
            FileType::Pdf
        } else {
            FileType::Image
        };

        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(&upload.data);
            format!("{:x}", hasher.finalize())
        };

        let document = Document {
            id: Uuid::new_v4().to_string(),
            filename: upload.filename,
            file_type,
            size: upload.data.len(),
            content_hash,
            created_at: now_micros(),
        };
        debug!(
            "Admitted {} as {} ({} bytes, sha256={})",
            document.filename,
            content_type,
            document.size,
            &document.content_hash[..12]
        );

        Ok((document, upload.data))
    }
}

/// Declared content type, or a guess from the extension when the client sent
/// none or a generic one.
fn effective_content_type(upload: &Upload) -> String {
    let declared = upload
        .content_type
        .as_deref()
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");

    match declared {
        // Some clients still send the pre-standard JPEG type.
        Some(ct) if ct == "image/jpg" || ct == "image/pjpeg" => "image/jpeg".to_string(),
        Some(ct) => ct,
        None => mime_guess::from_path(&upload.filename)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    }
}

/// Current UTC time truncated to microseconds, the precision the history
/// store keeps.
pub fn now_micros() -> DateTime<Utc> {
    let micros = Utc::now().timestamp_micros();
    DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str, content_type: Option<&str>, data: &[u8]) -> Upload {
        Upload {
            filename: name.to_string(),
            content_type: content_type.map(String::from),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_admits_png_on_image_endpoint() {
        let gate = IngestionGate::new(1024);
        let (doc, bytes) = gate
            .admit(upload("scan.png", Some("image/png"), b"\x89PNG...."), Accept::Image)
            .unwrap();
        assert_eq!(doc.file_type, FileType::Image);
        assert_eq!(doc.filename, "scan.png");
        assert_eq!(doc.size, bytes.len());
        assert_eq!(doc.content_hash.len(), 64);
    }

    #[test]
    fn test_rejects_pdf_on_image_endpoint() {
        let gate = IngestionGate::new(1024);
        let err = gate
            .admit(upload("doc.pdf", Some("application/pdf"), b"%PDF-1.4"), Accept::Image)
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedType { .. }));
    }

    #[test]
    fn test_guesses_type_from_extension() {
        let gate = IngestionGate::new(1024);
        let (doc, _) = gate
            .admit(upload("report.PDF", Some("application/octet-stream"), b"%PDF-1.7"), Accept::Any)
            .unwrap();
        assert_eq!(doc.file_type, FileType::Pdf);

        let (doc, _) = gate
            .admit(upload("photo.jpg", None, b"\xff\xd8\xff"), Accept::Any)
            .unwrap();
        assert_eq!(doc.file_type, FileType::Image);
    }

    #[test]
    fn test_rejects_oversized_and_empty() {
        let gate = IngestionGate::new(4);
        let err = gate
            .admit(upload("big.png", Some("image/png"), b"12345"), Accept::Image)
            .unwrap_err();
        assert!(matches!(err, ValidationError::TooLarge { size: 5, limit: 4 }));

        let err = gate
            .admit(upload("empty.png", Some("image/png"), b""), Accept::Image)
            .unwrap_err();
        assert!(matches!(err, ValidationError::Empty(_)));
    }

    #[test]
    fn test_rejects_unknown_types() {
        let gate = IngestionGate::new(1024);
        let err = gate
            .admit(upload("notes.txt", Some("text/plain"), b"hello"), Accept::Any)
            .unwrap_err();
        assert!(err.to_string().contains("text/plain"));
    }
}

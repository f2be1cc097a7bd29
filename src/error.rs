//! Typed pipeline errors and their HTTP status mapping.
//!
//! Only `InvalidDocument` (and the request-validation kinds the HTTP layer
//! raises before the pipeline runs) ever surface to a caller. Everything else
//! is absorbed into confidence degradation inside the pipeline and exists
//! here so stages can classify and log what went wrong.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Undecodable or unsupported input. Fatal to the run.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Upload exceeds the configured size ceiling.
    #[error("file size {size} exceeds maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// Declared MIME type is not in the allow-list.
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Batch request exceeds the configured file count.
    #[error("batch size {got} exceeds maximum of {max} files")]
    BatchTooLarge { got: usize, max: usize },

    /// OCR engine missing, crashed, or timed out. Degrades to empty text.
    #[error("OCR engine unavailable: {0}")]
    OcrUnavailable(String),

    /// A per-stage deadline ran out. Degrades to best-available data.
    #[error("extraction stage '{0}' deadline exceeded")]
    ExtractionTimeout(&'static str),

    /// Network, non-JSON, or schema failure from the language model.
    /// Triggers full reliance on the fallback extractor.
    #[error("model call failed: {0}")]
    ModelCallFailed(String),
}

impl ExtractionError {
    /// Transport status for errors that do surface to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidDocument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::BatchTooLarge { .. } => StatusCode::BAD_REQUEST,
            // Non-fatal kinds are absorbed before reaching the HTTP layer;
            // if one ever escapes, report it as a server-side failure.
            Self::OcrUnavailable(_) | Self::ExtractionTimeout(_) | Self::ModelCallFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for kinds the pipeline must absorb rather than propagate.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::OcrUnavailable(_) | Self::ExtractionTimeout(_) | Self::ModelCallFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ExtractionError::InvalidDocument("bad".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ExtractionError::FileTooLarge { size: 99, max: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ExtractionError::UnsupportedFileType("text/csv".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ExtractionError::BatchTooLarge { got: 20, max: 10 }.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_degradable_kinds() {
        assert!(ExtractionError::OcrUnavailable("gone".into()).is_degradable());
        assert!(ExtractionError::ExtractionTimeout("ocr").is_degradable());
        assert!(ExtractionError::ModelCallFailed("503".into()).is_degradable());
        assert!(!ExtractionError::InvalidDocument("bad".into()).is_degradable());
    }
}

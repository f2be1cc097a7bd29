//! Runtime settings and heuristic pattern tables.
//!
//! `Settings` is read from the environment once at startup and threaded into
//! the pipeline at construction; extraction logic never reads env vars on its
//! own. `PatternTables` holds the fallback extractor's label/keyword data as
//! versioned, externally loadable JSON (`configs/patterns.json`) with a
//! built-in default, so board-specific additions don't touch extraction code.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum upload size in bytes.
    pub max_file_size: u64,
    /// MIME types accepted by the extract endpoints.
    pub allowed_file_types: Vec<String>,
    /// Maximum number of files per batch request.
    pub max_batch_size: usize,
    /// Maximum concurrent pipeline runs within one batch.
    pub max_concurrent_extractions: usize,
    /// Path to the tesseract binary.
    pub tesseract_path: String,
    /// Tesseract language hint.
    pub ocr_language: String,
    /// Directory for per-run temporary frame files.
    pub temp_dir: String,
    /// CORS origins; `*` means permissive.
    pub allowed_origins: Vec<String>,
    /// Per-frame OCR subprocess budget.
    pub ocr_timeout: Duration,
    /// Per-call LLM budget.
    pub llm_timeout: Duration,
    /// End-to-end budget for one document run.
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            allowed_file_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
                "application/pdf".to_string(),
            ],
            max_batch_size: 10,
            max_concurrent_extractions: 4,
            tesseract_path: "tesseract".to_string(),
            ocr_language: "eng".to_string(),
            temp_dir: env::temp_dir().to_string_lossy().to_string(),
            allowed_origins: vec!["*".to_string()],
            ocr_timeout: Duration::from_secs(20),
            llm_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl Settings {
    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(v) = env::var("MAX_FILE_SIZE") {
            settings.max_file_size = v.parse().context("MAX_FILE_SIZE must be an integer")?;
        }
        if let Ok(v) = env::var("MAX_BATCH_SIZE") {
            settings.max_batch_size = v.parse().context("MAX_BATCH_SIZE must be an integer")?;
        }
        if let Ok(v) = env::var("MAX_CONCURRENT_EXTRACTIONS") {
            settings.max_concurrent_extractions = v
                .parse()
                .context("MAX_CONCURRENT_EXTRACTIONS must be an integer")?;
        }
        if let Ok(v) = env::var("TESSERACT_PATH") {
            if !v.is_empty() {
                settings.tesseract_path = v;
            }
        }
        if let Ok(v) = env::var("OCR_LANGUAGE") {
            if !v.is_empty() {
                settings.ocr_language = v;
            }
        }
        if let Ok(v) = env::var("TEMP_DIR") {
            if !v.is_empty() {
                settings.temp_dir = v;
            }
        }
        if let Ok(v) = env::var("ALLOWED_ORIGINS") {
            settings.allowed_origins = serde_json::from_str(&v)
                .context("ALLOWED_ORIGINS must be a JSON array of strings")?;
        }
        if let Ok(v) = env::var("OCR_TIMEOUT_SECS") {
            settings.ocr_timeout =
                Duration::from_secs(v.parse().context("OCR_TIMEOUT_SECS must be an integer")?);
        }
        if let Ok(v) = env::var("LLM_TIMEOUT_SECS") {
            settings.llm_timeout =
                Duration::from_secs(v.parse().context("LLM_TIMEOUT_SECS must be an integer")?);
        }
        if let Ok(v) = env::var("REQUEST_TIMEOUT_SECS") {
            settings.request_timeout = Duration::from_secs(
                v.parse().context("REQUEST_TIMEOUT_SECS must be an integer")?,
            );
        }

        Ok(settings)
    }
}

/// Heuristic tables the fallback extractor matches against. Versioned data,
/// not control flow: adding a board or a label variant is a data change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternTables {
    pub version: u32,
    /// Identity field name → label tokens that anchor its value in OCR text.
    pub identity_labels: HashMap<String, Vec<String>>,
    /// Labels announcing a date-of-birth value.
    pub dob_labels: Vec<String>,
    /// Labels announcing an issue date.
    pub issue_date_labels: Vec<String>,
    /// Labels announcing a place of issue.
    pub place_labels: Vec<String>,
    /// Known board/university name fragments.
    pub boards: Vec<String>,
    /// Division/class result terms.
    pub division_terms: Vec<String>,
    /// Tokens recognized as grades in subject rows (besides A-F letter forms).
    pub grade_tokens: Vec<String>,
    /// Tokens that disqualify a line from being a subject row.
    pub subject_exclude_terms: Vec<String>,
}

impl PatternTables {
    /// Load tables from a JSON file, or fall back to the built-in defaults
    /// when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read pattern tables: {:?}", path))?;
            let tables: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse pattern tables: {:?}", path))?;
            info!("Loaded pattern tables v{} from {:?}", tables.version, path);
            Ok(tables)
        } else {
            info!("Pattern tables file {:?} not found, using built-in defaults", path);
            Ok(Self::default_tables())
        }
    }

    /// Built-in tables covering common Indian board marksheet vocabulary.
    pub fn default_tables() -> Self {
        let mut identity_labels = HashMap::new();
        identity_labels.insert(
            "name".to_string(),
            vec![
                "name of candidate".to_string(),
                "candidate name".to_string(),
                "student name".to_string(),
                "name of student".to_string(),
                "name".to_string(),
            ],
        );
        identity_labels.insert(
            "father_name".to_string(),
            vec![
                "father's name".to_string(),
                "fathers name".to_string(),
                "father name".to_string(),
                "name of father".to_string(),
                "mother's name".to_string(),
                "guardian".to_string(),
                "s/o".to_string(),
                "d/o".to_string(),
            ],
        );
        identity_labels.insert(
            "roll_no".to_string(),
            vec![
                "roll no".to_string(),
                "roll number".to_string(),
                "roll".to_string(),
            ],
        );
        identity_labels.insert(
            "registration_no".to_string(),
            vec![
                "registration no".to_string(),
                "registration number".to_string(),
                "reg. no".to_string(),
                "reg no".to_string(),
                "registration".to_string(),
            ],
        );
        identity_labels.insert(
            "exam_year".to_string(),
            vec![
                "year of examination".to_string(),
                "exam year".to_string(),
                "examination year".to_string(),
                "year".to_string(),
            ],
        );
        identity_labels.insert(
            "institution".to_string(),
            vec![
                "school".to_string(),
                "college".to_string(),
                "institution".to_string(),
                "vidyalaya".to_string(),
            ],
        );

        Self {
            version: 1,
            identity_labels,
            dob_labels: vec![
                "date of birth".to_string(),
                "dob".to_string(),
                "birth".to_string(),
                "born".to_string(),
            ],
            issue_date_labels: vec![
                "date of issue".to_string(),
                "issue date".to_string(),
                "dated".to_string(),
                "date".to_string(),
            ],
            place_labels: vec![
                "place of issue".to_string(),
                "issued at".to_string(),
                "place".to_string(),
            ],
            boards: vec![
                "central board of secondary education".to_string(),
                "cbse".to_string(),
                "council for the indian school certificate examinations".to_string(),
                "icse".to_string(),
                "board of secondary education".to_string(),
                "board of higher secondary education".to_string(),
                "board of intermediate education".to_string(),
                "state board".to_string(),
                "university".to_string(),
                "madhyamik".to_string(),
            ],
            division_terms: vec![
                "distinction".to_string(),
                "first division".to_string(),
                "second division".to_string(),
                "third division".to_string(),
                "first class".to_string(),
                "second class".to_string(),
                "third class".to_string(),
                "first".to_string(),
                "second".to_string(),
                "third".to_string(),
                "pass".to_string(),
                "fail".to_string(),
            ],
            grade_tokens: vec![
                "a+".to_string(),
                "a".to_string(),
                "b+".to_string(),
                "b".to_string(),
                "c+".to_string(),
                "c".to_string(),
                "d".to_string(),
                "e".to_string(),
                "f".to_string(),
                "a1".to_string(),
                "a2".to_string(),
                "b1".to_string(),
                "b2".to_string(),
                "pass".to_string(),
                "fail".to_string(),
            ],
            subject_exclude_terms: vec![
                "total".to_string(),
                "grand total".to_string(),
                "result".to_string(),
                "division".to_string(),
                "percentage".to_string(),
                "grade".to_string(),
                "marks".to_string(),
                "obtained".to_string(),
                "maximum".to_string(),
                "subject".to_string(),
                "name".to_string(),
                "roll".to_string(),
                "registration".to_string(),
                "board".to_string(),
                "school".to_string(),
                "college".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables_have_core_labels() {
        let tables = PatternTables::default_tables();
        assert!(tables.identity_labels.contains_key("roll_no"));
        assert!(tables.identity_labels.contains_key("name"));
        assert!(tables
            .division_terms
            .iter()
            .any(|t| t == "distinction"));
        assert!(!tables.boards.is_empty());
    }

    #[test]
    fn test_tables_round_trip_as_json() {
        let tables = PatternTables::default_tables();
        let json = serde_json::to_string(&tables).unwrap();
        let parsed: PatternTables = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, tables.version);
        assert_eq!(parsed.boards.len(), tables.boards.len());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tables =
            PatternTables::load_or_default(Path::new("/nonexistent/patterns.json")).unwrap();
        assert_eq!(tables.version, 1);
    }

    #[test]
    fn test_settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.max_file_size, 10 * 1024 * 1024);
        assert_eq!(s.max_batch_size, 10);
        assert!(s.allowed_file_types.iter().any(|t| t == "application/pdf"));
    }
}

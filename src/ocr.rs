//! OCR runner: recognizes text on preprocessed frames and selects the best
//! recipe per logical page.
//!
//! [`TextRecognizer`] is the seam the pipeline depends on, so tests can swap
//! in a canned recognizer. The production implementation shells out to the
//! tesseract CLI in TSV mode to get per-word confidences.

use crate::config::Settings;
use crate::normalize::{LogicalPage, PageContent, PreprocessedFrame};
use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Confidence assigned to a PDF digital text layer, which bypasses OCR.
const TEXT_LAYER_CONFIDENCE: f64 = 0.95;

/// OCR output for one logical page. Never mutated after creation; both
/// extractors read the same value independently.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    /// Mean per-word engine confidence in [0, 1]; 0 when no text was read.
    pub confidence: f64,
}

impl OcrResult {
    /// The degraded result: empty text, zero confidence. Downstream stages
    /// must turn this into an all-null record, never an error.
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
        }
    }
}

/// Text recognition seam. Implementations must never panic on engine
/// failure; they degrade to [`OcrResult::empty`].
#[async_trait::async_trait]
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &str;
    async fn recognize_page(&self, page: &LogicalPage) -> OcrResult;
}

/// Tesseract CLI engine. Each frame is written to a run-scoped temp file
/// (released on every exit path by `NamedTempFile`) and recognized under a
/// per-frame timeout.
pub struct TesseractEngine {
    binary: String,
    language: String,
    temp_dir: PathBuf,
    frame_timeout: Duration,
}

impl TesseractEngine {
    pub fn new(settings: &Settings) -> Self {
        Self {
            binary: settings.tesseract_path.clone(),
            language: settings.ocr_language.clone(),
            temp_dir: PathBuf::from(&settings.temp_dir),
            frame_timeout: settings.ocr_timeout,
        }
    }

    /// Check whether the configured binary responds. Used at startup for a
    /// log line, not as a gate: a missing engine degrades, never aborts.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn recognize_frame(&self, frame: &PreprocessedFrame) -> Result<FrameOcr> {
        // PNG-encode the frame into a temp file tesseract can read.
        let mut encoded = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(frame.image.clone())
            .write_to(&mut encoded, ImageFormat::Png)
            .context("failed to encode frame as PNG")?;

        let temp = tempfile::Builder::new()
            .prefix(&format!("frame-{}-", uuid::Uuid::new_v4()))
            .suffix(".png")
            .tempfile_in(&self.temp_dir)
            .context("failed to create temp frame file")?;
        tokio::fs::write(temp.path(), encoded.into_inner())
            .await
            .context("failed to write temp frame file")?;

        // tesseract <input> stdout -l <lang> --oem 3 --psm 6 tsv
        let run = Command::new(&self.binary)
            .arg(temp.path())
            .arg("stdout")
            .args(["-l", &self.language, "--oem", "3", "--psm", "6", "tsv"])
            .output();

        let output = tokio::time::timeout(self.frame_timeout, run)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "tesseract timed out after {:?} on recipe {}",
                    self.frame_timeout,
                    frame.recipe.name()
                )
            })?
            .with_context(|| format!("failed to run tesseract at '{}'", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "tesseract exited with {} on recipe {}: {}",
                output.status.code().unwrap_or(-1),
                frame.recipe.name(),
                stderr.trim()
            );
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv(&tsv))
    }
}

#[async_trait::async_trait]
impl TextRecognizer for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize_page(&self, page: &LogicalPage) -> OcrResult {
        let frames = match &page.content {
            PageContent::TextLayer(text) => {
                if text.trim().is_empty() {
                    return OcrResult::empty();
                }
                return OcrResult {
                    text: text.clone(),
                    confidence: TEXT_LAYER_CONFIDENCE,
                };
            }
            PageContent::Frames(frames) => frames,
        };

        let mut candidates = Vec::new();
        for frame in frames {
            match self.recognize_frame(frame).await {
                Ok(ocr) => {
                    debug!(
                        "Recipe {} recognized {} chars at {:.2} confidence",
                        frame.recipe.name(),
                        ocr.text.len(),
                        ocr.confidence
                    );
                    candidates.push(ocr);
                }
                Err(e) => warn!("OCR failed on recipe {}: {:#}", frame.recipe.name(), e),
            }
        }

        match select_best(candidates) {
            Some(best) => OcrResult {
                text: best.text,
                confidence: best.confidence,
            },
            None => {
                warn!("OCR unavailable for page {}, degrading to empty text", page.page_num);
                OcrResult::empty()
            }
        }
    }
}

/// Per-frame recognition outcome before best-of selection.
#[derive(Debug, Clone)]
struct FrameOcr {
    text: String,
    confidence: f64,
}

/// Highest confidence wins; ties break toward longer recognized text.
fn select_best(mut candidates: Vec<FrameOcr>) -> Option<FrameOcr> {
    candidates.retain(|c| !c.text.trim().is_empty());
    candidates.into_iter().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.text.len().cmp(&b.text.len()))
    })
}

/// Parse tesseract TSV output: reconstruct line-broken text from word rows
/// (level 5) and average their confidences.
fn parse_tsv(tsv: &str) -> FrameOcr {
    let mut text = String::new();
    let mut confidences = Vec::new();
    let mut current_line: Option<(u32, u32, u32)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        // Columns: level page block par line word left top width height conf text
        if cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }
        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        match current_line {
            Some(prev) if prev == key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(key);
        text.push_str(word);

        if let Ok(conf) = cols[10].parse::<f64>() {
            if conf >= 0.0 {
                confidences.push(conf / 100.0);
            }
        }
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    FrameOcr { text, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Recipe;
    use image::{GrayImage, Luma};

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t120\t80\t-1\t\n\
5\t1\t1\t1\t1\t1\t10\t5\t40\t12\t96.5\tROLL\n\
5\t1\t1\t1\t1\t2\t55\t5\t30\t12\t91.5\tNO:\n\
5\t1\t1\t1\t1\t3\t90\t5\t40\t12\t88.0\t06937\n\
5\t1\t1\t1\t2\t1\t10\t25\t60\t12\t92.0\tNARAYAN\n";

    #[test]
    fn test_parse_tsv_reconstructs_lines_and_confidence() {
        let result = parse_tsv(SAMPLE_TSV);
        assert_eq!(result.text, "ROLL NO: 06937\nNARAYAN");
        let expected = (0.965 + 0.915 + 0.88 + 0.92) / 4.0;
        assert!((result.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_empty_output() {
        let result = parse_tsv("level\tpage_num\n");
        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_select_best_prefers_confidence_then_length() {
        let best = select_best(vec![
            FrameOcr {
                text: "short".into(),
                confidence: 0.7,
            },
            FrameOcr {
                text: "much longer text".into(),
                confidence: 0.7,
            },
            FrameOcr {
                text: "low".into(),
                confidence: 0.2,
            },
        ])
        .unwrap();
        assert_eq!(best.text, "much longer text");

        let best = select_best(vec![
            FrameOcr {
                text: "winner".into(),
                confidence: 0.9,
            },
            FrameOcr {
                text: "longer but worse".into(),
                confidence: 0.5,
            },
        ])
        .unwrap();
        assert_eq!(best.text, "winner");
    }

    #[test]
    fn test_select_best_skips_blank_candidates() {
        assert!(select_best(vec![FrameOcr {
            text: "   ".into(),
            confidence: 0.9,
        }])
        .is_none());
    }

    #[tokio::test]
    async fn test_missing_engine_degrades_to_empty() {
        let settings = Settings {
            tesseract_path: "/nonexistent/tesseract".to_string(),
            ..Settings::default()
        };
        let engine = TesseractEngine::new(&settings);
        let page = LogicalPage {
            page_num: 1,
            content: crate::normalize::PageContent::Frames(vec![PreprocessedFrame {
                recipe: Recipe::GrayscaleThreshold,
                image: GrayImage::from_pixel(4, 4, Luma([255u8])),
            }]),
        };
        let result = engine.recognize_page(&page).await;
        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_text_layer_bypasses_engine() {
        let settings = Settings {
            tesseract_path: "/nonexistent/tesseract".to_string(),
            ..Settings::default()
        };
        let engine = TesseractEngine::new(&settings);
        let page = LogicalPage {
            page_num: 1,
            content: crate::normalize::PageContent::TextLayer("ROLL NO: 123".to_string()),
        };
        let result = engine.recognize_page(&page).await;
        assert_eq!(result.text, "ROLL NO: 123");
        assert!(result.confidence > 0.9);
    }
}

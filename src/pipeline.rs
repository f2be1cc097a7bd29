//! Pipeline orchestrator: normalize, OCR, extract, merge.
//!
//! One `Pipeline` is built at startup and shared across requests. A run moves
//! through a fixed sequence of stages; after normalization every failure
//! degrades (worse confidence, never an error), so the only fatal outcome is
//! an undecodable document. Batch runs fan out through a bounded stream and
//! the results come back in input order regardless of completion order.

use crate::confidence;
use crate::config::Settings;
use crate::error::ExtractionError;
use crate::extractor::StructuredExtractor;
use crate::normalize;
use crate::ocr::{OcrResult, TextRecognizer};
use crate::schema::{ExtractionRecord, PartialRecord};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Progress marker for one run, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Normalized,
    OcrComplete,
    Extracted,
    Merged,
    Done,
}

/// Wall-clock budget for one run. Stages consume from the same deadline, so a
/// slow OCR pass shrinks what the model call is allowed to spend.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }
}

/// One file of a batch request.
pub struct BatchFile {
    pub filename: String,
    pub mime: String,
    pub data: Vec<u8>,
}

pub struct Pipeline {
    recognizer: Arc<dyn TextRecognizer>,
    /// Absent when no model is configured; the pipeline then runs
    /// fallback-only.
    llm: Option<Arc<dyn StructuredExtractor>>,
    fallback: Arc<dyn StructuredExtractor>,
    settings: Settings,
}

impl Pipeline {
    pub fn new(
        recognizer: Arc<dyn TextRecognizer>,
        llm: Option<Arc<dyn StructuredExtractor>>,
        fallback: Arc<dyn StructuredExtractor>,
        settings: Settings,
    ) -> Self {
        Self {
            recognizer,
            llm,
            fallback,
            settings,
        }
    }

    /// Run the full pipeline on one document.
    pub async fn run(
        &self,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<ExtractionRecord, ExtractionError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = Deadline::new(self.settings.request_timeout);
        let file_size = data.len() as u64;
        self.log_stage(run_id, Stage::Received);

        if file_size > self.settings.max_file_size {
            return Err(ExtractionError::FileTooLarge {
                size: file_size,
                max: self.settings.max_file_size,
            });
        }
        if !self.settings.allowed_file_types.iter().any(|t| t == mime) {
            return Err(ExtractionError::UnsupportedFileType(mime.to_string()));
        }

        // Decoding and preprocessing are CPU-bound; keep them off the
        // async workers.
        let mime_owned = mime.to_string();
        let pages = tokio::task::spawn_blocking(move || normalize::normalize(&data, &mime_owned))
            .await
            .map_err(|e| {
                ExtractionError::InvalidDocument(format!("preprocessing crashed: {}", e))
            })??;
        self.log_stage(run_id, Stage::Normalized);
        debug!("[{}] {} logical page(s)", run_id, pages.len());

        let mut page_records = Vec::with_capacity(pages.len());
        for page in &pages {
            // OCR draws on the same request deadline as the model stage.
            // Exhaustion keeps whatever pages were already extracted.
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                warn!("[{}] {}", run_id, ExtractionError::ExtractionTimeout("ocr"));
                break;
            }
            let ocr = match tokio::time::timeout(remaining, self.recognizer.recognize_page(page))
                .await
            {
                Ok(ocr) => ocr,
                Err(_) => {
                    warn!("[{}] {}", run_id, ExtractionError::ExtractionTimeout("ocr"));
                    break;
                }
            };
            self.log_stage(run_id, Stage::OcrComplete);
            debug!(
                "[{}] page {}: {} chars at {:.2} OCR confidence",
                run_id,
                page.page_num,
                ocr.text.len(),
                ocr.confidence
            );
            let record = self.extract_page(run_id, &ocr, &deadline).await;
            page_records.push(record);
        }

        let best = best_record(page_records);
        self.log_stage(run_id, Stage::Done);

        let elapsed = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        info!(
            "[{}] extraction finished in {:.2}s, aggregate confidence {:.2}",
            run_id,
            elapsed,
            best.aggregate_confidence()
        );
        Ok(ExtractionRecord::from_partial(best, elapsed, mime, file_size))
    }

    /// Run both extraction paths over one page's OCR text and merge. Never
    /// errors: any extraction failure degrades to the other path or to an
    /// all-null record.
    async fn extract_page(
        &self,
        run_id: Uuid,
        ocr: &OcrResult,
        deadline: &Deadline,
    ) -> PartialRecord {
        if ocr.text.trim().is_empty() {
            debug!("[{}] empty OCR text, skipping extraction", run_id);
            return PartialRecord::empty();
        }

        // The fallback path always runs, as a second opinion when the model
        // answers and as the only opinion when it doesn't.
        let fallback = match self.fallback.extract(ocr).await {
            Ok(record) => record,
            Err(e) => {
                warn!("[{}] fallback extractor failed: {:#}", run_id, e);
                PartialRecord::empty()
            }
        };

        let (llm, llm_clean) = match &self.llm {
            None => (None, false),
            Some(extractor) => {
                let budget = self.settings.llm_timeout.min(deadline.remaining());
                if budget.is_zero() {
                    warn!(
                        "[{}] {}",
                        run_id,
                        ExtractionError::ExtractionTimeout("llm")
                    );
                    (None, false)
                } else {
                    match tokio::time::timeout(budget, extractor.extract(ocr)).await {
                        Ok(Ok(record)) => (Some(record), true),
                        Ok(Err(e)) => {
                            warn!(
                                "[{}] {}",
                                run_id,
                                ExtractionError::ModelCallFailed(format!("{:#}", e))
                            );
                            (None, false)
                        }
                        Err(_) => {
                            warn!(
                                "[{}] {}",
                                run_id,
                                ExtractionError::ExtractionTimeout("llm")
                            );
                            (None, false)
                        }
                    }
                }
            }
        };
        self.log_stage(run_id, Stage::Extracted);

        let mut merged = confidence::merge_records(llm.as_ref(), &fallback, llm_clean);
        confidence::derive_missing(&mut merged);
        self.log_stage(run_id, Stage::Merged);
        merged
    }

    /// Run the pipeline over a batch. Concurrency is bounded by the
    /// configured limit; `buffered` keeps output order equal to input order
    /// no matter how the runs interleave, with per-file failures kept in
    /// place rather than failing the batch.
    pub async fn run_batch(
        self: &Arc<Self>,
        files: Vec<BatchFile>,
    ) -> Result<Vec<Result<ExtractionRecord, ExtractionError>>, ExtractionError> {
        if files.len() > self.settings.max_batch_size {
            return Err(ExtractionError::BatchTooLarge {
                got: files.len(),
                max: self.settings.max_batch_size,
            });
        }

        let concurrency = self.settings.max_concurrent_extractions.max(1);
        let results = stream::iter(files)
            .map(|file| {
                let pipeline = Arc::clone(self);
                async move { pipeline.run(file.data, &file.mime).await }
            })
            .buffered(concurrency)
            .collect::<Vec<_>>()
            .await;
        Ok(results)
    }

    /// Batch entry point that keeps filenames attached to their results.
    pub async fn run_batch_named(
        self: &Arc<Self>,
        files: Vec<BatchFile>,
    ) -> Result<Vec<(String, Result<ExtractionRecord, ExtractionError>)>, ExtractionError> {
        let names: Vec<String> = files.iter().map(|f| f.filename.clone()).collect();
        let results = self.run_batch(files).await?;
        Ok(names.into_iter().zip(results).collect())
    }

    fn log_stage(&self, run_id: Uuid, stage: Stage) {
        debug!("[{}] entered {:?}", run_id, stage);
    }
}

/// Pick the page record with the highest aggregate confidence. Ties go to
/// the earlier page; an empty input degrades to an all-null record.
fn best_record(records: Vec<PartialRecord>) -> PartialRecord {
    let mut best: Option<PartialRecord> = None;
    for record in records {
        let replace = match &best {
            None => true,
            Some(current) => record.aggregate_confidence() > current.aggregate_confidence(),
        };
        if replace {
            best = Some(record);
        }
    }
    best.unwrap_or_else(PartialRecord::empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternTables;
    use crate::fallback::FallbackExtractor;
    use crate::normalize::PageContent;
    use crate::schema::Field;
    use anyhow::Result;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png_of_width(width: u32) -> Vec<u8> {
        let mut img = GrayImage::from_pixel(width, 40, Luma([255u8]));
        for x in 0..width {
            img.put_pixel(x, 20, Luma([0u8]));
        }
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    /// Canned recognizer: same text for every page, no engine involved.
    struct CannedRecognizer {
        text: String,
    }

    #[async_trait::async_trait]
    impl crate::ocr::TextRecognizer for CannedRecognizer {
        fn name(&self) -> &str {
            "canned"
        }
        async fn recognize_page(&self, _page: &crate::normalize::LogicalPage) -> OcrResult {
            if self.text.is_empty() {
                OcrResult::empty()
            } else {
                OcrResult {
                    text: self.text.clone(),
                    confidence: 0.9,
                }
            }
        }
    }

    /// Recognizer that derives its answer from the frame width and sleeps
    /// longer for wider frames, so batch tasks finish out of input order.
    struct DimensionRecognizer;

    #[async_trait::async_trait]
    impl crate::ocr::TextRecognizer for DimensionRecognizer {
        fn name(&self) -> &str {
            "dimension"
        }
        async fn recognize_page(&self, page: &crate::normalize::LogicalPage) -> OcrResult {
            let PageContent::Frames(frames) = &page.content else {
                return OcrResult::empty();
            };
            let width = frames[0].image.width() as u64;
            tokio::time::sleep(Duration::from_millis(width)).await;
            OcrResult {
                text: format!("ROLL NO: {}", width),
                confidence: 0.9,
            }
        }
    }

    /// Extractor that counts invocations and returns a fixed record.
    struct CountingExtractor {
        calls: AtomicUsize,
        roll: String,
    }

    impl CountingExtractor {
        fn new(roll: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                roll: roll.to_string(),
            }
        }
    }

    #[async_trait::async_trait]
    impl StructuredExtractor for CountingExtractor {
        fn name(&self) -> &str {
            "counting"
        }
        async fn extract(&self, _ocr: &OcrResult) -> Result<PartialRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut record = PartialRecord::empty();
            record.candidate_details.roll_no = Field::new(self.roll.clone(), 0.99);
            Ok(record)
        }
    }

    /// Recognizer slower than any request budget used in these tests.
    struct SlowRecognizer;

    #[async_trait::async_trait]
    impl crate::ocr::TextRecognizer for SlowRecognizer {
        fn name(&self) -> &str {
            "slow"
        }
        async fn recognize_page(&self, _page: &crate::normalize::LogicalPage) -> OcrResult {
            tokio::time::sleep(Duration::from_secs(1)).await;
            OcrResult {
                text: "ROLL NO: 77".to_string(),
                confidence: 0.9,
            }
        }
    }

    /// Extractor that never answers within any sane test budget.
    struct StalledExtractor;

    #[async_trait::async_trait]
    impl StructuredExtractor for StalledExtractor {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn extract(&self, _ocr: &OcrResult) -> Result<PartialRecord> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(PartialRecord::empty())
        }
    }

    /// Extractor that always errors.
    struct BrokenExtractor;

    #[async_trait::async_trait]
    impl StructuredExtractor for BrokenExtractor {
        fn name(&self) -> &str {
            "broken"
        }
        async fn extract(&self, _ocr: &OcrResult) -> Result<PartialRecord> {
            anyhow::bail!("model exploded")
        }
    }

    fn fallback() -> Arc<dyn StructuredExtractor> {
        Arc::new(FallbackExtractor::new(PatternTables::default_tables()))
    }

    fn pipeline_with(
        recognizer: Arc<dyn crate::ocr::TextRecognizer>,
        llm: Option<Arc<dyn StructuredExtractor>>,
        settings: Settings,
    ) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(recognizer, llm, fallback(), settings))
    }

    #[tokio::test]
    async fn test_empty_ocr_yields_all_null_record_without_llm_call() {
        let llm = Arc::new(CountingExtractor::new("99"));
        let pipeline = pipeline_with(
            Arc::new(CannedRecognizer {
                text: String::new(),
            }),
            Some(llm.clone()),
            Settings::default(),
        );

        let record = pipeline.run(png_of_width(40), "image/png").await.unwrap();
        assert!(record.candidate_details.roll_no.is_null());
        assert!(record.subjects.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_deadline_caps_ocr_stage() {
        let settings = Settings {
            request_timeout: Duration::from_millis(50),
            ..Settings::default()
        };
        let pipeline = pipeline_with(Arc::new(SlowRecognizer), None, settings);

        let started = Instant::now();
        let record = pipeline.run(png_of_width(40), "image/png").await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "run took {:?} with a 50ms request budget",
            started.elapsed()
        );
        // OCR never finished, so the record degrades to all-null.
        assert!(record.candidate_details.roll_no.is_null());
        assert!(record.subjects.is_empty());
    }

    #[tokio::test]
    async fn test_llm_timeout_degrades_to_fallback() {
        let settings = Settings {
            llm_timeout: Duration::from_millis(20),
            ..Settings::default()
        };
        let pipeline = pipeline_with(
            Arc::new(CannedRecognizer {
                text: "ROLL NO: 06937".to_string(),
            }),
            Some(Arc::new(StalledExtractor)),
            settings,
        );

        let record = pipeline.run(png_of_width(40), "image/png").await.unwrap();
        assert_eq!(
            record.candidate_details.roll_no.value.as_deref(),
            Some("06937")
        );
    }

    #[tokio::test]
    async fn test_llm_error_degrades_to_fallback() {
        let pipeline = pipeline_with(
            Arc::new(CannedRecognizer {
                text: "ROLL NO: 06937".to_string(),
            }),
            Some(Arc::new(BrokenExtractor)),
            Settings::default(),
        );

        let record = pipeline.run(png_of_width(40), "image/png").await.unwrap();
        assert_eq!(
            record.candidate_details.roll_no.value.as_deref(),
            Some("06937")
        );
    }

    #[tokio::test]
    async fn test_llm_result_preferred_when_more_confident() {
        let pipeline = pipeline_with(
            Arc::new(CannedRecognizer {
                text: "some unlabeled text".to_string(),
            }),
            Some(Arc::new(CountingExtractor::new("ABC-99"))),
            Settings::default(),
        );

        let record = pipeline.run(png_of_width(40), "image/png").await.unwrap();
        assert_eq!(
            record.candidate_details.roll_no.value.as_deref(),
            Some("ABC-99")
        );
    }

    #[tokio::test]
    async fn test_oversized_file_rejected() {
        let settings = Settings {
            max_file_size: 16,
            ..Settings::default()
        };
        let pipeline = pipeline_with(
            Arc::new(CannedRecognizer {
                text: String::new(),
            }),
            None,
            settings,
        );
        let err = pipeline
            .run(png_of_width(40), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_disallowed_mime_rejected() {
        let pipeline = pipeline_with(
            Arc::new(CannedRecognizer {
                text: String::new(),
            }),
            None,
            Settings::default(),
        );
        let err = pipeline
            .run(b"csv,data".to_vec(), "text/csv")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFileType(_)));
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        let pipeline = pipeline_with(Arc::new(DimensionRecognizer), None, Settings::default());

        // Narrow frames answer fast; the first input is the slowest.
        let files = vec![
            BatchFile {
                filename: "a.png".to_string(),
                mime: "image/png".to_string(),
                data: png_of_width(90),
            },
            BatchFile {
                filename: "b.png".to_string(),
                mime: "image/png".to_string(),
                data: png_of_width(60),
            },
            BatchFile {
                filename: "c.png".to_string(),
                mime: "image/png".to_string(),
                data: png_of_width(30),
            },
        ];

        let results = pipeline.run_batch_named(files).await.unwrap();
        let rolls: Vec<String> = results
            .iter()
            .map(|(_, r)| {
                r.as_ref()
                    .unwrap()
                    .candidate_details
                    .roll_no
                    .value
                    .clone()
                    .unwrap()
            })
            .collect();
        assert_eq!(rolls, vec!["90", "60", "30"]);
        assert_eq!(results[0].0, "a.png");
        assert_eq!(results[2].0, "c.png");
    }

    #[tokio::test]
    async fn test_batch_keeps_per_file_failures_in_place() {
        let pipeline = pipeline_with(Arc::new(DimensionRecognizer), None, Settings::default());
        let files = vec![
            BatchFile {
                filename: "good.png".to_string(),
                mime: "image/png".to_string(),
                data: png_of_width(30),
            },
            BatchFile {
                filename: "bad.png".to_string(),
                mime: "image/png".to_string(),
                data: b"not an image".to_vec(),
            },
        ];

        let results = pipeline.run_batch_named(files).await.unwrap();
        assert!(results[0].1.is_ok());
        assert!(matches!(
            results[1].1,
            Err(ExtractionError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_too_large_rejected() {
        let settings = Settings {
            max_batch_size: 1,
            ..Settings::default()
        };
        let pipeline = pipeline_with(Arc::new(DimensionRecognizer), None, settings);
        let files = (0..2)
            .map(|i| BatchFile {
                filename: format!("{}.png", i),
                mime: "image/png".to_string(),
                data: png_of_width(20),
            })
            .collect();
        let err = pipeline.run_batch(files).await.unwrap_err();
        assert!(matches!(err, ExtractionError::BatchTooLarge { got: 2, max: 1 }));
    }

    #[test]
    fn test_best_record_prefers_higher_aggregate_first_on_tie() {
        let mut strong = PartialRecord::empty();
        strong.candidate_details.roll_no = Field::new("1".to_string(), 0.9);
        let weak = PartialRecord::empty();

        let best = best_record(vec![weak.clone(), strong.clone()]);
        assert_eq!(best, strong);

        let mut first = PartialRecord::empty();
        first.candidate_details.roll_no = Field::new("first".to_string(), 0.5);
        let mut second = PartialRecord::empty();
        second.candidate_details.roll_no = Field::new("second".to_string(), 0.5);
        let best = best_record(vec![first.clone(), second]);
        assert_eq!(best, first);

        assert_eq!(best_record(Vec::new()), PartialRecord::empty());
    }
}

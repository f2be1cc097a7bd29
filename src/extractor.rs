//! Structured extraction seam and the model-backed implementation.
//!
//! [`StructuredExtractor`] is the common contract both extraction paths
//! honor: take one page's OCR result, return the same partial-record shape.
//! The merger depends only on this interface, never on which implementation
//! ran, so either can be substituted or mocked in tests.

use crate::confidence;
use crate::llm::GeminiClient;
use crate::ocr::OcrResult;
use crate::schema::{
    CandidateDetails, Field, IssueDetails, OverallResult, PartialRecord, SubjectRecord,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

/// Maximum cleaned OCR characters fed to the model.
const MAX_PROMPT_CHARS: usize = 8000;

#[async_trait::async_trait]
pub trait StructuredExtractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, ocr: &OcrResult) -> Result<PartialRecord>;
}

/// Model-backed extractor: prompts the language model with cleaned OCR text
/// and parses its JSON answer tolerantly. Any malformed or absent field
/// degrades to null rather than failing the extraction.
pub struct LlmExtractor {
    client: GeminiClient,
}

impl LlmExtractor {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl StructuredExtractor for LlmExtractor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn extract(&self, ocr: &OcrResult) -> Result<PartialRecord> {
        let cleaned = clean_ocr_text(&ocr.text);
        let prompt = build_prompt(&cleaned);

        let response = self.client.generate(&prompt).await?;
        debug!("Raw LLM response length: {} chars", response.len());

        let raw: RawRecord =
            parse_llm_json(&response).context("failed to parse LLM extraction response")?;

        let record = raw.into_partial(ocr);
        info!(
            "LLM extraction produced {} subjects, aggregate confidence {:.2}",
            record.subjects.len(),
            record.aggregate_confidence()
        );
        Ok(record)
    }
}

/// Collapse whitespace and strip control noise so the prompt stays compact.
fn clean_ocr_text(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.chars() {
        match ch {
            '\n' => {
                cleaned.push('\n');
                last_was_space = false;
            }
            c if c.is_whitespace() => {
                if !last_was_space {
                    cleaned.push(' ');
                    last_was_space = true;
                }
            }
            c if c.is_control() => {}
            c => {
                cleaned.push(c);
                last_was_space = false;
            }
        }
    }
    truncate_on_char_boundary(cleaned.trim(), MAX_PROMPT_CHARS).to_string()
}

fn truncate_on_char_boundary(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &text[..end]
    }
}

fn build_prompt(ocr_text: &str) -> String {
    format!(
        r#"You are an expert at extracting structured information from marksheets of any board or institution with any layout.
I will provide text extracted from a marksheet using OCR. Be flexible: look for field labels ("Name:", "Roll No:"), common date patterns, tabular subject data, and positional cues.

Extract exactly this JSON structure. For every field report an object {{"value": ..., "confidence": 0.0-1.0}} where confidence is your estimate that the value is correct. Use null for the value when the information is not present.

```json
{{
  "candidate_details": {{
    "name": {{"value": "...", "confidence": 0.0}},
    "father_name": {{"value": "...", "confidence": 0.0}},
    "dob": {{"value": "...", "confidence": 0.0}},
    "roll_no": {{"value": "...", "confidence": 0.0}},
    "registration_no": {{"value": "...", "confidence": 0.0}},
    "exam_year": {{"value": "...", "confidence": 0.0}},
    "board": {{"value": "...", "confidence": 0.0}},
    "institution": {{"value": "...", "confidence": 0.0}}
  }},
  "subjects": [
    {{
      "subject": "...",
      "max_marks": {{"value": 100, "confidence": 0.0}},
      "obtained_marks": {{"value": 85, "confidence": 0.0}},
      "grade": {{"value": "...", "confidence": 0.0}},
      "confidence": 0.0
    }}
  ],
  "overall_result": {{
    "division": {{"value": "...", "confidence": 0.0}},
    "percentage": {{"value": 85.5, "confidence": 0.0}},
    "grade": {{"value": "...", "confidence": 0.0}}
  }},
  "issue_details": {{
    "date": {{"value": "...", "confidence": 0.0}},
    "place": {{"value": "...", "confidence": 0.0}}
  }}
}}
```

Subjects may carry a grade without marks; in that case leave both marks null. If marks appear as "Subject: 85/100" then obtained_marks is 85 and max_marks is 100. Ensure the JSON is valid.

Here is the OCR text:
---
{}
---"#,
        ocr_text
    )
}

/// Extract and parse JSON from the model response, tolerating code fences
/// and leading/trailing prose.
fn parse_llm_json<T: serde::de::DeserializeOwned>(response: &str) -> Result<T> {
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        // Last resort: widest brace-delimited slice.
        match (response.find('{'), response.rfind('}')) {
            (Some(start), Some(end)) if end > start => response[start..=end].trim(),
            _ => response.trim(),
        }
    };

    serde_json::from_str(json_str).with_context(|| {
        format!(
            "JSON structure mismatch: {}",
            &json_str.chars().take(200).collect::<String>()
        )
    })
}

// ============================================================================
// Tolerant response types
// ============================================================================

/// Raw model output. Every field is an untyped `Value` so that bare values,
/// `{value, confidence}` objects, nulls, and outright garbage all parse; the
/// conversion below decides what survives.
#[derive(Debug, Default, Deserialize)]
struct RawRecord {
    #[serde(default)]
    candidate_details: RawCandidate,
    #[serde(default)]
    subjects: Vec<RawSubject>,
    #[serde(default)]
    overall_result: RawOverall,
    #[serde(default)]
    issue_details: RawIssue,
}

#[derive(Debug, Default, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    name: Value,
    #[serde(default)]
    father_name: Value,
    #[serde(default)]
    dob: Value,
    #[serde(default)]
    roll_no: Value,
    #[serde(default)]
    registration_no: Value,
    #[serde(default)]
    exam_year: Value,
    #[serde(default)]
    board: Value,
    #[serde(default)]
    institution: Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawSubject {
    #[serde(default)]
    subject: Value,
    #[serde(default)]
    max_marks: Value,
    #[serde(default)]
    obtained_marks: Value,
    #[serde(default)]
    grade: Value,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOverall {
    #[serde(default)]
    division: Value,
    #[serde(default)]
    percentage: Value,
    #[serde(default)]
    grade: Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawIssue {
    #[serde(default)]
    date: Value,
    #[serde(default)]
    place: Value,
}

impl RawRecord {
    fn into_partial(self, ocr: &OcrResult) -> PartialRecord {
        let c = self.candidate_details;
        let o = self.overall_result;
        let i = self.issue_details;

        let subjects = self
            .subjects
            .into_iter()
            .filter_map(|s| s.into_subject(ocr))
            .collect();

        PartialRecord {
            candidate_details: CandidateDetails {
                name: string_field("name", &c.name, ocr),
                father_name: string_field("father_name", &c.father_name, ocr),
                dob: string_field("dob", &c.dob, ocr),
                roll_no: string_field("roll_no", &c.roll_no, ocr),
                registration_no: string_field("registration_no", &c.registration_no, ocr),
                exam_year: string_field("exam_year", &c.exam_year, ocr),
                board: string_field("board", &c.board, ocr),
                institution: string_field("institution", &c.institution, ocr),
            },
            subjects,
            overall_result: OverallResult {
                division: string_field("division", &o.division, ocr),
                percentage: number_field("percentage", &o.percentage, ocr),
                grade: string_field("grade", &o.grade, ocr),
            },
            issue_details: IssueDetails {
                date: string_field("date", &i.date, ocr),
                place: string_field("place", &i.place, ocr),
            },
        }
    }
}

impl RawSubject {
    fn into_subject(self, ocr: &OcrResult) -> Option<SubjectRecord> {
        // Subject name is the structural key; a row without one is noise.
        let (subject, _) = unwrap_string(&self.subject);
        let subject = subject?.trim().to_string();
        if subject.is_empty() {
            return None;
        }

        let row_score = confidence::score("subject", &subject, ocr);
        let row_confidence = blend(self.confidence, row_score);

        Some(SubjectRecord {
            max_marks: number_field("max_marks", &self.max_marks, ocr),
            obtained_marks: number_field("obtained_marks", &self.obtained_marks, ocr),
            grade: string_field("grade", &self.grade, ocr),
            subject,
            confidence: row_confidence,
        })
    }
}

/// Accept `"x"`, `42`, or `{"value": ..., "confidence": ...}`.
fn unwrap_string(v: &Value) -> (Option<String>, Option<f64>) {
    match v {
        Value::String(s) if !s.trim().is_empty() && s != "..." => {
            (Some(s.trim().to_string()), None)
        }
        Value::Number(n) => (Some(n.to_string()), None),
        Value::Object(obj) => {
            let conf = obj.get("confidence").and_then(Value::as_f64);
            let inner = obj.get("value").cloned().unwrap_or(Value::Null);
            let (value, _) = unwrap_string(&inner);
            (value, conf)
        }
        _ => (None, None),
    }
}

/// Accept `42`, `"42"`, `"85.5"`, or `{"value": ..., "confidence": ...}`.
fn unwrap_number(v: &Value) -> (Option<f64>, Option<f64>) {
    match v {
        Value::Number(n) => (n.as_f64(), None),
        Value::String(s) => (s.trim().trim_end_matches('%').parse().ok(), None),
        Value::Object(obj) => {
            let conf = obj.get("confidence").and_then(Value::as_f64);
            let inner = obj.get("value").cloned().unwrap_or(Value::Null);
            let (value, _) = unwrap_number(&inner);
            (value, conf)
        }
        _ => (None, None),
    }
}

fn string_field(field_name: &str, v: &Value, ocr: &OcrResult) -> Field<String> {
    let (value, model_conf) = unwrap_string(v);
    match value {
        Some(s) => {
            let score = confidence::score(field_name, &s, ocr);
            Field::new(s, blend(model_conf, score))
        }
        None => Field::null(),
    }
}

fn number_field(field_name: &str, v: &Value, ocr: &OcrResult) -> Field<f64> {
    let (value, model_conf) = unwrap_number(v);
    match value {
        Some(n) => {
            let score = confidence::score(field_name, &n.to_string(), ocr);
            Field::new(n, blend(model_conf, score))
        }
        None => Field::null(),
    }
}

/// Average the model's self-reported confidence with the deterministic score;
/// without a model estimate the deterministic score stands alone. The exact
/// blend is tunable, not load-bearing.
fn blend(model_conf: Option<f64>, score: f64) -> f64 {
    match model_conf {
        Some(m) => ((m.clamp(0.0, 1.0) + score) / 2.0).clamp(0.0, 1.0),
        None => score,
    }
}

//! Confidence scoring and result merging.
//!
//! Scoring blends three deterministic signals per field: format validation
//! (weight 0.4), OCR-presence/noise inspection (0.3), and label-context
//! proximity in the OCR text (0.3). Merging reconciles the LLM and fallback
//! records field by field and backfills derivable fields at a documented
//! confidence discount. Merging never mutates its inputs.

use crate::ocr::OcrResult;
use crate::schema::{
    CandidateDetails, Field, IssueDetails, OverallResult, PartialRecord, SubjectRecord,
};
use regex::Regex;
use std::sync::OnceLock;

const WEIGHT_VALIDATION: f64 = 0.4;
const WEIGHT_OCR: f64 = 0.3;
const WEIGHT_CONTEXT: f64 = 0.3;

/// Confidence discount applied to values computed from other fields rather
/// than observed in the document.
pub const DERIVED_CONFIDENCE_FACTOR: f64 = 0.8;

/// Score a field value against the OCR evidence. Returns 0 for empty values,
/// otherwise a weighted blend clamped to [0, 1].
pub fn score(field_name: &str, value: &str, ocr: &OcrResult) -> f64 {
    if value.trim().is_empty() {
        return 0.0;
    }
    let combined = validate_format(field_name, value) * WEIGHT_VALIDATION
        + ocr_presence(value, &ocr.text) * WEIGHT_OCR
        + context_proximity(field_name, value, &ocr.text) * WEIGHT_CONTEXT;
    combined.clamp(0.0, 1.0)
}

// ============================================================================
// Format validation
// ============================================================================

struct Validators {
    person_name: Regex,
    date: Regex,
    alnum_id: Regex,
    year: Regex,
    org_name: Regex,
    subject: Regex,
    letter_grade: Regex,
    division: Regex,
    place: Regex,
}

fn validators() -> &'static Validators {
    static CELL: OnceLock<Validators> = OnceLock::new();
    CELL.get_or_init(|| Validators {
        person_name: Regex::new(r"^[A-Za-z\s\-\.']+$").unwrap(),
        date: Regex::new(r"^\d{1,2}[-/]\d{1,2}[-/]\d{4}$").unwrap(),
        alnum_id: Regex::new(r"^[A-Za-z0-9\-/]+$").unwrap(),
        year: Regex::new(r"^(19|20)\d{2}$").unwrap(),
        org_name: Regex::new(r"^[A-Za-z\s&\-\.,()]+$").unwrap(),
        subject: Regex::new(r"^[A-Za-z0-9\s()\-&\.]+$").unwrap(),
        letter_grade: Regex::new(r"^[A-F][1-2+\-]?$").unwrap(),
        division: Regex::new(
            r"(?i)^(first|second|third|distinction|pass|fail)( (division|class))?$",
        )
        .unwrap(),
        place: Regex::new(r"^[A-Za-z\s\-]+$").unwrap(),
    })
}

fn validate_format(field_name: &str, value: &str) -> f64 {
    let v = validators();
    match field_name {
        "name" | "father_name" => {
            if v.person_name.is_match(value) {
                let words: Vec<&str> = value.split_whitespace().collect();
                if words.len() >= 2
                    && words
                        .iter()
                        .all(|w| w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false))
                {
                    0.95
                } else {
                    0.8
                }
            } else {
                0.3
            }
        }
        "dob" | "date" => {
            if v.date.is_match(value) && date_parts_plausible(value) {
                0.95
            } else {
                0.2
            }
        }
        "roll_no" | "registration_no" => {
            if v.alnum_id.is_match(value) {
                0.9
            } else {
                0.5
            }
        }
        "exam_year" => match value.parse::<u32>() {
            Ok(year) if v.year.is_match(value) && (1980..=2100).contains(&year) => 0.95,
            _ => 0.3,
        },
        "board" | "institution" => {
            if v.org_name.is_match(value) && starts_uppercase(value) {
                0.9
            } else {
                0.5
            }
        }
        "subject" => {
            if v.subject.is_match(value) && starts_uppercase(value) {
                0.9
            } else {
                0.5
            }
        }
        "max_marks" | "obtained_marks" => match value.parse::<f64>() {
            Ok(m) if (0.0..=1000.0).contains(&m) => 0.95,
            Ok(_) => 0.7,
            Err(_) => 0.1,
        },
        "grade" => {
            if v.letter_grade.is_match(value) || v.division.is_match(value) {
                0.9
            } else {
                0.4
            }
        }
        "division" => {
            if v.division.is_match(value) {
                0.95
            } else {
                0.3
            }
        }
        "percentage" => match value.parse::<f64>() {
            Ok(p) if (0.0..=100.0).contains(&p) => 0.95,
            Ok(_) => 0.5,
            Err(_) => 0.1,
        },
        "place" => {
            if v.place.is_match(value) && starts_uppercase(value) {
                0.9
            } else {
                0.5
            }
        }
        _ => 0.7,
    }
}

fn starts_uppercase(value: &str) -> bool {
    value
        .chars()
        .next()
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
}

fn date_parts_plausible(value: &str) -> bool {
    let parts: Vec<&str> = value.split(['-', '/']).collect();
    if parts.len() != 3 {
        return false;
    }
    let (Ok(day), Ok(month), Ok(year)) = (
        parts[0].parse::<u32>(),
        parts[1].parse::<u32>(),
        parts[2].parse::<u32>(),
    ) else {
        return false;
    };
    (1..=31).contains(&day) && (1..=12).contains(&month) && (1900..=2100).contains(&year)
}

// ============================================================================
// OCR presence
// ============================================================================

/// How plausibly the value came out of this OCR text. Values absent from the
/// text (model normalization, derived forms) score a neutral 0.5; values
/// exhibiting classic OCR confusions (0/O, 1/l) are discounted.
fn ocr_presence(value: &str, text: &str) -> f64 {
    static NOISE: OnceLock<Vec<Regex>> = OnceLock::new();
    let noise = NOISE.get_or_init(|| {
        vec![
            Regex::new(r"[0-9]+[oO][0-9]+").unwrap(),
            Regex::new(r"[lI][0-9]+").unwrap(),
            Regex::new(r"[0-9]+[lI]").unwrap(),
            Regex::new(r"[A-Za-z]{2,}[0-9]{2,}").unwrap(),
        ]
    });

    if !text.contains(value) {
        return 0.5;
    }
    if noise.iter().any(|p| p.is_match(value)) {
        return 0.6;
    }
    0.85
}

// ============================================================================
// Label-context proximity
// ============================================================================

fn field_indicators(field_name: &str) -> &'static [&'static str] {
    match field_name {
        "name" => &["name", "candidate", "student", "s/o", "d/o"],
        "father_name" => &["father", "mother", "parent", "guardian", "s/o", "d/o"],
        "dob" => &["birth", "dob", "born"],
        "roll_no" => &["roll"],
        "registration_no" => &["reg", "registration"],
        "exam_year" => &["year", "examination", "academic"],
        "board" => &["board", "university", "council", "authority"],
        "institution" => &["school", "college", "institution", "academy", "vidyalaya"],
        "subject" => &["subject", "paper", "course", "marks"],
        "max_marks" => &["max", "maximum", "total", "out of"],
        "obtained_marks" => &["obtained", "scored", "secured", "marks"],
        "grade" => &["grade", "grading", "result"],
        "division" => &["division", "class", "distinction", "result"],
        "percentage" => &["percentage", "percent", "%", "aggregate"],
        "date" => &["date", "dated", "issue"],
        "place" => &["place", "issued at", "location"],
        _ => &[],
    }
}

/// Score how close the value sits to a label that announces its field.
/// 0.9 when an indicator term appears in a window around an occurrence,
/// 0.5 for an occurrence with no nearby indicator, 0.3 when the value does
/// not occur in the text at all.
fn context_proximity(field_name: &str, value: &str, text: &str) -> f64 {
    const WINDOW: usize = 150;

    let lower_text = text.to_lowercase();
    let lower_value = value.to_lowercase();
    let indicators = field_indicators(field_name);

    let mut best: Option<f64> = None;
    let mut start = 0;
    while let Some(pos) = lower_text[start..].find(&lower_value) {
        let pos = start + pos;
        let from = pos.saturating_sub(WINDOW);
        let to = (pos + lower_value.len() + WINDOW).min(lower_text.len());
        let window = slice_on_boundaries(&lower_text, from, to);

        let hit = indicators.iter().any(|ind| window.contains(ind));
        let score = if hit { 0.9 } else { 0.5 };
        best = Some(best.map_or(score, |b: f64| b.max(score)));

        // Resume past the match end, which is always a char boundary.
        start = pos + lower_value.len();
        if start >= lower_text.len() {
            break;
        }
    }

    best.unwrap_or(0.3)
}

/// Slice on valid char boundaries nearest the requested byte range.
fn slice_on_boundaries(text: &str, mut from: usize, mut to: usize) -> &str {
    while from > 0 && !text.is_char_boundary(from) {
        from -= 1;
    }
    while to < text.len() && !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

// ============================================================================
// Merging
// ============================================================================

/// Reconcile the two extraction paths into one record. `llm_clean` marks that
/// the LLM stage ran and produced a non-degraded result; it decides equal-
/// confidence ties (the model is treated as slightly more context-aware).
/// Produces a new record; neither input is modified.
pub fn merge_records(
    llm: Option<&PartialRecord>,
    fallback: &PartialRecord,
    llm_clean: bool,
) -> PartialRecord {
    let Some(llm) = llm else {
        return fallback.clone();
    };

    let lc = &llm.candidate_details;
    let fc = &fallback.candidate_details;
    let lo = &llm.overall_result;
    let fo = &fallback.overall_result;
    let li = &llm.issue_details;
    let fi = &fallback.issue_details;

    PartialRecord {
        candidate_details: CandidateDetails {
            name: merge_field(&lc.name, &fc.name, llm_clean),
            father_name: merge_field(&lc.father_name, &fc.father_name, llm_clean),
            dob: merge_field(&lc.dob, &fc.dob, llm_clean),
            roll_no: merge_field(&lc.roll_no, &fc.roll_no, llm_clean),
            registration_no: merge_field(&lc.registration_no, &fc.registration_no, llm_clean),
            exam_year: merge_field(&lc.exam_year, &fc.exam_year, llm_clean),
            board: merge_field(&lc.board, &fc.board, llm_clean),
            institution: merge_field(&lc.institution, &fc.institution, llm_clean),
        },
        subjects: merge_subjects(&llm.subjects, &fallback.subjects, llm_clean),
        overall_result: OverallResult {
            division: merge_field(&lo.division, &fo.division, llm_clean),
            percentage: merge_field(&lo.percentage, &fo.percentage, llm_clean),
            grade: merge_field(&lo.grade, &fo.grade, llm_clean),
        },
        issue_details: IssueDetails {
            date: merge_field(&li.date, &fi.date, llm_clean),
            place: merge_field(&li.place, &fi.place, llm_clean),
        },
    }
}

/// Higher-confidence non-null value wins; equal confidence and both non-null
/// prefers the LLM when its stage ran clean; a null side always yields to
/// the other.
fn merge_field<T: Clone>(llm: &Field<T>, fallback: &Field<T>, llm_clean: bool) -> Field<T> {
    match (llm.is_null(), fallback.is_null()) {
        (true, true) => Field::null(),
        (false, true) => llm.clone(),
        (true, false) => fallback.clone(),
        (false, false) => {
            if fallback.confidence > llm.confidence {
                fallback.clone()
            } else if llm.confidence > fallback.confidence || llm_clean {
                llm.clone()
            } else {
                fallback.clone()
            }
        }
    }
}

/// Subject lists merge as whole lists: a non-empty list beats an empty one,
/// otherwise the higher mean row confidence wins, with the usual tie rule.
fn merge_subjects(
    llm: &[SubjectRecord],
    fallback: &[SubjectRecord],
    llm_clean: bool,
) -> Vec<SubjectRecord> {
    match (llm.is_empty(), fallback.is_empty()) {
        (true, true) => Vec::new(),
        (false, true) => llm.to_vec(),
        (true, false) => fallback.to_vec(),
        (false, false) => {
            let llm_mean = mean_row_confidence(llm);
            let fb_mean = mean_row_confidence(fallback);
            if fb_mean > llm_mean {
                fallback.to_vec()
            } else if llm_mean > fb_mean || llm_clean {
                llm.to_vec()
            } else {
                fallback.to_vec()
            }
        }
    }
}

fn mean_row_confidence(subjects: &[SubjectRecord]) -> f64 {
    subjects.iter().map(|s| s.confidence).sum::<f64>() / subjects.len() as f64
}

// ============================================================================
// Derived fields
// ============================================================================

/// Backfill fields that were not extracted but are calculable from others.
/// Derived values carry the source confidence scaled by
/// [`DERIVED_CONFIDENCE_FACTOR`]. Only fills nulls; observed values are
/// never overwritten.
pub fn derive_missing(record: &mut PartialRecord) {
    if record.overall_result.percentage.is_null() {
        if let Some((pct, conf)) = percentage_from_subjects(&record.subjects) {
            record.overall_result.percentage =
                Field::new(pct, conf * DERIVED_CONFIDENCE_FACTOR);
        }
    }

    if record.overall_result.division.is_null() {
        if let Some(pct) = record.overall_result.percentage.value {
            let division = division_from_percentage(pct);
            let conf = record.overall_result.percentage.confidence * DERIVED_CONFIDENCE_FACTOR;
            record.overall_result.division = Field::new(division.to_string(), conf);
        }
    }
}

/// Sum obtained over max across rows where both are present.
fn percentage_from_subjects(subjects: &[SubjectRecord]) -> Option<(f64, f64)> {
    let mut obtained_sum = 0.0;
    let mut max_sum = 0.0;
    let mut confs = Vec::new();

    for s in subjects {
        if let (Some(obtained), Some(max)) = (s.obtained_marks.value, s.max_marks.value) {
            if max > 0.0 {
                obtained_sum += obtained;
                max_sum += max;
                confs.push(s.obtained_marks.confidence.min(s.max_marks.confidence));
            }
        }
    }

    if max_sum <= 0.0 || confs.is_empty() {
        return None;
    }
    let pct = ((obtained_sum / max_sum * 100.0) * 100.0).round() / 100.0;
    let conf = confs.iter().sum::<f64>() / confs.len() as f64;
    Some((pct.min(100.0), conf))
}

/// Conventional board thresholds. Tunable data, not load-bearing.
fn division_from_percentage(pct: f64) -> &'static str {
    if pct >= 75.0 {
        "Distinction"
    } else if pct >= 60.0 {
        "First Division"
    } else if pct >= 45.0 {
        "Second Division"
    } else if pct >= 33.0 {
        "Third Division"
    } else {
        "Fail"
    }
}

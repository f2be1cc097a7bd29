//! Deterministic fallback extractor.
//!
//! Label-anchored regex and gazetteer matching over raw OCR text. Runs on
//! every document regardless of whether the LLM stage succeeds, both as a
//! safety net and as a second opinion for the merger. This extractor never
//! returns an error: on hostile input it produces an all-null record.
//!
//! Confidences are tiered by how the value was anchored (exact label >
//! gazetteer > fuzzy label > positional) and blended with the deterministic
//! field score so garbage matched by a strong label still gets marked down.

use crate::config::PatternTables;
use crate::confidence;
use crate::extractor::StructuredExtractor;
use crate::ocr::OcrResult;
use crate::schema::{Field, PartialRecord, SubjectRecord};
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

const EXACT_LABEL_CONFIDENCE: f64 = 0.9;
const GAZETTEER_CONFIDENCE: f64 = 0.8;
const FUZZY_LABEL_CONFIDENCE: f64 = 0.75;
const POSITIONAL_CONFIDENCE: f64 = 0.6;

/// Edit-distance budget for fuzzy label matching. OCR typically garbles one
/// or two characters of a printed label, not more.
const FUZZY_LABEL_BUDGET: usize = 2;

/// Labels shorter than this are too ambiguous to fuzzy-match.
const FUZZY_MIN_LABEL_LEN: usize = 4;

pub struct FallbackExtractor {
    tables: PatternTables,
}

struct DateRegexes {
    numeric: Regex,
    spelled: Regex,
    percentage: Regex,
    year: Regex,
    id_token: Regex,
    marks_pair: Regex,
}

fn regexes() -> &'static DateRegexes {
    static CELL: OnceLock<DateRegexes> = OnceLock::new();
    CELL.get_or_init(|| DateRegexes {
        numeric: Regex::new(r"(\d{1,2})[-/.](\d{1,2})[-/.](\d{4})").unwrap(),
        spelled: Regex::new(
            r"(?i)(\d{1,2})(?:st|nd|rd|th)?\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?,?\s+(\d{4})",
        )
        .unwrap(),
        percentage: Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").unwrap(),
        year: Regex::new(r"\b((?:19|20)\d{2})\b").unwrap(),
        id_token: Regex::new(r"[A-Za-z0-9][A-Za-z0-9\-/]*").unwrap(),
        marks_pair: Regex::new(r"^(\d{1,4}(?:\.\d+)?)/(\d{1,4}(?:\.\d+)?)$").unwrap(),
    })
}

impl FallbackExtractor {
    pub fn new(tables: PatternTables) -> Self {
        Self { tables }
    }

    fn extract_record(&self, ocr: &OcrResult) -> PartialRecord {
        let mut record = PartialRecord::empty();
        if ocr.text.trim().is_empty() {
            return record;
        }

        let lines: Vec<&str> = ocr
            .text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        self.extract_identity(&lines, ocr, &mut record);
        self.extract_dates(&lines, ocr, &mut record);
        self.extract_board(&lines, ocr, &mut record);
        self.extract_subjects(&lines, &mut record);
        self.extract_overall(&lines, ocr, &mut record);

        debug!(
            "Fallback extracted {} subjects, aggregate {:.2}",
            record.subjects.len(),
            record.aggregate_confidence()
        );
        record
    }

    // ------------------------------------------------------------------
    // Identity fields
    // ------------------------------------------------------------------

    fn extract_identity(&self, lines: &[&str], ocr: &OcrResult, record: &mut PartialRecord) {
        for line in lines {
            let Some((label, raw_value)) = split_labeled_line(line) else {
                continue;
            };

            let mut best: Option<(&str, f64, usize)> = None;
            for (field, tokens) in &self.tables.identity_labels {
                for token in tokens {
                    let tier = match label_tier(&label, token) {
                        Some(t) => t,
                        None => continue,
                    };
                    let candidate = (field.as_str(), tier, token.len());
                    // Exact beats fuzzy; among equals the longer label wins.
                    let better = match best {
                        None => true,
                        Some((_, bt, bl)) => tier > bt || (tier == bt && token.len() > bl),
                    };
                    if better {
                        best = Some(candidate);
                    }
                }
            }

            let Some((field, tier, _)) = best else { continue };
            let Some(value) = clean_identity_value(field, &raw_value) else {
                continue;
            };

            let conf = blend(tier, confidence::score(field, &value, ocr));
            let c = &mut record.candidate_details;
            let slot = match field {
                "name" => &mut c.name,
                "father_name" => &mut c.father_name,
                "roll_no" => &mut c.roll_no,
                "registration_no" => &mut c.registration_no,
                "exam_year" => &mut c.exam_year,
                "institution" => &mut c.institution,
                _ => continue,
            };
            if slot.is_null() {
                *slot = Field::new(value, conf);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dates and place of issue
    // ------------------------------------------------------------------

    fn extract_dates(&self, lines: &[&str], ocr: &OcrResult, record: &mut PartialRecord) {
        for line in lines {
            let lower = line.to_lowercase();

            if record.candidate_details.dob.is_null()
                && self.tables.dob_labels.iter().any(|l| contains_word(&lower, l))
            {
                if let Some(date) = find_date(line) {
                    let conf = blend(EXACT_LABEL_CONFIDENCE, confidence::score("dob", &date, ocr));
                    record.candidate_details.dob = Field::new(date, conf);
                }
            }

            // Issue date lines share vocabulary with DOB lines; birth wording
            // disqualifies a line from being an issue date.
            let is_birth_line = contains_word(&lower, "birth") || contains_word(&lower, "dob");
            if record.issue_details.date.is_null()
                && !is_birth_line
                && self
                    .tables
                    .issue_date_labels
                    .iter()
                    .any(|l| contains_word(&lower, l))
            {
                if let Some(date) = find_date(line) {
                    let conf =
                        blend(EXACT_LABEL_CONFIDENCE, confidence::score("date", &date, ocr));
                    record.issue_details.date = Field::new(date, conf);
                }
            }

            if record.issue_details.place.is_null() {
                if let Some((label, value)) = split_labeled_line(line) {
                    if self.tables.place_labels.iter().any(|l| label.contains(l)) {
                        if let Some(place) = clean_text_value(&value) {
                            let conf = blend(
                                EXACT_LABEL_CONFIDENCE,
                                confidence::score("place", &place, ocr),
                            );
                            record.issue_details.place = Field::new(place, conf);
                        }
                    }
                }
            }
        }

        // Positional rescue for the exam year when no label anchored it.
        if record.candidate_details.exam_year.is_null() {
            for line in lines {
                let lower = line.to_lowercase();
                if !(lower.contains("examination") || lower.contains("exam")) {
                    continue;
                }
                if let Some(m) = regexes().year.captures(line) {
                    let year = m[1].to_string();
                    let conf = blend(
                        POSITIONAL_CONFIDENCE,
                        confidence::score("exam_year", &year, ocr),
                    );
                    record.candidate_details.exam_year = Field::new(year, conf);
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Board gazetteer
    // ------------------------------------------------------------------

    fn extract_board(&self, lines: &[&str], ocr: &OcrResult, record: &mut PartialRecord) {
        if !record.candidate_details.board.is_null() {
            return;
        }
        // Longer fragments are more specific; try them first.
        let mut fragments: Vec<&String> = self.tables.boards.iter().collect();
        fragments.sort_by_key(|f| std::cmp::Reverse(f.len()));

        for line in lines {
            let lower = line.to_lowercase();
            for fragment in &fragments {
                if lower.contains(fragment.as_str()) {
                    if let Some(value) = clean_text_value(line) {
                        let conf = blend(
                            GAZETTEER_CONFIDENCE,
                            confidence::score("board", &value, ocr),
                        );
                        record.candidate_details.board = Field::new(value, conf);
                        return;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Subject table
    // ------------------------------------------------------------------

    fn extract_subjects(&self, lines: &[&str], record: &mut PartialRecord) {
        for line in lines {
            if let Some(subject) = self.parse_subject_row(line) {
                record.subjects.push(subject);
            }
        }
    }

    /// A subject row is leading alphabetic tokens (the subject name), then up
    /// to three numeric tokens (marks), then optionally a grade token.
    fn parse_subject_row(&self, line: &str) -> Option<SubjectRecord> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 || tokens.len() > 8 {
            return None;
        }

        let mut name_tokens = Vec::new();
        let mut rest = 0;
        for (i, token) in tokens.iter().enumerate() {
            if token.chars().all(|c| c.is_alphabetic() || c == '&' || c == '.') && !token.is_empty()
            {
                name_tokens.push(*token);
                rest = i + 1;
            } else {
                break;
            }
        }
        if name_tokens.is_empty() || name_tokens.len() > 4 || rest >= tokens.len() {
            return None;
        }
        let subject = name_tokens.join(" ");
        if !self.is_valid_subject_name(&subject) {
            return None;
        }

        let mut numbers: Vec<f64> = Vec::new();
        let mut pair: Option<(f64, f64)> = None;
        let mut grade: Option<String> = None;

        for token in &tokens[rest..] {
            if let Some(caps) = regexes().marks_pair.captures(token) {
                // "214/300" form: obtained over maximum.
                let obtained = caps[1].parse().ok()?;
                let max = caps[2].parse().ok()?;
                pair = Some((obtained, max));
            } else if let Ok(n) = token.parse::<f64>() {
                if !(0.0..=1000.0).contains(&n) {
                    return None;
                }
                numbers.push(n);
            } else if grade.is_none() && self.is_grade_token(token) {
                grade = Some(token.to_uppercase());
            } else {
                return None;
            }
        }

        let (max_marks, obtained_marks) = match pair {
            Some((obtained, max)) => (Some(max), Some(obtained)),
            None => match numbers.len() {
                0 => (None, None),
                1 => (None, Some(numbers[0])),
                // Two or three columns: maximum is the largest figure, the
                // obtained marks the smallest (theory+practical splits put
                // component columns in between).
                2 | 3 => {
                    let max = numbers.iter().cloned().fold(f64::MIN, f64::max);
                    let min = numbers.iter().cloned().fold(f64::MAX, f64::min);
                    (Some(max), Some(min))
                }
                _ => return None,
            },
        };

        // A row with neither marks nor a grade carries no signal.
        if max_marks.is_none() && obtained_marks.is_none() && grade.is_none() {
            return None;
        }

        let mut row_conf = POSITIONAL_CONFIDENCE;
        if max_marks.is_some() && obtained_marks.is_some() {
            row_conf += 0.15;
        }
        if grade.is_some() {
            row_conf += 0.1;
        }
        let row_conf = row_conf.min(1.0);

        Some(SubjectRecord {
            subject,
            max_marks: max_marks.map_or_else(Field::null, |m| Field::new(m, row_conf)),
            obtained_marks: obtained_marks.map_or_else(Field::null, |m| Field::new(m, row_conf)),
            grade: grade.map_or_else(Field::null, |g| Field::new(g, row_conf)),
            confidence: row_conf,
        })
    }

    fn is_valid_subject_name(&self, name: &str) -> bool {
        if name.len() < 3 {
            return false;
        }
        let lower = name.to_lowercase();
        if self
            .tables
            .subject_exclude_terms
            .iter()
            .any(|t| lower.split_whitespace().any(|w| w == t))
        {
            return false;
        }
        let first_alpha = name.chars().next().map(|c| c.is_alphabetic()).unwrap_or(false);
        let letters = name.chars().filter(|c| c.is_alphabetic()).count();
        first_alpha && letters * 2 > name.len()
    }

    fn is_grade_token(&self, token: &str) -> bool {
        let lower = token.to_lowercase();
        self.tables.grade_tokens.iter().any(|g| *g == lower)
    }

    // ------------------------------------------------------------------
    // Overall result
    // ------------------------------------------------------------------

    fn extract_overall(&self, lines: &[&str], ocr: &OcrResult, record: &mut PartialRecord) {
        let lower_text = ocr.text.to_lowercase();

        if record.overall_result.division.is_null() {
            let mut terms: Vec<&String> = self.tables.division_terms.iter().collect();
            terms.sort_by_key(|t| std::cmp::Reverse(t.len()));
            for term in terms {
                if !lower_text.contains(term.as_str()) {
                    continue;
                }
                // Single-word terms ("first", "pass") need result context to
                // avoid matching prose; multiword terms are specific enough.
                let specific = term.contains(' ')
                    || ["division", "class", "result", "passed"]
                        .iter()
                        .any(|c| lower_text.contains(c));
                if specific {
                    let value = title_case(term);
                    let conf = blend(
                        GAZETTEER_CONFIDENCE,
                        confidence::score("division", &value, ocr),
                    );
                    record.overall_result.division = Field::new(value, conf);
                    break;
                }
            }
        }

        if record.overall_result.percentage.is_null() {
            for line in lines {
                let lower = line.to_lowercase();
                let labeled = lower.contains("percentage") || lower.contains("percent");
                let m = regexes().percentage.captures(line);
                let Some(m) = m else {
                    if labeled {
                        // "PERCENTAGE: 85.5" without the % sign.
                        if let Some((_, value)) = split_labeled_line(line) {
                            if let Ok(p) = value.trim().parse::<f64>() {
                                if (0.0..=100.0).contains(&p) {
                                    let conf = blend(
                                        EXACT_LABEL_CONFIDENCE,
                                        confidence::score("percentage", value.trim(), ocr),
                                    );
                                    record.overall_result.percentage = Field::new(p, conf);
                                    break;
                                }
                            }
                        }
                    }
                    continue;
                };
                if let Ok(p) = m[1].parse::<f64>() {
                    if (0.0..=100.0).contains(&p) {
                        let tier = if labeled {
                            EXACT_LABEL_CONFIDENCE
                        } else {
                            POSITIONAL_CONFIDENCE
                        };
                        let conf = blend(tier, confidence::score("percentage", &m[1], ocr));
                        record.overall_result.percentage = Field::new(p, conf);
                        break;
                    }
                }
            }
        }

        if record.overall_result.grade.is_null() {
            for line in lines {
                let Some((label, value)) = split_labeled_line(line) else {
                    continue;
                };
                if !label.contains("grade") {
                    continue;
                }
                let token = value.split_whitespace().next().unwrap_or("");
                if self.is_grade_token(token) {
                    let value = token.to_uppercase();
                    let conf = blend(
                        EXACT_LABEL_CONFIDENCE,
                        confidence::score("grade", &value, ocr),
                    );
                    record.overall_result.grade = Field::new(value, conf);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl StructuredExtractor for FallbackExtractor {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn extract(&self, ocr: &OcrResult) -> Result<PartialRecord> {
        Ok(self.extract_record(ocr))
    }
}

// ============================================================================
// Line and value helpers
// ============================================================================

/// Split a line into a normalized label part and a raw value part. Prefers a
/// colon separator; without one, treats the leading alphabetic run as the
/// label and the remainder as the value.
fn split_labeled_line(line: &str) -> Option<(String, String)> {
    if let Some((label, value)) = line.split_once(':') {
        let label = normalize_label(label);
        if label.is_empty() {
            return None;
        }
        return Some((label, value.trim().to_string()));
    }

    // "ROLL NO 06937" form: label tokens are alphabetic, value starts at the
    // first token containing a digit.
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let boundary = tokens
        .iter()
        .position(|t| t.chars().any(|c| c.is_ascii_digit()))?;
    if boundary == 0 {
        return None;
    }
    let label = normalize_label(&tokens[..boundary].join(" "));
    let value = tokens[boundary..].join(" ");
    Some((label, value))
}

fn normalize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '\'' || *c == '/' || *c == '.')
        .collect();
    cleaned
        .trim_end_matches(['.', ' '])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Substring match on word boundaries only, so the bare label "date" does
/// not fire inside "candidate". Multi-word labels work unchanged.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let pos = start + pos;
        let end = pos + needle.len();
        let before_ok = haystack[..pos]
            .chars()
            .next_back()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        if before_ok && after_ok {
            return true;
        }
        start = end;
        if start >= haystack.len() {
            break;
        }
    }
    false
}

/// Exact match beats a fuzzy one within the edit budget; both beat nothing.
fn label_tier(label: &str, token: &str) -> Option<f64> {
    if label == token {
        return Some(EXACT_LABEL_CONFIDENCE);
    }
    if token.len() >= FUZZY_MIN_LABEL_LEN
        && label.len().abs_diff(token.len()) <= FUZZY_LABEL_BUDGET
        && levenshtein(label, token) <= FUZZY_LABEL_BUDGET
    {
        return Some(FUZZY_LABEL_CONFIDENCE);
    }
    None
}

fn clean_identity_value(field: &str, raw: &str) -> Option<String> {
    let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || c == ':' || c == '-' || c == '.');
    if trimmed.is_empty() {
        return None;
    }
    match field {
        "roll_no" | "registration_no" => regexes()
            .id_token
            .find(trimmed)
            .map(|m| m.as_str().to_string()),
        "exam_year" => regexes()
            .year
            .captures(trimmed)
            .map(|c| c[1].to_string()),
        _ => clean_text_value(trimmed),
    }
}

fn clean_text_value(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim_matches(|c: char| c.is_whitespace() || c == ':' || c == '-' || c == ',' || c == '.');
    if trimmed.len() < 2 {
        return None;
    }
    Some(trimmed.to_string())
}

/// Find the first plausible date in a line and normalize it to DD-MM-YYYY.
fn find_date(line: &str) -> Option<String> {
    let r = regexes();
    if let Some(caps) = r.numeric.captures(line) {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let year: u32 = caps[3].parse().ok()?;
        if date_plausible(day, month, year) {
            return Some(format!("{:02}-{:02}-{}", day, month, year));
        }
    }
    if let Some(caps) = r.spelled.captures(line) {
        let day: u32 = caps[1].parse().ok()?;
        let month = month_number(&caps[2])?;
        let year: u32 = caps[3].parse().ok()?;
        if date_plausible(day, month, year) {
            return Some(format!("{:02}-{:02}-{}", day, month, year));
        }
    }
    None
}

fn date_plausible(day: u32, month: u32, year: u32) -> bool {
    (1..=31).contains(&day) && (1..=12).contains(&month) && (1900..=2100).contains(&year)
}

fn month_number(name: &str) -> Option<u32> {
    let months = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    months
        .iter()
        .position(|m| name.to_lowercase().starts_with(m))
        .map(|i| i as u32 + 1)
}

fn title_case(term: &str) -> String {
    term.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn blend(tier: f64, score: f64) -> f64 {
    ((tier + score) / 2.0).clamp(0.0, 1.0)
}

/// Classic two-row dynamic-programming edit distance. Inputs are short label
/// strings, so the quadratic cost is irrelevant.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FallbackExtractor {
        FallbackExtractor::new(PatternTables::default_tables())
    }

    fn ocr(text: &str) -> OcrResult {
        OcrResult {
            text: text.to_string(),
            confidence: 0.85,
        }
    }

    #[test]
    fn test_labeled_identity_fields() {
        let input = ocr("ROLL NO: 06937\nNAME OF CANDIDATE: NARAYAN DEBNATH");
        let record = extractor().extract_record(&input);

        let c = &record.candidate_details;
        assert_eq!(c.roll_no.value.as_deref(), Some("06937"));
        assert!(c.roll_no.confidence > 0.0);
        assert_eq!(c.name.value.as_deref(), Some("NARAYAN DEBNATH"));
        assert!(c.name.confidence > 0.0);
        assert!(record.is_well_formed());
    }

    #[test]
    fn test_fuzzy_label_survives_ocr_garble() {
        let input = ocr("RCLL NO: 06937");
        let record = extractor().extract_record(&input);
        let roll = &record.candidate_details.roll_no;
        assert_eq!(roll.value.as_deref(), Some("06937"));

        let exact = extractor().extract_record(&ocr("ROLL NO: 06937"));
        assert!(roll.confidence < exact.candidate_details.roll_no.confidence);
    }

    #[test]
    fn test_label_without_colon() {
        let input = ocr("ROLL NO 06937");
        let record = extractor().extract_record(&input);
        assert_eq!(
            record.candidate_details.roll_no.value.as_deref(),
            Some("06937")
        );
    }

    #[test]
    fn test_fathers_name_not_shadowed_by_name() {
        let input = ocr("FATHER'S NAME: SUNIL DEBNATH\nNAME: NARAYAN DEBNATH");
        let record = extractor().extract_record(&input);
        let c = &record.candidate_details;
        assert_eq!(c.father_name.value.as_deref(), Some("SUNIL DEBNATH"));
        assert_eq!(c.name.value.as_deref(), Some("NARAYAN DEBNATH"));
    }

    #[test]
    fn test_dob_normalization() {
        let record = extractor().extract_record(&ocr("DATE OF BIRTH: 15/08/2001"));
        assert_eq!(
            record.candidate_details.dob.value.as_deref(),
            Some("15-08-2001")
        );

        let record = extractor().extract_record(&ocr("Date of Birth: 3rd August 2001"));
        assert_eq!(
            record.candidate_details.dob.value.as_deref(),
            Some("03-08-2001")
        );
    }

    #[test]
    fn test_implausible_date_rejected() {
        let record = extractor().extract_record(&ocr("DATE OF BIRTH: 45/13/2001"));
        assert!(record.candidate_details.dob.is_null());
    }

    #[test]
    fn test_issue_date_not_confused_with_dob() {
        let input = ocr("DATE OF BIRTH: 15-08-2001\nDATE OF ISSUE: 20-06-2019");
        let record = extractor().extract_record(&input);
        assert_eq!(
            record.candidate_details.dob.value.as_deref(),
            Some("15-08-2001")
        );
        assert_eq!(
            record.issue_details.date.value.as_deref(),
            Some("20-06-2019")
        );
    }

    #[test]
    fn test_date_label_needs_word_boundary() {
        // "candidate" contains "date"; the date on this line is not an
        // issue date.
        let record = extractor().extract_record(&ocr("CANDIDATE VERIFIED ON 15-01-2020"));
        assert!(record.issue_details.date.is_null());

        let record = extractor().extract_record(&ocr("Dated 20-06-2019"));
        assert_eq!(
            record.issue_details.date.value.as_deref(),
            Some("20-06-2019")
        );

        assert!(contains_word("date of issue: x", "date"));
        assert!(!contains_word("name of candidate", "date"));
    }

    #[test]
    fn test_board_gazetteer_takes_the_line() {
        let input = ocr("BOARD OF SECONDARY EDUCATION, MADHYA PRADESH\nROLL NO: 12");
        let record = extractor().extract_record(&input);
        assert_eq!(
            record.candidate_details.board.value.as_deref(),
            Some("BOARD OF SECONDARY EDUCATION, MADHYA PRADESH")
        );
    }

    #[test]
    fn test_subject_with_single_number() {
        let record = extractor().extract_record(&ocr("Science 214"));
        assert_eq!(record.subjects.len(), 1);
        let s = &record.subjects[0];
        assert_eq!(s.subject, "Science");
        assert_eq!(s.obtained_marks.value, Some(214.0));
        assert!(s.max_marks.is_null());
        assert!(s.confidence > 0.0);
    }

    #[test]
    fn test_subject_with_marks_and_grade() {
        let record = extractor().extract_record(&ocr("Mathematics 100 85 A+"));
        assert_eq!(record.subjects.len(), 1);
        let s = &record.subjects[0];
        assert_eq!(s.subject, "Mathematics");
        assert_eq!(s.max_marks.value, Some(100.0));
        assert_eq!(s.obtained_marks.value, Some(85.0));
        assert_eq!(s.grade.value.as_deref(), Some("A+"));
    }

    #[test]
    fn test_subject_slash_form() {
        let record = extractor().extract_record(&ocr("English 85/100"));
        let s = &record.subjects[0];
        assert_eq!(s.obtained_marks.value, Some(85.0));
        assert_eq!(s.max_marks.value, Some(100.0));
    }

    #[test]
    fn test_total_row_excluded() {
        let record = extractor().extract_record(&ocr("TOTAL 500 420"));
        assert!(record.subjects.is_empty());
    }

    #[test]
    fn test_division_and_percentage() {
        let input = ocr("Passed in First Division securing 62.4%");
        let record = extractor().extract_record(&input);
        assert_eq!(
            record.overall_result.division.value.as_deref(),
            Some("First Division")
        );
        assert_eq!(record.overall_result.percentage.value, Some(62.4));
    }

    #[test]
    fn test_percentage_without_sign_needs_label() {
        let record = extractor().extract_record(&ocr("PERCENTAGE: 85.5"));
        assert_eq!(record.overall_result.percentage.value, Some(85.5));

        let record = extractor().extract_record(&ocr("He scored 85.5 runs"));
        assert!(record.overall_result.percentage.is_null());
    }

    #[test]
    fn test_empty_text_yields_empty_record() {
        let record = extractor().extract_record(&OcrResult::empty());
        assert_eq!(record, PartialRecord::empty());
        assert!(record.is_well_formed());
    }

    #[test]
    fn test_hostile_text_never_panics() {
        let record = extractor().extract_record(&ocr(":::\n\u{7f}42//\n%%%%\nA: \n12345"));
        assert!(record.is_well_formed());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("roll no", "roll no"), 0);
        assert_eq!(levenshtein("rcll no", "roll no"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }
}

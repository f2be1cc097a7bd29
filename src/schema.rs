//! Extraction output schema: confidence-annotated fields and the record shapes
//! shared by the LLM and fallback extractors.

use serde::{Deserialize, Serialize};

/// A single extracted datum: value plus confidence in [0, 1].
///
/// Invariant: `confidence == 0.0` exactly when `value` is `None`. Constructors
/// enforce this, so a `Field` built through [`Field::new`] or [`Field::null`]
/// is always well-formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub confidence: f64,
}

impl<T> Field<T> {
    /// Build a field, clamping confidence to [0, 1]. A non-positive confidence
    /// degrades the field to null rather than carrying a value nobody trusts.
    pub fn new(value: T, confidence: f64) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        if confidence <= 0.0 {
            Self::null()
        } else {
            Self {
                value: Some(value),
                confidence,
            }
        }
    }

    pub fn null() -> Self {
        Self {
            value: None,
            confidence: 0.0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// True when the field satisfies the `confidence == 0 ⟺ value == None`
    /// invariant and the confidence is within range.
    pub fn is_well_formed(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
            && ((self.confidence == 0.0) == self.value.is_none())
    }

    /// Scale confidence by `factor` (used for derived values). Preserves the
    /// null invariant: scaling to zero nulls the value.
    pub fn scaled(self, factor: f64) -> Self {
        match self.value {
            Some(v) => Self::new(v, self.confidence * factor),
            None => Self::null(),
        }
    }
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::null()
    }
}

/// Candidate identity block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateDetails {
    pub name: Field<String>,
    pub father_name: Field<String>,
    pub dob: Field<String>,
    pub roll_no: Field<String>,
    pub registration_no: Field<String>,
    pub exam_year: Field<String>,
    pub board: Field<String>,
    pub institution: Field<String>,
}

/// One row of the subject table. `subject` is the structural key (not a
/// `Field`); duplicates are permitted since theory/practical rows may repeat
/// a subject name. Order follows document reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject: String,
    pub max_marks: Field<f64>,
    pub obtained_marks: Field<f64>,
    pub grade: Field<String>,
    /// Confidence that this row really is a subject row.
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallResult {
    pub division: Field<String>,
    pub percentage: Field<f64>,
    pub grade: Field<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueDetails {
    pub date: Field<String>,
    pub place: Field<String>,
}

/// The record shape both extractors produce and the merger consumes.
/// Always schema-complete: every field present, possibly null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialRecord {
    pub candidate_details: CandidateDetails,
    pub subjects: Vec<SubjectRecord>,
    pub overall_result: OverallResult,
    pub issue_details: IssueDetails,
}

impl PartialRecord {
    /// The fully degraded case: every field null, zero confidence.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Mean confidence over all scalar fields plus subject rows. Used to pick
    /// the best page of a multi-page document.
    pub fn aggregate_confidence(&self) -> f64 {
        let c = &self.candidate_details;
        let o = &self.overall_result;
        let i = &self.issue_details;
        let mut scores = vec![
            c.name.confidence,
            c.father_name.confidence,
            c.dob.confidence,
            c.roll_no.confidence,
            c.registration_no.confidence,
            c.exam_year.confidence,
            c.board.confidence,
            c.institution.confidence,
            o.division.confidence,
            o.percentage.confidence,
            o.grade.confidence,
            i.date.confidence,
            i.place.confidence,
        ];
        scores.extend(self.subjects.iter().map(|s| s.confidence));
        scores.iter().sum::<f64>() / scores.len() as f64
    }

    /// True when every field honors the `Field` invariant.
    pub fn is_well_formed(&self) -> bool {
        let c = &self.candidate_details;
        let o = &self.overall_result;
        let i = &self.issue_details;
        c.name.is_well_formed()
            && c.father_name.is_well_formed()
            && c.dob.is_well_formed()
            && c.roll_no.is_well_formed()
            && c.registration_no.is_well_formed()
            && c.exam_year.is_well_formed()
            && c.board.is_well_formed()
            && c.institution.is_well_formed()
            && o.division.is_well_formed()
            && o.percentage.is_well_formed()
            && o.grade.is_well_formed()
            && i.date.is_well_formed()
            && i.place.is_well_formed()
            && self.subjects.iter().all(|s| {
                s.max_marks.is_well_formed()
                    && s.obtained_marks.is_well_formed()
                    && s.grade.is_well_formed()
                    && (0.0..=1.0).contains(&s.confidence)
            })
    }
}

/// Terminal, immutable output of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub candidate_details: CandidateDetails,
    pub subjects: Vec<SubjectRecord>,
    pub overall_result: OverallResult,
    pub issue_details: IssueDetails,
    /// End-to-end processing time in seconds.
    pub processing_time: f64,
    /// Declared MIME type of the input.
    pub file_type: String,
    /// Input size in bytes.
    pub file_size: u64,
}

impl ExtractionRecord {
    pub fn from_partial(
        partial: PartialRecord,
        processing_time: f64,
        file_type: &str,
        file_size: u64,
    ) -> Self {
        Self {
            candidate_details: partial.candidate_details,
            subjects: partial.subjects,
            overall_result: partial.overall_result,
            issue_details: partial.issue_details,
            processing_time,
            file_type: file_type.to_string(),
            file_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_invariant_on_construction() {
        let f = Field::new("x".to_string(), 0.8);
        assert!(f.is_well_formed());
        assert_eq!(f.value.as_deref(), Some("x"));

        // Zero confidence collapses to null.
        let f = Field::new("x".to_string(), 0.0);
        assert!(f.is_well_formed());
        assert!(f.is_null());

        let f: Field<String> = Field::null();
        assert!(f.is_well_formed());
    }

    #[test]
    fn test_field_confidence_clamped() {
        let f = Field::new(42.0, 1.7);
        assert_eq!(f.confidence, 1.0);
        let f = Field::new(42.0, -0.5);
        assert!(f.is_null());
    }

    #[test]
    fn test_scaled_preserves_invariant() {
        let f = Field::new("First".to_string(), 0.9).scaled(0.8);
        assert!(f.is_well_formed());
        assert!((f.confidence - 0.72).abs() < 1e-9);

        let f = Field::new("First".to_string(), 0.9).scaled(0.0);
        assert!(f.is_null());
    }

    #[test]
    fn test_empty_record_is_well_formed_and_zero() {
        let r = PartialRecord::empty();
        assert!(r.is_well_formed());
        assert_eq!(r.aggregate_confidence(), 0.0);
    }
}

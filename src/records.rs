use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::term::Term;

/// One fetch unit: a course as listed in the reference `courses` table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub dept: String,
    pub course_number: String,
    /// Newest term already stored for this course, if any.
    pub latest_term: Option<Term>,
}

impl WorkItem {
    pub fn new(dept: impl Into<String>, course_number: impl Into<String>) -> Self {
        Self {
            dept: dept.into(),
            course_number: course_number.into(),
            latest_term: None,
        }
    }

    pub fn with_latest_term(mut self, term: Term) -> Self {
        self.latest_term = Some(term);
        self
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.dept, self.course_number)
    }
}

/// Decoded body of one grades response. Only the `classes` key is read;
/// every class stays an untyped JSON object until it is normalized.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub classes: Vec<Value>,
}

/// One section's grade distribution, keyed by
/// `dept_number_section_year_semester_professor`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpaRow {
    pub id: String,
    pub dept: String,
    pub course_number: String,
    pub section: String,
    pub professor: String,
    pub year: String,
    pub semester: String,
    pub gpa: Option<f64>,
    pub grade_a: i32,
    pub grade_b: i32,
    pub grade_c: i32,
    pub grade_d: i32,
    pub grade_f: i32,
    pub grade_i: i32,
    pub grade_s: i32,
    pub grade_u: i32,
    pub grade_q: i32,
    pub grade_x: i32,
    pub total_students: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GpaRow {
    pub fn grade_counts(&self) -> [i32; 10] {
        [
            self.grade_a,
            self.grade_b,
            self.grade_c,
            self.grade_d,
            self.grade_f,
            self.grade_i,
            self.grade_s,
            self.grade_u,
            self.grade_q,
            self.grade_x,
        ]
    }

    /// Checks the same constraints the `gpa_data` table enforces.
    pub fn check_constraints(&self) -> Result<(), String> {
        if let Some(gpa) = self.gpa {
            if !gpa.is_finite() {
                return Err(format!("{}: gpa {gpa} is not numeric", self.id));
            }
        }
        if self.grade_counts().iter().any(|&n| n < 0) || self.total_students < 0 {
            return Err(format!("{}: negative grade count", self.id));
        }
        if self.updated_at < self.created_at {
            return Err(format!("{}: updated_at precedes created_at", self.id));
        }
        Ok(())
    }
}

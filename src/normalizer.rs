use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    errors::NormalizationError,
    records::{GpaRow, RawRecord, WorkItem},
    term::TermYearExtractor,
};

/// Source keys of the per-letter grade counters, in `GpaRow` column order.
pub const GRADE_KEYS: [&str; 10] = ["A", "B", "C", "D", "F", "I", "S", "U", "Q", "X"];

/// Rows produced from one work item's payload, plus what was dropped.
#[derive(Debug, Default)]
pub struct NormalizedRecord {
    pub rows: Vec<GpaRow>,
    pub errors: Vec<NormalizationError>,
    /// Classes not newer than the term already stored for the course.
    pub skipped: usize,
}

pub struct Normalizer<'a> {
    year_extractor: &'a TermYearExtractor,
    now: DateTime<Utc>,
}

impl<'a> Normalizer<'a> {
    pub fn new(year_extractor: &'a TermYearExtractor, now: DateTime<Utc>) -> Self {
        Self {
            year_extractor,
            now,
        }
    }

    pub fn normalize_record(&self, item: &WorkItem, record: &RawRecord) -> NormalizedRecord {
        let mut out = NormalizedRecord::default();
        for class in &record.classes {
            if let Some(latest) = &item.latest_term {
                let year = text_field(class, "year").unwrap_or_default();
                let semester = text_field(class, "semester").unwrap_or_default();
                if !self.year_extractor.is_newer_than(&year, &semester, latest) {
                    out.skipped += 1;
                    continue;
                }
            }
            match normalize_class(class, self.now) {
                Ok(row) => out.rows.push(row),
                Err(e) => out.errors.push(e),
            }
        }
        out
    }
}

/// Maps one class object from the grades source into a row.
pub fn normalize_class(class: &Value, now: DateTime<Utc>) -> Result<GpaRow, NormalizationError> {
    let dept = required_text(class, "dept")?;
    let course_number = required_text(class, "number")?;
    let section = required_text(class, "section")?;
    let year = required_text(class, "year")?;
    let semester = required_text(class, "semester")?;
    let professor = required_text(class, "prof")?;
    let gpa = parse_gpa(class.get("gpa"))?;

    let mut counts = [0; GRADE_KEYS.len()];
    for (count, key) in counts.iter_mut().zip(GRADE_KEYS) {
        *count = grade_count(key, class.get(key))?;
    }
    let total_students = total_of(&counts)?;
    let [a, b, c, d, f, i, s, u, q, x] = counts;

    Ok(GpaRow {
        id: row_id(&dept, &course_number, &section, &year, &semester, &professor),
        dept,
        course_number,
        section,
        professor,
        year,
        semester,
        gpa,
        grade_a: a,
        grade_b: b,
        grade_c: c,
        grade_d: d,
        grade_f: f,
        grade_i: i,
        grade_s: s,
        grade_u: u,
        grade_q: q,
        grade_x: x,
        total_students,
        created_at: now,
        updated_at: now,
    })
}

pub fn row_id(
    dept: &str,
    course_number: &str,
    section: &str,
    year: &str,
    semester: &str,
    professor: &str,
) -> String {
    format!("{dept}_{course_number}_{section}_{year}_{semester}_{professor}")
}

fn text_field(class: &Value, key: &str) -> Option<String> {
    match class.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_text(class: &Value, key: &'static str) -> Result<String, NormalizationError> {
    text_field(class, key).ok_or(NormalizationError::MissingField(key))
}

/// Absent or non-numeric counters are 0; negative ones are malformed.
fn grade_count(key: &'static str, value: Option<&Value>) -> Result<i32, NormalizationError> {
    let count = match value {
        Some(Value::Number(n)) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    match (count, value) {
        (Some(n), Some(v)) if n < 0 => Err(NormalizationError::MalformedNumeric {
            field: key,
            value: v.to_string(),
        }),
        (count, _) => Ok(count.unwrap_or(0)),
    }
}

fn total_of(counts: &[i32]) -> Result<i32, NormalizationError> {
    let total: i64 = counts.iter().copied().map(i64::from).sum();
    i32::try_from(total).map_err(|_| NormalizationError::MalformedNumeric {
        field: "total_students",
        value: total.to_string(),
    })
}

fn parse_gpa(value: Option<&Value>) -> Result<Option<f64>, NormalizationError> {
    let malformed = |value: &Value| NormalizationError::MalformedNumeric {
        field: "gpa",
        value: value.to_string(),
    };
    match value {
        None => Err(NormalizationError::MissingField("gpa")),
        Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(v @ Value::String(s)) => s.trim().parse().map(Some).map_err(|_| malformed(v)),
        Some(v @ Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| malformed(v)),
        Some(v) => Err(malformed(v)),
    }
}

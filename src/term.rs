use regex::Regex;
use serde_json::Value;

/// A `(year, semester)` pair as the grades source spells it, e.g. `("2025b", "SPRING")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub year: String,
    pub semester: String,
}

impl Term {
    pub fn new(year: impl Into<String>, semester: impl Into<String>) -> Self {
        Self {
            year: year.into(),
            semester: semester.into(),
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.semester, self.year)
    }
}

/// Recency rank of a semester within one calendar year. Lower is newer:
/// summer follows spring, and fall is ranked oldest.
pub fn semester_rank(semester: &str) -> Option<u8> {
    match semester.trim().to_uppercase().as_str() {
        "SUMMER" => Some(1),
        "SPRING" => Some(2),
        "FALL" => Some(3),
        _ => None,
    }
}

pub struct TermYearExtractor {
    // Pulls the calendar year out of year labels like "2025" or "2025b".
    year_extraction_regex: Regex,
}

impl TermYearExtractor {
    pub fn new() -> anyhow::Result<Self> {
        let year_extraction_regex = Regex::new(r"(\d{4})")?;
        Ok(Self {
            year_extraction_regex,
        })
    }

    pub fn extract_year(&self, year_text: &str) -> Option<i32> {
        let caps = self.year_extraction_regex.captures(year_text)?;
        caps.get(1)?.as_str().parse().ok()
    }

    fn year_or_zero(&self, year_text: &str) -> i32 {
        self.extract_year(year_text).unwrap_or(0)
    }

    /// Whether a class taught in `year`/`semester` is strictly newer than `latest`.
    ///
    /// Unparseable years count as year 0 and unknown semesters as rank 0, so
    /// a record of the same year as `latest` with an unknown semester is never
    /// considered newer.
    pub fn is_newer_than(&self, year: &str, semester: &str, latest: &Term) -> bool {
        let class_year = self.year_or_zero(year);
        let min_year = self.year_or_zero(&latest.year);
        if class_year != min_year {
            return class_year > min_year;
        }
        let class_rank = semester_rank(semester).unwrap_or(0);
        let min_rank = semester_rank(&latest.semester).unwrap_or(0);
        class_rank < min_rank
    }

    /// Finds the newest term among raw class records. Records without a
    /// parseable year are ignored.
    pub fn newest_term<'a>(&self, classes: impl IntoIterator<Item = &'a Value>) -> Option<Term> {
        let mut newest: Option<(i32, u16, Term)> = None;
        for class in classes {
            let year_text = scalar_text(class.get("year")).unwrap_or_default();
            let Some(year) = self.extract_year(&year_text) else {
                log::debug!("skipping class with invalid year: {year_text:?}");
                continue;
            };
            let semester = scalar_text(class.get("semester"))
                .unwrap_or_default()
                .trim()
                .to_uppercase();
            let rank = semester_rank(&semester).map_or(999, u16::from);

            let is_newer = match &newest {
                None => true,
                Some((best_year, best_rank, _)) => {
                    year > *best_year || (year == *best_year && rank < *best_rank)
                }
            };
            if is_newer {
                newest = Some((year, rank, Term::new(year.to_string(), semester)));
            }
        }
        newest.map(|(_, _, term)| term)
    }
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_year_from_suffixed_label() {
        let extractor = TermYearExtractor::new().unwrap();
        assert_eq!(extractor.extract_year("2025b"), Some(2025));
        assert_eq!(extractor.extract_year("2024"), Some(2024));
        assert_eq!(extractor.extract_year("n/a"), None);
    }

    #[test]
    fn summer_is_newer_than_spring_in_same_year() {
        let extractor = TermYearExtractor::new().unwrap();
        let latest = Term::new("2024", "SPRING");
        assert!(extractor.is_newer_than("2024", "SUMMER", &latest));
        assert!(!extractor.is_newer_than("2024", "SPRING", &latest));
        assert!(!extractor.is_newer_than("2024", "FALL", &latest));
        assert!(extractor.is_newer_than("2025", "FALL", &latest));
        assert!(!extractor.is_newer_than("2023", "SUMMER", &latest));
    }

    #[test]
    fn newest_term_prefers_later_year_then_lower_rank() {
        let extractor = TermYearExtractor::new().unwrap();
        let classes = [
            json!({"year": "2024", "semester": "FALL"}),
            json!({"year": "2025b", "semester": "spring"}),
            json!({"year": "2025", "semester": "SUMMER"}),
            json!({"year": "bogus", "semester": "SUMMER"}),
        ];
        let newest = extractor.newest_term(classes.iter()).unwrap();
        assert_eq!(newest, Term::new("2025", "SUMMER"));
    }

    #[test]
    fn newest_term_of_nothing_is_none() {
        let extractor = TermYearExtractor::new().unwrap();
        assert_eq!(extractor.newest_term(std::iter::empty()), None);
    }
}

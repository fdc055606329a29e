use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};

use crate::{
    errors::{FatalError, UpsertError},
    records::{GpaRow, WorkItem},
    store::GpaStore,
};

/// Holds `gpa_data` in memory. Used for dry runs, where the work list is
/// read from Postgres but nothing is written back.
#[derive(Default)]
pub struct MemoryStore {
    work_items: Vec<WorkItem>,
    rows: Mutex<HashMap<String, GpaRow>>,
}

impl MemoryStore {
    pub fn new(work_items: Vec<WorkItem>) -> Self {
        Self {
            work_items,
            rows: Mutex::default(),
        }
    }

    pub fn row(&self, id: &str) -> Option<GpaRow> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GpaStore for MemoryStore {
    async fn work_items(&self, full: bool) -> Result<Vec<WorkItem>, FatalError> {
        let mut items = self.work_items.clone();
        if full {
            for item in &mut items {
                item.latest_term = None;
            }
        }
        Ok(items)
    }

    async fn upsert_batch(&self, batch: &[GpaRow]) -> Result<usize, UpsertError> {
        let rollback = |reason: String| UpsertError::BatchRollback {
            rows: batch.len(),
            reason,
        };

        // Validate everything before touching the map so a bad row leaves
        // the batch unapplied. Postgres refuses to update the same row twice
        // in one statement, and so do we.
        let mut seen = HashSet::with_capacity(batch.len());
        for row in batch {
            row.check_constraints().map_err(rollback)?;
            if !seen.insert(row.id.as_str()) {
                return Err(rollback(format!("{}: duplicate id in batch", row.id)));
            }
        }

        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for row in batch {
            let mut incoming = row.clone();
            if let Some(existing) = rows.get(&row.id) {
                incoming.created_at = existing.created_at;
            }
            rows.insert(incoming.id.clone(), incoming);
        }
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize_class;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn row(section: &str, gpa: &str) -> GpaRow {
        let class = json!({
            "dept": "STAT", "number": "211", "section": section,
            "year": "2024", "semester": "SPRING", "prof": "NGUYEN", "gpa": gpa, "A": 7,
        });
        normalize_class(&class, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn applying_a_batch_twice_is_idempotent() {
        let store = MemoryStore::default();
        let first = vec![row("501", "3.1"), row("502", "2.9")];
        assert_eq!(store.upsert_batch(&first).await.unwrap(), 2);
        let created = store.row(&first[0].id).unwrap().created_at;

        let later = Utc::now() + Duration::seconds(5);
        let again: Vec<_> = first
            .iter()
            .cloned()
            .map(|mut r| {
                r.created_at = later;
                r.updated_at = later;
                r
            })
            .collect();
        assert_eq!(store.upsert_batch(&again).await.unwrap(), 2);

        assert_eq!(store.len(), 2);
        let stored = store.row(&first[0].id).unwrap();
        assert_eq!(stored.created_at, created);
        assert_eq!(stored.updated_at, later);
        assert_eq!(stored.gpa, Some(3.1));
    }

    #[tokio::test]
    async fn update_overwrites_non_key_fields() {
        let store = MemoryStore::default();
        store.upsert_batch(&[row("501", "3.1")]).await.unwrap();
        let mut changed = row("501", "");
        changed.grade_a = 9;
        changed.total_students = 9;
        store.upsert_batch(&[changed.clone()]).await.unwrap();

        let stored = store.row(&changed.id).unwrap();
        assert_eq!(stored.gpa, None);
        assert_eq!(stored.grade_a, 9);
        assert_eq!(stored.total_students, 9);
    }

    #[tokio::test]
    async fn bad_row_rolls_back_whole_batch() {
        let store = MemoryStore::default();
        let mut bad = row("503", "1.0");
        bad.gpa = Some(f64::NAN);
        let batch = vec![row("501", "3.1"), bad, row("502", "2.0")];

        let err = store.upsert_batch(&batch).await.unwrap_err();
        assert!(matches!(err, UpsertError::BatchRollback { rows: 3, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_within_batch_is_rejected() {
        let store = MemoryStore::default();
        let batch = vec![row("501", "3.1"), row("501", "3.2")];
        assert!(store.upsert_batch(&batch).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn full_mode_drops_stored_terms() {
        let item = WorkItem::new("STAT", "211")
            .with_latest_term(crate::term::Term::new("2024", "SPRING"));
        let store = MemoryStore::new(vec![item]);
        assert!(store.work_items(false).await.unwrap()[0].latest_term.is_some());
        assert!(store.work_items(true).await.unwrap()[0].latest_term.is_none());
    }
}

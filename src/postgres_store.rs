use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::{
    PgPool, Postgres,
    postgres::{PgArguments, PgPoolOptions},
    query::Query,
};

use crate::{
    errors::{FatalError, UpsertError},
    records::{GpaRow, WorkItem},
    store::GpaStore,
    term::Term,
};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

const SCHEMA_UP: &str = include_str!("../sql/gpa_data/up.sql");

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

// Courses with no grade rows at all.
const MISSING_COURSES_SQL: &str = r"
    SELECT DISTINCT
        c.subject_id AS dept,
        c.course_number,
        CAST(c.course_number AS INTEGER) AS course_number_int
    FROM courses c
    WHERE c.subject_id IS NOT NULL
      AND c.course_number ~ '^[0-9]+$'
      AND NOT EXISTS (
          SELECT 1
          FROM gpa_data gd
          WHERE gd.dept = c.subject_id
            AND gd.course_number = c.course_number
      )
    ORDER BY dept, course_number_int
";

// Courses that have grade rows, with the newest stored term of each.
// Within a year SUMMER is newest and FALL oldest, as the source ranks them.
const LATEST_TERMS_SQL: &str = r"
    WITH latest_terms AS (
        SELECT DISTINCT ON (dept, course_number)
            dept, course_number, year, semester
        FROM gpa_data
        ORDER BY
            dept,
            course_number,
            substring(year FROM '[0-9]{4}')::int DESC NULLS LAST,
            CASE upper(trim(semester))
                WHEN 'SUMMER' THEN 1
                WHEN 'SPRING' THEN 2
                WHEN 'FALL' THEN 3
                ELSE 4
            END ASC
    )
    SELECT DISTINCT
        c.subject_id AS dept,
        c.course_number,
        CAST(c.course_number AS INTEGER) AS course_number_int,
        lt.year,
        lt.semester
    FROM courses c
    JOIN latest_terms lt
      ON c.subject_id = lt.dept AND c.course_number = lt.course_number
    WHERE c.subject_id IS NOT NULL
      AND c.course_number ~ '^[0-9]+$'
    ORDER BY dept, course_number_int
";

const ALL_COURSES_SQL: &str = r"
    SELECT DISTINCT
        c.subject_id AS dept,
        c.course_number,
        CAST(c.course_number AS INTEGER) AS course_number_int
    FROM courses c
    WHERE c.subject_id IS NOT NULL
      AND c.course_number ~ '^[0-9]+$'
    ORDER BY dept, course_number_int
";

// One statement per batch: columns go in as arrays, so the batch size is not
// bounded by the bind parameter limit.
const UPSERT_SQL: &str = r"
    INSERT INTO gpa_data (
        id, dept, course_number, section, professor, year, semester, gpa,
        grade_a, grade_b, grade_c, grade_d, grade_f,
        grade_i, grade_s, grade_u, grade_q, grade_x,
        total_students, created_at, updated_at
    )
    SELECT * FROM UNNEST(
        $1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[], $7::text[],
        $8::float8[],
        $9::int4[], $10::int4[], $11::int4[], $12::int4[], $13::int4[],
        $14::int4[], $15::int4[], $16::int4[], $17::int4[], $18::int4[],
        $19::int4[], $20::timestamptz[], $21::timestamptz[]
    )
    ON CONFLICT (id) DO UPDATE SET
        dept = EXCLUDED.dept,
        course_number = EXCLUDED.course_number,
        section = EXCLUDED.section,
        professor = EXCLUDED.professor,
        year = EXCLUDED.year,
        semester = EXCLUDED.semester,
        gpa = EXCLUDED.gpa,
        grade_a = EXCLUDED.grade_a,
        grade_b = EXCLUDED.grade_b,
        grade_c = EXCLUDED.grade_c,
        grade_d = EXCLUDED.grade_d,
        grade_f = EXCLUDED.grade_f,
        grade_i = EXCLUDED.grade_i,
        grade_s = EXCLUDED.grade_s,
        grade_u = EXCLUDED.grade_u,
        grade_q = EXCLUDED.grade_q,
        grade_x = EXCLUDED.grade_x,
        total_students = EXCLUDED.total_students,
        updated_at = EXCLUDED.updated_at
";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, FatalError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| FatalError::CannotConnect(e.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates `gpa_data` if it does not exist yet.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA_UP).execute(&self.pool).await?;
        info!("gpa_data schema is in place");
        Ok(())
    }

    async fn query_work_items(&self, full: bool) -> Result<Vec<WorkItem>, sqlx::Error> {
        if full {
            let rows: Vec<(String, String, i32)> =
                sqlx::query_as(ALL_COURSES_SQL).fetch_all(&self.pool).await?;
            info!("found {} courses", rows.len());
            return Ok(rows
                .into_iter()
                .map(|(dept, number, _)| WorkItem::new(dept, number))
                .collect());
        }

        let missing: Vec<(String, String, i32)> =
            sqlx::query_as(MISSING_COURSES_SQL).fetch_all(&self.pool).await?;
        let with_data: Vec<(String, String, i32, String, String)> =
            sqlx::query_as(LATEST_TERMS_SQL).fetch_all(&self.pool).await?;
        info!("found {} courses with no GPA data", missing.len());
        info!("found {} courses with existing GPA data", with_data.len());

        let mut items: Vec<WorkItem> = missing
            .into_iter()
            .map(|(dept, number, _)| WorkItem::new(dept, number))
            .collect();
        items.extend(with_data.into_iter().map(|(dept, number, _, year, semester)| {
            WorkItem::new(dept, number).with_latest_term(Term::new(year, semester))
        }));
        Ok(items)
    }
}

impl GpaStore for PostgresStore {
    async fn work_items(&self, full: bool) -> Result<Vec<WorkItem>, FatalError> {
        self.query_work_items(full)
            .await
            .map_err(|e| FatalError::CannotEnumerate(e.to_string()))
    }

    async fn upsert_batch(&self, batch: &[GpaRow]) -> Result<usize, UpsertError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let rollback = |e: sqlx::Error| UpsertError::BatchRollback {
            rows: batch.len(),
            reason: e.to_string(),
        };

        let columns = GpaColumns::from_rows(batch);
        // The connection goes back to the pool when `tx` is dropped, and an
        // uncommitted transaction is rolled back at that point.
        let mut tx = self.pool.begin().await.map_err(rollback)?;
        let written = columns
            .bind_all(sqlx::query(UPSERT_SQL))
            .execute(&mut *tx)
            .await;
        match written {
            Ok(result) => {
                tx.commit().await.map_err(rollback)?;
                debug!("upserted {} rows", result.rows_affected());
                Ok(batch.len())
            }
            Err(e) => {
                let err = rollback(e);
                if let Err(e) = tx.rollback().await {
                    log::warn!("explicit rollback failed, connection will be discarded: {e}");
                }
                Err(err)
            }
        }
    }
}

/// A batch transposed into one vector per column, for `UNNEST`.
#[derive(Default)]
struct GpaColumns {
    id: Vec<String>,
    dept: Vec<String>,
    course_number: Vec<String>,
    section: Vec<String>,
    professor: Vec<String>,
    year: Vec<String>,
    semester: Vec<String>,
    gpa: Vec<Option<f64>>,
    grades: [Vec<i32>; 10],
    total_students: Vec<i32>,
    created_at: Vec<DateTime<Utc>>,
    updated_at: Vec<DateTime<Utc>>,
}

impl GpaColumns {
    fn from_rows(rows: &[GpaRow]) -> Self {
        let mut columns = Self::default();
        for row in rows {
            columns.id.push(row.id.clone());
            columns.dept.push(row.dept.clone());
            columns.course_number.push(row.course_number.clone());
            columns.section.push(row.section.clone());
            columns.professor.push(row.professor.clone());
            columns.year.push(row.year.clone());
            columns.semester.push(row.semester.clone());
            columns.gpa.push(row.gpa);
            for (column, count) in columns.grades.iter_mut().zip(row.grade_counts()) {
                column.push(count);
            }
            columns.total_students.push(row.total_students);
            columns.created_at.push(row.created_at);
            columns.updated_at.push(row.updated_at);
        }
        columns
    }

    fn bind_all<'q>(self, query: PgQuery<'q>) -> PgQuery<'q> {
        let mut query = query
            .bind(self.id)
            .bind(self.dept)
            .bind(self.course_number)
            .bind(self.section)
            .bind(self.professor)
            .bind(self.year)
            .bind(self.semester)
            .bind(self.gpa);
        for column in self.grades {
            query = query.bind(column);
        }
        query
            .bind(self.total_students)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize_class;
    use serde_json::json;

    #[test]
    fn columns_are_transposed_in_row_order() {
        let now = Utc::now();
        let rows: Vec<_> = ["501", "502"]
            .iter()
            .map(|section| {
                let class = json!({
                    "dept": "CSCE", "number": "221", "section": section,
                    "year": "2023", "semester": "FALL", "prof": "KIM",
                    "gpa": "", "A": "3", "X": "1",
                });
                normalize_class(&class, now).unwrap()
            })
            .collect();

        let columns = GpaColumns::from_rows(&rows);
        assert_eq!(columns.section, vec!["501", "502"]);
        assert_eq!(columns.gpa, vec![None, None]);
        assert_eq!(columns.grades[0], vec![3, 3]);
        assert_eq!(columns.grades[9], vec![1, 1]);
        assert_eq!(columns.total_students, vec![4, 4]);
    }

    #[test]
    fn upsert_never_touches_created_at() {
        let update_clause = UPSERT_SQL.split("DO UPDATE SET").nth(1).unwrap();
        assert!(!update_clause.contains("created_at"));
        assert!(update_clause.contains("updated_at = EXCLUDED.updated_at"));
    }

    fn gpa_row(number: &str, section: &str, year: &str, semester: &str, gpa: &str) -> GpaRow {
        gpa_row_at(number, section, year, semester, gpa, Utc::now())
    }

    fn gpa_row_at(
        number: &str,
        section: &str,
        year: &str,
        semester: &str,
        gpa: &str,
        now: DateTime<Utc>,
    ) -> GpaRow {
        let class = json!({
            "dept": "CSCE", "number": number, "section": section,
            "year": year, "semester": semester, "prof": "KIM",
            "gpa": gpa, "A": "7", "B": "3",
        });
        normalize_class(&class, now).unwrap()
    }

    async fn store_with_schema(pool: PgPool) -> PostgresStore {
        let store = PostgresStore::from_pool(pool);
        store.init_schema().await.unwrap();
        store
    }

    async fn row_count(store: &PostgresStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM gpa_data")
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn applying_a_batch_twice_keeps_created_at(pool: PgPool) {
        let store = store_with_schema(pool).await;
        let first_run = Utc::now();
        let second_run = first_run + chrono::Duration::seconds(5);
        let batch = vec![
            gpa_row_at("121", "500", "2024", "FALL", "3.1", first_run),
            gpa_row_at("121", "501", "2024", "FALL", "", first_run),
        ];
        assert_eq!(store.upsert_batch(&batch).await.unwrap(), 2);

        let mut rerun = vec![
            gpa_row_at("121", "500", "2024", "FALL", "3.4", second_run),
            gpa_row_at("121", "501", "2024", "FALL", "", second_run),
        ];
        rerun[0].grade_a = 9;
        assert_eq!(store.upsert_batch(&rerun).await.unwrap(), 2);
        assert_eq!(row_count(&store).await, 2);

        let (gpa, grade_a, created_at, updated_at): (Option<f64>, i32, DateTime<Utc>, DateTime<Utc>) =
            sqlx::query_as(
                "SELECT gpa, grade_a, created_at, updated_at FROM gpa_data WHERE id = $1",
            )
            .bind(&batch[0].id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(gpa, Some(3.4));
        assert_eq!(grade_a, 9);
        assert_eq!(created_at.timestamp(), first_run.timestamp());
        assert_eq!(updated_at.timestamp(), second_run.timestamp());
    }

    #[sqlx::test]
    async fn nan_gpa_rolls_back_the_whole_batch(pool: PgPool) {
        let store = store_with_schema(pool).await;
        let batch = vec![
            gpa_row("121", "500", "2024", "FALL", "3.1"),
            gpa_row("121", "501", "2024", "FALL", "nan"),
        ];
        let err = store.upsert_batch(&batch).await.unwrap_err();
        assert!(matches!(err, UpsertError::BatchRollback { rows: 2, .. }));
        assert_eq!(row_count(&store).await, 0);

        // The pool stays usable after a rolled back batch.
        assert_eq!(store.upsert_batch(&batch[..1]).await.unwrap(), 1);
        assert_eq!(row_count(&store).await, 1);
    }

    #[sqlx::test]
    async fn duplicate_id_in_one_batch_rolls_back(pool: PgPool) {
        let store = store_with_schema(pool).await;
        let row = gpa_row("121", "500", "2024", "FALL", "3.1");
        let batch = vec![
            gpa_row("221", "500", "2024", "FALL", "2.9"),
            row.clone(),
            row,
        ];
        assert!(store.upsert_batch(&batch).await.is_err());
        assert_eq!(row_count(&store).await, 0);
    }

    #[sqlx::test]
    async fn work_items_carry_newest_stored_term(pool: PgPool) {
        let store = store_with_schema(pool).await;
        sqlx::raw_sql(
            "CREATE TABLE courses (subject_id TEXT, course_number TEXT);
             INSERT INTO courses VALUES
                 ('CSCE', '121'), ('CSCE', '221'), ('MATH', '151'), ('CSCE', '489A');",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        let batch = vec![
            gpa_row("121", "500", "2024", "SPRING", "3.0"),
            gpa_row("121", "500", "2024b", " Summer ", "3.0"),
            gpa_row("121", "500", "2023", "SUMMER", "3.0"),
            gpa_row("221", "500", "2022", "Fall", "3.0"),
            gpa_row("221", "500", "2021", "SUMMER", "3.0"),
        ];
        store.upsert_batch(&batch).await.unwrap();

        let items = store.work_items(false).await.unwrap();
        assert_eq!(
            items,
            vec![
                WorkItem::new("MATH", "151"),
                WorkItem::new("CSCE", "121").with_latest_term(Term::new("2024b", " Summer ")),
                WorkItem::new("CSCE", "221").with_latest_term(Term::new("2022", "Fall")),
            ]
        );

        let all = store.work_items(true).await.unwrap();
        assert_eq!(
            all,
            vec![
                WorkItem::new("CSCE", "121"),
                WorkItem::new("CSCE", "221"),
                WorkItem::new("MATH", "151"),
            ]
        );
    }
}

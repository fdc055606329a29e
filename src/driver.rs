use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{error, info, warn};

use crate::{
    batcher::into_batches,
    errors::{FatalError, UpsertError},
    fetcher::{FetchOutcome, Fetcher, Transport},
    normalizer::Normalizer,
    records::{GpaRow, WorkItem},
    store::GpaStore,
    term::{Term, TermYearExtractor},
};

/// Course used to discover which term the grades source has reached.
const REFERENCE_COURSE: (&str, &str) = ("MATH", "151");

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    pub batch_retries: u32,
    /// Ignore stored terms and refetch every course.
    pub full: bool,
    pub discover_newest_term: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            batch_retries: 0,
            full: false,
            discover_newest_term: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub work_items: usize,
    pub fetched: usize,
    pub fetch_failures: BTreeMap<&'static str, usize>,
    pub normalization_failures: BTreeMap<&'static str, usize>,
    pub skipped_records: usize,
    pub rows_normalized: usize,
    pub batches: usize,
    pub batches_failed: usize,
    pub rows_written: usize,
    pub newest_term: Option<Term>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total_fetch_failures(&self) -> usize {
        self.fetch_failures.values().sum()
    }

    pub fn total_normalization_failures(&self) -> usize {
        self.normalization_failures.values().sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "duration:               {:.1?}", self.elapsed)?;
        if let Some(term) = &self.newest_term {
            writeln!(f, "newest source term:     {term}")?;
        }
        writeln!(f, "courses attempted:      {}", self.work_items)?;
        writeln!(f, "courses fetched:        {}", self.fetched)?;
        writeln!(f, "fetch failures:         {}", self.total_fetch_failures())?;
        for (kind, count) in &self.fetch_failures {
            writeln!(f, "  {kind}: {count}")?;
        }
        writeln!(f, "records skipped (old):  {}", self.skipped_records)?;
        writeln!(f, "rows normalized:        {}", self.rows_normalized)?;
        writeln!(
            f,
            "normalization failures: {}",
            self.total_normalization_failures()
        )?;
        for (kind, count) in &self.normalization_failures {
            writeln!(f, "  {kind}: {count}")?;
        }
        writeln!(
            f,
            "batches written:        {}/{}",
            self.batches - self.batches_failed,
            self.batches
        )?;
        write!(f, "rows written:           {}", self.rows_written)?;
        if self.interrupted {
            write!(f, "\nrun was interrupted before all batches were applied")?;
        }
        Ok(())
    }
}

pub struct Driver<'a, S, T> {
    store: &'a S,
    fetcher: Fetcher<'a, T>,
    year_extractor: &'a TermYearExtractor,
    options: RunOptions,
    interrupted: &'a AtomicBool,
}

impl<'a, S: GpaStore, T: Transport> Driver<'a, S, T> {
    pub fn new(
        store: &'a S,
        fetcher: Fetcher<'a, T>,
        year_extractor: &'a TermYearExtractor,
        options: RunOptions,
        interrupted: &'a AtomicBool,
    ) -> Self {
        Self {
            store,
            fetcher,
            year_extractor,
            options,
            interrupted,
        }
    }

    /// Enumerate, fetch, normalize, then upsert batch by batch. Only a
    /// failure to enumerate aborts the run; it happens before any write.
    pub async fn run(&self) -> Result<RunSummary, FatalError> {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        let items = self
            .store
            .work_items(self.options.full)
            .await
            .inspect_err(|e| error!("{e}"))?;
        summary.work_items = items.len();
        if items.is_empty() {
            info!("no courses to fetch");
            summary.elapsed = started.elapsed();
            return Ok(summary);
        }

        if self.options.discover_newest_term {
            summary.newest_term = self.discover_newest_term().await;
        }

        let outcomes = self.fetcher.fetch_all(items, self.interrupted).await;
        if self.interrupted.load(Ordering::SeqCst) {
            warn!("interrupted while fetching, nothing will be written");
            summary.interrupted = true;
        }
        let rows = self.normalize_all(outcomes, &mut summary);

        let batches = into_batches(rows, self.options.batch_size);
        summary.batches = batches.len();
        info!(
            "upserting {} rows in {} batches of up to {}",
            summary.rows_normalized, summary.batches, self.options.batch_size
        );

        for (index, batch) in batches.iter().enumerate() {
            if self.interrupted.load(Ordering::SeqCst) {
                warn!(
                    "interrupted, {} of {} batches left unapplied",
                    batches.len() - index,
                    batches.len()
                );
                summary.interrupted = true;
                break;
            }
            match self.upsert_with_retries(index + 1, batch).await {
                Ok(written) => {
                    info!("batch {} ({} rows) [OK]", index + 1, batch.len());
                    summary.rows_written += written;
                }
                Err(e) => {
                    error!("batch {} failed: {e}", index + 1);
                    summary.batches_failed += 1;
                }
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            "done in {:.1?}: {} rows written from {} courses",
            summary.elapsed, summary.rows_written, summary.fetched
        );
        Ok(summary)
    }

    fn normalize_all(
        &self,
        outcomes: Vec<FetchOutcome>,
        summary: &mut RunSummary,
    ) -> Vec<GpaRow> {
        let normalizer = Normalizer::new(self.year_extractor, Utc::now());
        let mut rows = Vec::new();
        for (item, result) in outcomes {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!("[{}] fetch failed: {e}", item.key());
                    *summary.fetch_failures.entry(e.category()).or_default() += 1;
                    continue;
                }
            };
            summary.fetched += 1;

            let normalized = normalizer.normalize_record(&item, &record);
            for e in &normalized.errors {
                warn!("[{}] dropped class record: {e}", item.key());
                *summary.normalization_failures.entry(e.category()).or_default() += 1;
            }
            summary.skipped_records += normalized.skipped;
            rows.extend(normalized.rows);
        }
        summary.rows_normalized = rows.len();
        info!(
            "extracted {} rows from {} responses",
            rows.len(),
            summary.fetched
        );
        rows
    }

    async fn upsert_with_retries(
        &self,
        number: usize,
        batch: &[GpaRow],
    ) -> Result<usize, UpsertError> {
        let mut attempt = 0;
        loop {
            match self.store.upsert_batch(batch).await {
                Ok(written) => return Ok(written),
                Err(e) if attempt < self.options.batch_retries => {
                    attempt += 1;
                    warn!(
                        "batch {number} rolled back ({e}), retry {attempt}/{}",
                        self.options.batch_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn discover_newest_term(&self) -> Option<Term> {
        let (dept, number) = REFERENCE_COURSE;
        let reference = WorkItem::new(dept, number);
        match self.fetcher.fetch_one(&reference).await {
            Ok(record) => {
                let newest = self.year_extractor.newest_term(&record.classes);
                match &newest {
                    Some(term) => info!("newest semester on the grades source: {term}"),
                    None => warn!("could not determine newest semester from {dept} {number}"),
                }
                newest
            }
            Err(e) => {
                warn!("could not fetch semester data for {dept} {number}: {e}");
                None
            }
        }
    }
}

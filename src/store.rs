use crate::{
    errors::{FatalError, UpsertError},
    records::{GpaRow, WorkItem},
};

/// The relational side of the pipeline: where work comes from and where rows go.
#[allow(async_fn_in_trait)]
pub trait GpaStore {
    /// Courses to fetch this run. With `full`, stored terms are ignored and
    /// every course is fetched from scratch.
    async fn work_items(&self, full: bool) -> Result<Vec<WorkItem>, FatalError>;

    /// Writes one batch in a single transaction. Absent ids are inserted;
    /// present ids get every column but `id` and `created_at` overwritten.
    /// On error nothing from the batch is visible.
    async fn upsert_batch(&self, batch: &[GpaRow]) -> Result<usize, UpsertError>;
}

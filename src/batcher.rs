use crate::records::GpaRow;

/// Splits `rows` into consecutive batches of at most `batch_size`, keeping
/// order. Duplicate ids are passed through untouched.
pub fn into_batches(rows: Vec<GpaRow>, batch_size: usize) -> Vec<Vec<GpaRow>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(rows.len().div_ceil(batch_size));
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        batches.push(rows.by_ref().take(batch_size).collect());
    }
    batches
}

mod batcher;
mod config;
mod driver;
mod errors;
mod fetcher;
mod memory_store;
mod normalizer;
mod pipeline_context;
mod postgres_store;
mod ratelimit;
mod records;
mod requests;
mod store;
mod term;

pub use batcher::into_batches;
pub use config::{LoadFromEnv, PipelineConfig};
pub use driver::{Driver, RunOptions, RunSummary};
pub use errors::{FatalError, FetchError, NormalizationError, UpsertError};
pub use fetcher::{FetchOutcome, Fetcher, Transport, TransportError, TransportResponse};
pub use memory_store::MemoryStore;
pub use normalizer::{GRADE_KEYS, NormalizedRecord, Normalizer, normalize_class, row_id};
pub use pipeline_context::PipelineContext;
pub use postgres_store::PostgresStore;
pub use records::{GpaRow, RawRecord, WorkItem};
pub use requests::RequestClient;
pub use store::GpaStore;
pub use term::{Term, TermYearExtractor, semester_rank};

use thiserror::Error;

/// Why a single work item produced no payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timeout")]
    Timeout,
    #[error("http_status:{0}")]
    HttpStatus(u16),
    #[error("decode_error:{0}")]
    Decode(String),
    #[error("exception:{0}")]
    Exception(String),
    #[error("no_data")]
    NoData,
    /// Not attempted because the run was interrupted first.
    #[error("interrupted")]
    Interrupted,
}

impl FetchError {
    /// Short category name used when tallying failures.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::HttpStatus(_) => "http_status",
            Self::Decode(_) => "decode_error",
            Self::Exception(_) => "exception",
            Self::NoData => "no_data",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("missing_field: {0}")]
    MissingField(&'static str),
    #[error("malformed_numeric: {field} = {value:?}")]
    MalformedNumeric { field: &'static str, value: String },
}

impl NormalizationError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::MalformedNumeric { .. } => "malformed_numeric",
        }
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    /// The whole batch was rolled back; nothing from it is visible.
    #[error("batch of {rows} rows rolled back: {reason}")]
    BatchRollback { rows: usize, reason: String },
}

/// Conditions that stop a run before anything is written.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("cannot enumerate work items: {0}")]
    CannotEnumerate(String),
    #[error("cannot connect to store: {0}")]
    CannotConnect(String),
}

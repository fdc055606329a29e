use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info};
use tokio::sync::Semaphore;

use crate::{
    errors::FetchError,
    records::{RawRecord, WorkItem},
};

/// Status and body of one completed exchange with the grades source.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Other(String),
}

/// Sends the grades request for a single course.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn request(&self, item: &WorkItem) -> Result<TransportResponse, TransportError>;
}

pub type FetchOutcome = (WorkItem, Result<RawRecord, FetchError>);

pub struct Fetcher<'a, T> {
    transport: &'a T,
    concurrency: usize,
    timeout: Duration,
}

impl<'a, T: Transport> Fetcher<'a, T> {
    pub fn new(transport: &'a T, concurrency: usize, timeout: Duration) -> Self {
        Self {
            transport,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Fetches every item, returning exactly one outcome per item in
    /// completion order. At most `concurrency` requests are open at a time.
    /// Once `interrupted` is set no new request is started; the items still
    /// waiting come back as `FetchError::Interrupted`.
    pub async fn fetch_all(
        &self,
        items: Vec<WorkItem>,
        interrupted: &AtomicBool,
    ) -> Vec<FetchOutcome> {
        let total = items.len();
        info!(
            "fetching {total} courses with {} concurrent requests",
            self.concurrency
        );

        let gate = Semaphore::new(self.concurrency);
        let mut in_progress: FuturesUnordered<_> = items
            .into_iter()
            .map(|item| self.fetch_gated(&gate, interrupted, item))
            .collect();

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = in_progress.next().await {
            outcomes.push(outcome);
            if outcomes.len() % 100 == 0 {
                debug!("fetched {}/{total}", outcomes.len());
            }
        }
        outcomes
    }

    async fn fetch_gated(
        &self,
        gate: &Semaphore,
        interrupted: &AtomicBool,
        item: WorkItem,
    ) -> FetchOutcome {
        let _permit = match gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => return (item, Err(FetchError::Exception(e.to_string()))),
        };
        if interrupted.load(Ordering::SeqCst) {
            return (item, Err(FetchError::Interrupted));
        }
        let result = self.fetch_one(&item).await;
        (item, result)
    }

    /// One request for one item, bounded by the per-request timeout.
    pub async fn fetch_one(&self, item: &WorkItem) -> Result<RawRecord, FetchError> {
        match tokio::time::timeout(self.timeout, self.transport.request(item)).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => Err(FetchError::Timeout),
            Ok(Err(TransportError::Other(msg))) => Err(FetchError::Exception(msg)),
            Ok(Ok(response)) => decode_response(response),
        }
    }
}

pub fn decode_response(response: TransportResponse) -> Result<RawRecord, FetchError> {
    if !(200..300).contains(&response.status) {
        return Err(FetchError::HttpStatus(response.status));
    }
    let record: RawRecord =
        serde_json::from_str(&response.body).map_err(|e| FetchError::Decode(e.to_string()))?;
    if record.classes.is_empty() {
        return Err(FetchError::NoData);
    }
    Ok(record)
}

//! Upstream fetcher contracts, fixture-backed fetchers, source adapters and
//! the normalizer shared by the batch and push ingestion paths.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub mod fetch;
pub mod normalize;
pub mod record;
pub mod source;

pub use fetch::{
    AccountDirectory, FixtureAccountDirectory, FixtureOperationalFetcher, FixtureSecurityFetcher,
    IdPage, OperationalEventFetcher, RecordPage, SecurityFindingFetcher,
};
pub use normalize::{normalize, service_from_arn};
pub use record::{EventEnvelope, OperationalEventRecord, RawRecord, SecurityFindingRecord};
pub use source::{
    drain_source, DrainReport, ItemSink, OperationalEventsAdapter, RecordPager, ScopeFailure,
    SecurityFindingsAdapter, SinkError, SourceAdapter,
};

pub const CRATE_NAME: &str = "vigil-adapters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Run one upstream call under `limit`; running out of time is a fetch error.
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}

//! Source adapters: page through an upstream fetcher scope by scope and hand
//! normalized items to a sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, info_span, warn, Instrument};
use vigil_core::{CanonicalItem, ItemKind};
use vigil_storage::StoreError;

use crate::fetch::{OperationalEventFetcher, SecurityFindingFetcher};
use crate::normalize::normalize;
use crate::record::{OperationalEventRecord, RawRecord, SecurityFindingRecord};
use crate::{bounded, FetchError};

pub const SECURITY_PAGE_SIZE: usize = 50;
pub const OPERATIONAL_PAGE_SIZE: usize = 100;
pub const HEALTH_PRODUCT_NAME: &str = "Health";

/// Lazy page sequence for one scope. `Ok(None)` once the upstream
/// continuation token runs out.
#[async_trait]
pub trait RecordPager: Send {
    async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, FetchError>;
}

pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> ItemKind;

    fn source_name(&self) -> &'static str;

    fn scopes(&self) -> Vec<String>;

    /// Every upstream call the pager makes is bounded by `fetch_timeout`.
    fn open_scope(&self, scope: &str, fetch_timeout: Duration) -> Box<dyn RecordPager>;
}

/// Per-region GuardDuty adapter.
pub struct SecurityFindingsAdapter {
    fetcher: Arc<dyn SecurityFindingFetcher>,
    regions: Vec<String>,
}

impl SecurityFindingsAdapter {
    pub fn new(fetcher: Arc<dyn SecurityFindingFetcher>, regions: Vec<String>) -> Self {
        let regions = regions
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        Self { fetcher, regions }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PagerState {
    Start,
    Paging { detector_id: String, next_token: Option<String> },
    Done,
}

struct SecurityPager {
    fetcher: Arc<dyn SecurityFindingFetcher>,
    region: String,
    fetch_timeout: Duration,
    state: PagerState,
}

#[async_trait]
impl RecordPager for SecurityPager {
    async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, FetchError> {
        if self.state == PagerState::Start {
            let detectors = bounded(
                "ListDetectors",
                self.fetch_timeout,
                self.fetcher.list_detectors(&self.region),
            )
            .await?;
            match detectors.into_iter().next() {
                Some(detector_id) => {
                    self.state = PagerState::Paging {
                        detector_id,
                        next_token: None,
                    }
                }
                None => {
                    info!(region = %self.region, "no detectors found");
                    self.state = PagerState::Done;
                }
            }
        }

        let PagerState::Paging {
            detector_id,
            next_token,
        } = &self.state
        else {
            return Ok(None);
        };
        let detector_id = detector_id.clone();
        let listed = bounded(
            "ListFindings",
            self.fetch_timeout,
            self.fetcher.list_finding_ids(
                &self.region,
                &detector_id,
                next_token.as_deref(),
                SECURITY_PAGE_SIZE,
            ),
        )
        .await?;
        let findings = if listed.ids.is_empty() {
            Vec::new()
        } else {
            bounded(
                "GetFindings",
                self.fetch_timeout,
                self.fetcher.get_findings(&self.region, &detector_id, &listed.ids),
            )
            .await?
        };
        self.state = match listed.next_token {
            Some(token) => PagerState::Paging {
                detector_id,
                next_token: Some(token),
            },
            None => PagerState::Done,
        };
        Ok(Some(
            findings
                .into_iter()
                .map(|f| RawRecord::SecurityFinding(SecurityFindingRecord::new(f)))
                .collect(),
        ))
    }
}

impl SourceAdapter for SecurityFindingsAdapter {
    fn kind(&self) -> ItemKind {
        ItemKind::SecurityFinding
    }

    fn source_name(&self) -> &'static str {
        "guardduty"
    }

    fn scopes(&self) -> Vec<String> {
        self.regions.clone()
    }

    fn open_scope(&self, scope: &str, fetch_timeout: Duration) -> Box<dyn RecordPager> {
        Box::new(SecurityPager {
            fetcher: self.fetcher.clone(),
            region: scope.to_string(),
            fetch_timeout,
            state: PagerState::Start,
        })
    }
}

/// Health events through the Security Hub aggregation region.
pub struct OperationalEventsAdapter {
    fetcher: Arc<dyn OperationalEventFetcher>,
    aggregation_region: String,
}

impl OperationalEventsAdapter {
    pub fn new(fetcher: Arc<dyn OperationalEventFetcher>, aggregation_region: impl Into<String>) -> Self {
        Self {
            fetcher,
            aggregation_region: aggregation_region.into(),
        }
    }
}

struct OperationalPager {
    fetcher: Arc<dyn OperationalEventFetcher>,
    fetch_timeout: Duration,
    next_token: Option<String>,
    done: bool,
}

#[async_trait]
impl RecordPager for OperationalPager {
    async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, FetchError> {
        if self.done {
            return Ok(None);
        }
        let page = bounded(
            "GetFindings",
            self.fetch_timeout,
            self.fetcher.get_findings(
                HEALTH_PRODUCT_NAME,
                self.next_token.as_deref(),
                OPERATIONAL_PAGE_SIZE,
            ),
        )
        .await?;
        self.next_token = page.next_token;
        self.done = self.next_token.is_none();
        let received = page.records.len();
        let records = page
            .records
            .into_iter()
            .map(|payload| RawRecord::OperationalEvent(OperationalEventRecord::aggregated(payload)))
            .filter(|record| record.source_id().is_some())
            .collect::<Vec<_>>();
        if records.len() < received {
            debug!(skipped = received - records.len(), "skipped records without Id");
        }
        Ok(Some(records))
    }
}

impl SourceAdapter for OperationalEventsAdapter {
    fn kind(&self) -> ItemKind {
        ItemKind::OperationalEvent
    }

    fn source_name(&self) -> &'static str {
        "health"
    }

    fn scopes(&self) -> Vec<String> {
        vec![self.aggregation_region.clone()]
    }

    fn open_scope(&self, _scope: &str, fetch_timeout: Duration) -> Box<dyn RecordPager> {
        Box::new(OperationalPager {
            fetcher: self.fetcher.clone(),
            fetch_timeout,
            next_token: None,
            done: false,
        })
    }
}

/// A sink that stopped part way through a page reports how many items it
/// did write.
#[derive(Debug)]
pub struct SinkError {
    pub written: usize,
    pub source: StoreError,
}

#[async_trait]
pub trait ItemSink: Send + Sync {
    async fn write_page(&self, items: Vec<CanonicalItem>) -> Result<usize, SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ScopeFailure {
    pub scope: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DrainReport {
    pub stored: usize,
    pub scopes_completed: usize,
    pub scope_failures: Vec<ScopeFailure>,
    /// Set when a sink failure ended the drain early.
    pub aborted: Option<String>,
}

enum ScopeStop {
    Fetch(FetchError),
    Sink(StoreError),
}

async fn drain_scope(
    adapter: &dyn SourceAdapter,
    sink: &dyn ItemSink,
    scope: &str,
    fetch_timeout: Duration,
    stored: &mut usize,
) -> Result<(), ScopeStop> {
    let mut pager = adapter.open_scope(scope, fetch_timeout);
    while let Some(records) = pager.next_page().await.map_err(ScopeStop::Fetch)? {
        if records.is_empty() {
            continue;
        }
        let items = records.iter().map(normalize).collect::<Vec<_>>();
        match sink.write_page(items).await {
            Ok(written) => *stored += written,
            Err(err) => {
                *stored += err.written;
                return Err(ScopeStop::Sink(err.source));
            }
        }
    }
    Ok(())
}

/// Drain every scope in order. A fetch failure loses only its own scope; a
/// sink failure stops the whole drain with what was stored so far.
pub async fn drain_source(
    adapter: &dyn SourceAdapter,
    sink: &dyn ItemSink,
    fetch_timeout: Duration,
) -> DrainReport {
    let mut report = DrainReport::default();
    for scope in adapter.scopes() {
        let span = info_span!("scope", source = adapter.source_name(), scope = %scope);
        let mut stored = 0;
        let outcome = drain_scope(adapter, sink, &scope, fetch_timeout, &mut stored)
            .instrument(span)
            .await;
        report.stored += stored;
        let source = adapter.source_name();
        match outcome {
            Ok(()) => {
                report.scopes_completed += 1;
                info!(source, scope = %scope, stored, "scope drained");
            }
            Err(ScopeStop::Fetch(err)) => {
                warn!(source, scope = %scope, error = %err, stored, "scope failed, continuing with remaining scopes");
                report.scope_failures.push(ScopeFailure {
                    scope,
                    error: err.to_string(),
                });
            }
            Err(ScopeStop::Sink(err)) => {
                warn!(source, scope = %scope, error = %err, stored, "store write failed, ending run");
                report.aborted = Some(err.to_string());
                break;
            }
        }
    }
    report
}

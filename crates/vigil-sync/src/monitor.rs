//! The monitor boundary: syncs, queries, point reads, annotations, push
//! ingestion and the dashboard summary over the two item tables.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use vigil_adapters::{
    normalize, AccountDirectory, EventEnvelope, FixtureAccountDirectory, FixtureOperationalFetcher,
    FixtureSecurityFetcher, OperationalEventFetcher, OperationalEventsAdapter,
    SecurityFindingFetcher, SecurityFindingsAdapter,
};
use vigil_core::{CanonicalItem, ItemKey, ItemKind, SeverityLevel, ValidationError};
use vigil_storage::postgres::connect_pool;
use vigil_storage::{
    AnnotateError, AnnotationUpdater, AttrFilter, Cursor, ItemPage, ListRequest, MemoryTable,
    MergingStore, PgTable, QueryEngine, StoreError, TableStore, UpsertOutcome,
};

use crate::accounts::{AccountMap, AccountNameCache, AccountsError};
use crate::config::MonitorConfig;
use crate::pipeline::{PipelineSettings, SyncOutcome, SyncPipeline};

pub const DEFAULT_FINDINGS_LIMIT: usize = 50;
pub const DEFAULT_EVENTS_LIMIT: usize = 20;
pub const OPEN_STATUS: &str = "open";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no item stored under {0}")]
    NotFound(ItemKey),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Accounts(#[from] AccountsError),
}

impl From<AnnotateError> for MonitorError {
    fn from(err: AnnotateError) -> Self {
        match err {
            AnnotateError::Validation(err) => Self::Validation(err),
            AnnotateError::NotFound(key) => Self::NotFound(key),
            AnnotateError::Store(err) => Self::Store(err),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindingsQuery {
    pub account_id: Option<String>,
    /// Applied to the fetched page, after the store has paged.
    pub severity: Option<SeverityLevel>,
    pub cursor: Option<Cursor>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct EventsQuery {
    pub account_id: Option<String>,
    pub service: Option<String>,
    pub cursor: Option<Cursor>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum IngestOutcome {
    #[serde(rename_all = "camelCase")]
    Stored {
        kind: ItemKind,
        key: ItemKey,
        created: bool,
    },
    Ignored { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FindingsSummary {
    pub total: usize,
    pub severity: SeverityCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventsSummary {
    pub total: usize,
    pub open: usize,
    /// Open events whose start time is still ahead.
    pub upcoming: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub guardduty: FindingsSummary,
    pub health: EventsSummary,
    pub last_updated: String,
}

fn summarize_events(events: &[CanonicalItem], now: DateTime<Utc>) -> EventsSummary {
    let starts_later = |event: &CanonicalItem| {
        DateTime::parse_from_rfc3339(&event.created_at).is_ok_and(|start| start > now)
    };
    let open = events.iter().filter(|e| e.status_code() == "open");
    EventsSummary {
        total: events.len(),
        open: open.clone().count(),
        upcoming: open.filter(|e| starts_later(e)).count(),
        closed: events.iter().filter(|e| e.status_code() == "closed").count(),
    }
}

/// Upstream endpoints the monitor talks to.
pub struct Upstreams {
    pub security: Arc<dyn SecurityFindingFetcher>,
    pub operational: Arc<dyn OperationalEventFetcher>,
    pub accounts: Arc<dyn AccountDirectory>,
}

impl Upstreams {
    pub fn from_fixtures(config: &MonitorConfig) -> Self {
        Self {
            security: Arc::new(FixtureSecurityFetcher::new(&config.fixtures_dir)),
            operational: Arc::new(FixtureOperationalFetcher::new(&config.fixtures_dir)),
            accounts: Arc::new(FixtureAccountDirectory::new(&config.fixtures_dir)),
        }
    }
}

pub struct Monitor {
    findings: Arc<MergingStore>,
    events: Arc<MergingStore>,
    security_sync: SyncPipeline,
    operational_sync: SyncPipeline,
    accounts: AccountNameCache,
}

impl Monitor {
    pub fn new(
        findings_table: Arc<dyn TableStore>,
        events_table: Arc<dyn TableStore>,
        upstreams: Upstreams,
        config: &MonitorConfig,
    ) -> Self {
        let settings = PipelineSettings {
            fetch_timeout: config.fetch_timeout(),
            upsert_concurrency: config.upsert_concurrency,
        };
        let findings = Arc::new(MergingStore::new(findings_table));
        let events = Arc::new(MergingStore::new(events_table));
        let security_sync = SyncPipeline::new(
            Arc::new(SecurityFindingsAdapter::new(
                upstreams.security,
                config.guardduty_regions.clone(),
            )),
            findings.clone(),
            settings,
        );
        let operational_sync = SyncPipeline::new(
            Arc::new(OperationalEventsAdapter::new(
                upstreams.operational,
                config.aws_region.clone(),
            )),
            events.clone(),
            settings,
        );
        Self {
            findings,
            events,
            security_sync,
            operational_sync,
            accounts: AccountNameCache::new(upstreams.accounts, config.fetch_timeout()),
        }
    }

    /// Tables from `DATABASE_URL` when set, in-process otherwise; upstream
    /// records come from the fixtures directory.
    pub async fn from_config(config: &MonitorConfig) -> anyhow::Result<Self> {
        let (findings, events): (Arc<dyn TableStore>, Arc<dyn TableStore>) =
            match &config.database_url {
                Some(url) => {
                    let pool = connect_pool(url).await.context("connecting to database")?;
                    (
                        Arc::new(PgTable::new(pool.clone(), &config.guardduty_table)),
                        Arc::new(PgTable::new(pool, &config.health_table)),
                    )
                }
                None => {
                    info!("DATABASE_URL not set, keeping items in memory");
                    (
                        Arc::new(MemoryTable::new(&config.guardduty_table)),
                        Arc::new(MemoryTable::new(&config.health_table)),
                    )
                }
            };
        Ok(Self::new(findings, events, Upstreams::from_fixtures(config), config))
    }

    fn store_for(&self, kind: ItemKind) -> &Arc<MergingStore> {
        match kind {
            ItemKind::SecurityFinding => &self.findings,
            ItemKind::OperationalEvent => &self.events,
        }
    }

    fn engine_for(&self, kind: ItemKind) -> QueryEngine {
        QueryEngine::for_kind(self.store_for(kind).table().clone(), kind)
    }

    pub async fn sync_security(&self) -> SyncOutcome {
        self.security_sync.run().await
    }

    pub async fn sync_operational(&self) -> SyncOutcome {
        self.operational_sync.run().await
    }

    pub async fn query_findings(&self, query: FindingsQuery) -> Result<ItemPage, MonitorError> {
        let mut page = self
            .engine_for(ItemKind::SecurityFinding)
            .list(ListRequest {
                partition_key: query.account_id,
                status: None,
                filter: None,
                cursor: query.cursor,
                limit: query.limit.unwrap_or(DEFAULT_FINDINGS_LIMIT),
            })
            .await?;
        if let Some(bucket) = query.severity {
            page.items.retain(|item| item.severity_level() == bucket);
        }
        Ok(page)
    }

    /// Without an account the status index is read for open events.
    pub async fn query_events(&self, query: EventsQuery) -> Result<ItemPage, MonitorError> {
        let status = query
            .account_id
            .is_none()
            .then(|| OPEN_STATUS.to_string());
        let page = self
            .engine_for(ItemKind::OperationalEvent)
            .list(ListRequest {
                partition_key: query.account_id,
                status,
                filter: query.service.map(|service| AttrFilter::eq("service", service)),
                cursor: query.cursor,
                limit: query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT),
            })
            .await?;
        Ok(page)
    }

    /// Every item of one kind, cursor chain followed to the end.
    pub async fn list_all(&self, kind: ItemKind, request: ListRequest) -> Result<Vec<CanonicalItem>, MonitorError> {
        Ok(self.engine_for(kind).list_all(request).await?)
    }

    pub async fn get_one(
        &self,
        kind: ItemKind,
        account_id: &str,
        source_id: &str,
    ) -> Result<CanonicalItem, MonitorError> {
        let key = ItemKey::for_source(kind, account_id, source_id);
        self.store_for(kind)
            .get_by_id(&key)
            .await?
            .ok_or(MonitorError::NotFound(key))
    }

    pub async fn annotate(
        &self,
        kind: ItemKind,
        account_id: &str,
        source_id: &str,
        comment: Option<String>,
        determination: Option<&str>,
    ) -> Result<(), MonitorError> {
        let key = ItemKey::for_source(kind, account_id, source_id);
        AnnotationUpdater::new(self.store_for(kind).clone())
            .set_annotation(&key, comment, determination)
            .await?;
        Ok(())
    }

    /// Push path: normalize one envelope and upsert it like a synced record.
    pub async fn ingest_event(&self, envelope: EventEnvelope) -> Result<IngestOutcome, MonitorError> {
        let source = envelope.source.clone();
        let Some(record) = envelope.into_record() else {
            warn!(source = %source, "ignoring event from unknown source");
            return Ok(IngestOutcome::Ignored {
                reason: format!("unknown event source {source:?}"),
            });
        };
        if record.source_id().is_none() {
            warn!(source = %source, "ignoring event without an identifier");
            return Ok(IngestOutcome::Ignored {
                reason: "event carries no identifier".to_string(),
            });
        }
        let kind = record.kind();
        let item = normalize(&record);
        let key = item.key();
        let outcome = self.store_for(kind).upsert(item).await?;
        info!(source = %source, %key, ?outcome, "stored pushed event");
        Ok(IngestOutcome::Stored {
            kind,
            key,
            created: outcome == UpsertOutcome::Created,
        })
    }

    /// Full scans of both tables.
    pub async fn summary(&self) -> Result<DashboardSummary, MonitorError> {
        let findings = self
            .list_all(ItemKind::SecurityFinding, ListRequest { limit: 1000, ..Default::default() })
            .await?;
        let events = self
            .list_all(ItemKind::OperationalEvent, ListRequest { limit: 1000, ..Default::default() })
            .await?;

        let mut guardduty = FindingsSummary {
            total: findings.len(),
            ..Default::default()
        };
        for finding in &findings {
            match finding.severity_level() {
                SeverityLevel::Critical => guardduty.severity.critical += 1,
                SeverityLevel::High => guardduty.severity.high += 1,
                SeverityLevel::Medium => guardduty.severity.medium += 1,
                SeverityLevel::Low | SeverityLevel::Informational => guardduty.severity.low += 1,
            }
        }
        let now = Utc::now();
        Ok(DashboardSummary {
            guardduty,
            health: summarize_events(&events, now),
            last_updated: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    pub async fn accounts(&self) -> Result<Arc<AccountMap>, MonitorError> {
        Ok(self.accounts.get().await?)
    }
}

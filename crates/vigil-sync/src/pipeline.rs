//! One sync pipeline per source: adapter -> normalizer -> merging store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vigil_adapters::{drain_source, ItemSink, ScopeFailure, SinkError, SourceAdapter};
use vigil_core::CanonicalItem;
use vigil_storage::{MergingStore, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub fetch_timeout: Duration,
    pub upsert_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            upsert_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stored: usize,
    pub scopes_completed: usize,
    pub scope_failures: Vec<ScopeFailure>,
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// A run of the same source was already in progress.
    Skipped { source: String },
}

impl SyncOutcome {
    pub fn stored(&self) -> usize {
        match self {
            Self::Completed(report) => report.stored,
            Self::Skipped { .. } => 0,
        }
    }
}

/// Upserts one page concurrently, at most `permits` at a time.
struct StoreSink {
    store: Arc<MergingStore>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl ItemSink for StoreSink {
    async fn write_page(&self, items: Vec<CanonicalItem>) -> Result<usize, SinkError> {
        let mut tasks = JoinSet::new();
        for item in items {
            let store = self.store.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
                store.upsert(item).await
            });
        }

        let mut written = 0;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => written += 1,
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    first_error.get_or_insert(StoreError::Backend(format!("upsert task failed: {err}")));
                }
            }
        }
        match first_error {
            None => Ok(written),
            Some(source) => Err(SinkError { written, source }),
        }
    }
}

pub struct SyncPipeline {
    adapter: Arc<dyn SourceAdapter>,
    store: Arc<MergingStore>,
    settings: PipelineSettings,
    running: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(adapter: Arc<dyn SourceAdapter>, store: Arc<MergingStore>, settings: PipelineSettings) -> Self {
        Self {
            adapter,
            store,
            settings,
            running: Mutex::new(()),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.adapter.source_name()
    }

    /// Drain every scope of the source into the store. Never fails: fetch
    /// and store problems are carried in the report.
    pub async fn run(&self) -> SyncOutcome {
        let source = self.adapter.source_name();
        let Ok(_running) = self.running.try_lock() else {
            info!(source, "sync already running, skipping trigger");
            return SyncOutcome::Skipped {
                source: source.to_string(),
            };
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source);
        async move {
            let started_at = Utc::now();
            info!(table = self.store.table_name(), "sync started");
            let sink = StoreSink {
                store: self.store.clone(),
                permits: Arc::new(Semaphore::new(self.settings.upsert_concurrency.max(1))),
            };
            let drained = drain_source(self.adapter.as_ref(), &sink, self.settings.fetch_timeout).await;
            let report = SyncReport {
                run_id,
                source: source.to_string(),
                started_at,
                finished_at: Utc::now(),
                stored: drained.stored,
                scopes_completed: drained.scopes_completed,
                scope_failures: drained.scope_failures,
                aborted: drained.aborted,
            };
            if report.aborted.is_some() || !report.scope_failures.is_empty() {
                warn!(
                    stored = report.stored,
                    failed_scopes = report.scope_failures.len(),
                    aborted = report.aborted.is_some(),
                    "sync finished with errors"
                );
            } else {
                info!(stored = report.stored, scopes = report.scopes_completed, "sync finished");
            }
            SyncOutcome::Completed(report)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{json, Value as JsonValue};
    use tokio::sync::Notify;
    use vigil_adapters::{FetchError, OperationalEventFetcher, OperationalEventsAdapter, RecordPage};
    use vigil_core::{Determination, ItemKey, ItemKind};
    use vigil_storage::{AnnotationPatch, MemoryTable, TableStore};

    use super::*;

    fn health_record(n: usize) -> JsonValue {
        json!({
            "Id": format!("arn:aws:health:us-east-1::event/EC2/AWS_EC2_MAINTENANCE/{n}"),
            "AwsAccountId": "111122223333",
            "ProductFields": {"HealthEventTypeCategory": "scheduledChange"}
        })
    }

    /// Serves `count` records; the first call can be held until released.
    struct GatedFetcher {
        count: usize,
        calls: AtomicUsize,
        hold_first: bool,
        entered: Notify,
        release: Notify,
    }

    impl GatedFetcher {
        fn new(count: usize, hold_first: bool) -> Self {
            Self {
                count,
                calls: AtomicUsize::new(0),
                hold_first,
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl OperationalEventFetcher for GatedFetcher {
        async fn get_findings(
            &self,
            _product_name: &str,
            _next_token: Option<&str>,
            _max_results: usize,
        ) -> Result<RecordPage, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 && self.hold_first {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(RecordPage {
                records: (0..self.count).map(health_record).collect(),
                next_token: None,
            })
        }
    }

    fn pipeline(fetcher: Arc<GatedFetcher>, table: Arc<MemoryTable>) -> SyncPipeline {
        SyncPipeline::new(
            Arc::new(OperationalEventsAdapter::new(fetcher, "us-east-1")),
            Arc::new(MergingStore::new(table)),
            PipelineSettings {
                fetch_timeout: Duration::from_secs(5),
                upsert_concurrency: 3,
            },
        )
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let fetcher = Arc::new(GatedFetcher::new(4, true));
        let table = Arc::new(MemoryTable::new("events"));
        let pipeline = Arc::new(pipeline(fetcher.clone(), table.clone()));

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run().await })
        };
        fetcher.entered.notified().await;

        let second = pipeline.run().await;
        assert!(matches!(second, SyncOutcome::Skipped { ref source } if source == "health"));

        fetcher.release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.stored(), 4);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // gate is released once the run finishes
        assert_eq!(pipeline.run().await.stored(), 4);
        assert_eq!(table.len().await, 4);
    }

    #[tokio::test]
    async fn resync_keeps_annotations() {
        let fetcher = Arc::new(GatedFetcher::new(2, false));
        let table = Arc::new(MemoryTable::new("events"));
        let pipeline = pipeline(fetcher, table.clone());
        pipeline.run().await;

        let key = ItemKey::for_source(
            ItemKind::OperationalEvent,
            "111122223333",
            "arn:aws:health:us-east-1::event/EC2/AWS_EC2_MAINTENANCE/1",
        );
        table
            .update_annotation(
                &key,
                &AnnotationPatch {
                    comment: Some("planned window".into()),
                    determination: Some(Determination::NoIssue),
                },
            )
            .await
            .unwrap();

        let SyncOutcome::Completed(report) = pipeline.run().await else {
            panic!("second run skipped");
        };
        assert_eq!(report.stored, 2);
        assert!(report.scope_failures.is_empty());
        let stored = table.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.comment, "planned window");
        assert_eq!(stored.determination, Determination::NoIssue);
        assert!(stored.expires_at > 0);
    }
}

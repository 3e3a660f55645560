use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::monitor::Monitor;
use crate::pipeline::SyncOutcome;

/// How often each source is re-synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub security: Duration,
    pub operational: Duration,
}

impl Cadence {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            security: Duration::from_secs(config.security_sync_minutes.max(1) * 60),
            operational: Duration::from_secs(config.operational_sync_minutes.max(1) * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledSource {
    Security,
    Operational,
}

/// One scheduler tick. Overlap with a running sync of the same source is
/// absorbed by the pipeline gate.
pub async fn run_scheduled(monitor: &Monitor, source: ScheduledSource) -> SyncOutcome {
    let outcome = match source {
        ScheduledSource::Security => monitor.sync_security().await,
        ScheduledSource::Operational => monitor.sync_operational().await,
    };
    match &outcome {
        SyncOutcome::Completed(report) if report.aborted.is_some() => {
            warn!(source = %report.source, run_id = %report.run_id, "scheduled sync aborted")
        }
        SyncOutcome::Completed(report) => {
            info!(source = %report.source, stored = report.stored, "scheduled sync done")
        }
        SyncOutcome::Skipped { source } => info!(source = %source, "scheduled sync skipped"),
    }
    outcome
}

/// Registers one repeating job per source and starts the scheduler. The
/// caller keeps the returned handle alive for as long as jobs should fire.
pub async fn start_scheduler(monitor: Arc<Monitor>, cadence: Cadence) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (source, every) in [
        (ScheduledSource::Security, cadence.security),
        (ScheduledSource::Operational, cadence.operational),
    ] {
        let monitor = monitor.clone();
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let monitor = monitor.clone();
            Box::pin(async move {
                run_scheduled(&monitor, source).await;
            })
        })
        .with_context(|| format!("creating {source:?} sync job every {every:?}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    sched.start().await.context("starting scheduler")?;
    info!(
        security_secs = cadence.security.as_secs(),
        operational_secs = cadence.operational.as_secs(),
        "scheduler started"
    );
    Ok(sched)
}

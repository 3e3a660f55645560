//! Sync orchestration: pipelines per source, the monitor facade the web and
//! CLI layers call into, and the interval scheduler.

pub mod accounts;
pub mod config;
pub mod monitor;
pub mod pipeline;
pub mod scheduler;

pub use accounts::{AccountMap, AccountNameCache, AccountsError, ACCOUNT_CACHE_TTL};
pub use config::{FileConfig, MonitorConfig};
pub use monitor::{
    DashboardSummary, EventsQuery, EventsSummary, FindingsQuery, FindingsSummary, IngestOutcome, Monitor,
    MonitorError, SeverityCounts, Upstreams,
};
pub use pipeline::{PipelineSettings, SyncOutcome, SyncPipeline, SyncReport};
pub use scheduler::{run_scheduled, start_scheduler, Cadence, ScheduledSource};

pub const CRATE_NAME: &str = "vigil-sync";

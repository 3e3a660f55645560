use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "vigil.yaml";

/// Optional YAML layer under the environment. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database_url: Option<String>,
    pub aws_region: Option<String>,
    pub guardduty_regions: Option<Vec<String>>,
    pub guardduty_table: Option<String>,
    pub health_table: Option<String>,
    pub fixtures_dir: Option<PathBuf>,
    pub scheduler_enabled: Option<bool>,
    pub security_sync_minutes: Option<u64>,
    pub operational_sync_minutes: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub upsert_concurrency: Option<usize>,
    pub web_port: Option<u16>,
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `VIGIL_CONFIG` must point at a readable file; otherwise `vigil.yaml`
    /// in the working directory is used when present.
    pub fn discover() -> Result<Self> {
        if let Ok(path) = std::env::var("VIGIL_CONFIG") {
            return Self::load(path);
        }
        let default = Path::new(DEFAULT_CONFIG_FILE);
        if default.exists() {
            return Self::load(default);
        }
        debug!("no config file, using environment and defaults");
        Ok(Self::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// `None` keeps both tables in process memory.
    pub database_url: Option<String>,
    pub aws_region: String,
    pub guardduty_regions: Vec<String>,
    pub guardduty_table: String,
    pub health_table: String,
    pub fixtures_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub security_sync_minutes: u64,
    pub operational_sync_minutes: u64,
    pub fetch_timeout_secs: u64,
    pub upsert_concurrency: usize,
    pub web_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::resolve(FileConfig::default(), |_| None)
    }
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

fn region_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        let file = FileConfig::discover()?;
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Environment wins over the file, the file over built-in defaults.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());
        Self {
            database_url: env("DATABASE_URL")
                .filter(|v| !v.is_empty())
                .or(file.database_url),
            aws_region: env("AWS_REGION")
                .or(file.aws_region)
                .unwrap_or_else(|| "us-east-1".to_string()),
            guardduty_regions: env("GUARDDUTY_REGIONS")
                .map(|v| region_list(&v))
                .or(file.guardduty_regions)
                .unwrap_or_else(|| region_list("ap-northeast-1,us-east-1")),
            guardduty_table: env("DYNAMODB_GUARDDUTY_TABLE")
                .or(file.guardduty_table)
                .unwrap_or_else(|| "aws-monitoring-guardduty-findings".to_string()),
            health_table: env("DYNAMODB_HEALTH_TABLE")
                .or(file.health_table)
                .unwrap_or_else(|| "aws-monitoring-health-events".to_string()),
            fixtures_dir: env("VIGIL_FIXTURES_DIR")
                .map(PathBuf::from)
                .or(file.fixtures_dir)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            scheduler_enabled: env("VIGIL_SCHEDULER_ENABLED")
                .map(|v| flag(&v))
                .or(file.scheduler_enabled)
                .unwrap_or(true),
            security_sync_minutes: parsed("VIGIL_SECURITY_SYNC_MINUTES")
                .or(file.security_sync_minutes)
                .unwrap_or(60)
                .max(1),
            operational_sync_minutes: parsed("VIGIL_OPERATIONAL_SYNC_MINUTES")
                .or(file.operational_sync_minutes)
                .unwrap_or(30)
                .max(1),
            fetch_timeout_secs: parsed("VIGIL_FETCH_TIMEOUT_SECS")
                .or(file.fetch_timeout_secs)
                .unwrap_or(30)
                .max(1),
            upsert_concurrency: env("VIGIL_UPSERT_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .or(file.upsert_concurrency)
                .unwrap_or(8)
                .max(1),
            web_port: env("VIGIL_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .or(file.web_port)
                .unwrap_or(8000),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

//! Upstream fetcher contracts and their fixture-directory implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::FetchError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdPage {
    pub ids: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<JsonValue>,
    pub next_token: Option<String>,
}

/// GuardDuty-shaped API: detectors per region, finding ids by page, then
/// full findings by id.
#[async_trait]
pub trait SecurityFindingFetcher: Send + Sync {
    async fn list_detectors(&self, region: &str) -> Result<Vec<String>, FetchError>;

    async fn list_finding_ids(
        &self,
        region: &str,
        detector_id: &str,
        next_token: Option<&str>,
        max_results: usize,
    ) -> Result<IdPage, FetchError>;

    async fn get_findings(
        &self,
        region: &str,
        detector_id: &str,
        ids: &[String],
    ) -> Result<Vec<JsonValue>, FetchError>;
}

/// Security Hub-shaped API filtered to one product.
#[async_trait]
pub trait OperationalEventFetcher: Send + Sync {
    async fn get_findings(
        &self,
        product_name: &str,
        next_token: Option<&str>,
        max_results: usize,
    ) -> Result<RecordPage, FetchError>;
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Account id -> display name.
    async fn list_accounts(&self) -> Result<BTreeMap<String, String>, FetchError>;
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// `None` when the file does not exist.
async fn read_optional_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "fixture file absent");
        return Ok(None);
    }
    read_json_file(path).await.map(Some)
}

fn offset_from(next_token: Option<&str>) -> Result<usize, FetchError> {
    match next_token {
        None => Ok(0),
        Some(token) => token
            .parse()
            .map_err(|_| FetchError::Upstream(format!("invalid next token {token:?}"))),
    }
}

fn next_token_after(offset: usize, taken: usize, total: usize) -> Option<String> {
    let next = offset + taken;
    (next < total).then(|| next.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionFixture {
    #[serde(default)]
    detector_ids: Vec<String>,
    #[serde(default)]
    findings: Vec<JsonValue>,
}

/// Reads `security/<region>/findings.json`. A region without a directory
/// has no detectors.
#[derive(Debug, Clone)]
pub struct FixtureSecurityFetcher {
    root: PathBuf,
}

impl FixtureSecurityFetcher {
    pub fn new(fixtures_dir: impl AsRef<Path>) -> Self {
        Self {
            root: fixtures_dir.as_ref().join("security"),
        }
    }

    async fn region(&self, region: &str) -> Result<Option<RegionFixture>, FetchError> {
        let dir = self.root.join(region);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(read_json_file(&dir.join("findings.json")).await?))
    }

    async fn detector(&self, region: &str, detector_id: &str) -> Result<RegionFixture, FetchError> {
        match self.region(region).await? {
            Some(fixture) if fixture.detector_ids.iter().any(|d| d == detector_id) => Ok(fixture),
            _ => Err(FetchError::Upstream(format!(
                "detector {detector_id} not found in {region}"
            ))),
        }
    }
}

fn finding_id(finding: &JsonValue) -> Option<&str> {
    finding
        .get("Id")
        .or_else(|| finding.get("id"))
        .and_then(JsonValue::as_str)
}

#[async_trait]
impl SecurityFindingFetcher for FixtureSecurityFetcher {
    async fn list_detectors(&self, region: &str) -> Result<Vec<String>, FetchError> {
        Ok(self
            .region(region)
            .await?
            .map(|fixture| fixture.detector_ids)
            .unwrap_or_default())
    }

    async fn list_finding_ids(
        &self,
        region: &str,
        detector_id: &str,
        next_token: Option<&str>,
        max_results: usize,
    ) -> Result<IdPage, FetchError> {
        let fixture = self.detector(region, detector_id).await?;
        let offset = offset_from(next_token)?;
        let ids = fixture
            .findings
            .iter()
            .filter_map(finding_id)
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let page = ids
            .iter()
            .skip(offset)
            .take(max_results)
            .cloned()
            .collect::<Vec<_>>();
        Ok(IdPage {
            next_token: next_token_after(offset, page.len(), ids.len()),
            ids: page,
        })
    }

    async fn get_findings(
        &self,
        region: &str,
        detector_id: &str,
        ids: &[String],
    ) -> Result<Vec<JsonValue>, FetchError> {
        let fixture = self.detector(region, detector_id).await?;
        Ok(fixture
            .findings
            .into_iter()
            .filter(|f| finding_id(f).is_some_and(|id| ids.iter().any(|want| want == id)))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct FindingsFixture {
    #[serde(default, alias = "Findings")]
    findings: Vec<JsonValue>,
}

/// Reads `operational/findings.json`; a missing file is an empty result.
#[derive(Debug, Clone)]
pub struct FixtureOperationalFetcher {
    path: PathBuf,
}

impl FixtureOperationalFetcher {
    pub fn new(fixtures_dir: impl AsRef<Path>) -> Self {
        Self {
            path: fixtures_dir.as_ref().join("operational").join("findings.json"),
        }
    }
}

#[async_trait]
impl OperationalEventFetcher for FixtureOperationalFetcher {
    async fn get_findings(
        &self,
        product_name: &str,
        next_token: Option<&str>,
        max_results: usize,
    ) -> Result<RecordPage, FetchError> {
        let offset = offset_from(next_token)?;
        let matching = read_optional_json::<FindingsFixture>(&self.path)
            .await?
            .map(|fixture| fixture.findings)
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f.get("ProductName").and_then(JsonValue::as_str) == Some(product_name))
            .collect::<Vec<_>>();
        let total = matching.len();
        let records = matching
            .into_iter()
            .skip(offset)
            .take(max_results)
            .collect::<Vec<_>>();
        Ok(RecordPage {
            next_token: next_token_after(offset, records.len(), total),
            records,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountsFixture {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
}

/// Reads `accounts.json`; entries lacking an id or a name are skipped.
#[derive(Debug, Clone)]
pub struct FixtureAccountDirectory {
    path: PathBuf,
}

impl FixtureAccountDirectory {
    pub fn new(fixtures_dir: impl AsRef<Path>) -> Self {
        Self {
            path: fixtures_dir.as_ref().join("accounts.json"),
        }
    }
}

#[async_trait]
impl AccountDirectory for FixtureAccountDirectory {
    async fn list_accounts(&self) -> Result<BTreeMap<String, String>, FetchError> {
        let Some(fixture) = read_optional_json::<AccountsFixture>(&self.path).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(fixture
            .accounts
            .into_iter()
            .filter_map(|entry| match (entry.id, entry.name) {
                (Some(id), Some(name)) if !id.is_empty() && !name.is_empty() => Some((id, name)),
                _ => None,
            })
            .collect())
    }
}

//! Canonical finding model shared by every Vigil crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod view;

pub const CRATE_NAME: &str = "vigil-core";

/// Partition used when an upstream record carries no account id.
pub const UNKNOWN_ACCOUNT: &str = "unknown";

/// Retention horizon applied on every sync write.
pub const RETENTION_DAYS: i64 = 365;

pub fn expires_at_for(written_at: DateTime<Utc>) -> i64 {
    (written_at + Duration::days(RETENTION_DAYS)).timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    SecurityFinding,
    OperationalEvent,
}

impl ItemKind {
    pub fn sort_key_prefix(self) -> &'static str {
        match self {
            Self::SecurityFinding => "FINDING#",
            Self::OperationalEvent => "EVENT#",
        }
    }

    pub fn sort_key(self, source_id: &str) -> String {
        format!("{}{}", self.sort_key_prefix(), source_id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SecurityFinding => "securityFinding",
            Self::OperationalEvent => "operationalEvent",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid determination value: {0:?}")]
    Determination(String),
    #[error("invalid severity: {0:?}")]
    Severity(String),
    #[error("unknown sort column: {0:?}")]
    SortColumn(String),
}

/// Human review verdict. `Unset` is the explicit empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Determination {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "unreviewed")]
    Unreviewed,
    #[serde(rename = "investigating")]
    Investigating,
    #[serde(rename = "confirmed-issue")]
    ConfirmedIssue,
    #[serde(rename = "no-issue")]
    NoIssue,
}

impl Determination {
    pub const ALL: [Determination; 5] = [
        Self::Unset,
        Self::Unreviewed,
        Self::Investigating,
        Self::ConfirmedIssue,
        Self::NoIssue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Unreviewed => "unreviewed",
            Self::Investigating => "investigating",
            Self::ConfirmedIssue => "confirmed-issue",
            Self::NoIssue => "no-issue",
        }
    }

    pub fn is_set(self) -> bool {
        self != Self::Unset
    }
}

impl FromStr for Determination {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| ValidationError::Determination(s.to_string()))
    }
}

impl fmt::Display for Determination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered severity scale. Operational events carry it as their label;
/// security findings are bucketed onto it from their numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityLevel {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    /// `issue→HIGH, scheduledChange→MEDIUM, accountNotification→INFORMATIONAL, else LOW`.
    pub fn from_event_category(category: &str) -> Self {
        match category {
            "issue" => Self::High,
            "scheduledChange" => Self::Medium,
            "accountNotification" => Self::Informational,
            _ => Self::Low,
        }
    }

    /// Bucket boundaries: >=7 critical, >=4 high, >=2 medium, else low.
    pub fn bucket_for_score(score: f64) -> Self {
        if score >= 7.0 {
            Self::Critical
        } else if score >= 4.0 {
            Self::High
        } else if score >= 2.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Informational => "INFORMATIONAL",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl FromStr for SeverityLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "informational" => Ok(Self::Informational),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(ValidationError::Severity(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Open,
    Closed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Fields whose shape depends on the item kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ItemDetails {
    #[serde(rename_all = "camelCase")]
    SecurityFinding {
        severity: f64,
        confidence: f64,
        archived: bool,
        resource: String,
        service_info: String,
    },
    #[serde(rename_all = "camelCase")]
    OperationalEvent {
        service: String,
        severity: SeverityLevel,
        status_code: EventStatus,
        workflow_status: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl ItemKey {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }

    pub fn for_source(kind: ItemKind, account_id: &str, source_id: &str) -> Self {
        Self::new(account_id, kind.sort_key(source_id))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.sort_key)
    }
}

/// One normalized finding or event, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalItem {
    pub partition_key: String,
    pub sort_key: String,
    pub source_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub type_code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub details: ItemDetails,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub raw_payload: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub determination: Determination,
    #[serde(default)]
    pub expires_at: i64,
}

impl CanonicalItem {
    pub fn kind(&self) -> ItemKind {
        match self.details {
            ItemDetails::SecurityFinding { .. } => ItemKind::SecurityFinding,
            ItemDetails::OperationalEvent { .. } => ItemKind::OperationalEvent,
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.partition_key, &self.sort_key)
    }

    /// Key attribute of the secondary status index.
    pub fn status_code(&self) -> &'static str {
        match &self.details {
            ItemDetails::SecurityFinding { archived: true, .. } => "archived",
            ItemDetails::SecurityFinding { .. } => "active",
            ItemDetails::OperationalEvent { status_code, .. } => status_code.as_str(),
        }
    }

    pub fn severity_level(&self) -> SeverityLevel {
        match &self.details {
            ItemDetails::SecurityFinding { severity, .. } => SeverityLevel::bucket_for_score(*severity),
            ItemDetails::OperationalEvent { severity, .. } => *severity,
        }
    }

    /// Sort weight; findings keep their fine-grained score.
    pub fn severity_rank(&self) -> f64 {
        match &self.details {
            ItemDetails::SecurityFinding { severity, .. } => *severity,
            ItemDetails::OperationalEvent { severity, .. } => f64::from(severity.rank()),
        }
    }

    /// Service name for operational events, empty for findings.
    pub fn service(&self) -> &str {
        match &self.details {
            ItemDetails::OperationalEvent { service, .. } => service,
            ItemDetails::SecurityFinding { .. } => "",
        }
    }

    /// Named attribute lookup used by store-level equality filters.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        match name {
            "accountId" => Some(&self.account_id),
            "region" => Some(&self.region),
            "typeCode" => Some(&self.type_code),
            "service" => match &self.details {
                ItemDetails::OperationalEvent { service, .. } => Some(service),
                ItemDetails::SecurityFinding { .. } => None,
            },
            "statusCode" => Some(self.status_code()),
            "determination" => Some(self.determination.as_str()),
            _ => None,
        }
    }

    pub fn has_annotation(&self) -> bool {
        !self.comment.is_empty() || self.determination.is_set()
    }
}

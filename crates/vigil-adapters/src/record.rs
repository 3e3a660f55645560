//! Raw upstream records as delivered, plus the lookup helpers the normalizer
//! reads them with.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use vigil_core::ItemKind;

/// One GuardDuty-style finding. The API spells fields in PascalCase, the
/// event bus in camelCase; both are accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityFindingRecord {
    pub payload: JsonValue,
}

impl SecurityFindingRecord {
    pub fn new(payload: JsonValue) -> Self {
        Self { payload }
    }

    pub fn source_id(&self) -> Option<&str> {
        json_str(&self.payload, &["Id"]).filter(|id| !id.is_empty())
    }
}

/// Operational health record in one of its two upstream shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationalEventRecord {
    /// Security Hub finding produced by the Health integration.
    Aggregated { payload: JsonValue },
    /// Health event `detail`, with the envelope's account and region as
    /// fallbacks for the fields the detail may omit.
    Direct {
        detail: JsonValue,
        envelope_account: Option<String>,
        envelope_region: Option<String>,
    },
}

impl OperationalEventRecord {
    pub fn aggregated(payload: JsonValue) -> Self {
        Self::Aggregated { payload }
    }

    pub fn source_id(&self) -> Option<&str> {
        let id = match self {
            Self::Aggregated { payload } => json_str(payload, &["Id"]),
            Self::Direct { detail, .. } => json_str(detail, &["eventArn"]),
        };
        id.filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    SecurityFinding(SecurityFindingRecord),
    OperationalEvent(OperationalEventRecord),
}

impl RawRecord {
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::SecurityFinding(_) => ItemKind::SecurityFinding,
            Self::OperationalEvent(_) => ItemKind::OperationalEvent,
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::SecurityFinding(record) => record.source_id(),
            Self::OperationalEvent(record) => record.source_id(),
        }
    }
}

/// EventBridge-style envelope received on the push path.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub detail: JsonValue,
}

pub const GUARDDUTY_EVENT_SOURCE: &str = "aws.guardduty";
pub const HEALTH_EVENT_SOURCE: &str = "aws.health";

impl EventEnvelope {
    /// `None` for sources this system does not track.
    pub fn into_record(self) -> Option<RawRecord> {
        match self.source.as_str() {
            GUARDDUTY_EVENT_SOURCE => Some(RawRecord::SecurityFinding(SecurityFindingRecord::new(
                self.detail,
            ))),
            HEALTH_EVENT_SOURCE => Some(RawRecord::OperationalEvent(
                OperationalEventRecord::Direct {
                    detail: self.detail,
                    envelope_account: self.account,
                    envelope_region: self.region,
                },
            )),
            _ => None,
        }
    }
}

fn lower_first(segment: &str) -> String {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Walks `path`, trying each segment as written and then with its first
/// letter lower-cased.
pub(crate) fn lookup<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match cur.get(*segment) {
            Some(next) => next,
            None => cur.get(lower_first(segment).as_str())?,
        };
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    lookup(value, path)?.as_str()
}

pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    lookup(value, path)?.as_f64()
}

pub(crate) fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    lookup(value, path)?.as_bool()
}

pub(crate) fn json_string(value: &JsonValue, path: &[&str]) -> String {
    json_str(value, path).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_accepts_both_spellings() {
        let pascal = json!({"Service": {"Archived": true}});
        let camel = json!({"service": {"archived": true}});
        assert_eq!(json_bool(&pascal, &["Service", "Archived"]), Some(true));
        assert_eq!(json_bool(&camel, &["Service", "Archived"]), Some(true));
        assert_eq!(json_bool(&camel, &["Service", "Missing"]), None);
    }

    #[test]
    fn envelope_dispatch_by_source() {
        let envelope: EventEnvelope = serde_json::from_value(json!({
            "source": "aws.health",
            "account": "111122223333",
            "detail": {"eventArn": "arn:aws:health:us-east-1::event/EC2/X/1"}
        }))
        .unwrap();
        let record = envelope.into_record().unwrap();
        assert_eq!(record.kind(), ItemKind::OperationalEvent);
        assert_eq!(record.source_id(), Some("arn:aws:health:us-east-1::event/EC2/X/1"));

        let unknown: EventEnvelope =
            serde_json::from_value(json!({"source": "aws.s3", "detail": {}})).unwrap();
        assert!(unknown.into_record().is_none());
    }

    #[test]
    fn empty_id_counts_as_missing() {
        let record = SecurityFindingRecord::new(json!({"Id": ""}));
        assert_eq!(record.source_id(), None);
        let record = OperationalEventRecord::aggregated(json!({"Title": "no id"}));
        assert_eq!(record.source_id(), None);
    }
}

//! Raw record -> canonical item. Pure and total: absent fields become empty
//! strings, zeros or `false`, never errors.

use serde_json::Value as JsonValue;
use vigil_core::{
    CanonicalItem, Determination, EventStatus, ItemDetails, ItemKind, SeverityLevel,
    UNKNOWN_ACCOUNT,
};

use crate::record::{
    json_bool, json_f64, json_str, json_string, lookup, OperationalEventRecord, RawRecord,
    SecurityFindingRecord,
};

pub fn normalize(record: &RawRecord) -> CanonicalItem {
    match record {
        RawRecord::SecurityFinding(finding) => normalize_security_finding(finding),
        RawRecord::OperationalEvent(OperationalEventRecord::Aggregated { payload }) => {
            normalize_aggregated_event(payload)
        }
        RawRecord::OperationalEvent(OperationalEventRecord::Direct {
            detail,
            envelope_account,
            envelope_region,
        }) => normalize_direct_event(detail, envelope_account.as_deref(), envelope_region.as_deref()),
    }
}

/// Service segment of a Health event ARN
/// (`arn:aws:health:REGION::event/SERVICE/TYPE/ID`).
pub fn service_from_arn(arn: &str) -> String {
    arn.split('/')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn partition_for(account_id: &str) -> String {
    if account_id.is_empty() {
        UNKNOWN_ACCOUNT.to_string()
    } else {
        account_id.to_string()
    }
}

/// Serialized sub-object, or an empty string when it is absent.
fn opaque(value: &JsonValue, path: &[&str]) -> String {
    match lookup(value, path) {
        Some(JsonValue::Null) | None => String::new(),
        Some(sub) => sub.to_string(),
    }
}

fn raw(value: &JsonValue) -> String {
    value.to_string()
}

fn normalize_security_finding(record: &SecurityFindingRecord) -> CanonicalItem {
    let p = &record.payload;
    let source_id = json_string(p, &["Id"]);
    let account_id = json_string(p, &["AccountId"]);
    CanonicalItem {
        partition_key: partition_for(&account_id),
        sort_key: ItemKind::SecurityFinding.sort_key(&source_id),
        source_id,
        account_id,
        region: json_string(p, &["Region"]),
        type_code: json_string(p, &["Type"]),
        title: json_string(p, &["Title"]),
        description: json_string(p, &["Description"]),
        details: ItemDetails::SecurityFinding {
            severity: json_f64(p, &["Severity"]).unwrap_or(0.0),
            confidence: json_f64(p, &["Confidence"]).unwrap_or(0.0),
            archived: json_bool(p, &["Service", "Archived"]).unwrap_or(false),
            resource: opaque(p, &["Resource"]),
            service_info: opaque(p, &["Service"]),
        },
        created_at: json_string(p, &["CreatedAt"]),
        updated_at: json_string(p, &["UpdatedAt"]),
        raw_payload: raw(p),
        comment: String::new(),
        determination: Determination::Unset,
        expires_at: 0,
    }
}

fn aggregated_severity(p: &JsonValue) -> SeverityLevel {
    json_str(p, &["Severity", "Label"])
        .and_then(|label| label.parse().ok())
        .unwrap_or_else(|| {
            SeverityLevel::from_event_category(
                json_str(p, &["ProductFields", "HealthEventTypeCategory"]).unwrap_or_default(),
            )
        })
}

fn normalize_aggregated_event(p: &JsonValue) -> CanonicalItem {
    let source_id = json_string(p, &["Id"]);
    let account_id = json_string(p, &["AwsAccountId"]);
    let status = if json_str(p, &["RecordState"]) == Some("ARCHIVED") {
        EventStatus::Closed
    } else {
        EventStatus::Open
    };
    let created_at = json_str(p, &["ProductFields", "HealthEventStartTime"])
        .or_else(|| json_str(p, &["CreatedAt"]))
        .unwrap_or_default()
        .to_string();
    CanonicalItem {
        partition_key: partition_for(&account_id),
        sort_key: ItemKind::OperationalEvent.sort_key(&source_id),
        details: ItemDetails::OperationalEvent {
            service: service_from_arn(&source_id),
            severity: aggregated_severity(p),
            status_code: status,
            workflow_status: json_string(p, &["Workflow", "Status"]),
        },
        source_id,
        account_id,
        region: json_string(p, &["Region"]),
        type_code: json_string(p, &["GeneratorId"]),
        title: json_string(p, &["Title"]),
        description: json_string(p, &["Description"]),
        created_at,
        updated_at: json_string(p, &["UpdatedAt"]),
        raw_payload: raw(p),
        comment: String::new(),
        determination: Determination::Unset,
        expires_at: 0,
    }
}

fn normalize_direct_event(
    d: &JsonValue,
    envelope_account: Option<&str>,
    envelope_region: Option<&str>,
) -> CanonicalItem {
    let source_id = json_string(d, &["eventArn"]);
    let account_id = json_str(d, &["affectedAccount"])
        .filter(|a| !a.is_empty())
        .or(envelope_account)
        .unwrap_or_default()
        .to_string();
    let region = json_str(d, &["eventRegion"])
        .filter(|r| !r.is_empty())
        .or(envelope_region)
        .unwrap_or_default()
        .to_string();
    let status = if json_str(d, &["statusCode"]) == Some("closed") {
        EventStatus::Closed
    } else {
        EventStatus::Open
    };
    let description = d
        .get("eventDescription")
        .and_then(|descriptions| descriptions.get(0))
        .and_then(|first| first.get("latestDescription"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let type_code = json_string(d, &["eventTypeCode"]);
    CanonicalItem {
        partition_key: partition_for(&account_id),
        sort_key: ItemKind::OperationalEvent.sort_key(&source_id),
        details: ItemDetails::OperationalEvent {
            service: service_from_arn(&source_id),
            severity: SeverityLevel::from_event_category(
                json_str(d, &["eventTypeCategory"]).unwrap_or_default(),
            ),
            status_code: status,
            workflow_status: String::new(),
        },
        source_id,
        account_id,
        region,
        title: type_code.clone(),
        type_code,
        description,
        created_at: json_string(d, &["startTime"]),
        updated_at: json_string(d, &["lastUpdatedTime"]),
        raw_payload: raw(d),
        comment: String::new(),
        determination: Determination::Unset,
        expires_at: 0,
    }
}

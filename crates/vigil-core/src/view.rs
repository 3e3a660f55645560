//! Consumer-side filtering, sorting and page slicing over already-fetched items.
//!
//! The store only orders by key. Anything the reader sorts by here is sorted
//! over the items fetched so far; a globally correct order needs the caller to
//! have drained the cursor chain first.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::{CanonicalItem, SeverityLevel, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortColumn {
    #[default]
    CreatedAt,
    UpdatedAt,
    Severity,
    Account,
    Region,
    Title,
    TypeCode,
}

impl FromStr for SortColumn {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "createdAt" | "startTime" | "created" => Ok(Self::CreatedAt),
            "updatedAt" | "lastUpdatedTime" | "updated" => Ok(Self::UpdatedAt),
            "severity" => Ok(Self::Severity),
            "accountId" | "account" => Ok(Self::Account),
            "region" => Ok(Self::Region),
            "title" => Ok(Self::Title),
            "type" | "typeCode" | "eventTypeCode" => Ok(Self::TypeCode),
            other => Err(ValidationError::SortColumn(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    pub severity: Option<SeverityLevel>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub sort: SortColumn,
    pub descending: bool,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ViewPage {
    pub items: Vec<CanonicalItem>,
    pub matched: usize,
    pub page: usize,
    pub total_pages: usize,
}

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn in_range(item: &CanonicalItem, opts: &ViewOptions) -> bool {
    if opts.from.is_none() && opts.to.is_none() {
        return true;
    }
    let Some(ts) = parse_ts(&item.created_at) else {
        return false;
    };
    opts.from.map_or(true, |from| ts >= from) && opts.to.map_or(true, |to| ts <= to)
}

fn compare(a: &CanonicalItem, b: &CanonicalItem, column: SortColumn) -> Ordering {
    let primary = match column {
        SortColumn::CreatedAt => parse_ts(&a.created_at).cmp(&parse_ts(&b.created_at)),
        SortColumn::UpdatedAt => parse_ts(&a.updated_at).cmp(&parse_ts(&b.updated_at)),
        SortColumn::Severity => a
            .severity_rank()
            .partial_cmp(&b.severity_rank())
            .unwrap_or(Ordering::Equal),
        SortColumn::Account => a.account_id.cmp(&b.account_id),
        SortColumn::Region => a.region.cmp(&b.region),
        SortColumn::Title => a.title.cmp(&b.title),
        SortColumn::TypeCode => a.type_code.cmp(&b.type_code),
    };
    primary.then_with(|| a.key().cmp(&b.key()))
}

pub fn apply_view(items: &[CanonicalItem], opts: &ViewOptions) -> ViewPage {
    let mut filtered = items
        .iter()
        .filter(|item| opts.severity.map_or(true, |s| item.severity_level() == s))
        .filter(|item| in_range(item, opts))
        .cloned()
        .collect::<Vec<_>>();

    filtered.sort_by(|a, b| {
        let ord = compare(a, b, opts.sort);
        if opts.descending {
            ord.reverse()
        } else {
            ord
        }
    });

    let matched = filtered.len();
    let per_page = opts.per_page.unwrap_or(matched.max(1)).max(1);
    let total_pages = matched.max(1).div_ceil(per_page);
    let page = opts.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let items = filtered.into_iter().skip(start).take(per_page).collect();

    ViewPage {
        items,
        matched,
        page,
        total_pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Determination, ItemDetails, ItemKind};

    fn finding(id: &str, severity: f64, created_at: &str) -> CanonicalItem {
        CanonicalItem {
            partition_key: "123456789012".into(),
            sort_key: ItemKind::SecurityFinding.sort_key(id),
            source_id: id.into(),
            account_id: "123456789012".into(),
            region: "us-east-1".into(),
            type_code: "Recon:EC2/PortProbeUnprotectedPort".into(),
            title: format!("finding {id}"),
            description: String::new(),
            details: ItemDetails::SecurityFinding {
                severity,
                confidence: 0.0,
                archived: false,
                resource: "null".into(),
                service_info: "null".into(),
            },
            created_at: created_at.into(),
            updated_at: created_at.into(),
            raw_payload: "{}".into(),
            comment: String::new(),
            determination: Determination::Unset,
            expires_at: 0,
        }
    }

    fn ids(page: &ViewPage) -> Vec<&str> {
        page.items.iter().map(|i| i.source_id.as_str()).collect()
    }

    #[test]
    fn severity_filter_and_descending_sort() {
        let items = vec![
            finding("a", 8.5, "2026-01-03T00:00:00Z"),
            finding("b", 5.0, "2026-01-01T00:00:00Z"),
            finding("c", 7.2, "2026-01-02T00:00:00Z"),
        ];
        let page = apply_view(
            &items,
            &ViewOptions {
                severity: Some(SeverityLevel::Critical),
                sort: SortColumn::Severity,
                descending: true,
                ..Default::default()
            },
        );
        assert_eq!(ids(&page), vec!["a", "c"]);
        assert_eq!(page.matched, 2);
    }

    #[test]
    fn date_range_excludes_unparseable_timestamps() {
        let items = vec![
            finding("a", 1.0, "2026-01-03T00:00:00Z"),
            finding("b", 1.0, ""),
            finding("c", 1.0, "2026-01-10T00:00:00Z"),
        ];
        let page = apply_view(
            &items,
            &ViewOptions {
                from: parse_ts("2026-01-01T00:00:00Z"),
                to: parse_ts("2026-01-05T00:00:00Z"),
                ..Default::default()
            },
        );
        assert_eq!(ids(&page), vec!["a"]);
    }

    #[test]
    fn page_is_clamped_to_range() {
        let items = (0..5)
            .map(|i| finding(&format!("f{i}"), 1.0, &format!("2026-01-0{}T00:00:00Z", i + 1)))
            .collect::<Vec<_>>();
        let page = apply_view(
            &items,
            &ViewOptions {
                page: Some(9),
                per_page: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.page, 3);
        assert_eq!(ids(&page), vec!["f4"]);
    }

    #[test]
    fn sort_column_aliases_and_unknown_names() {
        assert_eq!("startTime".parse::<SortColumn>(), Ok(SortColumn::CreatedAt));
        assert_eq!("account".parse::<SortColumn>(), Ok(SortColumn::Account));
        assert_eq!(
            "colour".parse::<SortColumn>(),
            Err(ValidationError::SortColumn("colour".to_string()))
        );
    }
}

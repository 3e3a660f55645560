//! Partitioned item tables, merge-preserving upserts and paginated reads for Vigil.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use vigil_core::{CanonicalItem, Determination, ItemKey};

pub mod annotate;
pub mod memory;
pub mod merge;
pub mod postgres;
pub mod query;

pub use annotate::{AnnotateError, AnnotationUpdater};
pub use memory::MemoryTable;
pub use merge::{MergingStore, UpsertOutcome};
pub use postgres::PgTable;
pub use query::{ItemPage, ListRequest, QueryEngine};

pub const CRATE_NAME: &str = "vigil-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("item serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

/// Opaque continuation token handed to callers between pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Last-returned position inside a table ordering. Index queries also carry
/// the index attributes so the next page can resume inside the index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationKey {
    pub pk: String,
    pub sk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_time: Option<String>,
}

impl ContinuationKey {
    pub fn for_key(item: &CanonicalItem) -> Self {
        Self {
            pk: item.partition_key.clone(),
            sk: item.sort_key.clone(),
            status_code: None,
            sort_time: None,
        }
    }

    pub fn for_index(item: &CanonicalItem) -> Self {
        Self {
            status_code: Some(item.status_code().to_string()),
            sort_time: Some(item.created_at.clone()),
            ..Self::for_key(item)
        }
    }

    pub fn encode(&self) -> Result<Cursor, StoreError> {
        let json = serde_json::to_vec(self)?;
        Ok(Cursor(URL_SAFE_NO_PAD.encode(json)))
    }

    /// `None` for tokens that do not decode; callers restart from the beginning.
    pub fn decode(cursor: &Cursor) -> Option<Self> {
        let bytes = match URL_SAFE_NO_PAD.decode(cursor.as_str()) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(%err, "discarding undecodable cursor");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(key) => Some(key),
            Err(err) => {
                debug!(%err, "discarding malformed cursor payload");
                None
            }
        }
    }
}

/// Equality filter on one named item attribute, evaluated before the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrFilter {
    pub attribute: String,
    pub value: String,
}

impl AttrFilter {
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, item: &CanonicalItem) -> bool {
        item.attribute(&self.attribute) == Some(self.value.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<Cursor>,
    pub filter: Option<AttrFilter>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<CanonicalItem>,
    pub next_cursor: Option<Cursor>,
}

/// Partial annotation write. `None` leaves the stored field untouched,
/// `Some("")` / `Some(Determination::Unset)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationPatch {
    pub comment: Option<String>,
    pub determination: Option<Determination>,
}

impl AnnotationPatch {
    pub fn is_empty(&self) -> bool {
        self.comment.is_none() && self.determination.is_none()
    }

    pub fn apply_to(&self, item: &mut CanonicalItem) {
        if let Some(comment) = &self.comment {
            item.comment = comment.clone();
        }
        if let Some(determination) = self.determination {
            item.determination = determination;
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let Some(comment) = &self.comment {
            map.insert("comment".into(), comment.clone().into());
        }
        if let Some(determination) = self.determination {
            map.insert("determination".into(), determination.as_str().into());
        }
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Applied,
    Missing,
}

/// Key-value table contract: point reads and writes by `(pk, sk)`, a
/// partition query, one secondary index on the status code and a full scan.
/// Every list operation passes continuation cursors through.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn table_name(&self) -> &str;

    async fn get(&self, key: &ItemKey) -> Result<Option<CanonicalItem>, StoreError>;

    async fn put(&self, item: &CanonicalItem) -> Result<(), StoreError>;

    /// Conditional on the row existing; a missing row is never created.
    async fn update_annotation(
        &self,
        key: &ItemKey,
        patch: &AnnotationPatch,
    ) -> Result<UpdateResult, StoreError>;

    /// Rows of one partition whose sort key starts with `sort_key_prefix`,
    /// sort key descending.
    async fn query_partition(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
        request: &PageRequest,
    ) -> Result<Page, StoreError>;

    /// Rows whose status code equals `status_code`, newest `createdAt` first.
    async fn query_index(&self, status_code: &str, request: &PageRequest)
        -> Result<Page, StoreError>;

    /// Every row, ordered by `(pk, sk)` ascending.
    async fn scan(&self, request: &PageRequest) -> Result<Page, StoreError>;
}

/// Fill one page from rows already positioned after the cursor. One extra
/// row is looked at so the last page never hands out a dangling cursor.
pub(crate) fn fill_page<'a, I>(
    rows: I,
    request: &PageRequest,
    position: fn(&CanonicalItem) -> ContinuationKey,
) -> Result<Page, StoreError>
where
    I: IntoIterator<Item = &'a CanonicalItem>,
{
    let limit = request.limit.max(1);
    let mut items = rows
        .into_iter()
        .filter(|item| request.filter.as_ref().map_or(true, |f| f.matches(item)))
        .take(limit + 1)
        .cloned()
        .collect::<Vec<_>>();
    let next_cursor = if items.len() > limit {
        items.truncate(limit);
        match items.last() {
            Some(last) => Some(position(last).encode()?),
            None => None,
        }
    } else {
        None
    };
    Ok(Page { items, next_cursor })
}

//! Picks the access pattern for a listing and pages through it.

use std::sync::Arc;

use tracing::debug;
use vigil_core::{CanonicalItem, ItemKind};

use crate::{AttrFilter, Cursor, PageRequest, StoreError, TableStore};

pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub partition_key: Option<String>,
    pub status: Option<String>,
    pub filter: Option<AttrFilter>,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPage {
    pub items: Vec<CanonicalItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

pub struct QueryEngine {
    table: Arc<dyn TableStore>,
    kind: ItemKind,
}

impl QueryEngine {
    pub fn for_kind(table: Arc<dyn TableStore>, kind: ItemKind) -> Self {
        Self { table, kind }
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// A partition key wins over a status; with neither the table is scanned.
    /// The limit is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list(&self, request: ListRequest) -> Result<ItemPage, StoreError> {
        let page_request = PageRequest {
            limit: request.limit.clamp(1, MAX_PAGE_SIZE),
            cursor: request.cursor,
            filter: request.filter,
        };
        let page = match (&request.partition_key, &request.status) {
            (Some(pk), _) => {
                debug!(table = self.table.table_name(), pk, "partition query");
                self.table
                    .query_partition(pk, self.kind.sort_key_prefix(), &page_request)
                    .await?
            }
            (None, Some(status)) => {
                debug!(table = self.table.table_name(), status, "index query");
                self.table.query_index(status, &page_request).await?
            }
            (None, None) => {
                debug!(table = self.table.table_name(), "table scan");
                self.table.scan(&page_request).await?
            }
        };
        Ok(ItemPage {
            items: page.items,
            next_cursor: page.next_cursor,
        })
    }

    /// Follow the cursor chain to the end.
    pub async fn list_all(&self, mut request: ListRequest) -> Result<Vec<CanonicalItem>, StoreError> {
        let mut items = Vec::new();
        loop {
            let page = self.list(request.clone()).await?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) => request.cursor = Some(next),
                None => return Ok(items),
            }
        }
    }
}

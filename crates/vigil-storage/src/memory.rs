//! In-process table backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use vigil_core::{CanonicalItem, ItemKey};

use crate::{
    fill_page, AnnotationPatch, ContinuationKey, Page, PageRequest, StoreError, TableStore,
    UpdateResult,
};

#[derive(Debug)]
pub struct MemoryTable {
    name: String,
    rows: RwLock<BTreeMap<ItemKey, CanonicalItem>>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    fn resume_after(request: &PageRequest) -> Option<ContinuationKey> {
        request.cursor.as_ref().and_then(ContinuationKey::decode)
    }
}

fn index_position(item: &CanonicalItem) -> (&str, &str, &str) {
    (&item.created_at, &item.partition_key, &item.sort_key)
}

#[async_trait]
impl TableStore for MemoryTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<CanonicalItem>, StoreError> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn put(&self, item: &CanonicalItem) -> Result<(), StoreError> {
        self.rows.write().await.insert(item.key(), item.clone());
        Ok(())
    }

    async fn update_annotation(
        &self,
        key: &ItemKey,
        patch: &AnnotationPatch,
    ) -> Result<UpdateResult, StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(key) {
            Some(item) => {
                patch.apply_to(item);
                Ok(UpdateResult::Applied)
            }
            None => Ok(UpdateResult::Missing),
        }
    }

    async fn query_partition(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
        request: &PageRequest,
    ) -> Result<Page, StoreError> {
        let after = Self::resume_after(request);
        let rows = self.rows.read().await;
        let start = ItemKey::new(partition_key, "");
        let mut candidates = rows
            .range(start..)
            .take_while(|(key, _)| key.partition_key == partition_key)
            .filter(|(key, _)| key.sort_key.starts_with(sort_key_prefix))
            .map(|(_, item)| item)
            .filter(|item| after.as_ref().map_or(true, |c| item.sort_key < c.sk))
            .collect::<Vec<_>>();
        candidates.reverse();
        fill_page(candidates, request, ContinuationKey::for_key)
    }

    async fn query_index(
        &self,
        status_code: &str,
        request: &PageRequest,
    ) -> Result<Page, StoreError> {
        let after = Self::resume_after(request);
        let rows = self.rows.read().await;
        let mut candidates = rows
            .values()
            .filter(|item| item.status_code() == status_code)
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| index_position(b).cmp(&index_position(a)));
        let candidates = candidates.into_iter().filter(|item| match &after {
            Some(c) => {
                let resume = (
                    c.sort_time.as_deref().unwrap_or_default(),
                    c.pk.as_str(),
                    c.sk.as_str(),
                );
                index_position(item) < resume
            }
            None => true,
        });
        fill_page(candidates, request, ContinuationKey::for_index)
    }

    async fn scan(&self, request: &PageRequest) -> Result<Page, StoreError> {
        let resume = Self::resume_after(request).map(|c| ItemKey::new(c.pk, c.sk));
        let rows = self.rows.read().await;
        let candidates = rows
            .iter()
            .filter(|(key, _)| resume.as_ref().map_or(true, |r| *key > r))
            .map(|(_, item)| item);
        fill_page(candidates, request, ContinuationKey::for_key)
    }
}

//! Merge-preserving writes on top of a [`TableStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use vigil_core::{expires_at_for, CanonicalItem, ItemKey};

use crate::{AnnotationPatch, StoreError, TableStore, UpdateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated { preserved_annotation: bool },
}

type LockMap = HashMap<ItemKey, Arc<Mutex<()>>>;

/// One async lock per key currently being upserted. Entries are dropped as
/// soon as nobody else holds or waits on them.
#[derive(Debug, Default)]
struct KeyLocks {
    inner: StdMutex<LockMap>,
}

impl KeyLocks {
    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, key: &ItemKey) -> KeyLockEntry<'_> {
        let lock = self
            .map()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyLockEntry {
            locks: self,
            key: key.clone(),
            lock,
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.map().len()
    }
}

/// A caller's claim on a key's lock. Dropping it, including when the
/// owning future is cancelled, removes the map entry once unused.
struct KeyLockEntry<'a> {
    locks: &'a KeyLocks,
    key: ItemKey,
    lock: Arc<Mutex<()>>,
}

impl KeyLockEntry<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for KeyLockEntry<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.map();
        // the map's copy plus ours
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.key);
        }
    }
}

pub struct MergingStore {
    table: Arc<dyn TableStore>,
    locks: KeyLocks,
}

impl std::fmt::Debug for MergingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergingStore")
            .field("table", &self.table.table_name())
            .finish()
    }
}

impl MergingStore {
    pub fn new(table: Arc<dyn TableStore>) -> Self {
        Self {
            table,
            locks: KeyLocks::default(),
        }
    }

    pub fn table(&self) -> &Arc<dyn TableStore> {
        &self.table
    }

    pub fn table_name(&self) -> &str {
        self.table.table_name()
    }

    pub async fn upsert(&self, item: CanonicalItem) -> Result<UpsertOutcome, StoreError> {
        self.upsert_at(item, Utc::now()).await
    }

    /// Read-modify-write under the key's lock: carry the stored comment and
    /// determination forward unless the incoming item sets its own, refresh
    /// the retention horizon, then overwrite the row.
    pub async fn upsert_at(
        &self,
        mut item: CanonicalItem,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = item.key();
        let entry = self.locks.entry(&key);
        let held = entry.lock().await;
        let outcome = self.merge_and_put(&key, &mut item, now).await;
        drop(held);
        outcome
    }

    async fn merge_and_put(
        &self,
        key: &ItemKey,
        item: &mut CanonicalItem,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcome = match self.table.get(key).await? {
            None => UpsertOutcome::Created,
            Some(existing) => {
                let mut preserved_annotation = false;
                if item.comment.is_empty() && !existing.comment.is_empty() {
                    item.comment = existing.comment;
                    preserved_annotation = true;
                }
                if !item.determination.is_set() && existing.determination.is_set() {
                    item.determination = existing.determination;
                    preserved_annotation = true;
                }
                UpsertOutcome::Updated {
                    preserved_annotation,
                }
            }
        };
        item.expires_at = expires_at_for(now);
        self.table.put(item).await?;
        debug!(table = self.table.table_name(), %key, ?outcome, "upserted item");
        Ok(outcome)
    }

    pub async fn get_by_id(&self, key: &ItemKey) -> Result<Option<CanonicalItem>, StoreError> {
        self.table.get(key).await
    }

    /// Unlocked partial write; a concurrent upsert on the same row is
    /// last-write-wins.
    pub async fn update_annotation(
        &self,
        key: &ItemKey,
        patch: &AnnotationPatch,
    ) -> Result<UpdateResult, StoreError> {
        if patch.is_empty() {
            return Ok(UpdateResult::Applied);
        }
        self.table.update_annotation(key, patch).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::task::JoinSet;
    use vigil_core::{Determination, ItemDetails, ItemKind};

    use super::*;
    use crate::{MemoryTable, Page, PageRequest};

    fn finding(account: &str, id: &str, title: &str) -> CanonicalItem {
        CanonicalItem {
            partition_key: account.into(),
            sort_key: ItemKind::SecurityFinding.sort_key(id),
            source_id: id.into(),
            account_id: account.into(),
            region: "ap-northeast-1".into(),
            type_code: "UnauthorizedAccess:EC2/SSHBruteForce".into(),
            title: title.into(),
            description: "desc".into(),
            details: ItemDetails::SecurityFinding {
                severity: 5.0,
                confidence: 8.0,
                archived: false,
                resource: "{}".into(),
                service_info: "{}".into(),
            },
            created_at: "2026-02-01T00:00:00Z".into(),
            updated_at: "2026-02-01T00:00:00Z".into(),
            raw_payload: "{}".into(),
            comment: String::new(),
            determination: Determination::Unset,
            expires_at: 0,
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn store() -> (Arc<MemoryTable>, MergingStore) {
        let table = Arc::new(MemoryTable::new("findings"));
        (table.clone(), MergingStore::new(table))
    }

    #[tokio::test]
    async fn resync_preserves_annotation_and_refreshes_everything_else() {
        let (table, store) = store();
        let first = finding("111122223333", "f-1", "old title");
        let key = first.key();
        store.upsert_at(first, ts("2026-02-01T00:00:00Z")).await.unwrap();
        store
            .update_annotation(
                &key,
                &AnnotationPatch {
                    comment: Some("known scanner".into()),
                    determination: Some(Determination::NoIssue),
                },
            )
            .await
            .unwrap();

        let mut refreshed = finding("111122223333", "f-1", "new title");
        refreshed.updated_at = "2026-03-01T00:00:00Z".into();
        let outcome = store
            .upsert_at(refreshed, ts("2026-03-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Updated {
                preserved_annotation: true
            }
        );

        let stored = table.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.comment, "known scanner");
        assert_eq!(stored.determination, Determination::NoIssue);
        assert_eq!(stored.title, "new title");
        assert_eq!(stored.updated_at, "2026-03-01T00:00:00Z");
        assert_eq!(stored.expires_at, expires_at_for(ts("2026-03-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn incoming_annotation_wins_over_stored_one() {
        let (table, store) = store();
        let mut first = finding("a", "f-1", "t");
        first.comment = "old".into();
        store.upsert(first).await.unwrap();

        let mut second = finding("a", "f-1", "t");
        second.comment = "new".into();
        store.upsert(second).await.unwrap();

        let stored = table.get(&ItemKey::new("a", "FINDING#f-1")).await.unwrap().unwrap();
        assert_eq!(stored.comment, "new");
    }

    #[tokio::test]
    async fn upserting_twice_is_idempotent() {
        let (table, store) = store();
        let now = ts("2026-02-01T00:00:00Z");
        let item = finding("a", "f-1", "t");
        assert_eq!(store.upsert_at(item.clone(), now).await.unwrap(), UpsertOutcome::Created);
        let once = table.get(&item.key()).await.unwrap();
        store.upsert_at(item.clone(), now).await.unwrap();
        let twice = table.get(&item.key()).await.unwrap();
        assert_eq!(table.len().await, 1);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn empty_patch_is_a_no_op() {
        let (table, store) = store();
        let result = store
            .update_annotation(&ItemKey::new("x", "FINDING#y"), &AnnotationPatch::default())
            .await
            .unwrap();
        assert_eq!(result, UpdateResult::Applied);
        assert!(table.is_empty().await);
    }

    /// Tracks how many upserts sit between their read and their write.
    struct OverlapTracker {
        inner: MemoryTable,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl TableStore for OverlapTracker {
        fn table_name(&self) -> &str {
            self.inner.table_name()
        }

        async fn get(&self, key: &ItemKey) -> Result<Option<CanonicalItem>, StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.inner.get(key).await
        }

        async fn put(&self, item: &CanonicalItem) -> Result<(), StoreError> {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.put(item).await
        }

        async fn update_annotation(
            &self,
            key: &ItemKey,
            patch: &AnnotationPatch,
        ) -> Result<UpdateResult, StoreError> {
            self.inner.update_annotation(key, patch).await
        }

        async fn query_partition(
            &self,
            partition_key: &str,
            sort_key_prefix: &str,
            request: &PageRequest,
        ) -> Result<Page, StoreError> {
            self.inner.query_partition(partition_key, sort_key_prefix, request).await
        }

        async fn query_index(
            &self,
            status_code: &str,
            request: &PageRequest,
        ) -> Result<Page, StoreError> {
            self.inner.query_index(status_code, request).await
        }

        async fn scan(&self, request: &PageRequest) -> Result<Page, StoreError> {
            self.inner.scan(request).await
        }
    }

    fn tracker() -> Arc<OverlapTracker> {
        Arc::new(OverlapTracker {
            inner: MemoryTable::new("findings"),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn same_key_upserts_are_serialized() {
        let table = tracker();
        let store = Arc::new(MergingStore::new(table.clone()));
        let mut tasks = JoinSet::new();
        for n in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .upsert(finding("a", "dup", &format!("title {n}")))
                    .await
                    .unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        assert_eq!(table.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(table.inner.len().await, 1);
        assert_eq!(store.locks.tracked(), 0);
    }

    #[tokio::test]
    async fn distinct_key_upserts_overlap() {
        let table = tracker();
        let store = Arc::new(MergingStore::new(table.clone()));
        let mut tasks = JoinSet::new();
        for n in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                store.upsert(finding("a", &format!("f-{n}"), "t")).await.unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        assert!(table.max_in_flight.load(Ordering::SeqCst) > 1);
        assert_eq!(table.inner.len().await, 8);
    }

    /// Parks the first `get` until released, so a write can slip in between
    /// an upsert's read and its put.
    struct ParkedRead {
        inner: MemoryTable,
        parked: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TableStore for ParkedRead {
        fn table_name(&self) -> &str {
            self.inner.table_name()
        }

        async fn get(&self, key: &ItemKey) -> Result<Option<CanonicalItem>, StoreError> {
            let snapshot = self.inner.get(key).await;
            if !self.parked.swap(true, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            snapshot
        }

        async fn put(&self, item: &CanonicalItem) -> Result<(), StoreError> {
            self.inner.put(item).await
        }

        async fn update_annotation(
            &self,
            key: &ItemKey,
            patch: &AnnotationPatch,
        ) -> Result<UpdateResult, StoreError> {
            self.inner.update_annotation(key, patch).await
        }

        async fn query_partition(
            &self,
            partition_key: &str,
            sort_key_prefix: &str,
            request: &PageRequest,
        ) -> Result<Page, StoreError> {
            self.inner.query_partition(partition_key, sort_key_prefix, request).await
        }

        async fn query_index(
            &self,
            status_code: &str,
            request: &PageRequest,
        ) -> Result<Page, StoreError> {
            self.inner.query_index(status_code, request).await
        }

        async fn scan(&self, request: &PageRequest) -> Result<Page, StoreError> {
            self.inner.scan(request).await
        }
    }

    #[tokio::test]
    async fn annotation_racing_an_upsert_is_last_write_wins() {
        let table = Arc::new(ParkedRead {
            inner: MemoryTable::new("findings"),
            parked: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        });
        let seed = finding("a", "f-1", "t");
        let key = seed.key();
        table.inner.put(&seed).await.unwrap();

        let store = Arc::new(MergingStore::new(table.clone()));
        let syncing = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert(finding("a", "f-1", "t2")).await })
        };

        table.reached.notified().await;
        let written = store
            .update_annotation(
                &key,
                &AnnotationPatch {
                    comment: Some("triaged".into()),
                    determination: Some(Determination::Investigating),
                },
            )
            .await
            .unwrap();
        assert_eq!(written, UpdateResult::Applied);
        table.release.notify_one();
        syncing.await.unwrap().unwrap();

        // The upsert read the row before the annotation landed, so its put wins.
        let stored = table.inner.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.title, "t2");
        assert_eq!(stored.comment, "");
        assert_eq!(stored.determination, Determination::Unset);
    }

    #[tokio::test]
    async fn cancelled_upsert_releases_its_key_lock() {
        let table = Arc::new(ParkedRead {
            inner: MemoryTable::new("findings"),
            parked: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        });
        let store = Arc::new(MergingStore::new(table.clone()));
        let upserting = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert(finding("a", "f-1", "t")).await })
        };

        table.reached.notified().await;
        assert_eq!(store.locks.tracked(), 1);
        upserting.abort();
        assert!(upserting.await.unwrap_err().is_cancelled());
        assert_eq!(store.locks.tracked(), 0);

        // the key is usable again
        store.upsert(finding("a", "f-1", "t2")).await.unwrap();
        assert_eq!(store.locks.tracked(), 0);
        assert_eq!(table.inner.len().await, 1);
    }
}

//! Account id -> name lookup with a TTL and single-flight refresh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use vigil_adapters::{bounded, AccountDirectory};

pub const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

pub type AccountMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Error)]
pub enum AccountsError {
    #[error("account directory refresh failed: {0}")]
    Refresh(String),
    #[error("account directory refresh was cancelled")]
    Cancelled,
}

type Waiter = oneshot::Sender<Result<Arc<AccountMap>, AccountsError>>;

enum CacheState {
    Empty,
    Ready {
        accounts: Arc<AccountMap>,
        expires_at: Instant,
    },
    Loading(Vec<Waiter>),
}

pub struct AccountNameCache {
    directory: Arc<dyn AccountDirectory>,
    ttl: Duration,
    fetch_timeout: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl AccountNameCache {
    pub fn new(directory: Arc<dyn AccountDirectory>, fetch_timeout: Duration) -> Self {
        Self::with_ttl(directory, ACCOUNT_CACHE_TTL, fetch_timeout)
    }

    pub fn with_ttl(directory: Arc<dyn AccountDirectory>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            directory,
            ttl,
            fetch_timeout,
            state: Arc::new(Mutex::new(CacheState::Empty)),
        }
    }

    /// Cached map while it is fresh and non-empty. Otherwise every caller
    /// waits on one shared refresh. The refresh runs on its own task so a
    /// dropped caller cannot strand the others.
    pub async fn get(&self) -> Result<Arc<AccountMap>, AccountsError> {
        let rx = {
            let mut state = self.state.lock().await;
            match &mut *state {
                CacheState::Ready {
                    accounts,
                    expires_at,
                } if Instant::now() < *expires_at && !accounts.is_empty() => {
                    return Ok(accounts.clone());
                }
                CacheState::Loading(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    *state = CacheState::Loading(vec![tx]);
                    self.spawn_refresh();
                    rx
                }
            }
        };
        rx.await.map_err(|_| AccountsError::Cancelled)?
    }

    fn spawn_refresh(&self) {
        let directory = self.directory.clone();
        let state = self.state.clone();
        let ttl = self.ttl;
        let fetch_timeout = self.fetch_timeout;
        tokio::spawn(async move {
            // a failed or timed out refresh leaves the state empty for the next caller
            let result = bounded("ListAccounts", fetch_timeout, directory.list_accounts()).await;
            let mut state = state.lock().await;
            let waiters = match std::mem::replace(&mut *state, CacheState::Empty) {
                CacheState::Loading(waiters) => waiters,
                _ => Vec::new(),
            };
            let outcome = match result {
                Ok(accounts) => {
                    let accounts = Arc::new(accounts);
                    info!(accounts = accounts.len(), "account directory refreshed");
                    *state = CacheState::Ready {
                        accounts: accounts.clone(),
                        expires_at: Instant::now() + ttl,
                    };
                    Ok(accounts)
                }
                Err(err) => {
                    warn!(error = %err, "account directory refresh failed");
                    Err(AccountsError::Refresh(err.to_string()))
                }
            };
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::task::JoinSet;
    use vigil_adapters::FetchError;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct CountingDirectory {
        calls: AtomicUsize,
        fail: bool,
        empty: bool,
    }

    impl CountingDirectory {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                empty: false,
            }
        }
    }

    #[async_trait]
    impl AccountDirectory for CountingDirectory {
        async fn list_accounts(&self) -> Result<AccountMap, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(FetchError::Upstream("AccessDeniedException".into()));
            }
            let mut map = AccountMap::new();
            if !self.empty {
                map.insert("111122223333".into(), "production".into());
            }
            Ok(map)
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let directory = Arc::new(CountingDirectory::new());
        let cache = Arc::new(AccountNameCache::new(directory.clone(), TEST_TIMEOUT));
        let mut callers = JoinSet::new();
        for _ in 0..10 {
            let cache = cache.clone();
            callers.spawn(async move { cache.get().await });
        }
        while let Some(joined) = callers.join_next().await {
            let accounts = joined.unwrap().unwrap();
            assert_eq!(accounts["111122223333"], "production");
        }
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        cache.get().await.unwrap();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_or_empty_maps_are_refetched() {
        let directory = Arc::new(CountingDirectory::new());
        let cache = AccountNameCache::with_ttl(directory.clone(), Duration::ZERO, TEST_TIMEOUT);
        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);

        let empty = Arc::new(CountingDirectory {
            empty: true,
            ..CountingDirectory::new()
        });
        let cache = AccountNameCache::new(empty.clone(), TEST_TIMEOUT);
        assert!(cache.get().await.unwrap().is_empty());
        assert!(cache.get().await.unwrap().is_empty());
        assert_eq!(empty.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_failure_reaches_every_waiter() {
        let directory = Arc::new(CountingDirectory {
            fail: true,
            ..CountingDirectory::new()
        });
        let cache = Arc::new(AccountNameCache::new(directory.clone(), TEST_TIMEOUT));
        let (a, b) = tokio::join!(cache.get(), cache.get());
        assert!(matches!(a, Err(AccountsError::Refresh(ref m)) if m.contains("AccessDenied")));
        assert!(matches!(b, Err(AccountsError::Refresh(_))));
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    }

    struct HangingDirectory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AccountDirectory for HangingDirectory {
        async fn list_accounts(&self) -> Result<AccountMap, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn hung_directory_times_out_and_next_caller_retries() {
        let directory = Arc::new(HangingDirectory {
            calls: AtomicUsize::new(0),
        });
        let cache = AccountNameCache::new(directory.clone(), Duration::from_millis(50));

        for attempt in 1..=2 {
            let result = tokio::time::timeout(Duration::from_secs(2), cache.get())
                .await
                .expect("get must not hang");
            assert!(
                matches!(result, Err(AccountsError::Refresh(ref m)) if m.contains("timed out")),
                "{result:?}"
            );
            assert_eq!(directory.calls.load(Ordering::SeqCst), attempt);
        }
    }
}

//! In-process storage backend.
//!
//! A [`MemoryAccount`] holds any number of containers and is shared between
//! handles through the [`crate::StorageOpener`], so several daemonless
//! clients in one process see the same remote state. The account also counts
//! requests per operation and can inject failures, which is what the
//! integration tests use to observe dispatch behaviour.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    CloudStorage, ContinuationToken, DEFAULT_PAGE_SIZE, FetchCondition, Fetched, ListingPage,
    PutCondition, validate_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::instrument;

/// Storage operation kinds, as counted by [`MemoryAccount`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Fetch,
    Put,
    Delete,
    List,
    Create,
    Destroy,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetch => "fetch",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Create => "create",
            Self::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
struct MemObject {
    data: Bytes,
    etag: String,
}

#[derive(Default)]
struct AccountState {
    containers: BTreeMap<String, BTreeMap<String, MemObject>>,
    requests: HashMap<StorageOp, usize>,
    key_requests: HashMap<(StorageOp, String), usize>,
    failures: VecDeque<(StorageOp, u16)>,
    required_auth: Option<String>,
    next_etag: u64,
}

/// A named in-memory storage account.
#[derive(Default)]
pub struct MemoryAccount {
    name: String,
    state: Mutex<AccountState>,
}

impl MemoryAccount {
    /// Create an empty account.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(AccountState::default()),
        })
    }

    /// Account name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests of kind `op` issued so far.
    pub fn request_count(&self, op: StorageOp) -> usize {
        self.lock().requests.get(&op).copied().unwrap_or(0)
    }

    /// Number of requests of kind `op` issued for `key`.
    pub fn key_request_count(&self, op: StorageOp, key: &str) -> usize {
        self.lock()
            .key_requests
            .get(&(op, key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Reset all request counters.
    pub fn reset_counts(&self) {
        let mut state = self.lock();
        state.requests.clear();
        state.key_requests.clear();
    }

    /// Make the next request of kind `op` fail with HTTP `status`.
    pub fn fail_next(&self, op: StorageOp, status: u16) {
        self.lock().failures.push_back((op, status));
    }

    /// Reject every request with `403` unless it presents `token`.
    pub fn require_auth(&self, token: Option<&str>) {
        self.lock().required_auth = token.map(str::to_string);
    }

    /// Keys currently stored in `container`, sorted.
    pub fn keys(&self, container: &str) -> Vec<String> {
        self.lock()
            .containers
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw object content, bypassing counters and failure injection.
    pub fn object(&self, container: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .containers
            .get(container)
            .and_then(|objects| objects.get(key))
            .map(|obj| obj.data.clone())
    }

    /// Record a request and apply auth checks and injected failures.
    fn begin(
        &self,
        op: StorageOp,
        key: &str,
        auth: Option<&str>,
    ) -> StorageResult<MutexGuard<'_, AccountState>> {
        let mut state = self.lock();
        *state.requests.entry(op).or_default() += 1;
        *state.key_requests.entry((op, key.to_string())).or_default() += 1;

        if let Some(required) = &state.required_auth
            && auth != Some(required.as_str())
        {
            return Err(StorageError::Forbidden(format!("{op} {key}")));
        }
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op) {
            let (_, status) = state.failures.remove(pos).unwrap_or((op, 500));
            return Err(StorageError::from_status(
                status,
                format!("injected failure for {op} {key}"),
            ));
        }
        Ok(state)
    }
}

impl AccountState {
    fn mint_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("\"{:016x}\"", self.next_etag)
    }
}

/// Handle on one container of a [`MemoryAccount`].
pub struct MemoryBackend {
    account: Arc<MemoryAccount>,
    container: String,
    auth: Mutex<Option<String>>,
}

impl MemoryBackend {
    /// Create a handle on `container` of `account`.
    pub fn new(account: Arc<MemoryAccount>, container: &str, auth: Option<String>) -> Self {
        Self {
            account,
            container: container.to_string(),
            auth: Mutex::new(auth),
        }
    }

    /// The account this handle belongs to.
    pub fn account(&self) -> &Arc<MemoryAccount> {
        &self.account
    }

    fn auth(&self) -> Option<String> {
        self.auth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn container_missing(&self) -> StorageError {
        StorageError::NotFound(format!("container {}", self.container))
    }
}

#[async_trait]
impl CloudStorage for MemoryBackend {
    #[instrument(skip(self), fields(backend = "memory", container = %self.container))]
    async fn fetch(&self, key: &str, condition: FetchCondition) -> StorageResult<Fetched> {
        validate_key(key)?;
        let auth = self.auth();
        let state = self.account.begin(StorageOp::Fetch, key, auth.as_deref())?;
        let objects = state
            .containers
            .get(&self.container)
            .ok_or_else(|| self.container_missing())?;
        let obj = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let unchanged = match &condition {
            FetchCondition::None => false,
            FetchCondition::IfNoneMatch(etag) => *etag == obj.etag,
            FetchCondition::IfContentDiffers(digest) => {
                Md5::digest(&obj.data).as_slice() == digest.as_slice()
            }
        };
        if unchanged {
            return Err(StorageError::NotModified(key.to_string()));
        }

        Ok(Fetched {
            data: obj.data.clone(),
            etag: Some(obj.etag.clone()),
        })
    }

    #[instrument(skip(self, data), fields(backend = "memory", container = %self.container, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, condition: PutCondition) -> StorageResult<String> {
        validate_key(key)?;
        let auth = self.auth();
        let mut state = self.account.begin(StorageOp::Put, key, auth.as_deref())?;
        let etag = state.mint_etag();
        let objects = state
            .containers
            .get_mut(&self.container)
            .ok_or_else(|| self.container_missing())?;

        let current = objects.get(key).map(|obj| obj.etag.as_str());
        let allowed = match &condition {
            PutCondition::None => true,
            PutCondition::IfMatch(expected) => current == Some(expected.as_str()),
            PutCondition::IfNotExists => current.is_none(),
        };
        if !allowed {
            return Err(StorageError::PreconditionFailed(key.to_string()));
        }

        objects.insert(
            key.to_string(),
            MemObject {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    #[instrument(skip(self), fields(backend = "memory", container = %self.container))]
    async fn delete(&self, key: &str, etag: Option<&str>) -> StorageResult<()> {
        validate_key(key)?;
        let auth = self.auth();
        let mut state = self.account.begin(StorageOp::Delete, key, auth.as_deref())?;
        let objects = state
            .containers
            .get_mut(&self.container)
            .ok_or_else(|| self.container_missing())?;
        match objects.get(key) {
            None => Err(StorageError::NotFound(key.to_string())),
            Some(obj) if etag.is_some_and(|e| e != obj.etag) => {
                Err(StorageError::PreconditionFailed(key.to_string()))
            }
            Some(_) => {
                objects.remove(key);
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(backend = "memory", container = %self.container))]
    async fn list(
        &self,
        prefix: &str,
        marker: Option<ContinuationToken>,
    ) -> StorageResult<ListingPage> {
        let auth = self.auth();
        let state = self.account.begin(StorageOp::List, prefix, auth.as_deref())?;
        let objects = state
            .containers
            .get(&self.container)
            .ok_or_else(|| self.container_missing())?;
        let after = match &marker {
            Some(token) => Some(token.as_str()?.to_string()),
            None => None,
        };

        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| after.as_ref().is_none_or(|a| k.as_str() > a.as_str()))
            .take(DEFAULT_PAGE_SIZE + 1)
            .cloned()
            .collect();

        let next_token = if keys.len() > DEFAULT_PAGE_SIZE {
            keys.truncate(DEFAULT_PAGE_SIZE);
            let last = keys.last().cloned().unwrap_or_default();
            Some(ContinuationToken::new(last.into_bytes())?)
        } else {
            None
        };
        Ok(ListingPage { keys, next_token })
    }

    #[instrument(skip(self), fields(backend = "memory", container = %self.container))]
    async fn create(&self) -> StorageResult<()> {
        let auth = self.auth();
        let mut state = self
            .account
            .begin(StorageOp::Create, &self.container, auth.as_deref())?;
        if state.containers.contains_key(&self.container) {
            return Err(StorageError::AlreadyExists(format!(
                "container {}",
                self.container
            )));
        }
        state
            .containers
            .insert(self.container.clone(), BTreeMap::new());
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory", container = %self.container))]
    async fn destroy(&self) -> StorageResult<()> {
        let auth = self.auth();
        let mut state = self
            .account
            .begin(StorageOp::Destroy, &self.container, auth.as_deref())?;
        state
            .containers
            .remove(&self.container)
            .map(|_| ())
            .ok_or_else(|| self.container_missing())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn container(&self) -> &str {
        &self.container
    }

    fn set_auth(&self, auth: Option<String>) {
        *self.auth.lock().unwrap_or_else(PoisonError::into_inner) = auth;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Arc<MemoryAccount>, MemoryBackend) {
        let account = MemoryAccount::new("acct");
        let backend = MemoryBackend::new(account.clone(), "cont", None);
        backend.create().await.unwrap();
        (account, backend)
    }

    #[tokio::test]
    async fn test_counts_and_injected_failure() {
        let (account, backend) = setup().await;
        backend
            .put("a.bcv", Bytes::from("a"), PutCondition::None)
            .await
            .unwrap();
        account.fail_next(StorageOp::Fetch, 503);

        let err = backend
            .fetch("a.bcv", FetchCondition::None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        // The failure is consumed.
        backend.fetch("a.bcv", FetchCondition::None).await.unwrap();

        assert_eq!(account.request_count(StorageOp::Fetch), 2);
        assert_eq!(account.request_count(StorageOp::Put), 1);
        assert_eq!(account.key_request_count(StorageOp::Fetch, "a.bcv"), 2);
    }

    #[tokio::test]
    async fn test_required_auth() {
        let (account, backend) = setup().await;
        account.require_auth(Some("sas-2"));
        let err = backend
            .fetch("a.bcv", FetchCondition::None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(403));

        backend.set_auth(Some("sas-2".to_string()));
        let err = backend
            .fetch("a.bcv", FetchCondition::None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_conditional_put_and_shared_account() {
        let (account, a) = setup().await;
        let b = MemoryBackend::new(account.clone(), "cont", None);

        let e1 = a
            .put("manifest.bcv", Bytes::from("1"), PutCondition::IfNotExists)
            .await
            .unwrap();
        let e2 = b
            .put("manifest.bcv", Bytes::from("2"), PutCondition::IfMatch(e1.clone()))
            .await
            .unwrap();
        let err = a
            .put("manifest.bcv", Bytes::from("3"), PutCondition::IfMatch(e1))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(412));

        let fetched = a.fetch("manifest.bcv", FetchCondition::None).await.unwrap();
        assert_eq!(fetched.etag, Some(e2));
        assert_eq!(account.object("cont", "manifest.bcv"), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_missing_container_is_404() {
        let account = MemoryAccount::new("acct");
        let backend = MemoryBackend::new(account, "nope", None);
        let err = backend
            .put("manifest.bcv", Bytes::new(), PutCondition::IfNotExists)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }
}

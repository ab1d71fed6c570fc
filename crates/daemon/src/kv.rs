//! The per-container key-value store.
//!
//! Applications keep small named strings next to their databases in the
//! `bcv_kv.bcv` object, a JSON map. A container created by this crate starts
//! with an empty store; a container without the object reads as empty.
//! Writes are conditional on the ETag the store was read with, so concurrent
//! writers see `412` instead of overwriting each other.

use crate::dispatch::{Job, Request, Response};
use crate::engine::{Engine, EngineEvent, Tag, fetched, stored};
use crate::error::{BcvError, BcvResult, ErrorInfo};
use bcv_core::KV_KEY;
use bcv_core::retry::{HTTP_NOT_FOUND, HTTP_PRECONDITION_FAILED};
use bcv_storage::{FetchCondition, PutCondition, StorageResult};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Contents and version of a container's key-value store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    /// ETag of the object the store was read from. `None` if the object did
    /// not exist; the next write then requires that it still does not.
    pub etag: Option<String>,
    entries: BTreeMap<String, String>,
}

impl KvStore {
    pub fn parse(data: &[u8], etag: Option<String>) -> BcvResult<Self> {
        let entries = serde_json::from_slice(data)
            .map_err(|e| bcv_core::Error::corrupt(format!("{KV_KEY}: {e}")))?;
        Ok(Self { etag, entries })
    }

    pub fn compose(&self) -> BcvResult<Vec<u8>> {
        serde_json::to_vec(&self.entries)
            .map_err(|e| BcvError::Internal(format!("{KV_KEY}: {e}")))
    }

    /// Store read by a fetch of [`KV_KEY`]. A missing object is an empty
    /// store.
    pub(crate) fn from_fetch(result: StorageResult<Response>) -> BcvResult<Self> {
        match result {
            Ok(response) => {
                let body = fetched(response)?;
                Self::parse(&body.data, body.etag)
            }
            Err(e) if e.status() == Some(HTTP_NOT_FOUND) => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Set `name` to `value`, returning the previous value.
    pub fn set(&mut self, name: &str, value: &str) -> Option<String> {
        self.entries.insert(name.to_string(), value.to_string())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn put_request(&self) -> BcvResult<Request> {
        let condition = match &self.etag {
            Some(etag) => PutCondition::IfMatch(etag.clone()),
            None => PutCondition::IfNotExists,
        };
        Ok(Request::Put {
            key: KV_KEY.to_string(),
            data: Bytes::from(self.compose()?),
            condition,
        })
    }
}

pub(crate) fn kv_fetch() -> Request {
    Request::Fetch {
        key: KV_KEY.to_string(),
        condition: FetchCondition::None,
    }
}

/// Unconditional write of an empty store, for new containers.
pub(crate) fn empty_kv_put() -> BcvResult<Request> {
    Ok(Request::Put {
        key: KV_KEY.to_string(),
        data: Bytes::from(KvStore::default().compose()?),
        condition: PutCondition::None,
    })
}

impl Engine {
    /// Read the key-value store of `alias`.
    #[instrument(skip(self))]
    pub async fn kv_load(&mut self, alias: &str) -> BcvResult<KvStore> {
        let handle = self.container(alias)?.handle.clone();
        let result = self.call(&handle, kv_fetch()).await;
        let store = KvStore::from_fetch(result)?;
        debug!(alias, entries = store.len(), etag = ?store.etag, "loaded key-value store");
        self.container_mut(alias)?.kv = Some(store.clone());
        Ok(store)
    }

    /// Write `store` to `alias` and record the new ETag in it.
    ///
    /// Fails with status `412` if the store changed since it was read; load
    /// it again and reapply the edit.
    #[instrument(skip(self, store))]
    pub async fn kv_save(&mut self, alias: &str, store: &mut KvStore) -> BcvResult<()> {
        let handle = {
            let container = self.container(alias)?;
            container.check_writable()?;
            container.handle.clone()
        };
        let request = store.put_request()?;
        match self.call(&handle, request).await {
            Ok(response) => {
                store.etag = Some(stored(response)?);
                info!(alias, entries = store.len(), etag = ?store.etag, "saved key-value store");
                self.container_mut(alias)?.kv = Some(store.clone());
                Ok(())
            }
            Err(e) => {
                if e.status() == Some(HTTP_PRECONDITION_FAILED) {
                    warn!(alias, "key-value store changed remotely; reload and retry");
                    self.container_mut(alias)?.kv = None;
                }
                Err(e.into())
            }
        }
    }

    /// Begin reading the key-value store of `alias` without waiting. Returns
    /// false if a read is already running; its [`EngineEvent::KvLoaded`]
    /// covers this request too.
    pub fn start_kv_load(&mut self, alias: &str) -> BcvResult<bool> {
        let (alias, handle) = {
            let container = self.container(alias)?;
            (container.alias.clone(), container.handle.clone())
        };
        if !self.kv_loading.insert(alias.clone()) {
            return Ok(false);
        }
        self.dispatcher
            .submit(Job::new(Tag::Kv { alias }, handle, kv_fetch()));
        Ok(true)
    }

    pub(crate) fn on_kv(&mut self, alias: Arc<str>, result: StorageResult<Response>) {
        self.kv_loading.remove(&alias);
        let outcome = KvStore::from_fetch(result).and_then(|store| {
            self.container_mut(&alias)?.kv = Some(store);
            Ok(())
        });
        if let Err(e) = &outcome {
            warn!(container = %alias, error = %e, "key-value store read failed");
        }
        self.events.push_back(EngineEvent::KvLoaded {
            alias,
            result: outcome.map_err(|e| ErrorInfo::from(&e)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcv_storage::StorageError;

    #[test]
    fn test_store_keeps_entries_in_name_order() {
        let mut kv = KvStore::default();
        assert!(kv.is_empty());
        assert_eq!(kv.set("zeta", "1"), None);
        assert_eq!(kv.set("alpha", "2"), None);
        assert_eq!(kv.set("zeta", "3"), Some("1".to_string()));
        let names: Vec<&str> = kv.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let parsed = KvStore::parse(&kv.compose().unwrap(), Some("e1".into())).unwrap();
        assert_eq!(parsed.get("zeta"), Some("3"));
        assert_eq!(parsed.etag.as_deref(), Some("e1"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_missing_object_reads_as_empty_store() {
        let kv = KvStore::from_fetch(Err(StorageError::from_status(404, "gone"))).unwrap();
        assert!(kv.is_empty());
        assert_eq!(kv.etag, None);
        assert!(matches!(
            kv.put_request().unwrap(),
            Request::Put {
                condition: PutCondition::IfNotExists,
                ..
            }
        ));

        let err = KvStore::from_fetch(Err(StorageError::from_status(500, "down"))).unwrap_err();
        assert_eq!(err.code(), 500);
    }

    #[test]
    fn test_corrupt_store_is_rejected() {
        let err = KvStore::parse(b"[1, 2]", None).unwrap_err();
        assert!(matches!(err, BcvError::Core(bcv_core::Error::Corrupt(_))));
    }
}

//! Daemonless access: the engine embedded in the calling process.
//!
//! Every call runs to completion, pumping the dispatcher until the requests
//! it issued are done.

use crate::auth::AuthProvider;
use crate::cleanup::CleanupStats;
use crate::engine::Engine;
use crate::error::BcvResult;
use crate::kv::KvStore;
use crate::lifecycle::{PrefetchStats, UploadStats};
use crate::vtab;
use bcv_core::{DaemonConfig, DbId};
use bcv_storage::StorageOpener;
use std::sync::Arc;
use std::time::Duration;

/// An engine owned by one process, without a daemon.
pub struct Embedded {
    engine: Engine,
}

impl Embedded {
    pub async fn open(config: DaemonConfig, opener: Arc<StorageOpener>) -> BcvResult<Self> {
        Self::open_with_auth(config, opener, None).await
    }

    /// Open with a provider asked for a fresh credential on `403`.
    pub async fn open_with_auth(
        config: DaemonConfig,
        opener: Arc<StorageOpener>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> BcvResult<Self> {
        Ok(Self {
            engine: Engine::open(config, opener, auth).await?,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Nobody waits on background events here.
    fn settle<T>(&mut self, result: BcvResult<T>) -> BcvResult<T> {
        self.engine.take_events();
        result
    }

    pub async fn attach(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        alias: Option<&str>,
        auth: Option<String>,
        flags: u32,
    ) -> BcvResult<String> {
        let result = self
            .engine
            .attach(storage, account, container, alias, auth, flags)
            .await;
        self.settle(result)
    }

    pub async fn detach(&mut self, alias: &str) -> BcvResult<()> {
        let result = self.engine.detach(alias).await;
        self.settle(result)
    }

    pub async fn poll(&mut self, alias: &str) -> BcvResult<bool> {
        let result = self.engine.poll(alias).await;
        self.settle(result)
    }

    /// Publish local changes. Fails with status `412` if the container was
    /// changed by someone else since the last poll; poll and retry.
    pub async fn upload(&mut self, alias: &str) -> BcvResult<UploadStats> {
        let result = self.engine.upload(alias).await;
        self.settle(result)
    }

    pub fn create_database(&mut self, alias: &str, name: &str) -> BcvResult<DbId> {
        self.engine.create_database(alias, name)
    }

    pub fn copy(&mut self, alias: &str, from: &str, to: &str) -> BcvResult<DbId> {
        self.engine.copy(alias, from, to)
    }

    pub fn delete(&mut self, alias: &str, name: &str) -> BcvResult<()> {
        self.engine.delete(alias, name)
    }

    pub async fn revert(&mut self, alias: &str) -> BcvResult<()> {
        let result = self.engine.revert(alias).await;
        self.settle(result)
    }

    pub async fn cleanup(&mut self, alias: &str, retain: Duration) -> BcvResult<CleanupStats> {
        let result = self.engine.cleanup(alias, retain).await;
        self.settle(result)
    }

    pub async fn create(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        auth: Option<String>,
    ) -> BcvResult<()> {
        let result = self.engine.create(storage, account, container, auth).await;
        self.settle(result)
    }

    pub async fn destroy(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        auth: Option<String>,
    ) -> BcvResult<()> {
        let result = self.engine.destroy(storage, account, container, auth).await;
        self.settle(result)
    }

    pub async fn write_block(
        &mut self,
        alias: &str,
        db: &str,
        index: u32,
        data: &[u8],
    ) -> BcvResult<()> {
        self.engine.write_block(alias, db, index, data).await
    }

    pub async fn read_block(&mut self, alias: &str, db: &str, index: u32) -> BcvResult<Vec<u8>> {
        let result = self.engine.read_block(alias, db, index).await;
        self.settle(result)
    }

    pub async fn prefetch(&mut self, alias: &str) -> BcvResult<PrefetchStats> {
        let result = self.engine.prefetch(alias).await;
        self.settle(result)
    }

    /// Sorted names of the databases in the working copy of `alias`, staged
    /// changes included.
    pub fn databases(&self, alias: &str) -> BcvResult<Vec<String>> {
        let mut names: Vec<String> = self
            .engine
            .container(alias)?
            .working
            .dbs
            .iter()
            .map(|db| db.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Read the key-value store of `alias`.
    pub async fn kv(&mut self, alias: &str) -> BcvResult<KvStore> {
        let result = self.engine.kv_load(alias).await;
        self.settle(result)
    }

    /// Write an edited store back. Fails with status `412` if someone else
    /// wrote it since it was read; read it again and reapply the edit.
    pub async fn kv_save(&mut self, alias: &str, store: &mut KvStore) -> BcvResult<()> {
        let result = self.engine.kv_save(alias, store).await;
        self.settle(result)
    }

    /// Rows of a virtual table as JSON. `bcv_kv` reads the store of
    /// `container` afresh.
    pub async fn vtab(
        &mut self,
        table: &str,
        container: Option<&str>,
        database: Option<&str>,
        col_used: u64,
    ) -> BcvResult<serde_json::Value> {
        if table == vtab::BCV_KV {
            let alias = container.ok_or_else(|| {
                crate::error::BcvError::Misuse(format!("{table} requires a container"))
            })?;
            self.kv(alias).await?;
        }
        let rows = vtab::rows(&self.engine, table, container, database, col_used)?;
        serde_json::from_str(&rows)
            .map_err(|e| crate::error::BcvError::Internal(format!("vtab rows: {e}")))
    }
}

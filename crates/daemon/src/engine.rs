//! The block-cache engine shared by the daemon and the daemonless API.
//!
//! The engine owns the cache index, the cache file, the dispatcher and every
//! attached container. All of its state is mutated from one task. Blocking
//! operations submit a request and pump the dispatcher until that request
//! completes; completions for other requests are handled along the way and
//! reported as [`EngineEvent`]s.

use crate::auth::{AuthProvider, AuthTarget};
use crate::cache::{BlockCache, CacheKey};
use crate::cachefile::CacheFile;
use crate::cleanup::{CleanupJob, CleanupStats, CleanupStep};
use crate::container::{Container, ContainerState, Deferred};
use crate::dispatch::{Completion, Dispatcher, Job, Request, Response};
use crate::error::{BcvError, BcvResult, ErrorInfo};
use crate::lifecycle::PendingAttach;
use bcv_core::retry::{HTTP_AUTH_ERROR, HTTP_NOT_MODIFIED};
use bcv_core::{BlockId, DaemonConfig, Manifest, RetryPolicy, StorageConfig};
use bcv_metadata::{BlockRow, ContainerRow, MetadataStore};
use bcv_storage::{
    CloudStorage, FetchCondition, Fetched, ListingPage, StorageError, StorageOpener, StorageResult,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routes a completion back to whoever issued the request.
#[derive(Debug, Clone)]
pub(crate) enum Tag {
    /// A blocking call waiting in [`Engine::wait_call`].
    Call(u64),
    /// Download of block `id` into cache slot `slot`.
    Block { slot: u32, id: BlockId },
    /// Event-driven manifest refresh.
    Poll { alias: Arc<str> },
    /// Manifest download of a container being attached.
    Attach { alias: Arc<str> },
    /// One request of a background cleanup.
    Cleanup { alias: Arc<str>, step: CleanupStep },
    /// Read of a container's key-value store.
    Kv { alias: Arc<str> },
}

/// Outcome of background work, for the daemon to fan out to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A block download finished. On failure the slot has been freed.
    BlockReady {
        slot: u32,
        result: Result<(), ErrorInfo>,
    },
    /// A poll started with [`Engine::start_poll`] finished. `true` means a
    /// new manifest was installed.
    Polled {
        alias: Arc<str>,
        result: Result<bool, ErrorInfo>,
    },
    /// An attach started with [`Engine::start_attach`] finished.
    Attached {
        alias: Arc<str>,
        result: Result<(), ErrorInfo>,
    },
    /// A detach deferred by [`Engine::request_detach`] finished.
    Detached {
        alias: Arc<str>,
        result: Result<(), ErrorInfo>,
    },
    /// A cleanup started with [`Engine::start_cleanup`] finished.
    Cleaned {
        alias: Arc<str>,
        result: Result<CleanupStats, ErrorInfo>,
    },
    /// A read started with [`Engine::start_kv_load`] finished.
    KvLoaded {
        alias: Arc<str>,
        result: Result<(), ErrorInfo>,
    },
}

/// Cache, dispatcher and containers.
pub struct Engine {
    pub(crate) config: DaemonConfig,
    pub(crate) cache: BlockCache,
    pub(crate) file: CacheFile,
    pub(crate) dispatcher: Dispatcher<Tag>,
    pub(crate) containers: BTreeMap<String, Container>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) opener: Arc<StorageOpener>,
    pub(crate) auth: Option<Arc<dyn AuthProvider>>,
    pub(crate) retry: RetryPolicy,
    results: HashMap<u64, StorageResult<Response>>,
    next_call: u64,
    next_key_index: u32,
    pub(crate) events: VecDeque<EngineEvent>,
    pub(crate) attaching: HashMap<Arc<str>, PendingAttach>,
    pub(crate) cleanups: HashMap<Arc<str>, CleanupJob>,
    pub(crate) kv_loading: HashSet<Arc<str>>,
}

impl Engine {
    /// Open the cache directory, recovering cached blocks and attached
    /// containers from the blocks database.
    pub async fn open(
        config: DaemonConfig,
        opener: Arc<StorageOpener>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> BcvResult<Self> {
        config.validate().map_err(bcv_core::Error::Config)?;
        tokio::fs::create_dir_all(&config.directory).await?;
        let file =
            CacheFile::open(config.cache_file_path(), config.cache_size, config.block_size).await?;
        let metadata = bcv_metadata::open(config.blocksdb_path()).await?;

        let mut engine = Self {
            cache: BlockCache::new(file.n_slots()),
            file,
            dispatcher: Dispatcher::new(config.n_request, config.http_timeout()),
            containers: BTreeMap::new(),
            metadata,
            opener,
            auth,
            retry: RetryPolicy::from_config(&config.retry),
            results: HashMap::new(),
            next_call: 0,
            next_key_index: 1,
            events: VecDeque::new(),
            attaching: HashMap::new(),
            cleanups: HashMap::new(),
            kv_loading: HashSet::new(),
            config,
        };
        engine.recover().await?;
        Ok(engine)
    }

    async fn recover(&mut self) -> BcvResult<()> {
        let rows = self.metadata.list_containers().await?;
        let known: HashSet<String> = rows.iter().map(|r| r.alias.clone()).collect();
        for row in rows {
            match self.reopen(&row).await {
                Ok(container) => {
                    self.containers.insert(row.alias.clone(), container);
                }
                Err(e) => warn!(alias = %row.alias, error = %e, "cannot reopen container"),
            }
        }

        let n_slots = i64::from(self.cache.n_slots());
        let mut restored = 0usize;
        for row in self.metadata.list_blocks().await? {
            if row.slot < 0 || row.slot >= n_slots {
                self.metadata.delete_block(row.slot).await?;
                continue;
            }
            if let Some(alias) = &row.container
                && !known.contains(alias)
            {
                self.metadata.delete_block(row.slot).await?;
                continue;
            }
            let key = match self.row_key(&row) {
                Ok(Some(key)) => key,
                // Dirty rows of a container that failed to reopen are kept.
                Ok(None) => continue,
                Err(e) => {
                    warn!(slot = row.slot, error = %e, "dropping unreadable block row");
                    self.metadata.delete_block(row.slot).await?;
                    continue;
                }
            };
            let tick = u64::try_from(row.lru_tick).unwrap_or(0);
            if let Err(e) = self.cache.restore(row.slot as u32, key.clone(), tick) {
                warn!(slot = row.slot, error = %e, "dropping duplicate block row");
                self.metadata.delete_block(row.slot).await?;
                continue;
            }
            // Appended blocks extend their database until the next upload.
            if let CacheKey::Dirty {
                container,
                db,
                block,
            } = key
                && let Some(c) = self.containers.get_mut(&*container)
            {
                let extent = c.extents.entry(db).or_insert(0);
                *extent = (*extent).max(block + 1);
            }
            restored += 1;
        }
        self.cache.sort_lru();
        info!(
            containers = self.containers.len(),
            blocks = restored,
            slots = n_slots,
            "recovered cache state"
        );
        Ok(())
    }

    fn row_key(&self, row: &BlockRow) -> BcvResult<Option<CacheKey>> {
        if let Some(id) = &row.block_id {
            return Ok(Some(CacheKey::Clean(BlockId::from_slice(id)?)));
        }
        let (Some(alias), Some(db), Some(pos)) = (&row.container, &row.db_id, row.db_pos) else {
            return Err(BcvError::Internal(format!("block row {} is incomplete", row.slot)));
        };
        let Some(container) = self.containers.get(alias) else {
            return Ok(None);
        };
        let block = u32::try_from(pos)
            .map_err(|_| BcvError::Internal(format!("block row {} has position {pos}", row.slot)))?;
        Ok(Some(CacheKey::Dirty {
            container: container.alias.clone(),
            db: bcv_core::DbId::from_slice(db)?,
            block,
        }))
    }

    async fn reopen(&mut self, row: &ContainerRow) -> BcvResult<Container> {
        let config =
            StorageConfig::from_attach(&row.storage, &row.account).map_err(bcv_core::Error::Config)?;
        let handle = self.opener.open(&config, &row.container, None).await?;
        let data = row
            .manifest
            .as_deref()
            .ok_or_else(|| bcv_core::Error::corrupt(format!("no stored manifest for {}", row.alias)))?;
        let manifest = Manifest::parse(data, row.etag.clone())?;
        let key = match row.encryption_key.as_deref() {
            Some(raw) => Some(<[u8; 16]>::try_from(raw).map_err(|_| {
                BcvError::Internal(format!("stored key for {} is {} bytes", row.alias, raw.len()))
            })?),
            None => None,
        };
        let key_index = if key.is_some() { self.alloc_key_index() } else { 0 };
        Ok(Container::new(
            &row.alias,
            &row.storage,
            &row.account,
            &row.container,
            handle,
            manifest,
            u32::try_from(row.flags).unwrap_or(0),
            key,
            key_index,
        ))
    }

    pub(crate) fn alloc_key_index(&mut self) -> u32 {
        let index = self.next_key_index;
        self.next_key_index += 1;
        index
    }

    /// Configuration the engine runs with.
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Location of the cache file. Daemon clients read block data from it.
    pub fn cache_file_path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    /// The cache index.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Attached containers by alias.
    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    pub fn container(&self, alias: &str) -> BcvResult<&Container> {
        self.containers
            .get(alias)
            .ok_or_else(|| BcvError::NoSuchContainer(alias.to_string()))
    }

    pub(crate) fn container_mut(&mut self, alias: &str) -> BcvResult<&mut Container> {
        self.containers
            .get_mut(alias)
            .ok_or_else(|| BcvError::NoSuchContainer(alias.to_string()))
    }

    pub(crate) fn set_state(&mut self, alias: &str, state: ContainerState) {
        if let Some(container) = self.containers.get_mut(alias) {
            container.state = state;
        }
    }

    /// End the running operation on `alias` and start whatever waited for it.
    pub(crate) async fn finish_op(&mut self, alias: &str) {
        self.set_state(alias, ContainerState::None);
        self.resume(alias).await;
    }

    /// Start deferred work on `alias` while it is idle, then complete a
    /// pending detach once nothing is queued and no client is bound.
    pub(crate) async fn resume(&mut self, alias: &str) {
        loop {
            let Some(container) = self.containers.get_mut(alias) else {
                return;
            };
            if !container.is_idle() {
                return;
            }
            let Some(op) = container.deferred.pop_front() else {
                break;
            };
            let shared = container.alias.clone();
            let started = match op {
                Deferred::Poll => self.start_poll(alias).map(|_| ()),
                Deferred::Cleanup { retain } => self.start_cleanup(alias, retain).map(|_| ()),
            };
            if let Err(e) = started {
                warn!(container = alias, ?op, error = %e, "deferred work not started");
                let info = ErrorInfo::from(&e);
                self.events.push_back(match op {
                    Deferred::Poll => EngineEvent::Polled {
                        alias: shared,
                        result: Err(info),
                    },
                    Deferred::Cleanup { .. } => EngineEvent::Cleaned {
                        alias: shared,
                        result: Err(info),
                    },
                });
            }
        }

        let Some(container) = self.containers.get(alias) else {
            return;
        };
        if !container.detach_pending || container.n_client > 0 {
            return;
        }
        let shared = container.alias.clone();
        let result = self.detach_now(alias).await;
        if let Err(e) = &result {
            warn!(container = alias, error = %e, "deferred detach failed");
            if let Ok(container) = self.container_mut(alias) {
                container.detach_pending = false;
            }
        }
        self.events.push_back(EngineEvent::Detached {
            alias: shared,
            result: result.map_err(|e| ErrorInfo::from(&e)),
        });
    }

    /// A daemon client unbound from `alias`.
    pub(crate) async fn release_client(&mut self, alias: &str) {
        if let Some(container) = self.containers.get_mut(alias) {
            container.n_client = container.n_client.saturating_sub(1);
        }
        self.resume(alias).await;
    }

    /// Pump the dispatcher until no lifecycle operation runs on `alias`.
    pub(crate) async fn wait_idle(&mut self, alias: &str) -> BcvResult<()> {
        loop {
            let container = self.container(alias)?;
            if container.is_idle() {
                return Ok(());
            }
            let state = container.state;
            if !self.pump().await {
                return Err(BcvError::Internal(format!(
                    "{alias} is stuck in {} with nothing outstanding",
                    state.as_str()
                )));
            }
        }
    }

    pub(crate) fn check_block_size(&self, manifest: &Manifest) -> BcvResult<()> {
        if manifest.block_size != self.config.block_size {
            return Err(BcvError::Misuse(format!(
                "container block size {} does not match cache block size {}",
                manifest.block_size, self.config.block_size
            )));
        }
        Ok(())
    }

    /// Take every pending event.
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    /// Pump the dispatcher until an event matching `wanted` is pending, then
    /// remove and return it. `None` if the dispatcher ran dry first.
    pub(crate) async fn wait_event(
        &mut self,
        wanted: impl Fn(&EngineEvent) -> bool,
    ) -> Option<EngineEvent> {
        loop {
            if let Some(pos) = self.events.iter().position(&wanted) {
                return self.events.remove(pos);
            }
            if !self.pump().await {
                return None;
            }
        }
    }

    /// Remove and return the outcome of the download into `slot`, if any.
    pub(crate) fn take_block_event(&mut self, slot: u32) -> Option<Result<(), ErrorInfo>> {
        let pos = self
            .events
            .iter()
            .position(|e| matches!(e, EngineEvent::BlockReady { slot: s, .. } if *s == slot))?;
        match self.events.remove(pos) {
            Some(EngineEvent::BlockReady { result, .. }) => Some(result),
            _ => None,
        }
    }

    /// True when no request is running or queued.
    pub fn is_idle(&self) -> bool {
        self.dispatcher.is_idle()
    }

    /// Requests running or queued.
    pub fn outstanding(&self) -> usize {
        self.dispatcher.outstanding()
    }

    /// Wait for the next completion without handling it.
    ///
    /// Cancel safe. Hand the result to [`Engine::on_completion`].
    pub(crate) async fn next_completion(&mut self) -> Option<Completion<Tag>> {
        self.dispatcher.next().await
    }

    /// Handle one completion. Returns false if nothing was outstanding.
    pub(crate) async fn pump(&mut self) -> bool {
        match self.dispatcher.next().await {
            Some(completion) => {
                self.on_completion(completion).await;
                true
            }
            None => false,
        }
    }

    pub(crate) fn submit_call(&mut self, storage: Arc<dyn CloudStorage>, request: Request) -> u64 {
        let id = self.next_call;
        self.next_call += 1;
        self.dispatcher.submit(Job::new(Tag::Call(id), storage, request));
        id
    }

    pub(crate) async fn wait_call(&mut self, id: u64) -> StorageResult<Response> {
        loop {
            if let Some(result) = self.results.remove(&id) {
                return result;
            }
            if !self.pump().await {
                return Err(StorageError::Io(std::io::Error::other(format!(
                    "request {id} lost by dispatcher"
                ))));
            }
        }
    }

    /// Issue `request` and wait for its outcome, retries included.
    pub(crate) async fn call(
        &mut self,
        storage: &Arc<dyn CloudStorage>,
        request: Request,
    ) -> StorageResult<Response> {
        let id = self.submit_call(storage.clone(), request);
        self.wait_call(id).await
    }

    fn auth_target(&self, storage: &Arc<dyn CloudStorage>) -> AuthTarget {
        self.containers
            .values()
            .find(|c| Arc::ptr_eq(&c.handle, storage))
            .map(Container::auth_target)
            .or_else(|| {
                self.attaching
                    .values()
                    .find(|p| Arc::ptr_eq(&p.handle, storage))
                    .map(PendingAttach::auth_target)
            })
            .unwrap_or_else(|| AuthTarget {
                storage: storage.backend_name().to_string(),
                account: String::new(),
                container: storage.container().to_string(),
            })
    }

    /// Apply the retry policy to a completion, then deliver it by tag.
    pub(crate) async fn on_completion(&mut self, completion: Completion<Tag>) {
        if let Err(err) = &completion.result {
            let status = err.status();
            if status == Some(HTTP_AUTH_ERROR)
                && completion.auth_retries < self.retry.max_auth_retries()
                && let Some(provider) = self.auth.clone()
            {
                let target = self.auth_target(&completion.storage);
                if let Some(token) = provider.refresh(&target).await {
                    info!(container = %target.container, "credential refreshed after 403");
                    completion.storage.set_auth(Some(token));
                    self.dispatcher.submit(completion.into_auth_retry());
                    return;
                }
            }
            let delay = if err.is_transient() {
                self.retry
                    .delay_for(completion.attempt as usize, err.retry_after())
            } else {
                None
            };
            if let Some(delay) = delay {
                warn!(
                    op = completion.request.op(),
                    key = completion.request.key(),
                    attempt = completion.attempt + 1,
                    ?delay,
                    error = %err,
                    "retrying request"
                );
                self.dispatcher.submit(completion.into_retry(delay));
                return;
            }
        }

        match completion.tag {
            Tag::Call(id) => {
                self.results.insert(id, completion.result);
            }
            Tag::Block { slot, id } => self.on_block(slot, id, completion.result).await,
            Tag::Poll { alias } => self.on_poll(alias, completion.result).await,
            Tag::Attach { alias } => self.on_attach(alias, completion.result).await,
            Tag::Cleanup { alias, step } => self.on_cleanup(alias, step, completion.result).await,
            Tag::Kv { alias } => self.on_kv(alias, completion.result),
        }
    }

    async fn on_block(&mut self, slot: u32, id: BlockId, result: StorageResult<Response>) {
        if self.cache.entry(slot).key != Some(CacheKey::Clean(id)) {
            debug!(slot, block = %id, "download finished for a slot since reused");
            return;
        }
        let outcome = match result.map_err(BcvError::from).and_then(fetched) {
            Ok(body) => self.fill_slot(slot, &id, &body.data).await,
            Err(e) => Err(e),
        };
        let result = match outcome {
            Ok(()) => {
                debug!(slot, block = %id, "block cached");
                Ok(())
            }
            Err(e) => {
                warn!(slot, block = %id, error = %e, "block download failed");
                self.cache.discard(slot);
                Err(ErrorInfo::from(&e))
            }
        };
        self.events.push_back(EngineEvent::BlockReady { slot, result });
    }

    async fn fill_slot(&mut self, slot: u32, id: &BlockId, data: &[u8]) -> BcvResult<()> {
        if data.len() > self.file.block_size() {
            return Err(bcv_core::Error::corrupt(format!(
                "block {id} is {} bytes, larger than the block size",
                data.len()
            ))
            .into());
        }
        self.file.write_slot(slot, data).await?;
        self.cache.mark_valid(slot);
        let tick = self.cache.entry(slot).tick;
        self.metadata
            .upsert_block(&BlockRow::clean(slot, id.as_bytes(), tick))
            .await?;
        Ok(())
    }

    /// Start downloading block `id` of container `alias` unless it is
    /// already cached or on its way. Returns the slot either way.
    pub(crate) async fn start_fetch(&mut self, alias: &str, id: BlockId) -> BcvResult<u32> {
        let key = CacheKey::Clean(id);
        if let Some(slot) = self.cache.find(&key) {
            return Ok(slot);
        }
        let (handle, key_index) = {
            let c = self.container(alias)?;
            (c.handle.clone(), c.key_index)
        };
        let alloc = self.cache.alloc(key, key_index)?;
        if let Some(evicted) = &alloc.evicted {
            debug!(slot = alloc.slot, ?evicted, "evicting cached block");
            if let Err(e) = self.metadata.delete_block(i64::from(alloc.slot)).await {
                self.cache.discard(alloc.slot);
                return Err(e.into());
            }
        }
        self.dispatcher.submit(Job::new(
            Tag::Block {
                slot: alloc.slot,
                id,
            },
            handle,
            Request::Fetch {
                key: id.to_object_key(),
                condition: FetchCondition::None,
            },
        ));
        Ok(alloc.slot)
    }

    /// Begin refreshing the manifest of `alias` without waiting.
    ///
    /// Returns false if a poll is already running, or if another operation
    /// is and the poll was queued behind it. Either way an
    /// [`EngineEvent::Polled`] follows.
    pub fn start_poll(&mut self, alias: &str) -> BcvResult<bool> {
        let container = self.container_mut(alias)?;
        match container.state {
            ContainerState::None => {}
            ContainerState::Poll => return Ok(false),
            running => {
                if container.defer(Deferred::Poll) {
                    debug!(container = alias, running = running.as_str(), "poll deferred");
                }
                return Ok(false);
            }
        }
        container.state = ContainerState::Poll;
        let job = Job::new(
            Tag::Poll {
                alias: container.alias.clone(),
            },
            container.handle.clone(),
            manifest_fetch(&container.manifest),
        );
        self.dispatcher.submit(job);
        Ok(true)
    }

    async fn on_poll(&mut self, alias: Arc<str>, result: StorageResult<Response>) {
        let outcome = self.finish_poll(&alias, result).await;
        match &outcome {
            Ok(changed) => debug!(container = %alias, changed, "poll finished"),
            Err(e) => warn!(container = %alias, error = %e, "poll failed"),
        }
        self.events.push_back(EngineEvent::Polled {
            alias: alias.clone(),
            result: outcome.map_err(|e| ErrorInfo::from(&e)),
        });
        self.finish_op(&alias).await;
    }

    /// Install the manifest carried by a poll response.
    pub(crate) async fn finish_poll(
        &mut self,
        alias: &str,
        result: StorageResult<Response>,
    ) -> BcvResult<bool> {
        let body = match result {
            Err(e) if e.status() == Some(HTTP_NOT_MODIFIED) => return Ok(false),
            Err(e) => return Err(e.into()),
            Ok(response) => fetched(response)?,
        };
        let manifest = Manifest::parse(&body.data, body.etag)?;
        self.check_block_size(&manifest)?;
        let data = manifest.compose();
        let etag = manifest.etag.clone();
        let container = self.container_mut(alias)?;
        let changed = *container.manifest != manifest;
        container.install(manifest);
        self.metadata
            .update_manifest(alias, &data, etag.as_deref())
            .await?;
        if changed {
            info!(container = %alias, etag = ?etag, "installed new manifest");
        }
        Ok(changed)
    }
}

/// Conditional fetch of the manifest that yields `304` while `current` is
/// still the published one.
pub(crate) fn manifest_fetch(current: &Manifest) -> Request {
    let condition = match &current.etag {
        Some(etag) => FetchCondition::IfNoneMatch(etag.clone()),
        // Recovered from the blocks database without an ETag.
        None => FetchCondition::IfContentDiffers(current.digest()),
    };
    Request::Fetch {
        key: bcv_core::MANIFEST_KEY.to_string(),
        condition,
    }
}

pub(crate) fn fetched(response: Response) -> BcvResult<Fetched> {
    match response {
        Response::Fetched(body) => Ok(body),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn stored(response: Response) -> BcvResult<String> {
    match response {
        Response::Stored { etag } => Ok(etag),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn listed(response: Response) -> BcvResult<ListingPage> {
    match response {
        Response::Listed(page) => Ok(page),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> BcvError {
    let kind = match response {
        Response::Fetched(_) => "fetched",
        Response::Stored { .. } => "stored",
        Response::Deleted => "deleted",
        Response::Listed(_) => "listed",
        Response::Created => "created",
        Response::Destroyed => "destroyed",
    };
    BcvError::Internal(format!("unexpected {kind} response"))
}

//! Container lifecycle: attach, detach, poll, upload, staged database
//! changes, revert, and local block reads and writes.

use crate::auth::AuthTarget;
use crate::cache::CacheKey;
use crate::container::{Container, ContainerState, Staged};
use crate::dispatch::{Job, Request, Response};
use crate::engine::{Engine, EngineEvent, Tag, fetched, manifest_fetch, stored};
use crate::error::{BcvError, BcvResult, ErrorInfo};
use crate::kv::empty_kv_put;
use crate::protocol::{ATTACH_IFNOT, ATTACH_READONLY, ATTACH_SECURE};
use bcv_core::mhash::{BlockAssignment, add_gc, assign_block_id};
use bcv_core::retry::{HTTP_NOT_FOUND, HTTP_PRECONDITION_FAILED};
use bcv_core::{BlockId, DbId, MANIFEST_KEY, Manifest, ManifestHash, StorageConfig};
use bcv_metadata::{BlockRow, ContainerRow};
use bcv_storage::{CloudStorage, FetchCondition, PutCondition, StorageResult};
use bytes::Bytes;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

/// Result of a successful upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    /// Dirty blocks published.
    pub blocks_written: usize,
    /// Blocks actually sent; the rest matched existing content.
    pub blocks_uploaded: usize,
    /// Staged database changes published.
    pub changes: usize,
    /// ETag of the new manifest.
    pub etag: Option<String>,
}

/// Result of an embedded prefetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    pub fetched: usize,
    pub failed: usize,
}

/// How an attach started with [`Engine::start_attach`] proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attaching {
    /// Already attached under this alias; nothing to wait for.
    Done(String),
    /// The manifest is on its way; [`EngineEvent::Attached`] follows.
    Started(Arc<str>),
}

/// A container whose manifest is being fetched for attach.
pub(crate) struct PendingAttach {
    storage: String,
    account: String,
    container: String,
    pub(crate) handle: Arc<dyn CloudStorage>,
    flags: u32,
}

impl PendingAttach {
    fn same(&self, storage: &str, account: &str, container: &str) -> bool {
        self.storage == storage && self.account == account && self.container == container
    }

    pub(crate) fn auth_target(&self) -> AuthTarget {
        AuthTarget {
            storage: self.storage.clone(),
            account: self.account.clone(),
            container: self.container.clone(),
        }
    }
}

impl Engine {
    /// Attach a remote container under `alias` (defaulting to the container
    /// name) and return the alias.
    #[instrument(skip(self, auth), fields(storage = %storage))]
    pub async fn attach(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        alias: Option<&str>,
        auth: Option<String>,
        flags: u32,
    ) -> BcvResult<String> {
        let alias = match self
            .start_attach(storage, account, container, alias, auth, flags)
            .await?
        {
            Attaching::Done(alias) => return Ok(alias),
            Attaching::Started(alias) => alias,
        };
        let event = self
            .wait_event(|e| matches!(e, EngineEvent::Attached { alias: a, .. } if *a == alias))
            .await;
        match event {
            Some(EngineEvent::Attached { result, .. }) => {
                result.map_err(BcvError::from)?;
                Ok(alias.to_string())
            }
            _ => Err(BcvError::Internal(format!("attach of {alias} was abandoned"))),
        }
    }

    /// Begin attaching a remote container without waiting for its manifest.
    ///
    /// An `ATTACH_IFNOT` request for a container already attached, or being
    /// attached, under the same alias joins it instead of failing with
    /// `AliasInUse`.
    pub async fn start_attach(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        alias: Option<&str>,
        auth: Option<String>,
        flags: u32,
    ) -> BcvResult<Attaching> {
        let alias = alias.filter(|a| !a.is_empty()).unwrap_or(container).to_string();
        let ifnot = flags & ATTACH_IFNOT != 0;
        if let Some(existing) = self.containers.get(&alias) {
            let same = existing.remote == container
                && existing.storage == storage
                && existing.account == account;
            if ifnot && same && !existing.detach_pending {
                debug!(alias = %alias, "already attached");
                return Ok(Attaching::Done(alias));
            }
            return Err(BcvError::AliasInUse(alias));
        }
        if let Some((shared, pending)) = self.attaching.get_key_value(alias.as_str()) {
            if ifnot && pending.same(storage, account, container) {
                debug!(alias = %alias, "joining attach in progress");
                return Ok(Attaching::Started(shared.clone()));
            }
            return Err(BcvError::AliasInUse(alias));
        }

        let handle = self.open_handle(storage, account, container, auth).await?;
        let alias: Arc<str> = Arc::from(alias);
        self.dispatcher.submit(Job::new(
            Tag::Attach {
                alias: alias.clone(),
            },
            handle.clone(),
            Request::Fetch {
                key: MANIFEST_KEY.to_string(),
                condition: FetchCondition::None,
            },
        ));
        self.attaching.insert(
            alias.clone(),
            PendingAttach {
                storage: storage.to_string(),
                account: account.to_string(),
                container: container.to_string(),
                handle,
                flags: flags & (ATTACH_READONLY | ATTACH_SECURE),
            },
        );
        Ok(Attaching::Started(alias))
    }

    pub(crate) async fn on_attach(&mut self, alias: Arc<str>, result: StorageResult<Response>) {
        let Some(pending) = self.attaching.remove(&alias) else {
            debug!(alias = %alias, "manifest arrived for an abandoned attach");
            return;
        };
        let outcome = self.finish_attach(&alias, pending, result).await;
        if let Err(e) = &outcome {
            warn!(alias = %alias, error = %e, "attach failed");
        }
        self.events.push_back(EngineEvent::Attached {
            alias,
            result: outcome.map_err(|e| ErrorInfo::from(&e)),
        });
    }

    async fn finish_attach(
        &mut self,
        alias: &str,
        pending: PendingAttach,
        result: StorageResult<Response>,
    ) -> BcvResult<()> {
        let body = fetched(result?)?;
        let manifest = Manifest::parse(&body.data, body.etag)?;
        self.check_block_size(&manifest)?;

        let PendingAttach {
            storage,
            account,
            container,
            handle,
            flags,
        } = pending;
        let key = (flags & ATTACH_SECURE != 0).then(rand::random::<[u8; 16]>);
        let key_index = if key.is_some() { self.alloc_key_index() } else { 0 };
        let row = ContainerRow {
            alias: alias.to_string(),
            storage: storage.clone(),
            account: account.clone(),
            container: container.clone(),
            flags: i64::from(flags),
            manifest: Some(manifest.compose()),
            etag: manifest.etag.clone(),
            encryption_key: key.map(|k| k.to_vec()),
            attached_at: OffsetDateTime::now_utc(),
        };
        self.metadata.insert_container(&row).await?;

        info!(
            alias,
            container = %container,
            databases = manifest.dbs.len(),
            etag = ?manifest.etag,
            "attached container"
        );
        let attached = Container::new(
            alias, &storage, &account, &container, handle, manifest, flags, key, key_index,
        );
        self.containers.insert(alias.to_string(), attached);
        Ok(())
    }

    /// Detach `alias`, discarding its unpublished blocks.
    ///
    /// Waits for the running operation and anything queued behind it.
    #[instrument(skip(self))]
    pub async fn detach(&mut self, alias: &str) -> BcvResult<()> {
        if self.request_detach(alias).await? {
            return Ok(());
        }
        let event = self
            .wait_event(|e| matches!(e, EngineEvent::Detached { alias: a, .. } if **a == *alias))
            .await;
        match event {
            Some(EngineEvent::Detached { result, .. }) => result.map_err(BcvError::from),
            _ => {
                let container = self.container_mut(alias)?;
                container.detach_pending = false;
                Err(BcvError::Busy(format!(
                    "{alias} has {} connected clients",
                    container.n_client
                )))
            }
        }
    }

    /// Ask for `alias` to be detached. Returns true if it was detached now.
    /// Otherwise the detach completes once the running operation ends and
    /// every client has left, and [`EngineEvent::Detached`] reports it.
    pub async fn request_detach(&mut self, alias: &str) -> BcvResult<bool> {
        let container = self.container_mut(alias)?;
        if container.detach_pending {
            return Ok(false);
        }
        if container.is_idle() && container.deferred.is_empty() && container.n_client == 0 {
            self.detach_now(alias).await?;
            return Ok(true);
        }
        container.detach_pending = true;
        info!(
            alias,
            clients = container.n_client,
            running = container.state.as_str(),
            "detach deferred"
        );
        Ok(false)
    }

    pub(crate) async fn detach_now(&mut self, alias: &str) -> BcvResult<()> {
        let dirty = self.cache.dirty_entries(alias);
        for (slot, _, _) in &dirty {
            self.cache.discard(*slot);
        }
        self.metadata.delete_container(alias).await?;
        self.containers.remove(alias);
        info!(alias, discarded = dirty.len(), "detached container");
        Ok(())
    }

    /// Refresh the manifest of `alias`. Returns true if it changed.
    #[instrument(skip(self))]
    pub async fn poll(&mut self, alias: &str) -> BcvResult<bool> {
        self.wait_idle(alias).await?;
        let (handle, request) = {
            let container = self.container_mut(alias)?;
            container.state = ContainerState::Poll;
            (container.handle.clone(), manifest_fetch(&container.manifest))
        };
        let result = self.call(&handle, request).await;
        let outcome = self.finish_poll(alias, result).await;
        self.finish_op(alias).await;
        outcome
    }

    /// Stage a new, empty database.
    pub fn create_database(&mut self, alias: &str, name: &str) -> BcvResult<DbId> {
        let container = self.writable(alias)?;
        let id = DbId::new_random();
        container.stage(Staged::CreateDb {
            id,
            name: name.to_string(),
        })?;
        Ok(id)
    }

    /// Stage a copy of database `from` named `to`. The copy shares the
    /// published block array of `from`; no block data is copied.
    pub fn copy(&mut self, alias: &str, from: &str, to: &str) -> BcvResult<DbId> {
        let container = self.writable(alias)?;
        let id = DbId::new_random();
        container.stage(Staged::Copy {
            from: from.to_string(),
            to: to.to_string(),
            id,
        })?;
        Ok(id)
    }

    /// Stage the deletion of database `name`.
    pub fn delete(&mut self, alias: &str, name: &str) -> BcvResult<()> {
        let container = self.writable(alias)?;
        container.stage(Staged::Delete {
            name: name.to_string(),
        })
    }

    fn writable(&mut self, alias: &str) -> BcvResult<&mut Container> {
        let container = self.container_mut(alias)?;
        container.check_writable()?;
        Ok(container)
    }

    /// Drop every unpublished change to `alias`: dirty blocks and staged
    /// database changes.
    #[instrument(skip(self))]
    pub async fn revert(&mut self, alias: &str) -> BcvResult<()> {
        self.wait_idle(alias).await?;
        let dirty = self.cache.dirty_entries(alias);
        for (slot, _, _) in &dirty {
            self.cache.discard(*slot);
        }
        self.metadata.delete_dirty_blocks(alias).await?;
        let container = self.container_mut(alias)?;
        let changes = container.staged.len();
        container.reset_working();
        info!(alias, blocks = dirty.len(), changes, "reverted local changes");
        Ok(())
    }

    /// Write block `index` of database `db`. Writing one past the last block
    /// appends.
    pub async fn write_block(
        &mut self,
        alias: &str,
        db: &str,
        index: u32,
        data: &[u8],
    ) -> BcvResult<()> {
        if data.len() > self.file.block_size() {
            return Err(BcvError::Misuse(format!(
                "write of {} bytes exceeds block size {}",
                data.len(),
                self.file.block_size()
            )));
        }
        self.container(alias)?.check_writable()?;
        self.wait_idle(alias).await?;
        let (key, key_index, db_id, count) = {
            let container = self.container(alias)?;
            let db = container.working.db(db)?;
            let count = container.block_count(&db.id);
            if index > count {
                return Err(bcv_core::Error::BlockOutOfRange {
                    name: db.name.clone(),
                    index,
                    count,
                }
                .into());
            }
            let key = CacheKey::Dirty {
                container: container.alias.clone(),
                db: db.id,
                block: index,
            };
            (key, container.key_index, db.id, count)
        };

        let slot = match self.cache.find(&key) {
            Some(slot) => slot,
            None => {
                let alloc = self.cache.alloc(key, key_index)?;
                if alloc.evicted.is_some() {
                    self.metadata.delete_block(i64::from(alloc.slot)).await?;
                }
                alloc.slot
            }
        };
        if let Err(e) = self.file.write_slot(slot, data).await {
            if !self.cache.entry(slot).valid {
                self.cache.discard(slot);
            }
            return Err(e);
        }
        self.cache.mark_valid(slot);
        let tick = self.cache.entry(slot).tick;
        self.metadata
            .upsert_block(&BlockRow::dirty(slot, alias, db_id.as_bytes(), index, tick))
            .await?;
        if index == count {
            self.container_mut(alias)?.extents.insert(db_id, count + 1);
        }
        Ok(())
    }

    /// Read block `index` of database `db`, local writes first, downloading
    /// it into the cache if needed.
    pub async fn read_block(&mut self, alias: &str, db: &str, index: u32) -> BcvResult<Vec<u8>> {
        let (dirty_key, published) = {
            let container = self.container(alias)?;
            let db = container.working.db(db)?;
            let count = container.block_count(&db.id);
            if index >= count {
                return Err(bcv_core::Error::BlockOutOfRange {
                    name: db.name.clone(),
                    index,
                    count,
                }
                .into());
            }
            let key = CacheKey::Dirty {
                container: container.alias.clone(),
                db: db.id,
                block: index,
            };
            (key, db.local.get(index as usize).copied())
        };
        if let Some(slot) = self.cache.find(&dirty_key)
            && self.cache.entry(slot).valid
        {
            self.cache.touch(slot);
            return self.file.read_slot(slot).await;
        }
        let id = published.ok_or_else(|| {
            BcvError::Internal(format!("appended block {index} of {db} is not cached"))
        })?;
        self.read_clean(alias, id).await
    }

    async fn read_clean(&mut self, alias: &str, id: BlockId) -> BcvResult<Vec<u8>> {
        let key = CacheKey::Clean(id);
        let slot = self.start_fetch(alias, id).await?;
        self.cache.pin(slot);
        let result = self.wait_clean(slot, &key).await;
        // A failed download discards the slot and its pin with it.
        if self.cache.entry(slot).key.as_ref() == Some(&key) {
            self.cache.unpin(slot);
        }
        result
    }

    async fn wait_clean(&mut self, slot: u32, key: &CacheKey) -> BcvResult<Vec<u8>> {
        while self.cache.entry(slot).key.as_ref() == Some(key) && !self.cache.entry(slot).valid {
            if !self.pump().await {
                break;
            }
        }
        let outcome = self.take_block_event(slot);
        if self.cache.entry(slot).key.as_ref() == Some(key) && self.cache.entry(slot).valid {
            return self.file.read_slot(slot).await;
        }
        Err(match outcome {
            Some(Err(info)) => info.into(),
            _ => BcvError::Internal(format!("download of {key:?} was abandoned")),
        })
    }

    /// Download every block of `alias` that is not cached yet.
    #[instrument(skip(self))]
    pub async fn prefetch(&mut self, alias: &str) -> BcvResult<PrefetchStats> {
        let wanted: Vec<BlockId> = {
            let container = self.container(alias)?;
            let mut seen = HashSet::new();
            container
                .working
                .dbs
                .iter()
                .flat_map(|db| db.local.iter().copied())
                .filter(|id| seen.insert(*id))
                .filter(|id| self.cache.find(&CacheKey::Clean(*id)).is_none())
                .collect()
        };
        let mut slots = HashSet::new();
        for id in wanted {
            while self.outstanding() >= self.config.n_request {
                self.pump().await;
            }
            slots.insert(self.start_fetch(alias, id).await?);
        }
        while self.pump().await {}

        let mut stats = PrefetchStats::default();
        for slot in slots {
            match self.take_block_event(slot) {
                Some(Ok(())) => stats.fetched += 1,
                Some(Err(_)) => stats.failed += 1,
                None => {}
            }
        }
        info!(alias, fetched = stats.fetched, failed = stats.failed, "prefetch finished");
        Ok(stats)
    }

    /// Publish dirty blocks and staged database changes of `alias`.
    ///
    /// The manifest is written conditionally on the ETag it was read with.
    /// If someone else published first the upload fails with status `412`,
    /// local changes are kept, and the caller should poll and retry.
    #[instrument(skip(self))]
    pub async fn upload(&mut self, alias: &str) -> BcvResult<UploadStats> {
        self.container(alias)?.check_writable()?;
        self.wait_idle(alias).await?;
        let state = {
            let container = self.container(alias)?;
            let has_dirty = !self.cache.dirty_entries(alias).is_empty();
            let only = |f: fn(&Staged) -> bool| {
                !container.staged.is_empty() && container.staged.iter().all(f)
            };
            if has_dirty {
                ContainerState::Upload
            } else if only(|s| matches!(s, Staged::Copy { .. })) {
                ContainerState::Copy
            } else if only(|s| matches!(s, Staged::Delete { .. })) {
                ContainerState::Delete
            } else {
                ContainerState::Upload
            }
        };
        self.set_state(alias, state);
        let result = self.upload_inner(alias).await;
        self.finish_op(alias).await;
        result
    }

    async fn upload_inner(&mut self, alias: &str) -> BcvResult<UploadStats> {
        let (handle, mut next, staged) = {
            let container = self.container(alias)?;
            (
                container.handle.clone(),
                (*container.manifest).clone(),
                container.staged.clone(),
            )
        };
        let now = bcv_core::now_ms();
        for change in &staged {
            change.apply(&mut next, now)?;
        }

        let mut hash = ManifestHash::build(&next, None, false);
        let mut assigned = Vec::new();
        let mut orphaned = Vec::new();
        let mut puts = Vec::new();
        let mut superseded = Vec::new();
        for (slot, db_id, block) in self.cache.dirty_entries(alias) {
            let Some(di) = next.find_db_by_id(&db_id) else {
                orphaned.push(slot);
                continue;
            };
            let data = self.file.read_slot(slot).await?;
            let assignment = assign_block_id(&next, Some(&hash), &data)?;
            let id = assignment.id();
            hash.insert(id);
            if let BlockAssignment::New(_) = assignment {
                puts.push((id, Bytes::from(data)));
            }
            let db = &mut next.dbs[di];
            let pos = block as usize;
            match pos.cmp(&db.local.len()) {
                Ordering::Less => {
                    superseded.push(db.local[pos]);
                    db.local[pos] = id;
                }
                Ordering::Equal => db.local.push(id),
                Ordering::Greater => {
                    return Err(BcvError::Internal(format!(
                        "block {block} of {} written past the end",
                        db.name
                    )));
                }
            }
            assigned.push((slot, id));
        }

        self.put_blocks(&handle, &puts).await?;

        let n_gc = add_gc(&mut next, superseded, now);
        for db in &mut next.dbs {
            if db.is_modified() {
                db.version += 1;
            }
        }
        next.commit_local();
        let etag = self.publish(&handle, &mut next).await?;

        for (slot, id) in &assigned {
            if self.cache.find(&CacheKey::Clean(*id)).is_some() {
                self.cache.discard(*slot);
                self.metadata.delete_block(i64::from(*slot)).await?;
                continue;
            }
            self.cache.make_clean(*slot, *id)?;
            let tick = self.cache.entry(*slot).tick;
            self.metadata
                .upsert_block(&BlockRow::clean(*slot, id.as_bytes(), tick))
                .await?;
        }
        for slot in orphaned {
            self.cache.discard(slot);
            self.metadata.delete_block(i64::from(slot)).await?;
        }

        let data = next.compose();
        let container = self.container_mut(alias)?;
        container.staged.clear();
        container.extents.clear();
        container.install(next);
        self.metadata
            .update_manifest(alias, &data, Some(&etag))
            .await?;

        let stats = UploadStats {
            blocks_written: assigned.len(),
            blocks_uploaded: puts.len(),
            changes: staged.len(),
            etag: Some(etag),
        };
        info!(
            alias,
            written = stats.blocks_written,
            uploaded = stats.blocks_uploaded,
            changes = stats.changes,
            gc = n_gc,
            etag = ?stats.etag,
            "upload published"
        );
        Ok(stats)
    }

    /// PUT block objects, at most `n_write` at a time.
    async fn put_blocks(
        &mut self,
        handle: &Arc<dyn CloudStorage>,
        puts: &[(BlockId, Bytes)],
    ) -> BcvResult<()> {
        for chunk in puts.chunks(self.config.n_write.max(1)) {
            let calls: Vec<u64> = chunk
                .iter()
                .map(|(id, data)| {
                    self.submit_call(
                        handle.clone(),
                        Request::Put {
                            key: id.to_object_key(),
                            data: data.clone(),
                            condition: PutCondition::None,
                        },
                    )
                })
                .collect();
            let mut first_err = None;
            for call in calls {
                if let Err(e) = self.wait_call(call).await {
                    first_err.get_or_insert(e);
                }
            }
            if let Some(e) = first_err {
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Write `manifest` conditionally on the ETag it carries and store the
    /// new ETag in it.
    pub(crate) async fn publish(
        &mut self,
        handle: &Arc<dyn CloudStorage>,
        manifest: &mut Manifest,
    ) -> BcvResult<String> {
        let request = publish_request(manifest);
        let result = self.call(handle, request).await;
        let etag = published(handle.container(), result)?;
        manifest.etag = Some(etag.clone());
        Ok(etag)
    }

    pub(crate) async fn install_published(
        &mut self,
        alias: &str,
        manifest: &Manifest,
    ) -> BcvResult<()> {
        let data = manifest.compose();
        self.container_mut(alias)?.install(manifest.clone());
        self.metadata
            .update_manifest(alias, &data, manifest.etag.as_deref())
            .await?;
        Ok(())
    }

    /// Create a remote container holding an empty manifest. The container
    /// itself is created if the storage module reports it missing.
    #[instrument(skip(self, auth))]
    pub async fn create(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        auth: Option<String>,
    ) -> BcvResult<()> {
        let handle = self.open_handle(storage, account, container, auth).await?;
        let manifest = Manifest::new(self.config.block_size, self.config.name_bytes)?;
        let put = Request::Put {
            key: MANIFEST_KEY.to_string(),
            data: Bytes::from(manifest.compose()),
            condition: PutCondition::IfNotExists,
        };
        match self.call(&handle, put.clone()).await {
            Ok(_) => {}
            Err(e) if e.status() == Some(HTTP_NOT_FOUND) => {
                debug!(container, "creating remote container");
                self.call(&handle, Request::Create).await?;
                self.call(&handle, put).await?;
            }
            Err(e) => return Err(e.into()),
        }
        self.call(&handle, empty_kv_put()?).await?;
        info!(container, block_size = manifest.block_size, "created container");
        Ok(())
    }

    /// Delete a remote container and everything in it. Aliases attached to
    /// it are detached first.
    #[instrument(skip(self, auth))]
    pub async fn destroy(
        &mut self,
        storage: &str,
        account: &str,
        container: &str,
        auth: Option<String>,
    ) -> BcvResult<()> {
        let attached: Vec<String> = self
            .containers
            .values()
            .filter(|c| c.remote == container && c.storage == storage && c.account == account)
            .map(|c| c.alias.to_string())
            .collect();
        for alias in attached {
            info!(alias, container, "detaching before destroy");
            self.detach(&alias).await?;
        }
        let handle = self.open_handle(storage, account, container, auth).await?;
        self.call(&handle, Request::Destroy).await?;
        info!(container, "destroyed container");
        Ok(())
    }

    async fn open_handle(
        &self,
        storage: &str,
        account: &str,
        container: &str,
        auth: Option<String>,
    ) -> BcvResult<Arc<dyn CloudStorage>> {
        let config = StorageConfig::from_attach(storage, account).map_err(bcv_core::Error::Config)?;
        Ok(self.opener.open(&config, container, auth).await?)
    }

    /// The encryption key of `alias`, if it was attached with `SECURE`.
    pub fn encryption_key(&self, alias: &str) -> BcvResult<Option<[u8; 16]>> {
        Ok(self.container(alias)?.encryption_key)
    }
}

/// Conditional write of `manifest` on the ETag it carries, which is taken.
pub(crate) fn publish_request(manifest: &mut Manifest) -> Request {
    let condition = match manifest.etag.take() {
        Some(etag) => PutCondition::IfMatch(etag),
        None => PutCondition::IfNotExists,
    };
    Request::Put {
        key: MANIFEST_KEY.to_string(),
        data: Bytes::from(manifest.compose()),
        condition,
    }
}

/// ETag of a manifest written by a [`publish_request`].
pub(crate) fn published(container: &str, result: StorageResult<Response>) -> BcvResult<String> {
    match result {
        Ok(response) => stored(response),
        Err(e) => {
            if e.status() == Some(HTTP_PRECONDITION_FAILED) {
                warn!(container, "manifest changed remotely; poll and retry");
            }
            Err(e.into())
        }
    }
}

//! Garbage collection of unreferenced blocks, run as a chain of dispatcher
//! requests so the daemon keeps serving clients while it runs.
//!
//! A cleanup refreshes the manifest, lists the container, adds blocks found
//! there but absent from the manifest to the GC list, deletes GC entries
//! older than the retention period and publishes the shortened list. Each
//! step is a tagged request; [`Engine::on_cleanup`] issues the next one when
//! the previous completes.

use crate::container::{ContainerState, Deferred};
use crate::dispatch::{Job, Request, Response};
use crate::engine::{Engine, EngineEvent, Tag, listed, manifest_fetch};
use crate::error::{BcvError, BcvResult, ErrorInfo};
use crate::lifecycle::{publish_request, published};
use bcv_core::mhash::{add_strays, partition_gc};
use bcv_core::retry::HTTP_NOT_FOUND;
use bcv_core::{BlockId, GcEntry, Manifest};
use bcv_storage::{CloudStorage, ContinuationToken, StorageResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub objects_listed: usize,
    /// Unreferenced blocks found in the container and added to the GC list.
    pub strays: usize,
    pub deleted: usize,
    /// Deletes that failed; the entries stay on the GC list.
    pub failed: usize,
    /// Entries left on the GC list.
    pub retained: usize,
}

/// Request a running cleanup is waiting on.
#[derive(Debug, Clone)]
pub(crate) enum CleanupStep {
    Poll,
    List,
    PublishStrays,
    Delete(GcEntry),
    PublishGc,
}

/// State of one running cleanup.
pub(crate) struct CleanupJob {
    alias: Arc<str>,
    retain: Duration,
    handle: Arc<dyn CloudStorage>,
    keys: Vec<String>,
    /// Manifest being edited, published as the GC list changes.
    next: Manifest,
    eligible: VecDeque<GcEntry>,
    keep: Vec<GcEntry>,
    failed: Vec<GcEntry>,
    /// Deletes in flight.
    running: usize,
    stats: CleanupStats,
}

impl Engine {
    /// Delete unreferenced blocks from the remote container.
    ///
    /// Blocks found in the container but absent from the manifest are first
    /// added to the GC list. Entries older than `retain` are then deleted,
    /// every entry when `retain` is zero.
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self, alias: &str, retain: Duration) -> BcvResult<CleanupStats> {
        self.container(alias)?.check_writable()?;
        self.wait_idle(alias).await?;
        if !self.start_cleanup(alias, retain)? {
            return Err(BcvError::Busy(format!("{alias} is already being cleaned up")));
        }
        let event = self
            .wait_event(|e| matches!(e, EngineEvent::Cleaned { alias: a, .. } if **a == *alias))
            .await;
        match event {
            Some(EngineEvent::Cleaned { result, .. }) => result.map_err(BcvError::from),
            _ => Err(BcvError::Internal(format!("cleanup of {alias} was abandoned"))),
        }
    }

    /// Begin a cleanup of `alias` without waiting.
    ///
    /// Returns false if one is already running, or if another operation is
    /// and the cleanup was queued behind it. An [`EngineEvent::Cleaned`]
    /// reports the outcome of the cleanup that runs.
    pub fn start_cleanup(&mut self, alias: &str, retain: Duration) -> BcvResult<bool> {
        let running = self.cleanups.contains_key(alias);
        let container = self.container_mut(alias)?;
        container.check_writable()?;
        if running {
            return Ok(false);
        }
        if !container.is_idle() {
            if container.defer(Deferred::Cleanup { retain }) {
                debug!(container = alias, running = container.state.as_str(), "cleanup deferred");
            }
            return Ok(false);
        }
        container.state = ContainerState::Delete;
        let shared = container.alias.clone();
        let handle = container.handle.clone();
        let request = manifest_fetch(&container.manifest);
        let next = (*container.manifest).clone();
        self.cleanups.insert(
            shared.clone(),
            CleanupJob {
                alias: shared.clone(),
                retain,
                handle,
                keys: Vec::new(),
                next,
                eligible: VecDeque::new(),
                keep: Vec::new(),
                failed: Vec::new(),
                running: 0,
                stats: CleanupStats::default(),
            },
        );
        self.submit_cleanup(&shared, CleanupStep::Poll, request)?;
        Ok(true)
    }

    pub(crate) async fn on_cleanup(
        &mut self,
        alias: Arc<str>,
        step: CleanupStep,
        result: StorageResult<Response>,
    ) {
        if !self.cleanups.contains_key(&alias) {
            debug!(container = %alias, ?step, "completion for a finished cleanup");
            return;
        }
        let outcome = match self.cleanup_step(&alias, step, result).await {
            Ok(true) => return,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        let result = match (outcome, self.cleanups.remove(&alias)) {
            (Ok(()), Some(job)) => Ok(job.stats),
            (Ok(()), None) => Err(BcvError::Internal(format!("cleanup of {alias} vanished"))),
            (Err(e), _) => Err(e),
        };
        match &result {
            Ok(stats) => info!(
                alias = %alias,
                listed = stats.objects_listed,
                strays = stats.strays,
                deleted = stats.deleted,
                failed = stats.failed,
                "cleanup finished"
            ),
            Err(e) => warn!(alias = %alias, error = %e, "cleanup failed"),
        }
        self.events.push_back(EngineEvent::Cleaned {
            alias: alias.clone(),
            result: result.map_err(|e| ErrorInfo::from(&e)),
        });
        self.finish_op(&alias).await;
    }

    /// Handle the completion of `step`. Returns true while requests of the
    /// cleanup are still outstanding.
    async fn cleanup_step(
        &mut self,
        alias: &Arc<str>,
        step: CleanupStep,
        result: StorageResult<Response>,
    ) -> BcvResult<bool> {
        match step {
            CleanupStep::Poll => {
                self.finish_poll(alias, result).await?;
                let manifest = (*self.container(alias)?.manifest).clone();
                self.cleanup_job(alias)?.next = manifest;
                self.submit_cleanup(alias, CleanupStep::List, list_request(None))?;
                Ok(true)
            }
            CleanupStep::List => {
                let page = listed(result?)?;
                self.cleanup_job(alias)?.keys.extend(page.keys);
                match page.next_token {
                    Some(token) => {
                        self.submit_cleanup(alias, CleanupStep::List, list_request(Some(token)))?;
                        Ok(true)
                    }
                    None => self.collect_strays(alias),
                }
            }
            CleanupStep::PublishStrays => {
                self.install_cleanup_manifest(alias, result).await?;
                self.start_deletes(alias)
            }
            CleanupStep::Delete(entry) => {
                let job = self.cleanup_job(alias)?;
                job.running = job.running.saturating_sub(1);
                match result {
                    Ok(_) => job.stats.deleted += 1,
                    Err(e) if e.status() == Some(HTTP_NOT_FOUND) => job.stats.deleted += 1,
                    Err(e) => {
                        warn!(block = %entry.block, error = %e, "delete failed; keeping on GC list");
                        job.failed.push(entry);
                    }
                }
                self.continue_deletes(alias)
            }
            CleanupStep::PublishGc => {
                self.install_cleanup_manifest(alias, result).await?;
                Ok(false)
            }
        }
    }

    fn cleanup_job(&mut self, alias: &str) -> BcvResult<&mut CleanupJob> {
        self.cleanups
            .get_mut(alias)
            .ok_or_else(|| BcvError::Internal(format!("no cleanup running for {alias}")))
    }

    fn submit_cleanup(&mut self, alias: &str, step: CleanupStep, request: Request) -> BcvResult<()> {
        let job = self.cleanup_job(alias)?;
        let tag = Tag::Cleanup {
            alias: job.alias.clone(),
            step,
        };
        let handle = job.handle.clone();
        self.dispatcher.submit(Job::new(tag, handle, request));
        Ok(())
    }

    /// Add listed blocks the manifest does not know to its GC list, stamped
    /// with the current time so they age out like any other entry.
    fn collect_strays(&mut self, alias: &str) -> BcvResult<bool> {
        let job = self.cleanup_job(alias)?;
        let keys = mem::take(&mut job.keys);
        let name_bytes = job.next.name_bytes;
        let strays = add_strays(
            &mut job.next,
            keys.iter()
                .filter_map(|key| BlockId::from_object_key(key, name_bytes)),
            bcv_core::now_ms(),
        );
        job.stats.objects_listed = keys.len();
        job.stats.strays = strays;
        if strays == 0 {
            return self.start_deletes(alias);
        }
        info!(alias, strays, "adding stray blocks to the GC list");
        let request = publish_request(&mut job.next);
        self.submit_cleanup(alias, CleanupStep::PublishStrays, request)?;
        Ok(true)
    }

    async fn install_cleanup_manifest(
        &mut self,
        alias: &str,
        result: StorageResult<Response>,
    ) -> BcvResult<()> {
        let job = self.cleanup_job(alias)?;
        let etag = published(job.handle.container(), result)?;
        job.next.etag = Some(etag);
        let next = job.next.clone();
        self.install_published(alias, &next).await
    }

    fn start_deletes(&mut self, alias: &str) -> BcvResult<bool> {
        let job = self.cleanup_job(alias)?;
        let cutoff = (!job.retain.is_zero())
            .then(|| bcv_core::now_ms().saturating_sub(job.retain.as_millis() as u64));
        let (eligible, keep) = partition_gc(&job.next.gc, cutoff);
        job.eligible = eligible.into();
        job.keep = keep;
        self.continue_deletes(alias)
    }

    /// Keep up to `n_write` deletes in flight. Once all are done, publish
    /// the GC list without the deleted entries.
    fn continue_deletes(&mut self, alias: &str) -> BcvResult<bool> {
        let limit = self.config.n_write.max(1);
        loop {
            let job = self.cleanup_job(alias)?;
            if job.running >= limit {
                return Ok(true);
            }
            let Some(entry) = job.eligible.pop_front() else {
                break;
            };
            job.running += 1;
            let request = Request::Delete {
                key: entry.block.to_object_key(),
                etag: None,
            };
            self.submit_cleanup(alias, CleanupStep::Delete(entry), request)?;
        }

        let job = self.cleanup_job(alias)?;
        if job.running > 0 {
            return Ok(true);
        }
        job.stats.failed = job.failed.len();
        let failed = mem::take(&mut job.failed);
        job.keep.extend(failed);
        job.stats.retained = job.keep.len();
        if job.stats.deleted == 0 {
            return Ok(false);
        }
        job.next.gc = mem::take(&mut job.keep);
        let request = publish_request(&mut job.next);
        self.submit_cleanup(alias, CleanupStep::PublishGc, request)?;
        Ok(true)
    }
}

fn list_request(marker: Option<ContinuationToken>) -> Request {
    Request::List {
        prefix: String::new(),
        marker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcv_core::DaemonConfig;
    use bcv_storage::{StorageOp, StorageOpener};

    async fn attached_engine(dir: &std::path::Path) -> (Engine, Arc<bcv_storage::MemoryAccount>) {
        let opener = StorageOpener::new();
        let account = opener.memory_account("acct");
        let mut engine = Engine::open(DaemonConfig::for_testing(dir), opener, None)
            .await
            .unwrap();
        engine.create("memory", "acct", "cont", None).await.unwrap();
        engine
            .attach("memory", "acct", "cont", None, None, 0)
            .await
            .unwrap();
        engine.take_events();
        (engine, account)
    }

    #[tokio::test]
    async fn test_work_on_busy_container_waits_its_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _account) = attached_engine(dir.path()).await;

        assert!(engine.start_cleanup("cont", Duration::ZERO).unwrap());
        assert_eq!(engine.container("cont").unwrap().state, ContainerState::Delete);
        assert!(!engine.start_cleanup("cont", Duration::ZERO).unwrap());
        assert!(!engine.start_poll("cont").unwrap());
        assert!(!engine.start_poll("cont").unwrap());
        assert!(!engine.request_detach("cont").await.unwrap());
        assert_eq!(
            engine.container("cont").unwrap().deferred,
            VecDeque::from([Deferred::Poll])
        );

        while engine.pump().await {}
        let events = engine.take_events();
        assert!(
            matches!(
                &events[..],
                [
                    EngineEvent::Cleaned { result: Ok(_), .. },
                    EngineEvent::Polled { result: Ok(false), .. },
                    EngineEvent::Detached { result: Ok(()), .. },
                ]
            ),
            "unexpected events {events:?}"
        );
        assert!(engine.container("cont").is_err());
    }

    #[tokio::test]
    async fn test_deletes_stay_within_write_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, account) = attached_engine(dir.path()).await;
        let limit = engine.config.n_write.max(1);
        let name_bytes = engine.config.name_bytes;

        let mut manifest = (*engine.container("cont").unwrap().manifest).clone();
        let doomed: Vec<BlockId> = (0..limit * 2 + 1)
            .map(|_| BlockId::random(name_bytes).unwrap())
            .collect();
        bcv_core::mhash::add_gc(&mut manifest, doomed.iter().copied(), 1);
        let handle = engine.container("cont").unwrap().handle.clone();
        engine.publish(&handle, &mut manifest).await.unwrap();
        engine.install_published("cont", &manifest).await.unwrap();

        assert!(engine.start_cleanup("cont", Duration::ZERO).unwrap());
        let mut most = 0;
        while !engine.cleanups.is_empty() {
            if let Some(job) = engine.cleanups.get("cont") {
                most = most.max(job.running);
            }
            assert!(engine.pump().await);
        }
        assert!(most <= limit);
        assert_eq!(account.request_count(StorageOp::Delete), doomed.len());
        let Some(EngineEvent::Cleaned { result: Ok(stats), .. }) = engine.take_events().pop() else {
            panic!("cleanup did not report");
        };
        assert_eq!(stats.deleted, doomed.len());
        assert!(engine.container("cont").unwrap().manifest.gc.is_empty());
        assert!(engine.container("cont").unwrap().is_idle());
    }
}

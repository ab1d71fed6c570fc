//! Attached containers and their staged, unpublished changes.

use crate::auth::AuthTarget;
use crate::error::{BcvError, BcvResult};
use crate::kv::KvStore;
use crate::protocol::{ATTACH_READONLY, ATTACH_SECURE};
use bcv_core::mhash::delete_blocks;
use bcv_core::{DbId, Manifest, ManifestDb};
use bcv_storage::CloudStorage;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Lifecycle operation in progress on a container. At most one runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    #[default]
    None,
    Poll,
    Upload,
    Copy,
    Delete,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Poll => "poll",
            Self::Upload => "upload",
            Self::Copy => "copy",
            Self::Delete => "delete",
        }
    }
}

/// Background work held back until the running lifecycle operation ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    Poll,
    Cleanup { retain: Duration },
}

/// A database-level change waiting for the next upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staged {
    CreateDb { id: DbId, name: String },
    Copy { from: String, to: String, id: DbId },
    Delete { name: String },
}

impl Staged {
    /// Name of the database the change produces or removes.
    pub fn target(&self) -> &str {
        match self {
            Self::CreateDb { name, .. } | Self::Delete { name } => name,
            Self::Copy { to, .. } => to,
        }
    }

    /// Apply the change to `manifest`. Blocks of a deleted database go on
    /// the GC list stamped with `now_ms`.
    pub fn apply(&self, manifest: &mut Manifest, now_ms: u64) -> BcvResult<()> {
        match self {
            Self::CreateDb { id, name } => {
                let mut db = ManifestDb::new(*id, name)?;
                db.version = 1;
                manifest.insert_db(db)?;
            }
            Self::Copy { from, to, id } => {
                let src = manifest.db(from)?;
                let mut db = ManifestDb::new(*id, to)?;
                db.parent = Some(src.id);
                db.version = 1;
                db.original = src.original.clone();
                db.local = src.original.clone();
                manifest.insert_db(db)?;
            }
            Self::Delete { name } => {
                let index = manifest
                    .find_db(name)
                    .ok_or_else(|| bcv_core::Error::NoSuchDatabase(name.clone()))?;
                delete_blocks(manifest, index, now_ms);
                manifest.remove_db(index);
            }
        }
        Ok(())
    }
}

/// An attached container.
pub struct Container {
    pub alias: Arc<str>,
    /// Storage module spec as given at attach time.
    pub storage: String,
    pub account: String,
    /// Name of the remote container.
    pub remote: String,
    pub handle: Arc<dyn CloudStorage>,
    /// Last manifest read from or published to the remote store.
    pub manifest: Arc<Manifest>,
    /// `manifest` with the staged changes applied.
    pub working: Manifest,
    pub flags: u32,
    pub state: ContainerState,
    pub staged: Vec<Staged>,
    /// Logical block counts of databases grown by local writes.
    pub extents: HashMap<DbId, u32>,
    pub encryption_key: Option<[u8; 16]>,
    /// Cache key index for encrypted containers, 0 otherwise.
    pub key_index: u32,
    /// Daemon clients bound to the container.
    pub n_client: u32,
    /// Work to start, in order, once `state` returns to `None`.
    pub deferred: VecDeque<Deferred>,
    /// Detach requested; it completes once the container is idle and no
    /// client is bound.
    pub detach_pending: bool,
    /// Key-value store, as last read from or written to the container.
    pub kv: Option<KvStore>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("alias", &self.alias)
            .field("storage", &self.storage)
            .field("remote", &self.remote)
            .field("etag", &self.manifest.etag)
            .field("state", &self.state)
            .field("staged", &self.staged.len())
            .field("deferred", &self.deferred)
            .field("detach_pending", &self.detach_pending)
            .finish_non_exhaustive()
    }
}

impl Container {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alias: &str,
        storage: &str,
        account: &str,
        remote: &str,
        handle: Arc<dyn CloudStorage>,
        manifest: Manifest,
        flags: u32,
        encryption_key: Option<[u8; 16]>,
        key_index: u32,
    ) -> Self {
        Self {
            alias: Arc::from(alias),
            storage: storage.to_string(),
            account: account.to_string(),
            remote: remote.to_string(),
            handle,
            working: manifest.clone(),
            manifest: Arc::new(manifest),
            flags,
            state: ContainerState::None,
            staged: Vec::new(),
            extents: HashMap::new(),
            encryption_key,
            key_index,
            n_client: 0,
            deferred: VecDeque::new(),
            detach_pending: false,
            kv: None,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.flags & ATTACH_READONLY != 0
    }

    pub fn is_secure(&self) -> bool {
        self.flags & ATTACH_SECURE != 0
    }

    pub fn auth_target(&self) -> AuthTarget {
        AuthTarget {
            storage: self.storage.clone(),
            account: self.account.clone(),
            container: self.remote.clone(),
        }
    }

    /// True when no lifecycle operation is running.
    pub fn is_idle(&self) -> bool {
        self.state == ContainerState::None
    }

    /// Queue `op` behind the running operation. Returns false if the same
    /// kind of work is already queued.
    pub fn defer(&mut self, op: Deferred) -> bool {
        if self
            .deferred
            .iter()
            .any(|queued| mem::discriminant(queued) == mem::discriminant(&op))
        {
            return false;
        }
        self.deferred.push_back(op);
        true
    }

    /// Fail with `ReadOnly` for containers attached read-only.
    pub fn check_writable(&self) -> BcvResult<()> {
        if self.is_readonly() {
            return Err(BcvError::ReadOnly(self.alias.to_string()));
        }
        Ok(())
    }

    /// Logical number of blocks in the working copy of database `id`,
    /// counting blocks appended locally.
    pub fn block_count(&self, id: &DbId) -> u32 {
        let published = self
            .working
            .find_db_by_id(id)
            .map(|i| self.working.dbs[i].block_count())
            .unwrap_or(0);
        published.max(self.extents.get(id).copied().unwrap_or(0))
    }

    /// Stage a change after checking it applies to the working copy.
    pub fn stage(&mut self, change: Staged) -> BcvResult<()> {
        let mut working = self.working.clone();
        change.apply(&mut working, bcv_core::now_ms())?;
        self.working = working;
        self.staged.push(change);
        Ok(())
    }

    /// Replace the published manifest and rebuild the working copy.
    ///
    /// Staged changes that no longer apply are dropped.
    pub fn install(&mut self, manifest: Manifest) {
        let now = bcv_core::now_ms();
        let mut working = manifest.clone();
        self.staged.retain(|change| match change.apply(&mut working, now) {
            Ok(()) => true,
            Err(e) => {
                warn!(container = %self.alias, change = ?change, error = %e, "dropping staged change");
                false
            }
        });
        self.working = working;
        self.manifest = Arc::new(manifest);
    }

    /// Forget every staged change and local extent.
    pub fn reset_working(&mut self) {
        self.staged.clear();
        self.extents.clear();
        self.working = (*self.manifest).clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcv_core::BlockId;
    use bcv_storage::{MemoryAccount, MemoryBackend};

    fn container(manifest: Manifest) -> Container {
        let handle: Arc<dyn CloudStorage> =
            Arc::new(MemoryBackend::new(MemoryAccount::new("acct"), "cont", None));
        Container::new("main", "memory", "acct", "cont", handle, manifest, 0, None, 0)
    }

    fn manifest_with_a() -> Manifest {
        let mut m = Manifest::new(4096, 16).unwrap();
        let mut db = ManifestDb::new(DbId::from_bytes([1; 16]), "a.db").unwrap();
        db.original = vec![BlockId::random(16).unwrap(), BlockId::random(16).unwrap()];
        db.local = db.original.clone();
        m.insert_db(db).unwrap();
        m
    }

    #[test]
    fn test_copy_shares_block_array() {
        let mut c = container(manifest_with_a());
        c.stage(Staged::Copy {
            from: "a.db".into(),
            to: "b.db".into(),
            id: DbId::from_bytes([2; 16]),
        })
        .unwrap();
        let a = c.working.db("a.db").unwrap();
        let b = c.working.db("b.db").unwrap();
        assert_eq!(a.local, b.local);
        assert_eq!(b.parent, Some(a.id));
        // The published manifest is untouched.
        assert!(c.manifest.find_db("b.db").is_none());

        c.reset_working();
        assert!(c.working.find_db("b.db").is_none());
        assert!(c.staged.is_empty());
    }

    #[test]
    fn test_stage_rejects_bad_change() {
        let mut c = container(manifest_with_a());
        let err = c
            .stage(Staged::Delete {
                name: "missing.db".into(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            BcvError::Core(bcv_core::Error::NoSuchDatabase(_))
        ));
        assert!(c.staged.is_empty());
        assert!(
            c.stage(Staged::CreateDb {
                id: DbId::from_bytes([3; 16]),
                name: "a.db".into()
            })
            .is_err()
        );
    }

    #[test]
    fn test_install_drops_changes_that_no_longer_apply() {
        let mut c = container(manifest_with_a());
        c.stage(Staged::Delete {
            name: "a.db".into(),
        })
        .unwrap();
        assert!(c.working.find_db("a.db").is_none());
        assert_eq!(c.working.gc.len(), 2);

        c.install(Manifest::new(4096, 16).unwrap());
        assert!(c.staged.is_empty());
        assert!(c.working.dbs.is_empty());
    }

    #[test]
    fn test_defer_queues_each_kind_once() {
        let mut c = container(manifest_with_a());
        assert!(c.is_idle());
        assert!(c.defer(Deferred::Poll));
        assert!(c.defer(Deferred::Cleanup {
            retain: Duration::from_secs(60)
        }));
        assert!(!c.defer(Deferred::Poll));
        assert!(!c.defer(Deferred::Cleanup {
            retain: Duration::ZERO
        }));
        assert_eq!(
            c.deferred,
            VecDeque::from([
                Deferred::Poll,
                Deferred::Cleanup {
                    retain: Duration::from_secs(60)
                }
            ])
        );
    }

    #[test]
    fn test_block_count_includes_extents() {
        let mut c = container(manifest_with_a());
        let id = DbId::from_bytes([1; 16]);
        assert_eq!(c.block_count(&id), 2);
        c.extents.insert(id, 4);
        assert_eq!(c.block_count(&id), 4);
        assert_eq!(c.block_count(&DbId::from_bytes([9; 16])), 0);
    }
}

//! Integration tests for the daemonless container lifecycle.

mod common;

use bcv_core::{BlockId, KV_KEY, MANIFEST_KEY, StorageConfig};
use bcv_daemon::{ATTACH_IFNOT, ATTACH_READONLY, ATTACH_SECURE, BcvError, Embedded, StaticAuth};
use bcv_storage::{PutCondition, StorageOp};
use bytes::Bytes;
use common::{ACCOUNT, CONTAINER, MEMORY, TestEnv, block, publish_db};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_upload_new_database_then_poll_is_unchanged() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    assert!(e.databases(CONTAINER).unwrap().is_empty());

    e.create_database(CONTAINER, "a.db").unwrap();
    e.write_block(CONTAINER, "a.db", 0, &block(1)).await.unwrap();
    e.write_block(CONTAINER, "a.db", 1, &block(2)).await.unwrap();
    let stats = e.upload(CONTAINER).await.expect("Upload failed");
    assert_eq!(stats.blocks_written, 2);
    assert_eq!(stats.blocks_uploaded, 2);
    assert_eq!(stats.changes, 1);

    // Nobody else wrote, so the manifest is unchanged.
    assert!(!e.poll(CONTAINER).await.unwrap());
    let container = e.engine().container(CONTAINER).unwrap();
    assert_eq!(container.manifest.etag, stats.etag);

    let remote = env.remote_manifest();
    assert_eq!(remote.dbs.len(), 1);
    assert_eq!(remote.db("a.db").unwrap().block_count(), 2);
    assert_eq!(e.read_block(CONTAINER, "a.db", 1).await.unwrap(), block(2));
}

#[tokio::test]
async fn test_stale_etag_conflicts_until_poll() {
    let env = TestEnv::new();
    let mut a = env.publisher().await;
    let mut b = env.embedded("b").await;
    b.attach(MEMORY, ACCOUNT, CONTAINER, None, None, 0)
        .await
        .unwrap();

    publish_db(&mut a, "a.db", 2, 10).await;

    b.create_database(CONTAINER, "b.db").unwrap();
    b.write_block(CONTAINER, "b.db", 0, &block(99)).await.unwrap();
    let err = b.upload(CONTAINER).await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");
    assert_eq!(err.code(), 412);

    // The newer manifest was not overwritten.
    let remote = env.remote_manifest();
    assert!(remote.find_db("a.db").is_some());
    assert!(remote.find_db("b.db").is_none());

    assert!(b.poll(CONTAINER).await.unwrap());
    b.upload(CONTAINER).await.expect("Retry after poll failed");

    let remote = env.remote_manifest();
    assert!(remote.find_db("a.db").is_some());
    assert!(remote.find_db("b.db").is_some());
    assert_eq!(b.read_block(CONTAINER, "b.db", 0).await.unwrap(), block(99));
    assert_eq!(b.read_block(CONTAINER, "a.db", 1).await.unwrap(), block(11));
}

#[tokio::test]
async fn test_identical_blocks_are_uploaded_once() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    e.create_database(CONTAINER, "a.db").unwrap();
    e.write_block(CONTAINER, "a.db", 0, &block(7)).await.unwrap();
    e.write_block(CONTAINER, "a.db", 1, &block(7)).await.unwrap();

    let before = env.account.request_count(StorageOp::Put);
    let stats = e.upload(CONTAINER).await.unwrap();
    assert_eq!(stats.blocks_written, 2);
    assert_eq!(stats.blocks_uploaded, 1);
    // One block and the manifest.
    assert_eq!(env.account.request_count(StorageOp::Put) - before, 2);

    let remote = env.remote_manifest();
    let db = remote.db("a.db").unwrap();
    assert_eq!(db.local[0], db.local[1]);
}

#[tokio::test]
async fn test_copy_then_revert_restores_manifest() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    publish_db(&mut e, "a.db", 3, 20).await;
    let before = e
        .engine()
        .container(CONTAINER)
        .unwrap()
        .working
        .db("a.db")
        .unwrap()
        .clone();
    let puts = env.account.request_count(StorageOp::Put);

    e.copy(CONTAINER, "a.db", "b.db").unwrap();
    assert_eq!(e.databases(CONTAINER).unwrap(), vec!["a.db", "b.db"]);

    e.revert(CONTAINER).await.unwrap();
    assert_eq!(e.databases(CONTAINER).unwrap(), vec!["a.db"]);
    let after = e.engine().container(CONTAINER).unwrap();
    assert_eq!(after.working.db("a.db").unwrap(), &before);
    assert_eq!(env.account.request_count(StorageOp::Put), puts);
}

#[tokio::test]
async fn test_copy_upload_shares_blocks() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    publish_db(&mut e, "a.db", 3, 30).await;

    let puts = env.account.request_count(StorageOp::Put);
    e.copy(CONTAINER, "a.db", "b.db").unwrap();
    let stats = e.upload(CONTAINER).await.unwrap();
    assert_eq!(stats.blocks_uploaded, 0);
    // Only the manifest.
    assert_eq!(env.account.request_count(StorageOp::Put) - puts, 1);

    let remote = env.remote_manifest();
    let a = remote.db("a.db").unwrap();
    let b = remote.db("b.db").unwrap();
    assert_eq!(a.local, b.local);
    assert_eq!(b.parent, Some(a.id));
    assert_eq!(e.read_block(CONTAINER, "b.db", 2).await.unwrap(), block(32));
}

#[tokio::test]
async fn test_revert_discards_local_writes() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    let blocks = publish_db(&mut e, "a.db", 2, 40).await;

    e.write_block(CONTAINER, "a.db", 0, &block(400)).await.unwrap();
    e.write_block(CONTAINER, "a.db", 2, &block(401)).await.unwrap();
    assert_eq!(e.read_block(CONTAINER, "a.db", 0).await.unwrap(), block(400));

    e.revert(CONTAINER).await.unwrap();
    assert_eq!(e.read_block(CONTAINER, "a.db", 0).await.unwrap(), blocks[0]);
    let err = e.read_block(CONTAINER, "a.db", 2).await.unwrap_err();
    assert!(matches!(
        err,
        BcvError::Core(bcv_core::Error::BlockOutOfRange { .. })
    ));
}

#[tokio::test]
async fn test_overwrite_and_append() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    publish_db(&mut e, "a.db", 2, 50).await;
    let old = env.remote_manifest().db("a.db").unwrap().local[0];

    let err = e
        .write_block(CONTAINER, "a.db", 3, &block(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BcvError::Core(bcv_core::Error::BlockOutOfRange { .. })
    ));

    e.write_block(CONTAINER, "a.db", 0, &block(500)).await.unwrap();
    e.write_block(CONTAINER, "a.db", 2, &block(502)).await.unwrap();
    e.upload(CONTAINER).await.unwrap();

    let remote = env.remote_manifest();
    let db = remote.db("a.db").unwrap();
    assert_eq!(db.block_count(), 3);
    assert_ne!(db.local[0], old);
    // The superseded block waits for cleanup.
    assert_eq!(remote.gc.len(), 1);
    assert_eq!(remote.gc[0].block, old);
}

#[tokio::test]
async fn test_delete_then_cleanup_removes_blocks() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    publish_db(&mut e, "a.db", 2, 60).await;

    e.delete(CONTAINER, "a.db").unwrap();
    e.upload(CONTAINER).await.unwrap();
    let remote = env.remote_manifest();
    assert!(remote.dbs.is_empty());
    assert_eq!(remote.gc.len(), 2);

    let stats = e.cleanup(CONTAINER, Duration::ZERO).await.unwrap();
    assert_eq!(stats.strays, 0);
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.retained, 0);
    assert_eq!(
        env.account.keys(CONTAINER),
        vec![KV_KEY.to_string(), MANIFEST_KEY.to_string()]
    );
    assert!(env.remote_manifest().gc.is_empty());
}

#[tokio::test]
async fn test_cleanup_collects_strays_and_honours_retention() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    publish_db(&mut e, "a.db", 2, 70).await;
    e.delete(CONTAINER, "a.db").unwrap();
    e.upload(CONTAINER).await.unwrap();

    let stray = BlockId::random(24).unwrap();
    let handle = env
        .opener
        .open(
            &StorageConfig::Memory {
                account: ACCOUNT.into(),
            },
            CONTAINER,
            None,
        )
        .await
        .unwrap();
    handle
        .put(
            &stray.to_object_key(),
            Bytes::from(block(5)),
            PutCondition::None,
        )
        .await
        .unwrap();

    // The stray is stamped when found, so it waits out the retention
    // window along with the blocks of the deleted database.
    let before = bcv_core::now_ms();
    let stats = e.cleanup(CONTAINER, Duration::from_secs(3600)).await.unwrap();
    assert_eq!(stats.strays, 1);
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.retained, 3);
    assert!(env.account.object(CONTAINER, &stray.to_object_key()).is_some());
    let gc = env.remote_manifest().gc;
    assert_eq!(gc.len(), 3);
    let found = gc.iter().find(|entry| entry.block == stray).unwrap();
    assert!(found.timestamp >= before);

    let stats = e.cleanup(CONTAINER, Duration::ZERO).await.unwrap();
    assert_eq!(stats.strays, 0);
    assert_eq!(stats.deleted, 3);
    assert!(env.account.object(CONTAINER, &stray.to_object_key()).is_none());
    assert!(env.remote_manifest().gc.is_empty());
}

#[tokio::test]
async fn test_cleanup_counts_missing_as_deleted_and_keeps_failures() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    publish_db(&mut e, "a.db", 2, 80).await;
    e.delete(CONTAINER, "a.db").unwrap();
    e.upload(CONTAINER).await.unwrap();

    env.account.fail_next(StorageOp::Delete, 404);
    for _ in 0..4 {
        env.account.fail_next(StorageOp::Delete, 500);
    }
    let stats = e.cleanup(CONTAINER, Duration::ZERO).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retained, 1);
    assert_eq!(env.remote_manifest().gc.len(), 1);
}

#[tokio::test]
async fn test_attach_refreshes_credential_on_403() {
    let env = TestEnv::new();
    let mut p = env.publisher().await;
    let blocks = publish_db(&mut p, "a.db", 1, 90).await;
    env.account.require_auth(Some("tok"));

    let mut plain = env.embedded("plain").await;
    let err = plain
        .attach(MEMORY, ACCOUNT, CONTAINER, None, None, 0)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);

    let mut e = Embedded::open_with_auth(
        env.config("authed"),
        env.opener.clone(),
        Some(Arc::new(StaticAuth::new("tok"))),
    )
    .await
    .unwrap();
    let before = env.account.key_request_count(StorageOp::Fetch, MANIFEST_KEY);
    e.attach(MEMORY, ACCOUNT, CONTAINER, None, None, 0)
        .await
        .expect("Attach with refreshed credential failed");
    assert_eq!(
        env.account.key_request_count(StorageOp::Fetch, MANIFEST_KEY) - before,
        2
    );
    assert_eq!(e.read_block(CONTAINER, "a.db", 0).await.unwrap(), blocks[0]);
}

#[tokio::test]
async fn test_readonly_attach_rejects_changes() {
    let env = TestEnv::new();
    let mut p = env.publisher().await;
    publish_db(&mut p, "a.db", 1, 100).await;

    let mut e = env.embedded("ro").await;
    e.attach(MEMORY, ACCOUNT, CONTAINER, Some("ro"), None, ATTACH_READONLY)
        .await
        .unwrap();
    assert!(matches!(
        e.create_database("ro", "b.db"),
        Err(BcvError::ReadOnly(_))
    ));
    assert!(matches!(
        e.write_block("ro", "a.db", 0, &block(1)).await,
        Err(BcvError::ReadOnly(_))
    ));
    assert!(matches!(e.upload("ro").await, Err(BcvError::ReadOnly(_))));
    assert_eq!(e.read_block("ro", "a.db", 0).await.unwrap(), block(100));
}

#[tokio::test]
async fn test_attach_alias_rules() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    let err = e
        .attach(MEMORY, ACCOUNT, CONTAINER, None, None, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BcvError::AliasInUse(_)));

    let alias = e
        .attach(MEMORY, ACCOUNT, CONTAINER, None, None, ATTACH_IFNOT)
        .await
        .unwrap();
    assert_eq!(alias, CONTAINER);

    e.create_database(CONTAINER, "a.db").unwrap();
    assert!(matches!(
        e.create_database(CONTAINER, "a.db"),
        Err(BcvError::Core(bcv_core::Error::DatabaseExists(_)))
    ));
}

#[tokio::test]
async fn test_dirty_blocks_and_keys_survive_restart() {
    let env = TestEnv::new();
    let (blocks, key) = {
        let mut e = env.publisher().await;
        let blocks = publish_db(&mut e, "a.db", 2, 110).await;
        e.write_block(CONTAINER, "a.db", 0, &block(1100)).await.unwrap();
        e.attach(MEMORY, ACCOUNT, CONTAINER, Some("sec"), None, ATTACH_SECURE)
            .await
            .unwrap();
        let key = e.engine().container("sec").unwrap().encryption_key;
        assert!(key.is_some());
        (blocks, key)
    };

    let mut e = Embedded::open(env.config("publisher"), env.opener.clone())
        .await
        .expect("Reopen failed");
    assert_eq!(e.databases(CONTAINER).unwrap(), vec!["a.db"]);
    assert_eq!(e.engine().container("sec").unwrap().encryption_key, key);

    let fetches = env.account.request_count(StorageOp::Fetch);
    assert_eq!(e.read_block(CONTAINER, "a.db", 0).await.unwrap(), block(1100));
    assert_eq!(e.read_block(CONTAINER, "a.db", 1).await.unwrap(), blocks[1]);
    assert_eq!(env.account.request_count(StorageOp::Fetch), fetches);

    let stats = e.upload(CONTAINER).await.unwrap();
    assert_eq!(stats.blocks_written, 1);
}

#[tokio::test]
async fn test_detach_and_destroy() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    publish_db(&mut e, "a.db", 1, 120).await;
    e.write_block(CONTAINER, "a.db", 0, &block(1)).await.unwrap();
    e.attach(MEMORY, ACCOUNT, CONTAINER, Some("second"), None, 0)
        .await
        .unwrap();

    e.detach("second").await.unwrap();
    assert!(matches!(
        e.poll("second").await,
        Err(BcvError::NoSuchContainer(_))
    ));
    assert!(e.engine().container(CONTAINER).is_ok());

    // Destroying an attached container detaches it first, dirty blocks
    // and all.
    e.destroy(MEMORY, ACCOUNT, CONTAINER, None).await.unwrap();
    assert!(matches!(
        e.engine().container(CONTAINER),
        Err(BcvError::NoSuchContainer(_))
    ));
    assert_eq!(e.engine().cache().dirty_entries(CONTAINER).len(), 0);
    assert!(env.account.keys(CONTAINER).is_empty());
}

#[tokio::test]
async fn test_kv_store_writes_are_conditional() {
    let env = TestEnv::new();
    let mut a = env.publisher().await;
    let mut b = env.embedded("b").await;
    b.attach(MEMORY, ACCOUNT, CONTAINER, None, None, 0)
        .await
        .unwrap();

    // Created with the container.
    let mut ours = a.kv(CONTAINER).await.unwrap();
    assert!(ours.is_empty());
    assert!(ours.etag.is_some());
    let mut theirs = b.kv(CONTAINER).await.unwrap();

    ours.set("owner", "a");
    a.kv_save(CONTAINER, &mut ours).await.unwrap();
    theirs.set("owner", "b");
    let err = b.kv_save(CONTAINER, &mut theirs).await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");

    let mut theirs = b.kv(CONTAINER).await.unwrap();
    assert_eq!(theirs.get("owner"), Some("a"));
    theirs.set("reviewer", "b");
    b.kv_save(CONTAINER, &mut theirs).await.unwrap();

    let rows = a
        .vtab("bcv_kv", Some(CONTAINER), None, u64::MAX)
        .await
        .unwrap();
    assert_eq!(
        rows,
        serde_json::json!([
            {"name": "owner", "value": "a"},
            {"name": "reviewer", "value": "b"}
        ])
    );
    assert!(a.vtab("bcv_kv", None, None, u64::MAX).await.is_err());
}

#[tokio::test]
async fn test_kv_store_missing_object_reads_empty() {
    let env = TestEnv::new();
    let mut e = env.publisher().await;
    let handle = env
        .opener
        .open(
            &StorageConfig::Memory {
                account: ACCOUNT.into(),
            },
            CONTAINER,
            None,
        )
        .await
        .unwrap();
    handle.delete(KV_KEY, None).await.unwrap();

    let mut kv = e.kv(CONTAINER).await.unwrap();
    assert!(kv.is_empty());
    assert_eq!(kv.etag, None);
    kv.set("k", "v");
    e.kv_save(CONTAINER, &mut kv).await.unwrap();
    assert!(kv.etag.is_some());
    assert!(env.account.object(CONTAINER, KV_KEY).is_some());

    let mut ro = env.embedded("ro").await;
    ro.attach(MEMORY, ACCOUNT, CONTAINER, None, None, ATTACH_READONLY)
        .await
        .unwrap();
    let mut kv = ro.kv(CONTAINER).await.unwrap();
    assert_eq!(kv.get("k"), Some("v"));
    kv.set("k", "w");
    assert!(matches!(
        ro.kv_save(CONTAINER, &mut kv).await,
        Err(BcvError::ReadOnly(_))
    ));
}

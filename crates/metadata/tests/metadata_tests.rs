mod common;

use bcv_metadata::{BlockRepo, BlockRow, ContainerRepo, MetadataError, SqliteStore};
use common::{container_row, setup_store};

#[tokio::test]
async fn test_container_crud() {
    let (_dir, store) = setup_store().await;

    store.insert_container(&container_row("main")).await.unwrap();
    assert!(matches!(
        store.insert_container(&container_row("main")).await,
        Err(MetadataError::AlreadyExists(_))
    ));

    store
        .update_manifest("main", b"manifest-bytes", Some("\"e1\""))
        .await
        .unwrap();
    let row = store.get_container("main").await.unwrap().unwrap();
    assert_eq!(row.manifest.as_deref(), Some(&b"manifest-bytes"[..]));
    assert_eq!(row.etag.as_deref(), Some("\"e1\""));

    store.insert_container(&container_row("aux")).await.unwrap();
    let aliases: Vec<_> = store
        .list_containers()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.alias)
        .collect();
    assert_eq!(aliases, vec!["aux", "main"]);

    store.delete_container("main").await.unwrap();
    assert!(store.get_container("main").await.unwrap().is_none());
    assert!(matches!(
        store.update_manifest("main", b"x", None).await,
        Err(MetadataError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_block_rows_replace_by_slot() {
    let (_dir, store) = setup_store().await;

    store
        .upsert_block(&BlockRow::clean(3, &[1u8; 16], 7))
        .await
        .unwrap();
    store
        .upsert_block(&BlockRow::dirty(4, "main", &[9u8; 16], 2, 8))
        .await
        .unwrap();
    // Reusing slot 3 replaces its previous content.
    store
        .upsert_block(&BlockRow::clean(3, &[2u8; 16], 9))
        .await
        .unwrap();

    let rows = store.list_blocks().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].slot, 4);
    assert!(rows[0].is_dirty());
    assert_eq!(rows[1].block_id.as_deref(), Some(&[2u8; 16][..]));

    store.delete_block(3).await.unwrap();
    assert_eq!(store.list_blocks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_detach_drops_dirty_rows_only() {
    let (_dir, store) = setup_store().await;
    store.insert_container(&container_row("main")).await.unwrap();
    store
        .upsert_block(&BlockRow::clean(0, &[1u8; 16], 1))
        .await
        .unwrap();
    store
        .upsert_block(&BlockRow::dirty(1, "main", &[9u8; 16], 0, 2))
        .await
        .unwrap();
    store
        .upsert_block(&BlockRow::dirty(2, "other", &[9u8; 16], 0, 3))
        .await
        .unwrap();

    store.delete_container("main").await.unwrap();
    let slots: Vec<_> = store
        .list_blocks()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.slot)
        .collect();
    assert_eq!(slots, vec![0, 2]);
    assert_eq!(store.delete_dirty_blocks("other").await.unwrap(), 1);
}

#[tokio::test]
async fn test_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocksdb.bcv");
    {
        let store = SqliteStore::new(&path).await.unwrap();
        store.insert_container(&container_row("main")).await.unwrap();
        store
            .upsert_block(&BlockRow::clean(5, &[4u8; 24], 11))
            .await
            .unwrap();
        store.pool().close().await;
    }
    let store = SqliteStore::new(&path).await.unwrap();
    assert!(store.get_container("main").await.unwrap().is_some());
    assert_eq!(store.list_blocks().await.unwrap()[0].slot, 5);
}

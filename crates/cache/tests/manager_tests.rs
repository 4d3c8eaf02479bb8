//! Cache manager behavior: restoration, placement, eviction, datasets.

mod common;

use common::{fixture, FakeArchive};
use futures::StreamExt;
use larder_cache::{Cache, CacheError};
use larder_core::VolumeStatus;
use larder_inventory::{InventoryMutator, InventoryReader, SqliteInventory};
use larder_storage::{CacheVolume, FilesystemVolume};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_cache_restores_file_into_volume() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive
        .add_file("mds2-2119", "data/readme.txt", b"hello repository\n");

    let object = fx.manager.cache("mds2-2119/data/readme.txt", false, 0).await?;
    assert_eq!(object.volume, "main");
    assert_eq!(object.size, 17);
    assert_eq!(object.checked, 0, "fresh copies start unchecked");
    assert!(object.checksum.is_some());

    // the bytes on disk are exactly the archive's stream
    let on_disk = std::fs::read(fx.data_root.join(&object.name))?;
    assert_eq!(on_disk, b"hello repository\n");

    // read-your-writes through the inventory
    assert!(fx.manager.is_cached("mds2-2119/data/readme.txt").await?);
    let rows = fx
        .manager
        .inventory()
        .find_object("mds2-2119/data/readme.txt", None)
        .await?;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].size >= 0);
    Ok(())
}

#[tokio::test]
async fn test_cache_is_idempotent_without_recache() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("ds-1", "a.txt", b"alpha");

    let first = fx.manager.cache("ds-1/a.txt", false, 0).await?;
    let second = fx.manager.cache("ds-1/a.txt", false, 0).await?;
    assert_eq!(fx.restorer.restore_count(), 1, "second call reuses the copy");
    assert_eq!(first.name, second.name);
    assert_eq!(first.since, second.since);

    // recache replaces the copy and refreshes its timestamp
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let third = fx.manager.cache("ds-1/a.txt", true, 0).await?;
    assert_eq!(fx.restorer.restore_count(), 2);
    assert!(third.since > second.since);
    Ok(())
}

#[tokio::test]
async fn test_get_object_streams_bytes_and_fills_misses() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("ds-1", "b.bin", &[9u8; 1000]);

    assert!(!fx.manager.is_cached("ds-1/b.bin").await?);
    let (mut stream, object) = fx.manager.get_object("ds-1/b.bin").await?;
    assert_eq!(object.size, 1000);

    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk?);
    }
    assert_eq!(collected, vec![9u8; 1000]);
    assert!(fx.manager.is_cached("ds-1/b.bin").await?);
    Ok(())
}

#[tokio::test]
async fn test_uncache_removes_all_trace() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("ds-1", "a.txt", b"alpha");
    let object = fx.manager.cache("ds-1/a.txt", false, 0).await?;

    fx.manager.uncache("ds-1/a.txt").await?;
    assert!(!fx.manager.is_cached("ds-1/a.txt").await?);
    assert!(fx
        .manager
        .inventory()
        .find_object("ds-1/a.txt", None)
        .await?
        .is_empty());
    assert!(!fx.data_root.join(&object.name).exists());
    Ok(())
}

#[tokio::test]
async fn test_cache_unknown_resource_is_not_found() -> anyhow::Result<()> {
    let fx = fixture().await?;
    match fx.manager.cache("nope-1/missing.txt", false, 0).await {
        Err(CacheError::NotFound(_)) => Ok(()),
        other => anyhow::bail!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_verification_leaves_nothing_behind() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("ds-1", "bad.txt", b"payload");
    fx.archive.tamper_checksum("ds-1", "bad.txt");

    match fx.manager.cache("ds-1/bad.txt", false, 0).await {
        Err(CacheError::Restoration { .. }) => {}
        other => anyhow::bail!("expected Restoration error, got {other:?}"),
    }
    assert!(!fx.manager.is_cached("ds-1/bad.txt").await?);
    assert!(!fx.data_root.join("ds-1/bad.txt").exists());
    assert!(fx
        .manager
        .inventory()
        .find_object("ds-1/bad.txt", None)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cache_dataset_three_files() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("mds2-2119", "a.txt", b"aaa");
    fx.archive.add_file("mds2-2119", "data/b.txt", b"bbbb");
    fx.archive.add_file("mds2-2119", "data/c.csv", b"c,c,c");

    let written = fx
        .manager
        .cache_dataset("mds2-2119", None, false, 0, None)
        .await?;
    assert_eq!(written.len(), 3);

    let firsts: Vec<i64> = {
        let mut sinces = Vec::new();
        for id in ["mds2-2119/a.txt", "mds2-2119/data/b.txt", "mds2-2119/data/c.csv"] {
            let rows = fx.manager.inventory().find_object(id, None).await?;
            assert_eq!(rows.len(), 1, "{id} should have one copy");
            sinces.push(rows[0].since);
        }
        sinces
    };

    // a second pass restores nothing
    let rewritten = fx
        .manager
        .cache_dataset("mds2-2119", None, false, 0, None)
        .await?;
    assert!(rewritten.is_empty());

    // recache replaces all three with fresh timestamps
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let recached = fx
        .manager
        .cache_dataset("mds2-2119", None, true, 0, None)
        .await?;
    assert_eq!(recached.len(), 3);
    for (i, id) in ["mds2-2119/a.txt", "mds2-2119/data/b.txt", "mds2-2119/data/c.csv"]
        .iter()
        .enumerate()
    {
        let rows = fx.manager.inventory().find_object(id, None).await?;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].since > firsts[i], "{id} should be refreshed");
    }

    let summary = fx.manager.summarize_dataset("mds2-2119").await?;
    assert_eq!(summary.filecount, 3);
    assert_eq!(summary.totalsize, 12);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_cache_calls_restore_once() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("mds2-2119", "data/readme.txt", b"single flight");

    let id = "mds2-2119/data/readme.txt#1";
    let m1 = fx.manager.clone();
    let m2 = fx.manager.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { m1.cache(id, false, 0).await }),
        tokio::spawn(async move { m2.cache(id, false, 0).await }),
    );
    let a = a??;
    let b = b??;

    assert_eq!(
        fx.restorer.restore_count(),
        1,
        "exactly one restoration for N concurrent callers"
    );
    assert_eq!(a.name, b.name);
    assert_eq!(a.volume, b.volume);
    assert_eq!(
        fx.manager.inventory().find_object(id, None).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_placement_evicts_least_important_first() -> anyhow::Result<()> {
    // volume "a": capacity 100, holding an 80-byte priority-10 object and
    // a 20-byte priority-5 object
    let dir = tempfile::tempdir()?;
    let inventory = Arc::new(SqliteInventory::new(dir.path().join("inv.sqlite")).await?);
    let root = dir.path().join("vol-a");
    let volume: Arc<dyn CacheVolume> = Arc::new(FilesystemVolume::new("a", &root).await?);
    let mut cache = Cache::new(inventory.clone());
    cache
        .add_volume(volume.clone(), 100, 0, VolumeStatus::ForUpdate, None)
        .await?;

    volume.save("big", bytes::Bytes::from(vec![1u8; 80])).await?;
    inventory
        .add_object("ds/big", "a", "big", Some(&json!({"size": 80, "priority": 10})))
        .await?;
    volume.save("small", bytes::Bytes::from(vec![2u8; 20])).await?;
    inventory
        .add_object("ds/small", "a", "small", Some(&json!({"size": 20, "priority": 5})))
        .await?;
    assert_eq!(cache.free_space("a").await?, 0);

    // placing 30 bytes must evict the priority-10 object, not the
    // more-important priority-5 one
    let reservation = cache.reserve_space(30, 0).await?;
    assert_eq!(reservation.volume_name(), "a");
    drop(reservation);

    assert!(inventory.find_object("ds/big", None).await?.is_empty());
    assert_eq!(inventory.find_object("ds/small", None).await?.len(), 1);
    assert!(!root.join("big").exists());
    assert!(root.join("small").exists());
    assert_eq!(cache.free_space("a").await?, 80);

    // after writing the new 30-byte object, 50 bytes remain free
    volume.save("new", bytes::Bytes::from(vec![3u8; 30])).await?;
    inventory
        .add_object("ds/new", "a", "new", Some(&json!({"size": 30})))
        .await?;
    assert_eq!(cache.free_space("a").await?, 50);
    Ok(())
}

#[tokio::test]
async fn test_planner_insufficient_space_deletes_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let inventory = Arc::new(SqliteInventory::new(dir.path().join("inv.sqlite")).await?);
    let volume: Arc<dyn CacheVolume> =
        Arc::new(FilesystemVolume::new("a", dir.path().join("vol-a")).await?);
    let mut cache = Cache::new(inventory.clone());
    cache
        .add_volume(volume.clone(), 100, 0, VolumeStatus::ForUpdate, None)
        .await?;
    volume.save("only", bytes::Bytes::from(vec![1u8; 50])).await?;
    inventory
        .add_object("ds/only", "a", "only", Some(&json!({"size": 50})))
        .await?;

    // 500 bytes can never fit in a 100-byte volume
    match cache.reserve_space(500, 0).await {
        Err(CacheError::VolumeNotAvailable { size: 500, .. }) => {}
        other => anyhow::bail!("expected VolumeNotAvailable, got {other:?}"),
    }
    // and no victim was deleted in the failed attempt
    assert_eq!(inventory.find_object("ds/only", None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_optimally_cache_queues_dataset_then_file() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("mds2-2119", "a.txt", b"aaa");
    fx.archive.add_file("mds2-2119", "b.txt", b"bbb");

    // nothing cached: the whole dataset is queued
    fx.manager.optimally_cache("mds2-2119/a.txt", 0).await?;
    assert!(fx.manager.queue().is_queued("mds2-2119").await);

    // drain the queue reference and cache one file
    fx.manager.queue().pop_queue().await?;
    fx.manager.cache("mds2-2119/a.txt", false, 0).await?;

    // a file missing from a partially-cached dataset is queued alone
    fx.manager.optimally_cache("mds2-2119/b.txt", 0).await?;
    assert!(fx.manager.queue().is_queued("mds2-2119/b.txt").await);
    assert!(!fx.manager.queue().is_queued("mds2-2119").await);

    // an already-cached file queues nothing
    fx.manager.queue().pop_queue().await?;
    fx.manager.optimally_cache("mds2-2119/a.txt", 0).await?;
    assert!(!fx.manager.queue().has_pending().await);

    // an unknown dataset is ignored quietly
    fx.manager.optimally_cache("ghost-9/x.txt", 0).await?;
    assert!(!fx.manager.queue().has_pending().await);
    Ok(())
}

#[tokio::test]
async fn test_queue_cache_rejects_unknown_ids() -> anyhow::Result<()> {
    let fx = fixture().await?;
    match fx.manager.queue_cache("ghost-9/x.txt", false).await {
        Err(CacheError::NotFound(_)) => {}
        other => anyhow::bail!("expected NotFound, got {other:?}"),
    }
    assert!(!fx.manager.queue().has_pending().await);
    Ok(())
}

#[tokio::test]
async fn test_summaries_and_descriptions() -> anyhow::Result<()> {
    let fx = fixture().await?;
    fx.archive.add_file("mds2-2119", "data/readme.txt", b"hello");
    fx.manager.cache("mds2-2119/data/readme.txt", false, 0).await?;

    let volumes = fx.manager.summarize_volumes().await?;
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0]["name"], "main");
    assert_eq!(volumes[0]["filecount"], 1);
    assert_eq!(volumes[0]["totalsize"], 5);

    let described = fx
        .manager
        .describe_object("mds2-2119", "data/readme.txt", VolumeStatus::ForGet)
        .await?
        .expect("object should be describable");
    assert_eq!(described.size, 5);

    let files = fx
        .manager
        .select_file_objects("mds2-2119", "data/readme.txt", VolumeStatus::ForGet)
        .await?;
    assert_eq!(files.len(), 1);

    let contents = fx.manager.summarize_contents(None).await?;
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].aipid, "mds2-2119");

    assert!(fx
        .manager
        .describe_object("mds2-2119", "nope.txt", VolumeStatus::ForGet)
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn test_monitor_status_starts_never() -> anyhow::Result<()> {
    let fx = fixture().await?;
    let status = fx.manager.monitor_status().await;
    assert_eq!(status.last_ran, 0);
    assert_eq!(status.last_ran_date, "(never)");
    assert!(!status.running);

    let qstatus = fx.manager.caching_queue_status().await?;
    assert_eq!(qstatus["status"], "not running");
    assert!(qstatus["current"].is_null());
    Ok(())
}

// keep the helper type exercised even when individual tests are filtered
#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_archive_fixture_is_shareable() {
    assert_send_sync::<FakeArchive>();
}

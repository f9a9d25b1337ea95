use std::sync::Arc;

use bytes::Bytes;
use pageserver_api::value::Value;
use tokio::sync::Notify;

use super::*;
use crate::failpoint_support::{FailpointAction, FailpointKind};
use crate::tenant::harness::{test_img, TenantHarness, TIMELINE_ID};
use crate::tenant::Tenant;

const SHORT: Duration = Duration::from_millis(20);

/// A timeline with one resident L0 layer.
async fn one_layer(tenant: &Tenant) -> (Arc<Timeline>, Layer) {
    let tline = tenant
        .create_test_timeline(TIMELINE_ID, Lsn(0x10))
        .await
        .unwrap();
    {
        let mut writer = tline.writer().await;
        writer
            .put(Key::user(1, 1), Lsn(0x20), &Value::Image(test_img("foo")))
            .await
            .unwrap();
        writer.finish_write(Lsn(0x20));
    }
    tline.freeze_and_flush().await.unwrap();

    let mut layers = tline.layers_snapshot().await.historic_layers();
    assert_eq!(layers.len(), 1);
    let layer = layers.swap_remove(0);
    assert!(layer.is_likely_resident());
    (tline, layer)
}

fn assert_sizes(tline: &Timeline, resident: u64, remote: u64) {
    assert_eq!(tline.resident_physical_size(), resident);
    assert_eq!(tline.remote_physical_size(), remote);
}

#[tokio::test]
async fn evict_then_download() {
    let h = TenantHarness::create("evict_then_download").unwrap();
    let tenant = h.load().await;
    let (tline, layer) = one_layer(&tenant).await;
    let size = layer.layer_desc().file_size;
    let content = std::fs::read(layer.local_path()).unwrap();
    assert_sizes(&tline, size, 0);

    layer.evict_and_wait(SHORT).await.unwrap();
    assert!(!layer.local_path().exists());
    assert_sizes(&tline, 0, size);
    assert!(layer.info().is_remote());

    // not resident anymore
    assert!(matches!(
        layer.evict_and_wait(SHORT).await,
        Err(EvictionError::NotFound)
    ));

    // a read downloads on demand
    assert_eq!(
        tline.get(Key::user(1, 1), Lsn(0x20)).await.unwrap(),
        Bytes::from_static(b"foo")
    );
    assert!(layer.is_likely_resident());
    assert_eq!(std::fs::read(layer.local_path()).unwrap(), content);
    assert_sizes(&tline, size, 0);
}

#[tokio::test]
async fn pinned_layer_is_not_evicted() {
    let h = TenantHarness::create("pinned_layer_is_not_evicted").unwrap();
    let tenant = h.load().await;
    let (tline, layer) = one_layer(&tenant).await;

    let resident = layer.keep_resident().unwrap();
    assert_eq!(layer.pin_count(), 1);

    assert!(matches!(
        layer.evict_and_wait(SHORT).await,
        Err(EvictionError::Pinned)
    ));
    assert!(layer.local_path().exists());

    // the eviction waits for the pin to go away
    let evict = tokio::spawn({
        let layer = layer.clone();
        async move { layer.evict_and_wait(Duration::from_secs(60)).await }
    });
    tokio::time::sleep(SHORT).await;
    assert!(!evict.is_finished());
    drop(resident);

    evict.await.unwrap().unwrap();
    assert_eq!(layer.pin_count(), 0);
    assert!(!layer.local_path().exists());
    assert_sizes(&tline, 0, layer.layer_desc().file_size);
}

#[tokio::test]
async fn concurrent_downloads_share_one_attempt() {
    let h = TenantHarness::create("concurrent_downloads_share_one_attempt").unwrap();
    let tenant = h.load().await;
    let (tline, layer) = one_layer(&tenant).await;
    layer.evict_and_wait(SHORT).await.unwrap();

    let resume = Arc::new(Notify::new());
    h.failpoints.arm(
        FailpointKind::LayerDownloadBeforeRename,
        FailpointAction::Pause(resume.clone()),
    );

    let first = tokio::spawn({
        let layer = layer.clone();
        async move { layer.download().await }
    });
    h.failpoints
        .wait_for_hits(FailpointKind::LayerDownloadBeforeRename, 1)
        .await;
    assert!(layer.is_downloading());

    let second = tokio::spawn({
        let layer = layer.clone();
        async move { layer.download().await }
    });

    // downloads are not evicted
    assert!(matches!(
        layer.evict_and_wait(SHORT).await,
        Err(EvictionError::Downloading)
    ));
    // the size stays remote until the file is in place
    assert_sizes(&tline, 0, layer.layer_desc().file_size);

    h.failpoints.disarm_all();
    resume.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(
        h.failpoints
            .hit_count(FailpointKind::LayerDownloadBeforeRename),
        1
    );
    assert!(layer.is_likely_resident());
    assert_sizes(&tline, layer.layer_desc().file_size, 0);
}

#[tokio::test]
async fn failed_download_leaves_layer_evicted() {
    let h = TenantHarness::create("failed_download_leaves_layer_evicted").unwrap();
    let tenant = h.load().await;
    let (tline, layer) = one_layer(&tenant).await;
    let size = layer.layer_desc().file_size;
    layer.evict_and_wait(SHORT).await.unwrap();

    h.failpoints.arm(
        FailpointKind::LayerDownloadBeforeRename,
        FailpointAction::ReturnError,
    );
    let err = layer.download().await.unwrap_err();
    assert!(matches!(err, DownloadError::DownloadFailed(_)), "{err:?}");
    assert!(!layer.is_likely_resident());
    assert!(!layer.is_downloading());
    assert!(!layer.local_path().exists());
    assert_sizes(&tline, 0, size);

    // retrying works once the fault is gone
    h.failpoints.disarm_all();
    layer.download().await.unwrap();
    assert!(layer.is_likely_resident());
    assert_sizes(&tline, size, 0);
}

#[tokio::test]
async fn deleted_layer_removes_file_on_drop() {
    let h = TenantHarness::create("deleted_layer_removes_file_on_drop").unwrap();
    let tenant = h.load().await;
    let (tline, layer) = one_layer(&tenant).await;
    let path = layer.local_path().to_owned();

    // gc unlinks the layer and marks it deleted
    {
        let mut guard = tline.layers.write().await;
        Arc::make_mut(&mut guard).finish_gc_timeline(std::slice::from_ref(&layer));
    }
    assert_sizes(&tline, 0, 0);
    assert!(matches!(layer.download().await, Err(DownloadError::Deleted)));

    // the file goes away with the last reference
    assert!(path.exists());
    drop(layer);
    assert!(!path.exists());
    assert_sizes(&tline, 0, 0);
}

#[tokio::test]
async fn info_reflects_residency() {
    let h = TenantHarness::create("info_reflects_residency").unwrap();
    let tenant = h.load().await;
    let (_tline, layer) = one_layer(&tenant).await;

    let info = layer.info();
    assert!(!info.is_remote());
    assert_eq!(info.layer_file_name(), layer.layer_name().to_string());
    assert_eq!(info.layer_file_size(), layer.layer_desc().file_size);
    match info {
        HistoricLayerInfo::Delta {
            key_start,
            key_end,
            lsn_start,
            lsn_end,
            ..
        } => {
            assert_eq!(key_start..key_end, Key::MIN..Key::MAX);
            assert_eq!(lsn_start..lsn_end, Lsn(0x10)..Lsn(0x21));
        }
        other => panic!("expected a delta layer: {other:?}"),
    }
}

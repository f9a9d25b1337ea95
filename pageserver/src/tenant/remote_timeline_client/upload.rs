//! Helper functions to upload files to remote storage with a RemoteStorage

use anyhow::{bail, Context};
use bytes::Bytes;
use camino::Utf8Path;
use remote_storage::{GenericRemoteStorage, RemotePath, RemoteStorage};
use tokio_util::sync::CancellationToken;
use utils::id::{TenantId, TimelineId};

use super::index::IndexPart;
use super::remote_index_path;

/// Serializes and uploads the given index part data to the remote storage.
pub(super) async fn upload_index_part(
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    index_part: &IndexPart,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    tracing::trace!("uploading new index part");

    let serialized = index_part.to_json_bytes()?;
    let serialized = Bytes::from(serialized);

    let remote_path = remote_index_path(tenant_id, timeline_id);
    storage
        .upload_storage_object(serialized, &remote_path, cancel)
        .await
        .with_context(|| format!("upload index part for '{tenant_id} / {timeline_id}'"))
}

/// Uploads a layer file. A file already present remotely is overwritten.
///
/// The caller keeps the layer resident for the duration of the upload.
pub(super) async fn upload_timeline_layer(
    storage: &GenericRemoteStorage,
    local_path: &Utf8Path,
    remote_path: &RemotePath,
    metadata_size: u64,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let contents = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("read the source file for layer {local_path:?}"))?;

    let fs_size = contents.len() as u64;
    if metadata_size != fs_size {
        bail!("File {local_path:?} has its current FS size {fs_size} diferent from initially determined {metadata_size}");
    }

    storage
        .upload(Bytes::from(contents), remote_path, cancel)
        .await
        .with_context(|| format!("upload layer from local path '{local_path}'"))
}

pub(super) async fn copy_timeline_layer(
    storage: &GenericRemoteStorage,
    source_path: &RemotePath,
    target_path: &RemotePath,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    storage
        .copy(source_path, target_path, cancel)
        .await
        .with_context(|| format!("copy layer {source_path} to {target_path}"))
}

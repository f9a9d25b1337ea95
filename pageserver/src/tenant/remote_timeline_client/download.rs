//! Helper functions to download files from remote storage with a RemoteStorage
//!
//! The functions in this module retry failed operations automatically, according
//! to the FAILED_REMOTE_OP_RETRIES constant.

use std::collections::HashSet;
use std::future::Future;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::{DownloadError, GenericRemoteStorage, RemoteStorage};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use utils::backoff;
use utils::crashsafe::path_with_suffix_extension;
use utils::id::{TenantId, TimelineId};

use crate::config::PageServerConf;
use crate::tenant::storage_layer::LayerName;

use super::index::{IndexPart, LayerFileMetadata};
use super::{
    remote_index_path, remote_layer_path, remote_timelines_path, FAILED_DOWNLOAD_WARN_THRESHOLD,
    FAILED_REMOTE_OP_RETRIES, TEMP_DOWNLOAD_EXTENSION,
};

/// Downloads a layer file into a temporary file next to its final path.
///
/// The temporary file is written and fsynced, and its size is validated against
/// `layer_metadata`. It is moved into place with [`rename_into_place`].
///
/// Returns the temporary path and the size of the downloaded file.
pub(super) async fn download_layer_file_to_temp(
    conf: &'static PageServerConf,
    storage: &GenericRemoteStorage,
    tenant_id: TenantId,
    timeline_id: TimelineId,
    layer_file_name: &LayerName,
    layer_metadata: &LayerFileMetadata,
    cancel: &CancellationToken,
) -> Result<(Utf8PathBuf, u64), DownloadError> {
    let local_path = conf.layer_path(&tenant_id, &timeline_id, layer_file_name);
    let remote_path = remote_layer_path(&tenant_id, &timeline_id, layer_file_name);

    // Perform a rename inspired by durable_rename from file_utils.c.
    // The sequence:
    //     write(tmp)
    //     fsync(tmp)
    //     rename(tmp, new)
    //     fsync(new)
    //     fsync(parent)
    // If pageserver crashes the temp file will be deleted on startup and re-downloaded.
    let temp_file_path = path_with_suffix_extension(&local_path, TEMP_DOWNLOAD_EXTENSION);

    let bytes_amount = download_retry(
        || async {
            let bytes = storage.download(&remote_path, cancel).await?;

            let mut destination_file = tokio::fs::File::create(&temp_file_path)
                .await
                .with_context(|| {
                    format!("create a destination file for layer '{temp_file_path}'")
                })
                .map_err(DownloadError::other)?;

            destination_file
                .write_all(&bytes)
                .await
                .with_context(|| {
                    format!("download layer at remote path '{remote_path}' into file '{temp_file_path}'")
                })
                .map_err(DownloadError::other)?;

            // not using sync_data because it can lose file size update
            destination_file
                .sync_all()
                .await
                .with_context(|| format!("failed to fsync source file at {temp_file_path}"))
                .map_err(DownloadError::other)?;

            Ok(bytes.len() as u64)
        },
        &format!("download {remote_path}"),
        cancel,
    )
    .await?;

    let expected = layer_metadata.file_size;
    if expected != bytes_amount {
        remove_temp_download(&temp_file_path).await;
        return Err(DownloadError::other(anyhow::anyhow!(
            "According to layer file metadata should have downloaded {expected} bytes but downloaded {bytes_amount} bytes into file {temp_file_path:?}",
        )));
    }

    Ok((temp_file_path, bytes_amount))
}

/// Second half of a layer download: renames the temporary file to its final path and
/// fsyncs the file and the timeline directory.
pub(super) async fn rename_into_place(
    temp_file_path: &Utf8Path,
    local_path: &Utf8Path,
) -> Result<(), DownloadError> {
    utils::crashsafe::durable_rename(temp_file_path, local_path, true)
        .await
        .with_context(|| format!("rename download layer file to {local_path}"))
        .map_err(DownloadError::other)?;

    tracing::debug!("download complete: {local_path}");
    Ok(())
}

/// Removes the temporary file of a download which did not complete.
pub(super) async fn remove_temp_download(temp_file_path: &Utf8Path) {
    match tokio::fs::remove_file(temp_file_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove temporary download file {temp_file_path}: {e}"),
    }
}

/// Whether the path is a leftover of an interrupted layer download.
pub fn is_temp_download_file(path: &Utf8Path) -> bool {
    path.extension() == Some(TEMP_DOWNLOAD_EXTENSION)
}

/// List timelines of given tenant in remote storage. Only timelines with an index
/// are returned.
pub async fn list_remote_timelines(
    storage: &GenericRemoteStorage,
    tenant_id: TenantId,
    cancel: &CancellationToken,
) -> anyhow::Result<HashSet<TimelineId>> {
    let timelines_path = remote_timelines_path(&tenant_id);

    let objects = download_retry(
        || storage.list(Some(&timelines_path), cancel),
        &format!("list timelines for {timelines_path}"),
        cancel,
    )
    .await?;

    let mut timeline_ids = HashSet::new();
    for object in objects {
        if object.object_name() != Some(IndexPart::FILE_NAME) {
            continue;
        }
        let relative = object
            .strip_prefix(&timelines_path)
            .with_context(|| format!("listed object {object} is outside of {timelines_path}"))?;
        let timeline_dir = relative
            .components()
            .next()
            .with_context(|| format!("failed to get timeline id for remote object {object}"))?;
        let timeline_id: TimelineId = timeline_dir.as_str().parse().with_context(|| {
            format!("failed to parse object name into timeline id '{timeline_dir}'")
        })?;
        timeline_ids.insert(timeline_id);
    }

    Ok(timeline_ids)
}

pub(crate) async fn download_index_part(
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    cancel: &CancellationToken,
) -> Result<IndexPart, DownloadError> {
    let remote_path = remote_index_path(tenant_id, timeline_id);

    let index_part_bytes = download_retry(
        || storage.download(&remote_path, cancel),
        &format!("download {remote_path}"),
        cancel,
    )
    .await?;

    let index_part = IndexPart::from_json_bytes(&index_part_bytes)
        .with_context(|| format!("deserialize index part file {remote_path}"))
        .map_err(DownloadError::other)?;

    Ok(index_part)
}

/// Helper function to handle retries for a download operation.
///
/// Remote operations can fail due to rate limits, spurious network problems,
/// or other external reasons. Retry FAILED_REMOTE_OP_RETRIES times, with backoff.
///
/// (See similar logic for uploads in `upload`)
async fn download_retry<T, O, F>(
    op: O,
    description: &str,
    cancel: &CancellationToken,
) -> Result<T, DownloadError>
where
    O: FnMut() -> F,
    F: Future<Output = Result<T, DownloadError>>,
{
    backoff::retry(
        op,
        DownloadError::is_permanent,
        FAILED_DOWNLOAD_WARN_THRESHOLD,
        FAILED_REMOTE_OP_RETRIES,
        description,
        cancel,
    )
    .await
    .unwrap_or(Err(DownloadError::Cancelled))
}

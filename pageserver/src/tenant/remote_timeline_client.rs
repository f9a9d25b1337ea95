//! This module manages synchronizing local FS with remote storage.
//!
//! # Overview
//!
//! * [`RemoteTimelineClient`] provides functions related to upload/download of a particular timeline.
//!
//! * Stand-alone function, [`list_remote_timelines`], to get list of timelines of a tenant.
//!
//! These functions use the low-level remote storage client, [`remote_storage::RemoteStorage`].
//!
//! # Remote Storage Structure & [`IndexPart`] Index File
//!
//! The "directory structure" in the remote storage mirrors the local directory structure, with paths
//! like `tenants/<tenant_id>/timelines/<timeline_id>/<layer filename>`.
//! Next to the layers every timeline has an "index file" aka [`IndexPart`], containing the list
//! of **all** remote files for the timeline and the timeline metadata.
//! If a file is not referenced from [`IndexPart`], it's not part of the remote storage state.
//!
//! # Consistency
//!
//! To have a consistent remote structure, it's important that uploads and
//! deletions are performed in the right order. The index file lists layer files,
//! so it must not be uploaded until all the layer files in its list have been
//! successfully uploaded, and a layer must not be deleted while an uploaded index
//! still lists it. The caller is responsible for that order: every operation of
//! the client completes before it returns.
//!
//! Index uploads of one timeline are serialized with [`RemoteTimelineClient::lock_index_upload`].
//! The caller builds the [`IndexPart`] from the live in-memory state while holding the
//! guard, so a slow writer cannot overwrite a newer index with an older one.
//!
//! All of this relies on the following invariants:
//!
//! - We rely on read-after write consistency in the remote storage.
//! - Layer files are immutable
//!
//! # Retries & Error Handling
//!
//! The client retries operations with exponential back-off, see [`utils::backoff::retry`].
//! Cancellation of the timeline aborts the retries.

pub(crate) mod download;
pub mod index;
mod upload;

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use remote_storage::{
    DownloadError, GenericRemoteStorage, RemotePath, RemoteStorage, TimeoutOrCancel,
};
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::backoff;
use utils::id::{TenantId, TimelineId};

use crate::config::{PageServerConf, TENANTS_SEGMENT_NAME, TIMELINES_SEGMENT_NAME};
use crate::metrics::{RemoteOpFileKind, RemoteOpKind, TimelineMetrics};
use crate::tenant::storage_layer::{LayerName, ResidentLayer};
use crate::tenant::TimelineResources;

#[cfg(test)]
use crate::failpoint_support::Failpoints;

pub(crate) use download::{download_index_part, is_temp_download_file, list_remote_timelines};
use index::{IndexPart, LayerFileMetadata};

/// Extension of layer files while they are being downloaded.
pub const TEMP_DOWNLOAD_EXTENSION: &str = "temp_download";

// Occasional network issues and such can cause remote operations to fail, and
// that's expected. If a download fails, we log it at info-level, and retry.
// But after FAILED_DOWNLOAD_WARN_THRESHOLD retries, we start to log it at WARN
// level instead, as repeated failures can mean a more serious problem. If it
// fails more than FAILED_REMOTE_OP_RETRIES times, we give up
pub(crate) const FAILED_DOWNLOAD_WARN_THRESHOLD: u32 = 3;
pub(crate) const FAILED_REMOTE_OP_RETRIES: u32 = 10;

// Similarly log failed uploads and deletions at WARN level, after this many
// retries.
pub(crate) const FAILED_UPLOAD_WARN_THRESHOLD: u32 = 3;

/// A client for accessing a timeline's data in remote storage.
pub struct RemoteTimelineClient {
    conf: &'static PageServerConf,

    tenant_id: TenantId,
    timeline_id: TimelineId,

    storage_impl: GenericRemoteStorage,

    metrics: Arc<TimelineMetrics>,

    /// The last index uploaded by this client. Locked for the whole build-and-upload
    /// of a new index.
    latest_index: tokio::sync::Mutex<Option<IndexPart>>,

    #[cfg(test)]
    failpoints: Arc<Failpoints>,
}

/// Exclusive right to upload the index of a timeline, see [`RemoteTimelineClient::lock_index_upload`].
pub(crate) struct IndexUploadGuard<'a> {
    client: &'a RemoteTimelineClient,
    latest: tokio::sync::MutexGuard<'a, Option<IndexPart>>,
}

impl IndexUploadGuard<'_> {
    /// The index last uploaded through this client.
    pub(crate) fn latest(&self) -> Option<&IndexPart> {
        self.latest.as_ref()
    }

    pub(crate) async fn upload(
        mut self,
        index_part: IndexPart,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let client = self.client;
        let res = upload_retry(
            || {
                upload::upload_index_part(
                    &client.storage_impl,
                    &client.tenant_id,
                    &client.timeline_id,
                    &index_part,
                    cancel,
                )
            },
            "upload index part",
            cancel,
        )
        .await;
        client.record(RemoteOpFileKind::Index, RemoteOpKind::Upload, &res);
        res?;

        debug!(
            disk_consistent_lsn = %index_part.metadata.disk_consistent_lsn,
            layers = index_part.layer_metadata.len(),
            "uploaded index part"
        );
        *self.latest = Some(index_part);
        Ok(())
    }
}

impl RemoteTimelineClient {
    pub(crate) fn new(
        conf: &'static PageServerConf,
        resources: &TimelineResources,
        tenant_id: TenantId,
        timeline_id: TimelineId,
        metrics: Arc<TimelineMetrics>,
    ) -> RemoteTimelineClient {
        RemoteTimelineClient {
            conf,
            tenant_id,
            timeline_id,
            storage_impl: resources.remote_storage.clone(),
            metrics,
            latest_index: tokio::sync::Mutex::new(None),
            #[cfg(test)]
            failpoints: resources.failpoints.clone(),
        }
    }

    fn record<T, E>(&self, file_kind: RemoteOpFileKind, op_kind: RemoteOpKind, res: &Result<T, E>) {
        self.metrics
            .remote_operation(file_kind, op_kind, res.is_ok());
    }

    //
    // Download operations.
    //

    /// Download the index file of this timeline.
    pub async fn download_index_file(
        &self,
        cancel: &CancellationToken,
    ) -> Result<IndexPart, DownloadError> {
        let res = download::download_index_part(
            &self.storage_impl,
            &self.tenant_id,
            &self.timeline_id,
            cancel,
        )
        .await;
        self.record(RemoteOpFileKind::Index, RemoteOpKind::Download, &res);
        res
    }

    /// Download a layer file into the timeline directory.
    ///
    /// 'layer_metadata' is the metadata from the remote index file.
    ///
    /// On success, returns the size of the downloaded file.
    pub async fn download_layer_file(
        &self,
        layer_file_name: &LayerName,
        layer_metadata: &LayerFileMetadata,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let res = self
            .download_layer_file0(layer_file_name, layer_metadata, cancel)
            .await;
        self.record(RemoteOpFileKind::Layer, RemoteOpKind::Download, &res);
        res
    }

    async fn download_layer_file0(
        &self,
        layer_file_name: &LayerName,
        layer_metadata: &LayerFileMetadata,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let (temp_file_path, downloaded_size) = download::download_layer_file_to_temp(
            self.conf,
            &self.storage_impl,
            self.tenant_id,
            self.timeline_id,
            layer_file_name,
            layer_metadata,
            cancel,
        )
        .await?;

        let local_path = self
            .conf
            .layer_path(&self.tenant_id, &self.timeline_id, layer_file_name);
        let res = async {
            crate::failpoint!(self.failpoints, LayerDownloadBeforeRename, |kind| {
                DownloadError::other(anyhow::anyhow!("failpoint {kind}"))
            });
            download::rename_into_place(&temp_file_path, &local_path).await
        }
        .await;
        if let Err(e) = res {
            download::remove_temp_download(&temp_file_path).await;
            return Err(e);
        }

        Ok(downloaded_size)
    }

    //
    // Upload operations.
    //

    /// Waits for other index uploads of this timeline to finish. The returned guard
    /// uploads one index.
    pub(crate) async fn lock_index_upload(&self) -> IndexUploadGuard<'_> {
        IndexUploadGuard {
            client: self,
            latest: self.latest_index.lock().await,
        }
    }

    /// Uploads the given layer. The layer becomes part of the timeline once an index
    /// listing it has been uploaded.
    pub(crate) async fn upload_layer_file(
        &self,
        uploaded: &ResidentLayer,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let remote_path = remote_layer_path(
            &self.tenant_id,
            &self.timeline_id,
            &uploaded.layer_desc().layer_name(),
        );

        let res = upload_retry(
            || {
                upload::upload_timeline_layer(
                    &self.storage_impl,
                    uploaded.local_path(),
                    &remote_path,
                    uploaded.metadata().file_size,
                    cancel,
                )
            },
            "upload layer",
            cancel,
        )
        .await;
        self.record(RemoteOpFileKind::Layer, RemoteOpKind::Upload, &res);
        res
    }

    /// Copies a layer of another timeline of the same tenant to the same name in this
    /// timeline. The layer is not added to any index.
    pub(crate) async fn copy_timeline_layer(
        &self,
        source_timeline_id: &TimelineId,
        layer_file_name: &LayerName,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let source_remote_path =
            remote_layer_path(&self.tenant_id, source_timeline_id, layer_file_name);
        let target_remote_path =
            remote_layer_path(&self.tenant_id, &self.timeline_id, layer_file_name);

        let res = upload_retry(
            || {
                upload::copy_timeline_layer(
                    &self.storage_impl,
                    &source_remote_path,
                    &target_remote_path,
                    cancel,
                )
            },
            "copy timeline layer",
            cancel,
        )
        .await;
        self.record(RemoteOpFileKind::Layer, RemoteOpKind::Copy, &res);
        res
    }

    //
    // Delete operations.
    //

    /// Deletes the layer files from the remote storage. The caller has uploaded an index
    /// which no longer lists them.
    pub(crate) async fn delete_layer_files(
        &self,
        names: &[LayerName],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        for name in names {
            let path = remote_layer_path(&self.tenant_id, &self.timeline_id, name);
            let res = self.delete_object(&path, cancel).await;
            self.record(RemoteOpFileKind::Layer, RemoteOpKind::Delete, &res);
            res?;
        }
        Ok(())
    }

    /// Deletes every object of the timeline, the index last.
    pub(crate) async fn delete_all(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let timeline_path = remote_timeline_path(&self.tenant_id, &self.timeline_id);
        let index_path = remote_index_path(&self.tenant_id, &self.timeline_id);

        let objects = backoff::retry(
            || self.storage_impl.list(Some(&timeline_path), cancel),
            DownloadError::is_permanent,
            FAILED_DOWNLOAD_WARN_THRESHOLD,
            FAILED_REMOTE_OP_RETRIES,
            "list timeline objects",
            cancel,
        )
        .await
        .unwrap_or(Err(DownloadError::Cancelled))
        .context("list timeline objects")?;

        for object in objects.iter().filter(|p| **p != index_path) {
            let res = self.delete_object(object, cancel).await;
            self.record(RemoteOpFileKind::Layer, RemoteOpKind::Delete, &res);
            res?;
        }

        let res = self.delete_object(&index_path, cancel).await;
        self.record(RemoteOpFileKind::Index, RemoteOpKind::Delete, &res);
        res?;

        info!(deleted = objects.len(), "deleted timeline from remote storage");
        Ok(())
    }

    async fn delete_object(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        upload_retry(
            || async {
                self.storage_impl
                    .delete(path, cancel)
                    .await
                    .with_context(|| format!("delete {path}"))
            },
            "delete remote object",
            cancel,
        )
        .await
    }
}

/// Retries an upload, copy or delete. Only cancellation is a permanent error.
async fn upload_retry<T, O, F>(
    op: O,
    description: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<T>
where
    O: FnMut() -> F,
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    backoff::retry(
        op,
        TimeoutOrCancel::caused_by_cancel,
        FAILED_UPLOAD_WARN_THRESHOLD,
        FAILED_REMOTE_OP_RETRIES,
        description,
        cancel,
    )
    .await
    .ok_or_else(|| anyhow::Error::new(TimeoutOrCancel::Cancel))
    .and_then(|x| x)
    .with_context(|| description.to_string())
}

pub fn remote_tenant_path(tenant_id: &TenantId) -> RemotePath {
    let path = format!("{TENANTS_SEGMENT_NAME}/{tenant_id}");
    RemotePath::from_string(&path).expect("Failed to construct path")
}

pub fn remote_timelines_path(tenant_id: &TenantId) -> RemotePath {
    remote_tenant_path(tenant_id).join(Utf8Path::new(TIMELINES_SEGMENT_NAME))
}

pub fn remote_timeline_path(tenant_id: &TenantId, timeline_id: &TimelineId) -> RemotePath {
    remote_timelines_path(tenant_id).join(Utf8Path::new(&timeline_id.to_string()))
}

/// Obtains the path of the given Layer in the remote
pub fn remote_layer_path(
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    layer_file_name: &LayerName,
) -> RemotePath {
    remote_timeline_path(tenant_id, timeline_id).join(layer_file_name.to_string())
}

pub fn remote_index_path(tenant_id: &TenantId, timeline_id: &TimelineId) -> RemotePath {
    remote_timeline_path(tenant_id, timeline_id).join(IndexPart::FILE_NAME)
}

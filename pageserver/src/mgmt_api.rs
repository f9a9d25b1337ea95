//!
//! Management operations on the timelines of a tenant.
//!
//! Every operation resolves the timeline by id, runs the operation and maps the
//! failure onto [`ApiError`], whose [`ApiError::kind`] is what a caller sees.
//!
use std::borrow::Cow;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::anyhow;
use pageserver_api::models::detach_ancestor::AncestorDetached;
use pageserver_api::models::{
    DownloadRemoteLayersTaskInfo, DownloadRemoteLayersTaskSpawnRequest, LayerMapInfo,
    LsnByTimestampResponse, TimelineGcRequest, TimelineInfo,
};
use serde::Serialize;
use tracing::*;
use utils::id::TimelineId;
use utils::lsn::Lsn;

use crate::pgdatadir_mapping::{from_timestamp, to_timestamp, TimestampLookupError};
use crate::tenant::gc_result::GcResult;
use crate::tenant::storage_layer::layer::{DownloadError, EvictionError};
use crate::tenant::storage_layer::LayerName;
use crate::tenant::timeline::{
    detach_ancestor, CompactionError, DownloadRemoteLayersError, FlushLayerError, GcError,
    PageReconstructError,
};
use crate::tenant::{GetTimelineError, Tenant, Timeline};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("NotFound: {0}")]
    NotFound(anyhow::Error),

    #[error("Bad request: {0:#}")]
    BadRequest(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "Partial failure: {} of {} layer downloads failed",
        .0.failed_download_count,
        .0.total_layer_count
    )]
    PartialFailure(DownloadRemoteLayersTaskInfo),

    #[error("Resource temporarily unavailable: {0}")]
    ResourceUnavailable(Cow<'static, str>),

    #[error("Shutting down")]
    ShuttingDown,

    #[error(transparent)]
    InternalServerError(anyhow::Error),
}

/// What a caller gets back for a failed operation.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DownloadRemoteLayersTaskInfo>,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NotFound",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Conflict(_) => "Conflict",
            ApiError::PartialFailure(_) => "PartialFailure",
            ApiError::ResourceUnavailable(_) => "ResourceUnavailable",
            ApiError::ShuttingDown => "ShuttingDown",
            ApiError::InternalServerError(_) => "InternalServerError",
        }
    }

    pub fn body(&self) -> ErrorBody {
        let report = match self {
            ApiError::PartialFailure(info) => Some(info.clone()),
            _ => None,
        };
        ErrorBody {
            kind: self.kind(),
            msg: self.to_string(),
            report,
        }
    }

    /// Logs the error at a level matching its kind. Internal errors are the only
    /// ones worth an error line.
    fn log(self) -> Self {
        match &self {
            ApiError::InternalServerError(e) => error!("operation failed: {e:?}"),
            ApiError::ShuttingDown => debug!("operation failed: {self}"),
            _ => info!("operation failed: {self}"),
        }
        self
    }
}

impl From<GetTimelineError> for ApiError {
    fn from(e: GetTimelineError) -> Self {
        ApiError::NotFound(anyhow::Error::new(e))
    }
}

impl From<FlushLayerError> for ApiError {
    fn from(e: FlushLayerError) -> Self {
        match e {
            FlushLayerError::Cancelled => ApiError::ShuttingDown,
            FlushLayerError::Other(e) => ApiError::InternalServerError(e),
        }
    }
}

impl From<CompactionError> for ApiError {
    fn from(e: CompactionError) -> Self {
        match e {
            CompactionError::ShuttingDown => ApiError::ShuttingDown,
            CompactionError::Other(e) => ApiError::InternalServerError(e),
        }
    }
}

impl From<GcError> for ApiError {
    fn from(e: GcError) -> Self {
        match e {
            GcError::TimelineCancelled => ApiError::ShuttingDown,
            GcError::Remote(_) => ApiError::ResourceUnavailable(e.to_string().into()),
            GcError::Timestamps(_) => ApiError::InternalServerError(anyhow::Error::new(e)),
        }
    }
}

impl From<EvictionError> for ApiError {
    fn from(e: EvictionError) -> Self {
        match e {
            EvictionError::NotFound => ApiError::NotFound(anyhow::Error::new(e)),
            EvictionError::Downloading | EvictionError::Pinned => {
                ApiError::Conflict(e.to_string())
            }
            EvictionError::FileRemoval(_) => ApiError::InternalServerError(anyhow::Error::new(e)),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(e: DownloadError) -> Self {
        match e {
            e if e.is_cancelled() => ApiError::ShuttingDown,
            DownloadError::Deleted => ApiError::NotFound(anyhow::Error::new(e)),
            DownloadError::DownloadFailed(ref inner) if !inner.is_permanent() => {
                ApiError::ResourceUnavailable(format!("{e:#}: {inner}").into())
            }
            e => ApiError::InternalServerError(anyhow::Error::new(e)),
        }
    }
}

impl From<DownloadRemoteLayersError> for ApiError {
    fn from(e: DownloadRemoteLayersError) -> Self {
        match e {
            DownloadRemoteLayersError::Busy(_) => ApiError::Conflict(e.to_string()),
            DownloadRemoteLayersError::NothingToDownload => ApiError::Conflict(e.to_string()),
            DownloadRemoteLayersError::PartialFailure(info) => ApiError::PartialFailure(info),
            DownloadRemoteLayersError::ShuttingDown => ApiError::ShuttingDown,
        }
    }
}

impl From<PageReconstructError> for ApiError {
    fn from(e: PageReconstructError) -> Self {
        match e {
            PageReconstructError::Cancelled => ApiError::ShuttingDown,
            PageReconstructError::MissingKey { .. } => ApiError::NotFound(anyhow::Error::new(e)),
            e => ApiError::InternalServerError(anyhow::Error::new(e)),
        }
    }
}

impl From<TimestampLookupError> for ApiError {
    fn from(e: TimestampLookupError) -> Self {
        match e {
            TimestampLookupError::InvalidLsn => ApiError::BadRequest(anyhow!("Invalid LSN")),
            TimestampLookupError::Read(e) => ApiError::from(e),
        }
    }
}

fn get_timeline(tenant: &Tenant, timeline_id: TimelineId) -> Result<Arc<Timeline>, ApiError> {
    Ok(tenant.get_timeline(timeline_id)?)
}

/// A name which does not parse cannot be the name of any layer of the timeline.
fn parse_layer_name(layer_file_name: &str) -> Result<LayerName, ApiError> {
    LayerName::from_str(layer_file_name).map_err(|e| ApiError::NotFound(anyhow!(e)))
}

/// Forces the open layer to disk as a new historic delta layer.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id))]
pub async fn checkpoint(tenant: &Tenant, timeline_id: TimelineId) -> Result<(), ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    timeline
        .freeze_and_flush()
        .await
        .map_err(|e| ApiError::from(e).log())
}

/// Runs one compaction pass.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id))]
pub async fn compact(tenant: &Tenant, timeline_id: TimelineId) -> Result<(), ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    timeline
        .compact(&timeline.cancel)
        .await
        .map_err(|e| ApiError::from(e).log())
}

/// Runs gc on one timeline. The horizon defaults to the one of the tenant.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id))]
pub async fn gc(
    tenant: &Tenant,
    timeline_id: TimelineId,
    request: TimelineGcRequest,
) -> Result<GcResult, ApiError> {
    // gc_iteration skips unknown timelines
    get_timeline(tenant, timeline_id)?;
    let gc_horizon = request.gc_horizon.unwrap_or_else(|| tenant.get_gc_horizon());
    tenant
        .gc_iteration(
            Some(timeline_id),
            gc_horizon,
            tenant.get_pitr_interval(),
            &tenant.cancel,
        )
        .await
        .map_err(|e| ApiError::from(e).log())
}

/// Evicts one layer. Returns false if the layer was not resident.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id, layer = %layer_file_name))]
pub async fn evict_layer(
    tenant: &Tenant,
    timeline_id: TimelineId,
    layer_file_name: &str,
) -> Result<bool, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    let layer_name = parse_layer_name(layer_file_name)?;
    match timeline.evict_layer(&layer_name).await {
        Ok(Some(evicted)) => Ok(evicted),
        Ok(None) => Err(ApiError::NotFound(anyhow!(
            "Layer {}/{timeline_id}/{layer_file_name} not found",
            tenant.tenant_id
        ))),
        Err(e) => Err(ApiError::from(e).log()),
    }
}

/// Evicts every resident layer of the timeline. Returns how many were evicted.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id))]
pub async fn evict_all_layers(tenant: &Tenant, timeline_id: TimelineId) -> Result<usize, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    timeline
        .evict_all_layers()
        .await
        .map_err(|e| ApiError::from(e).log())
}

/// Downloads one layer. Returns false if the layer was resident already.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id, layer = %layer_file_name))]
pub async fn download_layer(
    tenant: &Tenant,
    timeline_id: TimelineId,
    layer_file_name: &str,
) -> Result<bool, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    let layer_name = parse_layer_name(layer_file_name)?;
    match timeline.download_layer(&layer_name).await {
        Ok(Some(downloaded)) => Ok(downloaded),
        Ok(None) => Err(ApiError::NotFound(anyhow!(
            "Layer {}/{timeline_id}/{layer_file_name} not found",
            tenant.tenant_id
        ))),
        Err(e) => Err(ApiError::from(e).log()),
    }
}

/// Downloads every evicted layer and returns the completion report.
///
/// A job stopped by a failed download is a [`ApiError::PartialFailure`] carrying the
/// report. With `errors_ok` the failures are only counted in the report.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id))]
pub async fn download_remote_layers(
    tenant: &Tenant,
    timeline_id: TimelineId,
    request: DownloadRemoteLayersTaskSpawnRequest,
) -> Result<DownloadRemoteLayersTaskInfo, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    timeline
        .download_all_remote_layers(request)
        .await
        .map_err(|e| ApiError::from(e).log())
}

/// The report of the last bulk download of the timeline.
pub fn download_remote_layers_task_info(
    tenant: &Tenant,
    timeline_id: TimelineId,
) -> Result<DownloadRemoteLayersTaskInfo, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    timeline
        .get_download_all_remote_layers_task_info()
        .ok_or_else(|| ApiError::NotFound(anyhow!("task not found")))
}

pub async fn layer_map_info(
    tenant: &Tenant,
    timeline_id: TimelineId,
) -> Result<LayerMapInfo, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    Ok(timeline.layer_map_info().await)
}

pub async fn timeline_info(
    tenant: &Tenant,
    timeline_id: TimelineId,
) -> Result<TimelineInfo, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    Ok(timeline.timeline_info().await)
}

/// Finds the LSN of a RFC 3339 timestamp, e.g. `2023-01-01T12:00:00Z`.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id))]
pub async fn get_lsn_by_timestamp(
    tenant: &Tenant,
    timeline_id: TimelineId,
    timestamp: &str,
) -> Result<LsnByTimestampResponse, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    let timestamp = humantime::parse_rfc3339(timestamp)
        .map_err(|e| ApiError::BadRequest(anyhow!("invalid timestamp {timestamp:?}: {e}")))?;
    let result = timeline
        .find_lsn_for_timestamp(to_timestamp(timestamp))
        .await
        .map_err(|e| ApiError::from(e).log())?;
    Ok(LsnByTimestampResponse {
        lsn: result.lsn(),
        kind: result.kind(),
    })
}

/// The commit timestamp covering the LSN.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id, %lsn))]
pub async fn get_timestamp_of_lsn(
    tenant: &Tenant,
    timeline_id: TimelineId,
    lsn: Lsn,
) -> Result<SystemTime, ApiError> {
    let timeline = get_timeline(tenant, timeline_id)?;
    let timestamp = timeline
        .get_timestamp_for_lsn(lsn)
        .await
        .map_err(|e| ApiError::from(e).log())?;
    Ok(from_timestamp(timestamp))
}

/// Detaches the timeline from its ancestor, copying or rewriting `batch_size` layers
/// between persisted steps.
#[instrument(skip_all, fields(tenant_id = %tenant.tenant_id, %timeline_id))]
pub async fn detach_ancestor(
    tenant: &Tenant,
    timeline_id: TimelineId,
    batch_size: Option<NonZeroUsize>,
) -> Result<AncestorDetached, ApiError> {
    get_timeline(tenant, timeline_id)?;
    let mut options = detach_ancestor::Options::default();
    if let Some(batch_size) = batch_size {
        options.batch_size = batch_size;
    }
    tenant
        .detach_ancestor(timeline_id, options)
        .await
        .map_err(|e| ApiError::from(e).log())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use pageserver_api::key::Key;
    use pageserver_api::models::LsnByTimestampKind;
    use pageserver_api::value::Value;

    use super::*;
    use crate::tenant::harness::{test_img, TenantHarness, TIMELINE_ID};

    async fn timeline_with_layers(tenant: &Tenant, count: u64) -> Arc<Timeline> {
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        let start = SystemTime::now() - Duration::from_secs(3600);
        for i in 0..count {
            let lsn = Lsn(0x20 + 0x10 * i);
            {
                let mut writer = tline.writer().await;
                writer
                    .put(Key::user(1, i as u32), lsn, &Value::Image(test_img("row")))
                    .await
                    .unwrap();
                writer
                    .put_commit_timestamp(lsn, start + Duration::from_secs(i))
                    .await
                    .unwrap();
                writer.finish_write(lsn);
            }
            checkpoint(tenant, TIMELINE_ID).await.unwrap();
        }
        tline
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let harness = TenantHarness::create("unknown_names_are_not_found").unwrap();
        let tenant = harness.load().await;
        timeline_with_layers(&tenant, 1).await;

        let err = evict_layer(&tenant, TIMELINE_ID, "not-a-layer").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        let err = download_layer(&tenant, TIMELINE_ID, "not-a-layer").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");

        let missing = TimelineId::generate();
        let err = compact(&tenant, missing).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        let err = gc(&tenant, missing, TimelineGcRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");

        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["kind"], "NotFound");
        assert!(body.get("report").is_none());
    }

    #[tokio::test]
    async fn evict_and_download_one_layer() {
        let harness = TenantHarness::create("evict_and_download_one_layer").unwrap();
        let tenant = harness.load().await;
        let tline = timeline_with_layers(&tenant, 2).await;

        let before = layer_map_info(&tenant, TIMELINE_ID).await.unwrap();
        let name = before.historic_layers[0].layer_file_name().to_owned();
        let path = harness.timeline_path(&TIMELINE_ID).join(&name);
        let content = std::fs::read(&path).unwrap();

        assert!(evict_layer(&tenant, TIMELINE_ID, &name).await.unwrap());
        assert!(!path.exists());
        assert!(!evict_layer(&tenant, TIMELINE_ID, &name).await.unwrap());

        let evicted = layer_map_info(&tenant, TIMELINE_ID).await.unwrap();
        let mut expected = before.clone();
        expected.historic_layers[0].set_remote(true);
        assert_eq!(evicted, expected);

        let info = timeline_info(&tenant, TIMELINE_ID).await.unwrap();
        assert_eq!(
            info.resident_physical_size + info.remote_physical_size,
            info.current_physical_size
        );
        assert_eq!(info.remote_physical_size, before.historic_layers[0].layer_file_size());

        assert!(download_layer(&tenant, TIMELINE_ID, &name).await.unwrap());
        assert!(!download_layer(&tenant, TIMELINE_ID, &name).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert_eq!(layer_map_info(&tenant, TIMELINE_ID).await.unwrap(), before);
        assert_eq!(tline.remote_physical_size(), 0);
    }

    #[tokio::test]
    async fn bulk_download_after_evicting_everything() {
        let harness = TenantHarness::create("bulk_download_after_evicting_everything").unwrap();
        let tenant = harness.load().await;
        timeline_with_layers(&tenant, 3).await;

        let before = timeline_info(&tenant, TIMELINE_ID).await.unwrap();
        assert_eq!(evict_all_layers(&tenant, TIMELINE_ID).await.unwrap(), 3);
        let info = timeline_info(&tenant, TIMELINE_ID).await.unwrap();
        assert_eq!(info.resident_physical_size, 0);

        let report = download_remote_layers(
            &tenant,
            TIMELINE_ID,
            DownloadRemoteLayersTaskSpawnRequest {
                max_concurrent_downloads: NonZeroUsize::new(10).unwrap(),
                errors_ok: false,
                at_least_one_download: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.total_layer_count, 3);
        assert_eq!(report.successful_download_count, 3);
        assert_eq!(report.failed_download_count, 0);
        assert_eq!(
            download_remote_layers_task_info(&tenant, TIMELINE_ID)
                .unwrap()
                .task_id,
            report.task_id
        );

        let after = timeline_info(&tenant, TIMELINE_ID).await.unwrap();
        assert_eq!(after.resident_physical_size, before.resident_physical_size);

        // nothing left to download
        let err = download_remote_layers(
            &tenant,
            TIMELINE_ID,
            DownloadRemoteLayersTaskSpawnRequest {
                max_concurrent_downloads: NonZeroUsize::new(10).unwrap(),
                errors_ok: false,
                at_least_one_download: true,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[tokio::test]
    async fn timestamps_and_lsns() {
        let harness = TenantHarness::create("timestamps_and_lsns").unwrap();
        let tenant = harness.load().await;
        timeline_with_layers(&tenant, 4).await;

        let err = get_timestamp_of_lsn(&tenant, TIMELINE_ID, Lsn(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
        let err = get_timestamp_of_lsn(&tenant, TIMELINE_ID, Lsn(0x18))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");

        let first = get_timestamp_of_lsn(&tenant, TIMELINE_ID, Lsn(0x20)).await.unwrap();
        let last = get_timestamp_of_lsn(&tenant, TIMELINE_ID, Lsn(0x50)).await.unwrap();
        assert!(first < last);

        let future = humantime::format_rfc3339(SystemTime::now() + Duration::from_secs(3600));
        let res = get_lsn_by_timestamp(&tenant, TIMELINE_ID, &future.to_string())
            .await
            .unwrap();
        assert_eq!(res.kind, LsnByTimestampKind::Future);
        assert!(res.lsn > Lsn(0x20));

        let err = get_lsn_by_timestamp(&tenant, TIMELINE_ID, "yesterday")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn gc_and_detach_errors() {
        let harness = TenantHarness::create("gc_and_detach_errors").unwrap();
        let tenant = harness.load().await;
        let tline = timeline_with_layers(&tenant, 2).await;

        // everything is within the horizon
        let result = gc(
            &tenant,
            TIMELINE_ID,
            TimelineGcRequest {
                gc_horizon: Some(u64::MAX),
            },
        )
        .await
        .unwrap();
        assert_eq!(result.layers_removed, 0);
        assert_eq!(result.layers_total, 2);

        let err = detach_ancestor(&tenant, TIMELINE_ID, None).await.unwrap_err();
        assert_eq!(err.kind(), "Conflict");

        assert_eq!(
            tline.get(Key::user(1, 1), Lsn(0x30)).await.unwrap(),
            Bytes::from_static(b"row")
        );
    }

    #[test]
    fn partial_failure_carries_the_report() {
        let err = ApiError::from(DownloadRemoteLayersError::PartialFailure(
            DownloadRemoteLayersTaskInfo {
                task_id: "1".to_string(),
                state: pageserver_api::models::DownloadRemoteLayersTaskState::Completed,
                total_layer_count: 3,
                successful_download_count: 1,
                failed_download_count: 2,
            },
        ));
        assert_eq!(err.kind(), "PartialFailure");
        assert_eq!(err.to_string(), "Partial failure: 2 of 3 layer downloads failed");
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["report"]["failed_download_count"], 2);
    }
}

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{IntCounter, UIntGauge};
use once_cell::sync::Lazy;
use pageserver_api::key::Key;
use pageserver_api::models::HistoricLayerInfo;
use std::ops::Range;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::*;
use utils::lsn::Lsn;

use crate::config::PageServerConf;
use crate::tenant::remote_timeline_client::index::LayerFileMetadata;
use crate::tenant::timeline::{PageReconstructError, Timeline};

use super::{
    DeltaLayerInner, ImageLayerInner, LayerFileError, LayerName, PersistentLayerDesc,
    ValueReconstructResult, ValueReconstructState,
};

#[cfg(test)]
mod tests;

/// A persistent layer of a timeline: a delta or an image layer stored as a file.
///
/// The file is always present in the remote storage, and may or may not be present
/// locally. Reads download it on demand, eviction removes the local copy.
///
/// ### State transitions
///
/// ```text
///            evict_and_wait (no pins)
///  +----------+ ------------------> +---------+
///  | Resident |                     | Evicted |
///  +----------+ <--+                +---------+
///                  | success             |  ^
///                  |                     |  | failure
///             +-------------+  <---------+  |
///             | Downloading |  download ----+
///             +-------------+
/// ```
///
/// Any state moves to `Deleted` on [`Layer::delete_on_drop`]. At most one download
/// runs per layer: concurrent readers share the in-flight future. Every transition
/// moves the file size between the resident and the remote size gauges while
/// holding the state lock. Dropping the last reference removes the size from the
/// gauges.
#[derive(Clone)]
pub struct Layer(Arc<LayerInner>);

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.desc.short_id())
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0) == Arc::as_ptr(&other.0)
    }
}

impl Layer {
    /// Creates a layer value for a file which only exists in the remote storage.
    pub(crate) fn for_evicted(
        conf: &'static PageServerConf,
        timeline: &Arc<Timeline>,
        file_name: LayerName,
        metadata: LayerFileMetadata,
    ) -> Self {
        let desc = PersistentLayerDesc::from_filename(
            timeline.tenant_id,
            timeline.timeline_id,
            file_name,
            metadata.file_size,
        );
        Layer(Arc::new(LayerInner::new(
            conf,
            timeline,
            desc,
            Residence::Evicted,
        )))
    }

    /// Creates a Layer value for a file we know to be resident in timeline directory.
    pub(crate) fn for_resident(
        conf: &'static PageServerConf,
        timeline: &Arc<Timeline>,
        file_name: LayerName,
        metadata: LayerFileMetadata,
    ) -> ResidentLayer {
        let desc = PersistentLayerDesc::from_filename(
            timeline.tenant_id,
            timeline.timeline_id,
            file_name,
            metadata.file_size,
        );
        Self::resident_from_desc(conf, timeline, desc)
    }

    fn resident_from_desc(
        conf: &'static PageServerConf,
        timeline: &Arc<Timeline>,
        desc: PersistentLayerDesc,
    ) -> ResidentLayer {
        let downloaded = Arc::new(DownloadedLayer::default());
        let owner = Layer(Arc::new(LayerInner::new(
            conf,
            timeline,
            desc,
            Residence::Resident(downloaded.clone()),
        )));
        ResidentLayer::new(owner, downloaded)
    }

    /// Creates a Layer value for a file written to `temp_path`, renaming it to its
    /// final path in the timeline directory.
    pub(crate) async fn finish_creating(
        conf: &'static PageServerConf,
        timeline: &Arc<Timeline>,
        desc: PersistentLayerDesc,
        temp_path: &Utf8Path,
    ) -> anyhow::Result<ResidentLayer> {
        let path = conf.layer_path(&desc.tenant_id, &desc.timeline_id, &desc.layer_name());
        utils::crashsafe::durable_rename(temp_path, &path, true)
            .await
            .map_err(|e| anyhow::anyhow!("rename {temp_path} to {path}: {e}"))?;
        Ok(Self::resident_from_desc(conf, timeline, desc))
    }

    pub(crate) fn layer_desc(&self) -> &PersistentLayerDesc {
        &self.0.desc
    }

    pub(crate) fn layer_name(&self) -> LayerName {
        self.0.desc.layer_name()
    }

    pub(crate) fn local_path(&self) -> &Utf8Path {
        &self.0.path
    }

    pub(crate) fn metadata(&self) -> LayerFileMetadata {
        LayerFileMetadata::new(self.0.desc.file_size)
    }

    /// Evict the layer file as soon as possible, waiting at most `timeout` for readers
    /// to unpin it.
    ///
    /// If the file is not resident, an [`EvictionError::NotFound`] is returned. A layer
    /// being downloaded is not evicted.
    pub(crate) async fn evict_and_wait(&self, timeout: Duration) -> Result<(), EvictionError> {
        let res = self.0.evict_and_wait(timeout).await;
        let outcome = match &res {
            Ok(()) => EvictionOutcome::Evicted,
            Err(EvictionError::NotFound) => EvictionOutcome::NotFound,
            Err(EvictionError::Downloading) => EvictionOutcome::Downloading,
            Err(EvictionError::Pinned) => EvictionOutcome::Pinned,
            Err(EvictionError::FileRemoval(_)) => EvictionOutcome::FileRemovalFailed,
        };
        LAYER_IMPL_METRICS.evictions[outcome].inc();
        res
    }

    /// Forget this layer: its size is no longer accounted for and the local file is
    /// removed once the last reference is dropped.
    ///
    /// Callers unlink the layer from the layer map before calling this.
    pub(crate) fn delete_on_drop(&self) {
        self.0.delete_on_drop();
    }

    /// Downloads if necessary and creates a guard, which will keep this layer from being evicted.
    pub(crate) async fn download_and_keep_resident(&self) -> Result<ResidentLayer, DownloadError> {
        loop {
            let download = {
                let mut status = self.0.status.lock().unwrap();
                match &*status {
                    Residence::Resident(downloaded) => {
                        return Ok(ResidentLayer::new(self.clone(), downloaded.clone()));
                    }
                    Residence::Deleted => return Err(DownloadError::Deleted),
                    Residence::Downloading(download) => download.clone(),
                    Residence::Evicted => {
                        let download = self.0.spawn_download()?;
                        *status = Residence::Downloading(download.clone());
                        download
                    }
                }
            };
            download.await?;
        }
    }

    /// Downloads the layer if it is not resident.
    pub(crate) async fn download(&self) -> Result<(), DownloadError> {
        self.download_and_keep_resident().await.map(drop)
    }

    /// Pins the layer if it is resident right now, without downloading.
    pub(crate) fn keep_resident(&self) -> Option<ResidentLayer> {
        let status = self.0.status.lock().unwrap();
        match &*status {
            Residence::Resident(downloaded) => {
                Some(ResidentLayer::new(self.clone(), downloaded.clone()))
            }
            _ => None,
        }
    }

    pub(crate) fn is_likely_resident(&self) -> bool {
        matches!(*self.0.status.lock().unwrap(), Residence::Resident(_))
    }

    pub(crate) fn is_downloading(&self) -> bool {
        matches!(*self.0.status.lock().unwrap(), Residence::Downloading(_))
    }

    pub(crate) async fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_data: &mut ValueReconstructState,
    ) -> Result<ValueReconstructResult, PageReconstructError> {
        let layer = self.download_and_keep_resident().await?;
        layer
            .get_value_reconstruct_data(key, lsn_range, reconstruct_data)
            .await
    }

    pub(crate) fn info(&self) -> HistoricLayerInfo {
        let desc = &self.0.desc;
        let layer_file_name = desc.layer_name().to_string();
        let remote = !self.is_likely_resident();
        if desc.is_delta {
            HistoricLayerInfo::Delta {
                layer_file_name,
                layer_file_size: desc.file_size,
                key_start: desc.key_range.start,
                key_end: desc.key_range.end,
                lsn_start: desc.lsn_range.start,
                lsn_end: desc.lsn_range.end,
                remote,
            }
        } else {
            HistoricLayerInfo::Image {
                layer_file_name,
                layer_file_size: desc.file_size,
                key_start: desc.key_range.start,
                key_end: desc.key_range.end,
                lsn_start: desc.image_layer_lsn(),
                remote,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pin_count(&self) -> usize {
        *self.0.pins.borrow()
    }
}

type SharedDownload = Shared<BoxFuture<'static, Result<(), DownloadError>>>;

enum Residence {
    Resident(Arc<DownloadedLayer>),
    Evicted,
    Downloading(SharedDownload),
    Deleted,
}

struct LayerInner {
    /// Full path to the file in the timeline directory.
    path: Utf8PathBuf,

    desc: PersistentLayerDesc,

    /// Timeline access is needed for remote timeline client and metrics.
    ///
    /// There should not be an access to timeline for any reason without entering the
    /// [`Timeline::gate`] at the same time.
    timeline: Weak<Timeline>,

    resident_size: UIntGauge,
    remote_size: UIntGauge,

    status: Mutex<Residence>,

    /// Number of live [`ResidentLayer`] guards. Only incremented with `status` locked.
    pins: tokio::sync::watch::Sender<usize>,
}

impl std::fmt::Display for LayerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.desc.short_id())
    }
}

impl Drop for LayerInner {
    fn drop(&mut self) {
        // a layer is accounted for in the size gauges for as long as it is alive
        match self.status.get_mut() {
            Ok(Residence::Resident(_)) => {
                self.resident_size.sub(self.desc.file_size);
                return;
            }
            Ok(Residence::Evicted | Residence::Downloading(_)) => {
                self.remote_size.sub(self.desc.file_size);
                return;
            }
            Ok(Residence::Deleted) => {}
            Err(_) => return,
        }
        let span = info_span!(
            "layer_delete",
            tenant_id = %self.desc.tenant_id,
            timeline_id = %self.desc.timeline_id,
            layer = %self
        );
        let _g = span.entered();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed deleted layer file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("failed to remove deleted layer file {}: {e}", self.path),
        }
    }
}

impl LayerInner {
    fn new(
        conf: &'static PageServerConf,
        timeline: &Arc<Timeline>,
        desc: PersistentLayerDesc,
        residence: Residence,
    ) -> Self {
        let path = conf.layer_path(&desc.tenant_id, &desc.timeline_id, &desc.layer_name());
        let resident_size = timeline.metrics.resident_physical_size_gauge.clone();
        let remote_size = timeline.metrics.remote_physical_size_gauge.clone();
        match &residence {
            Residence::Resident(_) => resident_size.add(desc.file_size),
            Residence::Evicted => remote_size.add(desc.file_size),
            Residence::Downloading(_) | Residence::Deleted => {
                unreachable!("layers start out resident or evicted")
            }
        }
        LayerInner {
            path,
            desc,
            timeline: Arc::downgrade(timeline),
            resident_size,
            remote_size,
            status: Mutex::new(residence),
            pins: tokio::sync::watch::channel(0).0,
        }
    }

    fn delete_on_drop(&self) {
        let mut status = self.status.lock().unwrap();
        match &*status {
            Residence::Resident(_) => self.resident_size.sub(self.desc.file_size),
            // a download in progress is still accounted as remote
            Residence::Evicted | Residence::Downloading(_) => {
                self.remote_size.sub(self.desc.file_size)
            }
            Residence::Deleted => return,
        }
        *status = Residence::Deleted;
    }

    async fn evict_and_wait(&self, timeout: Duration) -> Result<(), EvictionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pins = self.pins.subscribe();
        loop {
            {
                let mut status = self.status.lock().unwrap();
                match &*status {
                    Residence::Evicted | Residence::Deleted => {
                        return Err(EvictionError::NotFound)
                    }
                    Residence::Downloading(_) => return Err(EvictionError::Downloading),
                    Residence::Resident(_) if *self.pins.borrow() == 0 => {
                        match std::fs::remove_file(&self.path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                                warn!(layer = %self, "resident layer file was already missing on eviction");
                            }
                            Err(e) => return Err(EvictionError::FileRemoval(e)),
                        }
                        *status = Residence::Evicted;
                        self.resident_size.sub(self.desc.file_size);
                        self.remote_size.add(self.desc.file_size);
                        info!(layer = %self, "evicted layer");
                        return Ok(());
                    }
                    Residence::Resident(_) => {}
                }
            }

            let unpinned = async { pins.wait_for(|n| *n == 0).await.map(drop) };
            match tokio::time::timeout_at(deadline, unpinned).await {
                Ok(Ok(())) => continue,
                // the sender lives in self
                Ok(Err(_closed)) => return Err(EvictionError::NotFound),
                Err(_elapsed) => return Err(EvictionError::Pinned),
            }
        }
    }

    /// Starts the download task. Called with `status` locked and `Evicted`.
    fn spawn_download(self: &Arc<Self>) -> Result<SharedDownload, DownloadError> {
        let timeline = self
            .timeline
            .upgrade()
            .ok_or(DownloadError::TimelineShutdown)?;
        let gate = timeline
            .gate
            .enter()
            .map_err(|_| DownloadError::TimelineShutdown)?;

        let span = info_span!(
            parent: None,
            "download_layer",
            tenant_id = %self.desc.tenant_id,
            timeline_id = %self.desc.timeline_id,
            layer = %self
        );

        let this = self.clone();
        let handle = tokio::spawn(
            async move {
                let _gate = gate;
                let res = this.download_from_remote(&timeline).await;
                this.finish_download(res)
            }
            .instrument(span),
        );

        let this = self.clone();
        Ok(async move {
            match handle.await {
                Ok(res) => res,
                Err(e) => {
                    error!(layer = %this, "download task failed: {e}");
                    let mut status = this.status.lock().unwrap();
                    if matches!(*status, Residence::Downloading(_)) {
                        *status = Residence::Evicted;
                    }
                    Err(DownloadError::DownloadCancelled)
                }
            }
        }
        .boxed()
        .shared())
    }

    async fn download_from_remote(
        &self,
        timeline: &Arc<Timeline>,
    ) -> Result<Arc<DownloadedLayer>, DownloadError> {
        info!("downloading on-demand");
        let res = timeline
            .remote_client
            .download_layer_file(
                &self.desc.layer_name(),
                &LayerFileMetadata::new(self.desc.file_size),
                &timeline.cancel,
            )
            .await;

        match res {
            Ok(size) => {
                assert_eq!(size, self.desc.file_size, "checked by download_layer_file");
                info!("on-demand download successful");
                LAYER_IMPL_METRICS.downloads[DownloadOutcome::Success].inc();
                Ok(Arc::new(DownloadedLayer::default()))
            }
            Err(remote_storage::DownloadError::Cancelled) => {
                info!("on-demand download cancelled");
                LAYER_IMPL_METRICS.downloads[DownloadOutcome::Cancelled].inc();
                Err(DownloadError::DownloadCancelled)
            }
            Err(e) => {
                error!("on-demand download failed: {e:#}");
                LAYER_IMPL_METRICS.downloads[DownloadOutcome::Failure].inc();
                Err(DownloadError::DownloadFailed(e))
            }
        }
    }

    fn finish_download(
        &self,
        res: Result<Arc<DownloadedLayer>, DownloadError>,
    ) -> Result<(), DownloadError> {
        let mut status = self.status.lock().unwrap();
        match (res, &*status) {
            (Ok(downloaded), Residence::Downloading(_)) => {
                *status = Residence::Resident(downloaded);
                self.remote_size.sub(self.desc.file_size);
                self.resident_size.add(self.desc.file_size);
                Ok(())
            }
            (Ok(_), Residence::Deleted) => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("failed to remove layer file downloaded after deletion: {e}");
                }
                Err(DownloadError::Deleted)
            }
            (Err(e), Residence::Downloading(_)) => {
                *status = Residence::Evicted;
                Err(e)
            }
            (Err(_), Residence::Deleted) => Err(DownloadError::Deleted),
            (_, Residence::Resident(_) | Residence::Evicted) => {
                unreachable!("only the download task moves a layer out of Downloading")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EvictionError {
    #[error("layer was no longer resident")]
    NotFound,

    /// The layer is being downloaded; eviction does not cancel downloads.
    #[error("layer is being downloaded")]
    Downloading,

    /// Readers kept the layer pinned for the whole timeout.
    #[error("layer is pinned by readers")]
    Pinned,

    #[error("failed to remove the layer file")]
    FileRemoval(#[source] std::io::Error),
}

#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum DownloadError {
    #[error("timeline has already shutdown")]
    TimelineShutdown,
    #[error("layer has been deleted")]
    Deleted,
    #[error("download was cancelled")]
    DownloadCancelled,
    #[error("downloading failed")]
    DownloadFailed(#[source] remote_storage::DownloadError),
}

impl DownloadError {
    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DownloadError::TimelineShutdown | DownloadError::DownloadCancelled
        )
    }
}

/// The contents of a layer file, loaded on first use.
#[derive(Default)]
pub(crate) struct DownloadedLayer {
    kind: tokio::sync::OnceCell<Result<LayerKind, LayerFileError>>,
}

impl std::fmt::Debug for DownloadedLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadedLayer")
            .field("loaded", &self.kind.initialized())
            .finish()
    }
}

impl DownloadedLayer {
    /// Loads the file on first call. Failure to load the layer is sticky.
    async fn get(&self, owner: &LayerInner) -> Result<&LayerKind, LayerFileError> {
        let res = self
            .kind
            .get_or_init(|| async {
                if owner.desc.is_delta {
                    DeltaLayerInner::load(&owner.path, &owner.desc)
                        .await
                        .map(LayerKind::Delta)
                } else {
                    ImageLayerInner::load(&owner.path, &owner.desc)
                        .await
                        .map(LayerKind::Image)
                }
            })
            .await;
        match res {
            Ok(kind) => Ok(kind),
            Err(e) => {
                error!(layer = %owner, "failed to load layer file: {e}");
                Err(e.clone())
            }
        }
    }
}

/// Wrapper around an actual layer implementation.
#[derive(Debug)]
pub(crate) enum LayerKind {
    Delta(DeltaLayerInner),
    Image(ImageLayerInner),
}

/// Guard for forcing a layer be resident while it exists.
pub struct ResidentLayer {
    owner: Layer,
    downloaded: Arc<DownloadedLayer>,
}

impl std::fmt::Display for ResidentLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.owner)
    }
}

impl std::fmt::Debug for ResidentLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.owner)
    }
}

impl Clone for ResidentLayer {
    fn clone(&self) -> Self {
        ResidentLayer::new(self.owner.clone(), self.downloaded.clone())
    }
}

impl Drop for ResidentLayer {
    fn drop(&mut self) {
        self.owner.0.pins.send_modify(|n| *n -= 1);
    }
}

impl ResidentLayer {
    fn new(owner: Layer, downloaded: Arc<DownloadedLayer>) -> Self {
        owner.0.pins.send_modify(|n| *n += 1);
        ResidentLayer { owner, downloaded }
    }

    /// Release the eviction guard, converting back into a plain [`Layer`].
    pub(crate) fn drop_eviction_guard(self) -> Layer {
        self.owner.clone()
    }

    pub(crate) fn layer(&self) -> &Layer {
        &self.owner
    }

    pub(crate) fn layer_desc(&self) -> &PersistentLayerDesc {
        self.owner.layer_desc()
    }

    pub(crate) fn local_path(&self) -> &Utf8Path {
        self.owner.local_path()
    }

    pub(crate) fn metadata(&self) -> LayerFileMetadata {
        self.owner.metadata()
    }

    pub(crate) async fn load(&self) -> Result<&LayerKind, LayerFileError> {
        self.downloaded.get(&self.owner.0).await
    }

    pub(crate) async fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_data: &mut ValueReconstructState,
    ) -> Result<ValueReconstructResult, PageReconstructError> {
        let res = match self.load().await? {
            LayerKind::Delta(d) => d.get_value_reconstruct_data(key, lsn_range, reconstruct_data),
            LayerKind::Image(i) => i.get_value_reconstruct_data(key, lsn_range, reconstruct_data),
        };
        Ok(res)
    }
}

#[derive(enum_map::Enum, Clone, Copy, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum EvictionOutcome {
    Evicted,
    NotFound,
    Downloading,
    Pinned,
    FileRemovalFailed,
}

#[derive(enum_map::Enum, Clone, Copy, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum DownloadOutcome {
    Success,
    Failure,
    Cancelled,
}

pub(crate) struct LayerImplMetrics {
    evictions: enum_map::EnumMap<EvictionOutcome, IntCounter>,
    downloads: enum_map::EnumMap<DownloadOutcome, IntCounter>,
}

impl Default for LayerImplMetrics {
    fn default() -> Self {
        use enum_map::Enum;

        // reminder: these will be pageserver_layer_* with "_total" suffix

        let evictions = metrics::register_int_counter_vec!(
            "pageserver_layer_evictions_total",
            "Layer evictions by outcome",
            &["outcome"]
        )
        .unwrap();

        let evictions = enum_map::EnumMap::from_array(std::array::from_fn(|i| {
            let outcome = EvictionOutcome::from_usize(i);
            let s: &'static str = outcome.into();
            evictions.with_label_values(&[s])
        }));

        let downloads = metrics::register_int_counter_vec!(
            "pageserver_layer_downloads_total",
            "On-demand layer downloads by outcome",
            &["outcome"]
        )
        .unwrap();

        let downloads = enum_map::EnumMap::from_array(std::array::from_fn(|i| {
            let outcome = DownloadOutcome::from_usize(i);
            let s: &'static str = outcome.into();
            downloads.with_label_values(&[s])
        }));

        Self {
            evictions,
            downloads,
        }
    }
}

pub(crate) static LAYER_IMPL_METRICS: Lazy<LayerImplMetrics> =
    Lazy::new(LayerImplMetrics::default);

pub(crate) mod compaction;
pub(crate) mod detach_ancestor;
pub(crate) mod layer_manager;

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, ensure, Context};
use bytes::Bytes;
use camino::Utf8PathBuf;
use itertools::Itertools;
use pageserver_api::key::Key;
use pageserver_api::models::{
    DownloadRemoteLayersTaskInfo, DownloadRemoteLayersTaskSpawnRequest,
    DownloadRemoteLayersTaskState, LayerMapInfo, TimelineInfo,
};
use pageserver_api::value::{apply_records, Value};
use remote_storage::GenericRemoteStorage;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::id::{TenantId, TimelineId};
use utils::lsn::{AtomicLsn, Lsn};
use utils::sync::gate::Gate;

use crate::config::PageServerConf;
#[cfg(test)]
use crate::failpoint_support::Failpoints;
use crate::metrics::{StorageTimeOperation, TimelineMetrics};
use crate::pgdatadir_mapping::LsnForTimestamp;
use crate::tenant::config::{TenantConf, TenantConfOpt};
use crate::tenant::gc_result::GcResult;
use crate::tenant::layer_map::{SearchLayer, SearchResult};
use crate::tenant::metadata::TimelineMetadata;
use crate::tenant::remote_timeline_client::index::{IndexPart, Lineage, OngoingDetach};
use crate::tenant::remote_timeline_client::RemoteTimelineClient;
use crate::tenant::storage_layer::layer::{self, EvictionError};
use crate::tenant::storage_layer::{
    InMemoryLayer, Layer, LayerFileError, LayerName, ValueReconstructResult,
    ValueReconstructState,
};
use crate::tenant::TimelineArena;

use self::layer_manager::LayerManager;

/// Shared resources a timeline needs to talk to the outside world.
#[derive(Clone)]
pub struct TimelineResources {
    pub remote_storage: GenericRemoteStorage,
    #[cfg(test)]
    pub failpoints: Arc<Failpoints>,
}

impl TimelineResources {
    /// Connects to the remote storage of the configuration.
    pub fn from_conf(conf: &PageServerConf) -> anyhow::Result<Self> {
        let config = conf
            .remote_storage_config
            .as_ref()
            .context("remote storage is not configured")?;
        let mut remote_storage = GenericRemoteStorage::from_config(config)
            .context("failed to init remote storage")?;
        if conf.test_remote_failures > 0 {
            info!(
                fail_first = conf.test_remote_failures,
                "using unreliable remote storage wrapper"
            );
            remote_storage =
                GenericRemoteStorage::unreliable_wrapper(remote_storage, conf.test_remote_failures);
        }
        Ok(TimelineResources {
            remote_storage,
            #[cfg(test)]
            failpoints: Arc::default(),
        })
    }
}

pub struct Timeline {
    pub(crate) conf: &'static PageServerConf,
    tenant_conf: Arc<RwLock<TenantConfOpt>>,

    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,

    /// The layers of this timeline.
    ///
    /// Readers clone the inner `Arc` and work on that snapshot. Every modification
    /// replaces the manager with a modified copy while holding the write lock, so a
    /// reader never blocks on, nor observes, a half-done change.
    pub(crate) layers: tokio::sync::RwLock<Arc<LayerManager>>,

    /// The timelines of the tenant, to resolve the ancestor by id.
    arena: Weak<TimelineArena>,

    /// Ancestor timeline id and the LSN of the branch point. Cleared when the
    /// timeline is detached from its ancestor.
    ancestor: RwLock<Option<(TimelineId, Lsn)>>,

    initdb_lsn: Lsn,

    /// The LSN of the last record ingested into the timeline.
    last_record_lsn: AtomicLsn,

    /// All data up to and including this LSN is in historic layers.
    disk_consistent_lsn: AtomicLsn,

    /// Reads below this LSN are not guaranteed to succeed. Only moves forward.
    latest_gc_cutoff_lsn: AtomicLsn,

    pub(crate) remote_client: Arc<RemoteTimelineClient>,

    pub(crate) metrics: Arc<TimelineMetrics>,

    /// Held by the [`TimelineWriter`], serializes ingest and freezing.
    write_lock: tokio::sync::Mutex<()>,

    /// Serializes flushes of frozen layers.
    flush_lock: tokio::sync::Mutex<()>,

    /// Serializes compactions, also taken by the ancestor detach.
    pub(crate) compaction_lock: tokio::sync::Mutex<()>,

    /// Serializes gc, also taken by the ancestor detach.
    pub(crate) gc_lock: tokio::sync::Mutex<()>,

    lineage: Mutex<Lineage>,

    /// Persisted progress of an ancestor detach which has not completed.
    ongoing_detach: Mutex<Option<OngoingDetach>>,

    download_all_remote_layers_task_info: RwLock<Option<DownloadRemoteLayersTaskInfo>>,

    /// Entered by everything which uses the timeline in the background. Closed on shutdown.
    pub(crate) gate: Gate,

    /// Cancelled on shutdown, a child of the tenant's token.
    pub(crate) cancel: CancellationToken,

    #[cfg(test)]
    pub(crate) failpoints: Arc<Failpoints>,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("tenant_id", &self.tenant_id)
            .field("timeline_id", &self.timeline_id)
            .finish()
    }
}

/// An error happened in a get() operation.
#[derive(thiserror::Error, Debug)]
pub(crate) enum PageReconstructError {
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    #[error("timeline shutting down")]
    Cancelled,

    #[error("could not find data for key {key} at LSN {lsn}")]
    MissingKey { key: Key, lsn: Lsn },

    #[error("layer download failed")]
    DownloadFailed(#[source] layer::DownloadError),

    #[error(transparent)]
    LayerFile(#[from] LayerFileError),
}

impl From<layer::DownloadError> for PageReconstructError {
    fn from(e: layer::DownloadError) -> Self {
        if e.is_cancelled() {
            PageReconstructError::Cancelled
        } else {
            PageReconstructError::DownloadFailed(e)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum FlushLayerError {
    /// Timeline cancellation token was cancelled
    #[error("timeline shutting down")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlushLayerError {
    // When crossing from generic anyhow errors to this error type, we explicitly check
    // for timeline cancellation to avoid logging inoffensive shutdown errors as warn/err.
    fn from_anyhow(timeline: &Timeline, err: anyhow::Error) -> Self {
        if timeline.cancel.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Other(err)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum CompactionError {
    #[error("The timeline or pageserver is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<FlushLayerError> for CompactionError {
    fn from(e: FlushLayerError) -> Self {
        match e {
            FlushLayerError::Cancelled => CompactionError::ShuttingDown,
            FlushLayerError::Other(e) => CompactionError::Other(e),
        }
    }
}

impl From<PageReconstructError> for CompactionError {
    fn from(e: PageReconstructError) -> Self {
        match e {
            PageReconstructError::Cancelled => CompactionError::ShuttingDown,
            e => CompactionError::Other(anyhow::Error::new(e).context("read for compaction")),
        }
    }
}

impl From<layer::DownloadError> for CompactionError {
    fn from(e: layer::DownloadError) -> Self {
        PageReconstructError::from(e).into()
    }
}

impl From<LayerFileError> for CompactionError {
    fn from(e: LayerFileError) -> Self {
        CompactionError::Other(anyhow::Error::new(e))
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum GcError {
    #[error("timeline shutting down")]
    TimelineCancelled,

    /// The pitr cutoff could not be determined.
    #[error("reading commit timestamps")]
    Timestamps(#[source] PageReconstructError),

    #[error("remote storage: {0:#}")]
    Remote(anyhow::Error),
}

/// Failure of [`Timeline::download_all_remote_layers`].
#[derive(thiserror::Error, Debug)]
pub(crate) enum DownloadRemoteLayersError {
    #[error("a download of all remote layers is already running: {0}")]
    Busy(String),

    #[error("there are no remote layers to download")]
    NothingToDownload,

    #[error("{} of {} layer downloads failed", .0.failed_download_count, .0.total_layer_count)]
    PartialFailure(DownloadRemoteLayersTaskInfo),

    #[error("timeline shutting down")]
    ShuttingDown,
}

/// The cutoffs gc chose, in the order they are checked.
#[derive(Debug, Clone, Copy)]
struct GcCutoffs {
    /// `last_record_lsn - gc_horizon`
    space: Lsn,
    /// The LSN at `now - pitr_interval`.
    time: Lsn,
}

impl GcCutoffs {
    /// The later of the two cutoffs.
    fn select(&self) -> Lsn {
        std::cmp::max(self.space, self.time)
    }
}

impl Timeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conf: &'static PageServerConf,
        tenant_conf: Arc<RwLock<TenantConfOpt>>,
        metadata: &TimelineMetadata,
        lineage: Lineage,
        ongoing_detach: Option<OngoingDetach>,
        tenant_id: TenantId,
        timeline_id: TimelineId,
        resources: TimelineResources,
        arena: Weak<TimelineArena>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let metrics = Arc::new(TimelineMetrics::new(&tenant_id, &timeline_id));
        let remote_client = Arc::new(RemoteTimelineClient::new(
            conf,
            &resources,
            tenant_id,
            timeline_id,
            Arc::clone(&metrics),
        ));

        // a branch starts with everything up to the branch point
        let disk_consistent_lsn = std::cmp::max(metadata.disk_consistent_lsn, metadata.start_lsn());

        Arc::new(Timeline {
            conf,
            tenant_conf,
            tenant_id,
            timeline_id,
            layers: Default::default(),
            arena,
            ancestor: RwLock::new(metadata.ancestor()),
            initdb_lsn: metadata.initdb_lsn,
            last_record_lsn: AtomicLsn::from(disk_consistent_lsn),
            disk_consistent_lsn: AtomicLsn::from(disk_consistent_lsn),
            latest_gc_cutoff_lsn: AtomicLsn::from(metadata.latest_gc_cutoff_lsn),
            remote_client,
            metrics,
            write_lock: tokio::sync::Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
            compaction_lock: tokio::sync::Mutex::new(()),
            gc_lock: tokio::sync::Mutex::new(()),
            lineage: Mutex::new(lineage),
            ongoing_detach: Mutex::new(ongoing_detach),
            download_all_remote_layers_task_info: RwLock::new(None),
            gate: Gate::default(),
            cancel,
            #[cfg(test)]
            failpoints: resources.failpoints,
        })
    }

    /// Sets up the layer map of a timeline which was just created.
    pub(crate) async fn init_empty_layer_map(&self) {
        let next_open_layer_at = match self.get_ancestor() {
            Some((_, ancestor_lsn)) => ancestor_lsn + 1,
            None => self.initdb_lsn,
        };
        let mut guard = self.layers.write().await;
        Arc::make_mut(&mut guard).initialize_empty(next_open_layer_at);
    }

    /// Builds the layer map from the index, keeping the local files which match it.
    ///
    /// Local files unknown to the index and leftovers of interrupted writes are removed.
    pub(crate) async fn load_layer_map(
        self: &Arc<Self>,
        index_part: &IndexPart,
    ) -> anyhow::Result<()> {
        let timeline_path = self.conf.timeline_path(&self.tenant_id, &self.timeline_id);
        utils::crashsafe::create_dir_all(&timeline_path)
            .with_context(|| format!("create timeline directory {timeline_path}"))?;

        // files prepared by an unfinished detach are kept for its retry
        let prepared = index_part
            .ongoing_detach
            .as_ref()
            .map(|d| &d.prepared_layers);

        let mut local_sizes = HashMap::new();
        let mut entries = tokio::fs::read_dir(&timeline_path)
            .await
            .with_context(|| format!("read timeline directory {timeline_path}"))?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                warn!("non-utf8 file in timeline directory: {:?}", entry.path());
                continue;
            };
            let Some(file_name) = path.file_name() else {
                continue;
            };
            if crate::is_temporary(&path) {
                info!("removing temporary file {path}");
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("remove temporary file {path}"))?;
                continue;
            }
            match file_name.parse::<LayerName>() {
                Ok(name) if index_part.layer_metadata.contains_key(&name) => {
                    local_sizes.insert(name, entry.metadata().await?.len());
                }
                Ok(name) if prepared.is_some_and(|p| p.contains_key(&name)) => {}
                Ok(name) => {
                    info!(layer = %name, "removing local layer which is not in the index");
                    tokio::fs::remove_file(&path)
                        .await
                        .with_context(|| format!("remove unknown layer file {path}"))?;
                }
                Err(_) => warn!("unrecognized file in timeline directory: {file_name}"),
            }
        }

        let mut layers = Vec::with_capacity(index_part.layer_metadata.len());
        for (name, metadata) in &index_part.layer_metadata {
            let layer = match local_sizes.get(name) {
                Some(&size) if size == metadata.file_size => {
                    Layer::for_resident(self.conf, self, name.clone(), *metadata)
                        .drop_eviction_guard()
                }
                Some(&size) => {
                    warn!(
                        layer = %name,
                        local = size,
                        remote = metadata.file_size,
                        "local layer file size does not match the index, removing it"
                    );
                    let path = self.conf.layer_path(&self.tenant_id, &self.timeline_id, name);
                    tokio::fs::remove_file(&path)
                        .await
                        .with_context(|| format!("remove mismatching layer file {path}"))?;
                    Layer::for_evicted(self.conf, self, name.clone(), *metadata)
                }
                None => Layer::for_evicted(self.conf, self, name.clone(), *metadata),
            };
            layers.push(layer);
        }

        let next_open_layer_at = if layers.is_empty() && self.get_ancestor().is_none() {
            self.initdb_lsn
        } else {
            self.get_disk_consistent_lsn() + 1
        };

        info!(
            layers = layers.len(),
            resident = local_sizes.len(),
            "loaded layer map"
        );
        let mut guard = self.layers.write().await;
        Arc::make_mut(&mut guard).initialize_local_layers(layers, next_open_layer_at);
        Ok(())
    }

    /// A snapshot of the layers. Later modifications are not visible in it.
    pub(crate) async fn layers_snapshot(&self) -> Arc<LayerManager> {
        Arc::clone(&*self.layers.read().await)
    }

    //
    // Accessors
    //

    pub(crate) fn get_ancestor(&self) -> Option<(TimelineId, Lsn)> {
        *self.ancestor.read().unwrap()
    }

    pub(crate) fn get_ancestor_timeline_id(&self) -> Option<TimelineId> {
        self.get_ancestor().map(|(id, _)| id)
    }

    /// The branch point, or [`Lsn::INVALID`] for a timeline without ancestor.
    pub(crate) fn get_ancestor_lsn(&self) -> Lsn {
        self.get_ancestor().map(|(_, lsn)| lsn).unwrap_or(Lsn::INVALID)
    }

    pub(crate) fn set_ancestor(&self, ancestor: Option<(TimelineId, Lsn)>) {
        *self.ancestor.write().unwrap() = ancestor;
    }

    /// Resolves the ancestor through the tenant's timelines.
    pub(crate) fn get_ancestor_timeline(&self) -> anyhow::Result<Option<(Arc<Timeline>, Lsn)>> {
        let Some((ancestor_id, ancestor_lsn)) = self.get_ancestor() else {
            return Ok(None);
        };
        let arena = self
            .arena
            .upgrade()
            .context("tenant of the timeline is gone")?;
        let ancestor = arena
            .get(&ancestor_id)
            .with_context(|| format!("ancestor timeline {ancestor_id} is not loaded"))?;
        Ok(Some((ancestor, ancestor_lsn)))
    }

    pub(crate) fn arena(&self) -> Option<Arc<TimelineArena>> {
        self.arena.upgrade()
    }

    pub(crate) fn get_initdb_lsn(&self) -> Lsn {
        self.initdb_lsn
    }

    pub(crate) fn get_last_record_lsn(&self) -> Lsn {
        self.last_record_lsn.load()
    }

    pub(crate) fn get_disk_consistent_lsn(&self) -> Lsn {
        self.disk_consistent_lsn.load()
    }

    pub(crate) fn get_latest_gc_cutoff_lsn(&self) -> Lsn {
        self.latest_gc_cutoff_lsn.load()
    }

    pub(crate) fn lineage(&self) -> Lineage {
        self.lineage.lock().unwrap().clone()
    }

    pub(crate) fn update_lineage<T>(&self, f: impl FnOnce(&mut Lineage) -> T) -> T {
        f(&mut self.lineage.lock().unwrap())
    }

    pub(crate) fn ongoing_detach(&self) -> Option<OngoingDetach> {
        self.ongoing_detach.lock().unwrap().clone()
    }

    pub(crate) fn set_ongoing_detach(&self, ongoing: Option<OngoingDetach>) {
        *self.ongoing_detach.lock().unwrap() = ongoing;
    }

    pub(crate) fn update_ongoing_detach<T>(
        &self,
        f: impl FnOnce(&mut Option<OngoingDetach>) -> T,
    ) -> T {
        f(&mut self.ongoing_detach.lock().unwrap())
    }

    /// Sum of the sizes of all historic layers, resident or not.
    pub(crate) async fn layer_size_sum(&self) -> u64 {
        self.layers_snapshot().await.layer_size_sum()
    }

    pub(crate) fn resident_physical_size(&self) -> u64 {
        self.metrics.resident_physical_size_get()
    }

    pub(crate) fn remote_physical_size(&self) -> u64 {
        self.metrics.remote_physical_size_get()
    }

    fn get_tenant_conf(&self) -> TenantConf {
        self.tenant_conf
            .read()
            .unwrap()
            .merge(self.conf.default_tenant_conf)
    }

    pub(crate) fn get_checkpoint_distance(&self) -> u64 {
        self.get_tenant_conf().checkpoint_distance
    }

    pub(crate) fn get_compaction_target_size(&self) -> u64 {
        self.get_tenant_conf().compaction_target_size
    }

    pub(crate) fn get_compaction_threshold(&self) -> usize {
        self.get_tenant_conf().compaction_threshold
    }

    pub(crate) fn get_image_creation_threshold(&self) -> usize {
        self.get_tenant_conf().image_creation_threshold
    }

    pub(crate) fn get_eviction_timeout(&self) -> Duration {
        self.get_tenant_conf().eviction_timeout
    }

    //
    // Reads
    //

    /// Look up the value with the given key at the given LSN.
    ///
    /// NOTE: It is considered an error to 'get' a key that doesn't exist. A key
    /// missing from this timeline is looked up in the ancestors, below the branch
    /// point.
    pub(crate) async fn get(&self, key: Key, lsn: Lsn) -> Result<Bytes, PageReconstructError> {
        if !lsn.is_valid() {
            return Err(PageReconstructError::Other(anyhow!("Invalid LSN")));
        }
        let last_record_lsn = self.get_last_record_lsn();
        if lsn > last_record_lsn {
            return Err(PageReconstructError::Other(anyhow!(
                "read at {lsn} is ahead of the last record LSN {last_record_lsn}"
            )));
        }

        let mut reconstruct_state = ValueReconstructState::default();
        self.get_reconstruct_data(key, lsn, &mut reconstruct_state)
            .await?;

        let ValueReconstructState { records, img } = reconstruct_state;
        // collected newest first
        let records = records.into_iter().rev().map(|(_, rec)| rec).collect_vec();
        apply_records(img.map(|(_, img)| img), &records)
            .ok_or(PageReconstructError::MissingKey { key, lsn })
    }

    /// Collects the data needed to reconstruct the value, walking from this timeline
    /// down the ancestors.
    async fn get_reconstruct_data(
        &self,
        key: Key,
        request_lsn: Lsn,
        reconstruct_state: &mut ValueReconstructState,
    ) -> Result<(), PageReconstructError> {
        let mut cont_lsn = request_lsn + 1;
        let mut ancestor: Option<Arc<Timeline>> = None;

        loop {
            let timeline = ancestor.as_deref().unwrap_or(self);
            if timeline.cancel.is_cancelled() {
                return Err(PageReconstructError::Cancelled);
            }

            // resolved before the layers: a detach publishes the copied layers before
            // it clears the ancestor
            let next = timeline.get_ancestor_timeline()?;

            match timeline
                .get_reconstruct_data_from_layers(key, cont_lsn, reconstruct_state)
                .await?
            {
                ValueReconstructResult::Complete => return Ok(()),
                ValueReconstructResult::Missing => {
                    return Err(PageReconstructError::MissingKey {
                        key,
                        lsn: request_lsn,
                    })
                }
                ValueReconstructResult::Continue => {}
            }

            let Some((next, ancestor_lsn)) = next else {
                // reached the root, the records found so far need no base
                return Ok(());
            };
            trace!(
                ancestor_timeline_id = %next.timeline_id,
                %ancestor_lsn,
                "continuing the lookup in the ancestor"
            );
            cont_lsn = std::cmp::min(cont_lsn, ancestor_lsn + 1);
            ancestor = Some(next);
        }
    }

    /// Reads the layers of this timeline below `cont_lsn`, newest first.
    async fn get_reconstruct_data_from_layers(
        &self,
        key: Key,
        mut cont_lsn: Lsn,
        reconstruct_state: &mut ValueReconstructState,
    ) -> Result<ValueReconstructResult, PageReconstructError> {
        let layers = self.layers_snapshot().await;

        while let Some(SearchResult { layer, lsn_floor }) =
            layers.layer_map().search(key, cont_lsn)
        {
            if lsn_floor >= cont_lsn {
                return Err(PageReconstructError::Other(anyhow!(
                    "could not make progress reading {key} below {cont_lsn}"
                )));
            }
            let lsn_range = lsn_floor..cont_lsn;
            let result = match layer {
                SearchLayer::InMemory(inmem) => {
                    inmem
                        .get_value_reconstruct_data(key, lsn_range, reconstruct_state)
                        .await
                }
                SearchLayer::Persistent(desc) => {
                    layers
                        .get_from_desc(&desc)
                        .get_value_reconstruct_data(key, lsn_range, reconstruct_state)
                        .await?
                }
            };
            match result {
                ValueReconstructResult::Continue => cont_lsn = lsn_floor,
                done => return Ok(done),
            }
        }

        Ok(ValueReconstructResult::Continue)
    }

    //
    // Writes
    //

    /// Mutate the timeline with a [`TimelineWriter`].
    pub(crate) async fn writer(&self) -> TimelineWriter<'_> {
        TimelineWriter {
            tl: self,
            _write_guard: self.write_lock.lock().await,
            max_lsn: None,
        }
    }

    /// Returns the open layer, creating it if needed.
    async fn get_layer_for_write(&self, lsn: Lsn) -> anyhow::Result<Arc<InMemoryLayer>> {
        {
            let layers = self.layers.read().await;
            if let Some(open_layer) = &layers.layer_map().open_layer {
                if open_layer.get_lsn_range().start <= lsn {
                    return Ok(Arc::clone(open_layer));
                }
            }
        }

        let mut guard = self.layers.write().await;
        Arc::make_mut(&mut guard).get_layer_for_write(
            lsn,
            self.conf,
            self.timeline_id,
            self.tenant_id,
        )
    }

    /// Flush to disk all data that was written with the put_* functions
    pub(crate) async fn freeze_and_flush(self: &Arc<Self>) -> Result<(), FlushLayerError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| FlushLayerError::Cancelled)?;

        {
            let _write_guard = self.write_lock.lock().await;
            let last_record_lsn = self.get_last_record_lsn();
            let mut guard = self.layers.write().await;
            if Arc::make_mut(&mut guard)
                .try_freeze_in_memory_layer(last_record_lsn)
                .await
            {
                debug!(%last_record_lsn, "froze the open layer");
            }
        }

        self.flush_frozen_layers().await
    }

    /// Writes out all frozen layers, oldest first.
    pub(crate) async fn flush_frozen_layers(self: &Arc<Self>) -> Result<(), FlushLayerError> {
        let _flush_guard = self.flush_lock.lock().await;

        loop {
            if self.cancel.is_cancelled() {
                return Err(FlushLayerError::Cancelled);
            }
            let frozen = {
                let layers = self.layers.read().await;
                layers.layer_map().frozen_layers.front().cloned()
            };
            let Some(frozen) = frozen else {
                return Ok(());
            };
            self.flush_frozen_layer(frozen).await?;
        }
    }

    /// Flush one frozen in-memory layer to disk, as a new delta layer.
    ///
    /// The layer is uploaded before it becomes visible in the layer map, so that any
    /// index built from the layer map only lists uploaded layers.
    #[instrument(skip_all, fields(layer = ?frozen))]
    async fn flush_frozen_layer(
        self: &Arc<Self>,
        frozen: Arc<InMemoryLayer>,
    ) -> Result<(), FlushLayerError> {
        let timer = self.metrics.start_timer(StorageTimeOperation::LayerFlush);
        let lsn_range = frozen.get_lsn_range();

        let new_delta = frozen
            .write_to_disk(self)
            .await
            .map_err(|e| FlushLayerError::from_anyhow(self, e))?;

        if let Some(delta) = &new_delta {
            self.remote_client
                .upload_layer_file(delta, &self.cancel)
                .await
                .map_err(|e| FlushLayerError::from_anyhow(self, e))?;
        }

        {
            let mut guard = self.layers.write().await;
            Arc::make_mut(&mut guard).finish_flush_l0_layer(new_delta.as_ref(), &frozen);
        }

        // everything below the end of the frozen layer is now on disk
        let disk_consistent_lsn = Lsn(lsn_range.end.0 - 1);
        self.disk_consistent_lsn.fetch_max(disk_consistent_lsn);

        self.upload_index()
            .await
            .map_err(|e| FlushLayerError::from_anyhow(self, e))?;

        timer.stop_and_record();
        match &new_delta {
            Some(delta) => info!(%disk_consistent_lsn, layer = %delta, "flushed frozen layer"),
            None => info!(%disk_consistent_lsn, "frozen layer was empty"),
        }
        Ok(())
    }

    /// Builds the index of the timeline from its current state.
    pub(crate) fn build_index_part(&self, layers: &LayerManager) -> IndexPart {
        let layer_metadata = layers
            .historic_layers()
            .into_iter()
            .map(|l| (l.layer_name(), l.metadata()))
            .collect();
        let (ancestor_timeline, ancestor_lsn) = match self.get_ancestor() {
            Some((id, lsn)) => (Some(id), lsn),
            None => (None, Lsn::INVALID),
        };
        let metadata = TimelineMetadata::new(
            self.get_disk_consistent_lsn(),
            ancestor_timeline,
            ancestor_lsn,
            self.get_latest_gc_cutoff_lsn(),
            self.initdb_lsn,
        );
        IndexPart::new(
            layer_metadata,
            metadata,
            self.lineage(),
            self.ongoing_detach(),
        )
    }

    /// Uploads an index reflecting the state of the timeline at the time of the call.
    ///
    /// Concurrent calls are serialized, and each builds the index only once it holds
    /// the upload lock, so an older state never overwrites a newer one.
    pub(crate) async fn upload_index(&self) -> anyhow::Result<()> {
        let guard = self.remote_client.lock_index_upload().await;
        let index_part = {
            let layers = self.layers.read().await;
            self.build_index_part(&layers)
        };
        guard.upload(index_part, &self.cancel).await
    }

    //
    // Garbage collection
    //

    /// Garbage collect layer files on a timeline that are no longer needed.
    ///
    /// Currently, we don't make any attempt at removing unneeded page versions
    /// within a layer file. We can only remove the whole file if it's fully
    /// obsolete.
    ///
    /// `retain_lsns` are the branch points of the child timelines.
    pub(crate) async fn gc_timeline(
        &self,
        horizon: u64,
        pitr: Duration,
        retain_lsns: Vec<Lsn>,
    ) -> Result<GcResult, GcError> {
        let _gate = self.gate.enter().map_err(|_| GcError::TimelineCancelled)?;
        let _gc_guard = self.gc_lock.lock().await;

        if let Some(ongoing) = self.ongoing_detach() {
            info!(
                ancestor_timeline_id = %ongoing.ancestor_timeline_id,
                "skipping gc while an ancestor detach is ongoing"
            );
            return Ok(GcResult::default());
        }

        let cutoffs = self
            .find_gc_cutoffs(horizon, pitr)
            .await
            .map_err(|e| match e {
                PageReconstructError::Cancelled => GcError::TimelineCancelled,
                e => GcError::Timestamps(e),
            })?;

        let timer = self.metrics.start_timer(StorageTimeOperation::Gc);
        let res = self.gc_timeline_inner(cutoffs, retain_lsns).await?;
        timer.stop_and_record();
        Ok(res)
    }

    async fn find_gc_cutoffs(
        &self,
        horizon: u64,
        pitr: Duration,
    ) -> Result<GcCutoffs, PageReconstructError> {
        let last_record_lsn = self.get_last_record_lsn();
        let space = last_record_lsn.checked_sub(horizon).unwrap_or(Lsn(0));

        let time = if pitr == Duration::ZERO {
            space
        } else {
            match SystemTime::now().checked_sub(pitr) {
                Some(pitr_cutoff_timestamp) => {
                    let timestamp = crate::pgdatadir_mapping::to_timestamp(pitr_cutoff_timestamp);
                    match self.find_lsn_for_timestamp(timestamp).await? {
                        LsnForTimestamp::Present(lsn) => lsn,
                        LsnForTimestamp::Future(lsn) => {
                            // no commits since the pitr cutoff
                            debug!("future({lsn})");
                            space
                        }
                        LsnForTimestamp::Past(lsn) | LsnForTimestamp::NoData(lsn) => {
                            // nothing is known to be older than the pitr window
                            debug!("past or nodata({lsn})");
                            self.get_latest_gc_cutoff_lsn()
                        }
                    }
                }
                None => self.get_latest_gc_cutoff_lsn(),
            }
        };

        Ok(GcCutoffs { space, time })
    }

    async fn gc_timeline_inner(
        &self,
        cutoffs: GcCutoffs,
        retain_lsns: Vec<Lsn>,
    ) -> Result<GcResult, GcError> {
        let now = Instant::now();
        let mut result: GcResult = GcResult::default();

        // data above disk_consistent_lsn only exists in memory
        let new_gc_cutoff = std::cmp::max(
            std::cmp::min(cutoffs.select(), self.get_disk_consistent_lsn()),
            self.get_latest_gc_cutoff_lsn(),
        );

        info!(
            space_cutoff = %cutoffs.space,
            time_cutoff = %cutoffs.time,
            %new_gc_cutoff,
            retain_lsns = ?retain_lsns,
            "GC starting"
        );

        let layers = self.layers_snapshot().await;
        let layer_map = layers.layer_map();
        let mut layers_to_remove = Vec::new();

        // Scan all layers in the timeline (remote or on-disk).
        //
        // Garbage collect the layer if all conditions are satisfied:
        // 1. it is older than cutoff LSN;
        // 2. it doesn't need to be retained for 'retain_lsns';
        // 3. newer on-disk image layers cover the layer's whole key range
        'outer: for l in layer_map.iter_historic_layers() {
            result.layers_total += 1;

            // 1. Is it newer than GC horizon cutoff point?
            if l.get_lsn_range().end > new_gc_cutoff {
                debug!(layer = %l.short_id(), "keeping because it's newer than the gc cutoff {new_gc_cutoff}");
                if new_gc_cutoff == cutoffs.time && cutoffs.time > cutoffs.space {
                    result.layers_needed_by_pitr += 1;
                } else {
                    result.layers_needed_by_cutoff += 1;
                }
                continue 'outer;
            }

            // 2. Is it needed by a child branch?
            for retain_lsn in &retain_lsns {
                if l.get_lsn_range().start > *retain_lsn {
                    continue;
                }
                // the layer has values at the branch point, or the branch reads
                // through it because nothing newer covers it
                let needed = *retain_lsn < l.get_lsn_range().end
                    || !layer_map.image_layer_exists(
                        &l.get_key_range(),
                        &(l.get_lsn_range().end..*retain_lsn + 1),
                    );
                if needed {
                    debug!(layer = %l.short_id(), "keeping because it's still needed by branch at {retain_lsn}");
                    result.layers_needed_by_branches += 1;
                    continue 'outer;
                }
            }

            // 3. Is there a later on-disk layer for this relation?
            //
            // The end-LSN is exclusive, while disk_consistent_lsn is inclusive:
            // an image at the cutoff serves reads at the cutoff.
            if !layer_map.image_layer_exists(
                &l.get_key_range(),
                &(l.get_lsn_range().end..new_gc_cutoff + 1),
            ) {
                debug!(layer = %l.short_id(), "keeping because it is the latest layer");
                result.layers_not_updated += 1;
                continue 'outer;
            }

            debug!(layer = %l.short_id(), "garbage collecting");
            layers_to_remove.push(layers.get_from_desc(&l));
        }
        drop(layers);

        self.latest_gc_cutoff_lsn.fetch_max(new_gc_cutoff);

        if layers_to_remove.is_empty() {
            info!("Nothing to GC");
            // the cutoff may still have moved
            self.upload_index().await.map_err(|e| self.gc_remote_error(e))?;
            result.elapsed = now.elapsed();
            return Ok(result);
        }

        {
            let mut guard = self.layers.write().await;
            Arc::make_mut(&mut guard).finish_gc_timeline(&layers_to_remove);
        }

        // the index no longer lists the layers before their remote files go away
        self.upload_index().await.map_err(|e| self.gc_remote_error(e))?;

        let names = layers_to_remove.iter().map(|l| l.layer_name()).collect_vec();
        self.remote_client
            .delete_layer_files(&names, &self.cancel)
            .await
            .map_err(|e| self.gc_remote_error(e))?;

        result.layers_removed = layers_to_remove.len() as u64;
        result.elapsed = now.elapsed();
        info!(
            removed = result.layers_removed,
            needed_by_cutoff = result.layers_needed_by_cutoff,
            needed_by_pitr = result.layers_needed_by_pitr,
            needed_by_branches = result.layers_needed_by_branches,
            not_updated = result.layers_not_updated,
            "GC completed"
        );
        Ok(result)
    }

    fn gc_remote_error(&self, e: anyhow::Error) -> GcError {
        if self.cancel.is_cancelled() {
            GcError::TimelineCancelled
        } else {
            GcError::Remote(e)
        }
    }

    //
    // Residency
    //

    pub(crate) async fn find_layer(&self, layer_name: &LayerName) -> Option<Layer> {
        self.layers_snapshot().await.find_layer_by_name(layer_name)
    }

    /// Evict just one layer.
    ///
    /// Returns `Ok(None)` if the layer is not part of the timeline, `Ok(Some(false))`
    /// if it was not resident.
    pub(crate) async fn evict_layer(
        &self,
        layer_file_name: &LayerName,
    ) -> Result<Option<bool>, EvictionError> {
        let Some(layer) = self.find_layer(layer_file_name).await else {
            return Ok(None);
        };

        match layer.evict_and_wait(self.get_eviction_timeout()).await {
            Ok(()) => Ok(Some(true)),
            Err(EvictionError::NotFound) => Ok(Some(false)),
            Err(e) => Err(e),
        }
    }

    /// Evicts every resident layer. Returns the number of evicted layers.
    ///
    /// All layers are attempted, the first failure is returned.
    pub(crate) async fn evict_all_layers(&self) -> Result<usize, EvictionError> {
        let layers = self.layers_snapshot().await;
        let resident = layers.likely_resident_layers().cloned().collect_vec();
        drop(layers);

        let timeout = self.get_eviction_timeout();
        let mut evicted = 0;
        let mut first_error = None;
        for layer in resident {
            match layer.evict_and_wait(timeout).await {
                Ok(()) => evicted += 1,
                // raced with another eviction
                Err(EvictionError::NotFound) => {}
                Err(e) => {
                    warn!(%layer, "failed to evict layer: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    /// Downloads one layer.
    ///
    /// Returns `Ok(None)` if the layer is not part of the timeline, `Ok(Some(false))`
    /// if it was already resident.
    pub(crate) async fn download_layer(
        &self,
        layer_file_name: &LayerName,
    ) -> Result<Option<bool>, layer::DownloadError> {
        let Some(layer) = self.find_layer(layer_file_name).await else {
            return Ok(None);
        };
        if layer.is_likely_resident() {
            return Ok(Some(false));
        }
        layer.download().await?;
        Ok(Some(true))
    }

    /// Downloads all evicted layers, at most `max_concurrent_downloads` at a time.
    ///
    /// Without `errors_ok` the first failure stops the job: the layers not attempted
    /// yet are counted as failed.
    pub(crate) async fn download_all_remote_layers(
        &self,
        request: DownloadRemoteLayersTaskSpawnRequest,
    ) -> Result<DownloadRemoteLayersTaskInfo, DownloadRemoteLayersError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| DownloadRemoteLayersError::ShuttingDown)?;

        let task_id = {
            let mut status_guard = self.download_all_remote_layers_task_info.write().unwrap();
            if let Some(st) = &*status_guard {
                if st.state == DownloadRemoteLayersTaskState::Running {
                    return Err(DownloadRemoteLayersError::Busy(st.task_id.clone()));
                }
            }
            let task_id = format!("{:016x}", rand::random::<u64>());
            *status_guard = Some(DownloadRemoteLayersTaskInfo {
                task_id: task_id.clone(),
                state: DownloadRemoteLayersTaskState::Running,
                total_layer_count: 0,
                successful_download_count: 0,
                failed_download_count: 0,
            });
            task_id
        };

        let res = self
            .download_all_remote_layers0(&request)
            .instrument(info_span!("download_all_remote_layers", task_id = %task_id))
            .await;

        let info = self
            .get_download_all_remote_layers_task_info()
            .expect("set at the start of the job");
        match res {
            Ok(()) if request.at_least_one_download && info.total_layer_count == 0 => {
                Err(DownloadRemoteLayersError::NothingToDownload)
            }
            Ok(()) if info.state == DownloadRemoteLayersTaskState::ShutDown => {
                Err(DownloadRemoteLayersError::ShuttingDown)
            }
            Ok(()) if request.at_least_one_download && info.successful_download_count == 0 => {
                Err(DownloadRemoteLayersError::PartialFailure(info))
            }
            Ok(()) => Ok(info),
            Err(()) => Err(DownloadRemoteLayersError::PartialFailure(info)),
        }
    }

    /// Runs the bulk download, keeping the task info up to date. Fails if the job
    /// was stopped by a failed download.
    async fn download_all_remote_layers0(
        &self,
        request: &DownloadRemoteLayersTaskSpawnRequest,
    ) -> Result<(), ()> {
        let layers = self.layers_snapshot().await;
        let evicted = layers
            .historic_layers()
            .into_iter()
            .filter(|l| !l.is_likely_resident())
            .collect_vec();
        drop(layers);

        let total_layer_count = evicted.len() as u64;
        self.update_download_task_info(|st| st.total_layer_count = total_layer_count);
        info!(total_layer_count, "downloading all remote layers");

        let max_concurrent = std::cmp::min(
            request.max_concurrent_downloads.get(),
            self.conf.max_concurrent_layer_downloads.get(),
        );

        let mut pending = evicted.into_iter();
        let mut downloads = JoinSet::new();
        let mut stopped = false;
        let mut cancelled = false;
        loop {
            while !stopped && downloads.len() < max_concurrent {
                let Some(layer) = pending.next() else {
                    break;
                };
                downloads.spawn(async move {
                    let res = layer.download().await;
                    (layer, res)
                });
            }

            let next = tokio::select! {
                next = downloads.join_next() => next,
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            };
            let Some(res) = next else {
                break;
            };

            let failed = match res {
                Ok((layer, Ok(()))) => {
                    debug!(%layer, "downloaded layer");
                    false
                }
                Ok((layer, Err(e))) => {
                    warn!(%layer, "failed to download layer: {e:#}");
                    true
                }
                Err(join_error) => {
                    error!("layer download task panicked: {join_error}");
                    true
                }
            };
            self.update_download_task_info(|st| {
                if failed {
                    st.failed_download_count += 1;
                } else {
                    st.successful_download_count += 1;
                }
            });
            if failed && !request.errors_ok {
                stopped = true;
            }
        }

        if cancelled {
            downloads.shutdown().await;
        }

        // never attempted or aborted
        let not_attempted = pending.count() as u64;
        let info = self.update_download_task_info(|st| {
            st.failed_download_count = st.total_layer_count - st.successful_download_count;
            st.state = if cancelled {
                DownloadRemoteLayersTaskState::ShutDown
            } else {
                DownloadRemoteLayersTaskState::Completed
            };
            st.clone()
        });
        info!(
            successful = info.successful_download_count,
            failed = info.failed_download_count,
            not_attempted,
            "downloading all remote layers finished"
        );

        if stopped {
            return Err(());
        }
        Ok(())
    }

    fn update_download_task_info<T>(
        &self,
        f: impl FnOnce(&mut DownloadRemoteLayersTaskInfo) -> T,
    ) -> T {
        let mut status_guard = self.download_all_remote_layers_task_info.write().unwrap();
        let st = status_guard
            .as_mut()
            .expect("set at the start of the job");
        f(st)
    }

    pub(crate) fn get_download_all_remote_layers_task_info(
        &self,
    ) -> Option<DownloadRemoteLayersTaskInfo> {
        self.download_all_remote_layers_task_info
            .read()
            .unwrap()
            .clone()
    }

    //
    // Introspection
    //

    pub(crate) async fn layer_map_info(&self) -> LayerMapInfo {
        let layers = self.layers_snapshot().await;
        let layer_map = layers.layer_map();

        let mut in_memory_layers = Vec::with_capacity(layer_map.frozen_layers.len() + 1);
        if let Some(open_layer) = &layer_map.open_layer {
            in_memory_layers.push(open_layer.info());
        }
        for frozen_layer in &layer_map.frozen_layers {
            in_memory_layers.push(frozen_layer.info());
        }

        let historic_layers = layers
            .historic_layers()
            .iter()
            .map(|l| l.info())
            .collect();

        LayerMapInfo {
            in_memory_layers,
            historic_layers,
        }
    }

    pub(crate) async fn timeline_info(&self) -> TimelineInfo {
        let ancestor = self.get_ancestor();
        TimelineInfo {
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            ancestor_timeline_id: ancestor.map(|(id, _)| id),
            ancestor_lsn: ancestor.map(|(_, lsn)| lsn),
            last_record_lsn: self.get_last_record_lsn(),
            disk_consistent_lsn: self.get_disk_consistent_lsn(),
            latest_gc_cutoff_lsn: self.get_latest_gc_cutoff_lsn(),
            current_physical_size: self.layer_size_sum().await,
            resident_physical_size: self.resident_physical_size(),
            remote_physical_size: self.remote_physical_size(),
        }
    }

    //
    // Lifecycle
    //

    /// Cancels background work and waits for it to stop. In-memory data which was
    /// not flushed is lost.
    pub(crate) async fn shutdown(&self) {
        debug!("shutting down timeline");
        self.cancel.cancel();
        self.gate.close().await;
        self.metrics.shutdown();
    }

    /// Drops all layers, removing the local files once they are no longer used.
    pub(crate) async fn delete_local_layers(&self) {
        let mut guard = self.layers.write().await;
        Arc::make_mut(&mut guard).delete_all();
    }
}

/// Various functions to mutate the timeline.
///
/// Holding a writer excludes other writers and freezing of the open layer.
pub(crate) struct TimelineWriter<'a> {
    tl: &'a Timeline,
    _write_guard: tokio::sync::MutexGuard<'a, ()>,
    /// Largest LSN which passed through this writer.
    max_lsn: Option<Lsn>,
}

impl Deref for TimelineWriter<'_> {
    type Target = Timeline;

    fn deref(&self) -> &Self::Target {
        self.tl
    }
}

impl TimelineWriter<'_> {
    /// Put a new page version that can be constructed from a WAL record
    ///
    /// This will implicitly extend the relation, if the page is beyond the
    /// current end-of-file.
    pub(crate) async fn put(&mut self, key: Key, lsn: Lsn, value: &Value) -> anyhow::Result<()> {
        let last_record_lsn = self.tl.get_last_record_lsn();
        ensure!(
            lsn >= last_record_lsn,
            "put at {lsn} is below the last record LSN {last_record_lsn}"
        );

        if let Some(max_lsn) = self.max_lsn {
            ensure!(lsn >= max_lsn, "put at {lsn} is below the previous put at {max_lsn}");
            if lsn > max_lsn {
                // all values of the previous record are in
                self.maybe_roll_layer(max_lsn).await;
            }
        }

        let layer = self.tl.get_layer_for_write(lsn).await?;
        layer.put_value(key, lsn, value).await?;
        self.max_lsn = Some(lsn);
        Ok(())
    }

    /// Freezes the open layer at `freeze_at + 1` once it has grown past the
    /// checkpoint distance. The frozen layer is written out by the next flush.
    async fn maybe_roll_layer(&mut self, freeze_at: Lsn) {
        let open_layer = {
            let layers = self.tl.layers.read().await;
            layers.layer_map().open_layer.clone()
        };
        let Some(open_layer) = open_layer else {
            return;
        };
        let current_size = open_layer.size().await;
        if current_size < self.tl.get_checkpoint_distance() {
            return;
        }

        let mut guard = self.tl.layers.write().await;
        if Arc::make_mut(&mut guard)
            .try_freeze_in_memory_layer(freeze_at)
            .await
        {
            debug!(%freeze_at, current_size, "rolled the open layer");
        }
    }

    /// Track the end of the latest digested WAL record.
    ///
    /// Call this after you have finished writing all the WAL up to 'lsn'.
    pub(crate) fn finish_write(&self, new_lsn: Lsn) {
        let prev = self.tl.last_record_lsn.fetch_max(new_lsn);
        debug_assert!(prev <= new_lsn, "last record LSN moved backwards");
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::mgmt_api::ApiError;
    use crate::tenant::harness::{test_img, TenantHarness, TIMELINE_ID};

    async fn put_and_flush(tl: &Arc<Timeline>, values: &[(Key, Lsn, &str)]) {
        {
            let mut writer = tl.writer().await;
            for (key, lsn, img) in values {
                writer.put(*key, *lsn, &Value::Image(test_img(img))).await.unwrap();
                writer.finish_write(*lsn);
            }
        }
        tl.freeze_and_flush().await.unwrap();
    }

    async fn assert_size_invariants(tl: &Timeline) {
        let info = tl.timeline_info().await;
        let layers = tl.layers_snapshot().await;
        let sum: u64 = layers
            .historic_layers()
            .iter()
            .map(|l| l.metadata().file_size)
            .sum();
        assert_eq!(info.current_physical_size, sum);
        assert_eq!(
            info.resident_physical_size + info.remote_physical_size,
            info.current_physical_size
        );
    }

    #[tokio::test]
    async fn reads_walk_layers_and_ancestors() {
        let harness = TenantHarness::create("reads_walk_layers_and_ancestors").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();

        let key = Key::user(1, 0);
        put_and_flush(&tline, &[(key, Lsn(0x10), "foo at 0x10")]).await;
        {
            let mut writer = tline.writer().await;
            writer
                .put(key, Lsn(0x20), &Value::WalRecord(Bytes::from_static(b" bar")))
                .await
                .unwrap();
            writer.finish_write(Lsn(0x20));
        }

        assert_eq!(tline.get(key, Lsn(0x10)).await.unwrap(), test_img("foo at 0x10"));
        assert_eq!(
            tline.get(key, Lsn(0x20)).await.unwrap(),
            Bytes::from_static(b"foo at 0x10 bar")
        );
        assert!(matches!(
            tline.get(Key::user(1, 1), Lsn(0x20)).await,
            Err(PageReconstructError::MissingKey { .. })
        ));
        assert!(tline.get(key, Lsn(0x30)).await.is_err());

        let child = tenant
            .branch_timeline_test(&tline, TimelineId::generate(), Lsn(0x10))
            .await
            .unwrap();
        {
            let mut writer = child.writer().await;
            writer
                .put(key, Lsn(0x30), &Value::WalRecord(Bytes::from_static(b" baz")))
                .await
                .unwrap();
            writer.finish_write(Lsn(0x30));
        }
        assert_eq!(
            child.get(key, Lsn(0x30)).await.unwrap(),
            Bytes::from_static(b"foo at 0x10 baz")
        );
        // the parent's later record is not visible to the branch
        assert_eq!(child.get(key, Lsn(0x10)).await.unwrap(), test_img("foo at 0x10"));
    }

    #[tokio::test]
    async fn checkpoint_flushes_open_layer() {
        let harness = TenantHarness::create("checkpoint_flushes_open_layer").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();

        // nothing written yet
        tline.freeze_and_flush().await.unwrap();
        assert_eq!(tline.layer_map_info().await.historic_layers.len(), 0);

        put_and_flush(
            &tline,
            &[(Key::user(1, 0), Lsn(0x10), "a"), (Key::user(1, 1), Lsn(0x20), "b")],
        )
        .await;

        let info = tline.layer_map_info().await;
        assert_eq!(info.in_memory_layers.len(), 0);
        assert_eq!(info.historic_layers.len(), 1);
        assert_eq!(tline.get_disk_consistent_lsn(), Lsn(0x20));
        assert_size_invariants(&tline).await;

        // the index lists the flushed layer
        let index = tline
            .remote_client
            .download_index_file(&tline.cancel)
            .await
            .unwrap();
        assert_eq!(index.layer_metadata.len(), 1);
        assert_eq!(index.metadata.disk_consistent_lsn, Lsn(0x20));
    }

    #[tokio::test]
    async fn evict_and_download_round_trip() {
        let harness = TenantHarness::create("evict_and_download_round_trip").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        put_and_flush(&tline, &[(Key::user(1, 0), Lsn(0x10), "a")]).await;
        put_and_flush(&tline, &[(Key::user(1, 1), Lsn(0x20), "b")]).await;

        let before = tline.layer_map_info().await;
        let resident_before = tline.resident_physical_size();
        assert!(resident_before > 0);
        let layer = tline.layers_snapshot().await.historic_layers()[0].clone();
        let contents_before = std::fs::read(layer.local_path()).unwrap();

        assert_eq!(tline.evict_layer(&layer.layer_name()).await.unwrap(), Some(true));
        assert_eq!(tline.evict_layer(&layer.layer_name()).await.unwrap(), Some(false));
        assert!(!layer.local_path().exists());
        assert_size_invariants(&tline).await;

        assert_eq!(tline.download_layer(&layer.layer_name()).await.unwrap(), Some(true));
        assert_eq!(std::fs::read(layer.local_path()).unwrap(), contents_before);
        assert_eq!(tline.layer_map_info().await, before);
        assert_eq!(tline.resident_physical_size(), resident_before);

        assert_eq!(tline.evict_all_layers().await.unwrap(), 2);
        assert_eq!(tline.resident_physical_size(), 0);
        for l in tline.layers_snapshot().await.historic_layers() {
            assert!(!l.local_path().exists());
        }
        assert_size_invariants(&tline).await;

        // reads download on demand
        assert_eq!(tline.get(Key::user(1, 1), Lsn(0x20)).await.unwrap(), test_img("b"));
        assert!(tline.resident_physical_size() > 0);
        assert_size_invariants(&tline).await;
    }

    #[tokio::test]
    async fn pinned_layer_eviction_is_busy() {
        let harness = TenantHarness::create("pinned_layer_eviction_is_busy").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        tenant.update_conf(|c| c.eviction_timeout = Some(Duration::from_millis(10)));
        put_and_flush(&tline, &[(Key::user(1, 0), Lsn(0x10), "a")]).await;

        let layer = tline.layers_snapshot().await.historic_layers()[0].clone();
        let pinned = layer.keep_resident().unwrap();
        assert!(matches!(
            tline.evict_layer(&layer.layer_name()).await,
            Err(EvictionError::Pinned)
        ));
        drop(pinned);
        assert_eq!(tline.evict_layer(&layer.layer_name()).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn bulk_download_after_evicting_all() {
        let harness = TenantHarness::create("bulk_download_after_evicting_all").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        for i in 0..5u32 {
            let lsn = Lsn(0x10 + 0x10 * i as u64);
            put_and_flush(&tline, &[(Key::user(1, i), lsn, "value")]).await;
        }
        let resident_before = tline.resident_physical_size();
        assert_eq!(tline.evict_all_layers().await.unwrap(), 5);

        let request = DownloadRemoteLayersTaskSpawnRequest {
            max_concurrent_downloads: NonZeroUsize::new(10).unwrap(),
            errors_ok: false,
            at_least_one_download: true,
        };
        let info = tline.download_all_remote_layers(request.clone()).await.unwrap();
        assert_eq!(info.state, DownloadRemoteLayersTaskState::Completed);
        assert_eq!(info.total_layer_count, 5);
        assert_eq!(info.successful_download_count, info.total_layer_count);
        assert_eq!(info.failed_download_count, 0);
        assert_eq!(tline.resident_physical_size(), resident_before);
        assert_eq!(tline.get_download_all_remote_layers_task_info(), Some(info));

        assert!(matches!(
            tline.download_all_remote_layers(request).await,
            Err(DownloadRemoteLayersError::NothingToDownload)
        ));
    }

    #[tokio::test]
    async fn bulk_download_counts_failures() {
        let harness = TenantHarness::create("bulk_download_counts_failures").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        for i in 0..4u32 {
            let lsn = Lsn(0x10 + 0x10 * i as u64);
            put_and_flush(&tline, &[(Key::user(1, i), lsn, "value")]).await;
        }
        assert_eq!(tline.evict_all_layers().await.unwrap(), 4);

        // two layers are gone from the remote storage
        let lost = tline
            .layers_snapshot()
            .await
            .historic_layers()
            .iter()
            .take(2)
            .map(|l| l.layer_name())
            .collect_vec();
        tline
            .remote_client
            .delete_layer_files(&lost, &tline.cancel)
            .await
            .unwrap();

        let request = DownloadRemoteLayersTaskSpawnRequest {
            max_concurrent_downloads: NonZeroUsize::new(1).unwrap(),
            errors_ok: true,
            at_least_one_download: true,
        };
        let info = tline.download_all_remote_layers(request.clone()).await.unwrap();
        assert_eq!(info.state, DownloadRemoteLayersTaskState::Completed);
        assert_eq!(info.total_layer_count, 4);
        assert_eq!(info.successful_download_count, 2);
        assert_eq!(info.failed_download_count, 2);
        assert_size_invariants(&tline).await;

        // without errors_ok the first failure stops the job
        let request = DownloadRemoteLayersTaskSpawnRequest {
            errors_ok: false,
            ..request
        };
        let info = match tline.download_all_remote_layers(request).await {
            Err(DownloadRemoteLayersError::PartialFailure(info)) => info,
            other => panic!("expected a partial failure: {other:?}"),
        };
        assert_eq!(info.state, DownloadRemoteLayersTaskState::Completed);
        assert_eq!(info.total_layer_count, 2);
        assert_eq!(info.successful_download_count, 0);
        assert_eq!(info.failed_download_count, 2);
        assert_eq!(tline.get_download_all_remote_layers_task_info(), Some(info));
        for name in &lost {
            let layer = tline.find_layer(name).await.unwrap();
            assert!(!layer.is_likely_resident());
        }
        assert_size_invariants(&tline).await;
    }

    #[tokio::test]
    async fn corrupted_layer_fails_reads() {
        let harness = TenantHarness::create("corrupted_layer_fails_reads").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        put_and_flush(&tline, &[(Key::user(1, 0), Lsn(0x20), "a")]).await;

        let layer = tline.layers_snapshot().await.historic_layers().remove(0);
        let path = layer.local_path().to_owned();
        let mut content = std::fs::read(&path).unwrap();
        let middle = content.len() / 2;
        content[middle] ^= 0xFF;
        std::fs::write(&path, &content).unwrap();
        let info_before = tline.timeline_info().await;

        let err = tline.get(Key::user(1, 0), Lsn(0x20)).await.unwrap_err();
        assert!(
            matches!(err, PageReconstructError::LayerFile(LayerFileError::Corrupted(_))),
            "{err:?}"
        );
        assert_eq!(ApiError::from(err).kind(), "InternalServerError");

        // nothing was changed or removed because of the failed read
        assert_eq!(tline.timeline_info().await, info_before);
        assert_eq!(tline.layers_snapshot().await.historic_layers().len(), 1);
        assert!(layer.is_likely_resident());
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert_size_invariants(&tline).await;

        // the remote copy is intact
        layer.evict_and_wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            tline.get(Key::user(1, 0), Lsn(0x20)).await.unwrap(),
            test_img("a")
        );
    }

    #[tokio::test]
    async fn gc_removes_only_superseded_layers() {
        let harness = TenantHarness::create("gc_removes_only_superseded_layers").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        let key = Key::user(1, 0);
        put_and_flush(&tline, &[(key, Lsn(0x10), "v1")]).await;
        put_and_flush(&tline, &[(key, Lsn(0x20), "v2")]).await;
        put_and_flush(&tline, &[(key, Lsn(0x30), "v3")]).await;

        // nothing is covered by an image yet
        let res = tline.gc_timeline(0, Duration::ZERO, Vec::new()).await.unwrap();
        assert_eq!(res.layers_removed, 0);
        assert_eq!(res.layers_not_updated, 2);
        assert_eq!(res.layers_needed_by_cutoff, 1);

        tenant.update_conf(|c| c.image_creation_threshold = Some(1));
        tline.compact(&CancellationToken::new()).await.unwrap();
        let before = tline
            .layers_snapshot()
            .await
            .historic_layers()
            .iter()
            .map(|l| l.layer_name())
            .collect_vec();

        // the newest delta ends above the cutoff
        let res = tline.gc_timeline(0, Duration::ZERO, Vec::new()).await.unwrap();
        assert_eq!(res.layers_removed, 2);
        assert_eq!(res.layers_needed_by_cutoff, 2);
        let after = tline
            .layers_snapshot()
            .await
            .historic_layers()
            .iter()
            .map(|l| l.layer_name())
            .collect_vec();
        assert!(after.iter().all(|l| before.contains(l)));
        assert!(after.len() < before.len());
        assert_eq!(tline.get(key, Lsn(0x30)).await.unwrap(), test_img("v3"));
        assert_eq!(tline.get_latest_gc_cutoff_lsn(), Lsn(0x30));
        assert_size_invariants(&tline).await;

        let res = tline.gc_timeline(0, Duration::ZERO, Vec::new()).await.unwrap();
        assert_eq!(res.layers_removed, 0);
    }

    #[tokio::test]
    async fn gc_keeps_layers_needed_by_branches() {
        let harness = TenantHarness::create("gc_keeps_layers_needed_by_branches").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        let key = Key::user(1, 0);
        put_and_flush(&tline, &[(key, Lsn(0x10), "v1")]).await;
        put_and_flush(&tline, &[(key, Lsn(0x20), "v2")]).await;
        let child = tenant
            .branch_timeline_test(&tline, TimelineId::generate(), Lsn(0x20))
            .await
            .unwrap();
        put_and_flush(&tline, &[(key, Lsn(0x30), "v3")]).await;
        tenant.update_conf(|c| c.image_creation_threshold = Some(1));
        tline.compact(&CancellationToken::new()).await.unwrap();

        let res = tline
            .gc_timeline(0, Duration::ZERO, vec![Lsn(0x20)])
            .await
            .unwrap();
        // the branch reads both deltas below its branch point
        assert_eq!(res.layers_needed_by_branches, 2);
        assert_eq!(res.layers_removed, 0);
        assert_eq!(child.get(key, Lsn(0x20)).await.unwrap(), test_img("v2"));
        assert_eq!(tline.get(key, Lsn(0x30)).await.unwrap(), test_img("v3"));
    }
}

//! Timeline repository implementation that keeps old data in layer files, and
//! the recent changes in memory.
//!
//! See tenant/storage_layer/*.rs files. The functions here are responsible for
//! the set of timelines of a tenant: creating, branching, deleting and loading
//! them, and running the maintenance which spans timelines (gc, compaction).
//!
//! The files are stored in the `tenants/<tenant_id>/timelines/<timeline_id>`
//! directory of the workdir. The remote storage holds the same layer files plus an
//! `index_part.json` per timeline, which is the only persistent record of the
//! timeline metadata: the local directories are a cache of the remote state.
//!

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use futures::stream::{FuturesUnordered, StreamExt};
use pageserver_api::models::detach_ancestor::AncestorDetached;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::*;
use utils::id::{TenantId, TimelineId};
use utils::lsn::Lsn;

use crate::config::PageServerConf;
use crate::tenant::config::{TenantConf, TenantConfOpt};
use crate::tenant::gc_result::GcResult;
use crate::tenant::metadata::TimelineMetadata;
use crate::tenant::remote_timeline_client::index::{IndexPart, Lineage, OngoingDetach};
use crate::tenant::remote_timeline_client::{download_index_part, list_remote_timelines};
use crate::tenant::timeline::detach_ancestor;
use crate::tenant::timeline::{CompactionError, GcError};

pub mod blob_io;
pub mod config;
pub mod gc_result;
pub(crate) mod layer_map;
pub mod metadata;
pub mod remote_timeline_client;
pub mod storage_layer;
pub mod tasks;
pub mod timeline;

pub use timeline::{Timeline, TimelineResources};

#[derive(thiserror::Error, Debug)]
pub enum CreateTimelineError {
    #[error("timeline already exists")]
    Conflict,
    #[error(transparent)]
    AncestorLsn(anyhow::Error),
    #[error("tenant shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DeleteTimelineError {
    #[error("NotFound")]
    NotFound,

    #[error("HasChildren")]
    HasChildren(Vec<TimelineId>),

    #[error("tenant shutting down")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum GetTimelineError {
    #[error("Timeline {tenant_id}/{timeline_id} was not found")]
    NotFound {
        tenant_id: TenantId,
        timeline_id: TimelineId,
    },
}

/// The timelines of a tenant, keyed by id.
///
/// Timelines refer to their ancestor by id only and resolve it through the arena, so
/// removing or reparenting a timeline never leaves a dangling reference behind.
#[derive(Default)]
pub(crate) struct TimelineArena {
    timelines: Mutex<HashMap<TimelineId, Arc<Timeline>>>,
}

impl TimelineArena {
    pub(crate) fn get(&self, timeline_id: &TimelineId) -> Option<Arc<Timeline>> {
        self.timelines.lock().unwrap().get(timeline_id).cloned()
    }

    fn insert(&self, timeline: Arc<Timeline>) {
        let timeline_id = timeline.timeline_id;
        let prev = self.timelines.lock().unwrap().insert(timeline_id, timeline);
        assert!(prev.is_none(), "timeline {timeline_id} was inserted twice");
    }

    fn remove(&self, timeline_id: &TimelineId) -> Option<Arc<Timeline>> {
        self.timelines.lock().unwrap().remove(timeline_id)
    }

    /// All timelines, ordered by id.
    pub(crate) fn all(&self) -> Vec<Arc<Timeline>> {
        let mut timelines: Vec<_> = self.timelines.lock().unwrap().values().cloned().collect();
        timelines.sort_by_key(|tl| tl.timeline_id);
        timelines
    }

    /// Timelines with the given timeline as their ancestor.
    pub(crate) fn children_of(&self, timeline_id: &TimelineId) -> Vec<TimelineId> {
        let mut children: Vec<_> = self
            .timelines
            .lock()
            .unwrap()
            .values()
            .filter(|tl| tl.get_ancestor_timeline_id().as_ref() == Some(timeline_id))
            .map(|tl| tl.timeline_id)
            .collect();
        children.sort();
        children
    }
}

///
/// Tenant consists of multiple timelines. Keep them in a hash table.
///
pub struct Tenant {
    conf: &'static PageServerConf,
    pub tenant_id: TenantId,

    tenant_conf: Arc<RwLock<TenantConfOpt>>,

    pub(crate) timelines: Arc<TimelineArena>,

    resources: TimelineResources,

    // This mutex prevents creation of new timelines and ancestor detaches during GC.
    // Adding yet another mutex (in addition to `timelines`) is needed because holding
    // `timelines` mutex during all GC iteration
    // may block for a long time `get_timeline`, `get_timelines_state`,... and other operations
    // with timelines, which in turn may cause dropping replication connection, expiration of wait_for_lsn
    // timeout...
    gc_cs: tokio::sync::Mutex<()>,

    /// At most one ancestor detach runs in a tenant at a time.
    pub(crate) ongoing_timeline_detach: detach_ancestor::SharedState,

    /// The compaction and gc loops.
    pub(crate) background_tasks: TaskTracker,

    /// Cancelled on shutdown. The timelines use child tokens of it.
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

impl Tenant {
    fn new(
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        tenant_conf: TenantConfOpt,
        resources: TimelineResources,
    ) -> Tenant {
        Tenant {
            conf,
            tenant_id,
            tenant_conf: Arc::new(RwLock::new(tenant_conf)),
            timelines: Arc::new(TimelineArena::default()),
            resources,
            gc_cs: tokio::sync::Mutex::new(()),
            ongoing_timeline_detach: Default::default(),
            background_tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Loads the tenant from the remote storage.
    ///
    /// Every timeline with an index in the remote storage is loaded, ancestors before
    /// their children. Local layer files which match the index are kept as resident,
    /// the others are left in the remote storage until they are needed. Local
    /// timeline directories unknown to the remote storage are removed.
    #[instrument(skip_all, fields(%tenant_id))]
    pub async fn attach(
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        tenant_conf: TenantConfOpt,
        resources: TimelineResources,
    ) -> anyhow::Result<Arc<Tenant>> {
        let tenant = Arc::new(Tenant::new(conf, tenant_id, tenant_conf, resources));
        let started_at = Instant::now();

        let remote_timeline_ids = list_remote_timelines(
            &tenant.resources.remote_storage,
            tenant_id,
            &tenant.cancel,
        )
        .await
        .context("list remote timelines")?;
        info!("found {} timelines", remote_timeline_ids.len());

        let mut index_parts = HashMap::with_capacity(remote_timeline_ids.len());
        let mut downloads = remote_timeline_ids
            .iter()
            .map(|timeline_id| {
                let tenant = &tenant;
                async move {
                    let res = download_index_part(
                        &tenant.resources.remote_storage,
                        &tenant.tenant_id,
                        timeline_id,
                        &tenant.cancel,
                    )
                    .await;
                    (*timeline_id, res)
                }
            })
            .collect::<FuturesUnordered<_>>();
        while let Some((timeline_id, res)) = downloads.next().await {
            let index_part =
                res.with_context(|| format!("download index part of timeline {timeline_id}"))?;
            index_parts.insert(timeline_id, index_part);
        }
        drop(downloads);

        tenant
            .remove_unknown_local_timelines(&remote_timeline_ids)
            .await?;

        let sorted = tree_sort_timelines(index_parts, |index_part| {
            index_part.metadata.ancestor_timeline
        })?;
        for (timeline_id, index_part) in sorted {
            tenant
                .load_remote_timeline(timeline_id, index_part)
                .await
                .with_context(|| format!("load timeline {timeline_id}"))?;
        }

        info!(
            elapsed_ms = started_at.elapsed().as_millis(),
            "attached tenant"
        );
        Ok(tenant)
    }

    #[instrument(skip_all, fields(%timeline_id))]
    async fn load_remote_timeline(
        &self,
        timeline_id: TimelineId,
        index_part: IndexPart,
    ) -> anyhow::Result<()> {
        if let Some(ongoing) = &index_part.ongoing_detach {
            info!(
                ancestor_timeline_id = %ongoing.ancestor_timeline_id,
                prepared_layers = ongoing.prepared_layers.len(),
                "timeline has an unfinished ancestor detach"
            );
        }
        let timeline = self.create_timeline_struct(
            timeline_id,
            &index_part.metadata,
            index_part.lineage.clone(),
            index_part.ongoing_detach.clone(),
        );
        timeline.load_layer_map(&index_part).await?;
        self.timelines.insert(timeline);
        Ok(())
    }

    async fn remove_unknown_local_timelines(
        &self,
        remote_timeline_ids: &HashSet<TimelineId>,
    ) -> anyhow::Result<()> {
        let timelines_path = self.conf.timelines_path(&self.tenant_id);
        utils::crashsafe::create_dir_all(&timelines_path)
            .with_context(|| format!("create timelines directory {timelines_path}"))?;

        let mut entries = tokio::fs::read_dir(&timelines_path)
            .await
            .with_context(|| format!("read timelines directory {timelines_path}"))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!("skipping timelines directory entry with a non-utf8 name: {file_name:?}");
                continue;
            };
            let timeline_id = match file_name.parse::<TimelineId>() {
                Ok(timeline_id) => timeline_id,
                Err(_) => {
                    warn!("skipping unexpected entry {file_name} in the timelines directory");
                    continue;
                }
            };
            if remote_timeline_ids.contains(&timeline_id) {
                continue;
            }
            let timeline_path = self.conf.timeline_path(&self.tenant_id, &timeline_id);
            info!(%timeline_id, "removing local timeline which is not in the remote storage");
            tokio::fs::remove_dir_all(&timeline_path)
                .await
                .with_context(|| format!("remove timeline directory {timeline_path}"))?;
        }
        Ok(())
    }

    fn create_timeline_struct(
        &self,
        timeline_id: TimelineId,
        metadata: &TimelineMetadata,
        lineage: Lineage,
        ongoing_detach: Option<OngoingDetach>,
    ) -> Arc<Timeline> {
        Timeline::new(
            self.conf,
            Arc::clone(&self.tenant_conf),
            metadata,
            lineage,
            ongoing_detach,
            self.tenant_id,
            timeline_id,
            self.resources.clone(),
            Arc::downgrade(&self.timelines),
            self.cancel.child_token(),
        )
    }

    /// Get Timeline handle for given timeline ID.
    pub fn get_timeline(&self, timeline_id: TimelineId) -> Result<Arc<Timeline>, GetTimelineError> {
        self.timelines
            .get(&timeline_id)
            .ok_or(GetTimelineError::NotFound {
                tenant_id: self.tenant_id,
                timeline_id,
            })
    }

    /// Lists timelines the tenant contains.
    pub fn list_timelines(&self) -> Vec<Arc<Timeline>> {
        self.timelines.all()
    }

    /// Creates a root timeline without any layers, starting at `initdb_lsn`.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %new_timeline_id))]
    pub async fn create_empty_timeline(
        &self,
        new_timeline_id: TimelineId,
        initdb_lsn: Lsn,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        if self.cancel.is_cancelled() {
            return Err(CreateTimelineError::ShuttingDown);
        }
        let _gc_cs = self.gc_cs.lock().await;
        if self.timelines.get(&new_timeline_id).is_some() {
            return Err(CreateTimelineError::Conflict);
        }

        let metadata =
            TimelineMetadata::new(initdb_lsn, None, Lsn::INVALID, initdb_lsn, initdb_lsn);
        let timeline = self.create_timeline_files(new_timeline_id, &metadata).await?;
        info!(%initdb_lsn, "created timeline");
        Ok(timeline)
    }

    /// Branch an existing timeline.
    ///
    /// The branch point defaults to the last record LSN of the source. It must not be
    /// below the latest gc cutoff of the source, because the history there may be gone.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, src_timeline_id = %src_timeline.timeline_id, dst_timeline_id = %dst_id))]
    pub async fn branch_timeline(
        &self,
        src_timeline: &Arc<Timeline>,
        dst_id: TimelineId,
        start_lsn: Option<Lsn>,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        if self.cancel.is_cancelled() {
            return Err(CreateTimelineError::ShuttingDown);
        }
        let src_id = src_timeline.timeline_id;

        // We will validate our ancestor LSN in this function. Acquire the GC lock so
        // that GC cannot advance the GC cutoff until we are finished.
        let _gc_cs = self.gc_cs.lock().await;

        if self.timelines.get(&dst_id).is_some() {
            return Err(CreateTimelineError::Conflict);
        }
        if self.timelines.get(&src_id).is_none() {
            return Err(CreateTimelineError::Other(anyhow!(
                "source timeline {src_id} is not a timeline of this tenant"
            )));
        }

        // If no start LSN is specified, we branch the new timeline from the source timeline's last record LSN
        let start_lsn = start_lsn.unwrap_or_else(|| src_timeline.get_last_record_lsn());

        // Ensure that `start_lsn` is valid, i.e. the LSN is within the PITR
        // horizon on the source timeline
        let latest_gc_cutoff_lsn = src_timeline.get_latest_gc_cutoff_lsn();
        if start_lsn < latest_gc_cutoff_lsn {
            return Err(CreateTimelineError::AncestorLsn(anyhow!(
                "invalid branch start lsn: less than latest GC cutoff {latest_gc_cutoff_lsn}"
            )));
        }
        let last_record_lsn = src_timeline.get_last_record_lsn();
        if start_lsn > last_record_lsn {
            return Err(CreateTimelineError::AncestorLsn(anyhow!(
                "invalid branch start lsn {start_lsn}: ahead of the last record LSN {last_record_lsn} of the source"
            )));
        }

        // Create the metadata file, noting the ancestor of the new timeline.
        // There is initially no data in it, but all the read-calls know to look
        // into the ancestor.
        let metadata = TimelineMetadata::new(
            start_lsn,
            Some(src_id),
            start_lsn,
            start_lsn,
            src_timeline.get_initdb_lsn(),
        );
        let timeline = self.create_timeline_files(dst_id, &metadata).await?;
        info!(%start_lsn, "branched timeline");
        Ok(timeline)
    }

    /// Creates the local directory and the remote index of a new timeline, then makes
    /// it visible in the tenant.
    async fn create_timeline_files(
        &self,
        timeline_id: TimelineId,
        metadata: &TimelineMetadata,
    ) -> anyhow::Result<Arc<Timeline>> {
        let timeline_path = self.conf.timeline_path(&self.tenant_id, &timeline_id);
        utils::crashsafe::create_dir_all(&timeline_path)
            .with_context(|| format!("create timeline directory {timeline_path}"))?;

        let timeline = self.create_timeline_struct(timeline_id, metadata, Lineage::default(), None);
        timeline.init_empty_layer_map().await;

        if let Err(e) = timeline.upload_index().await {
            timeline.shutdown().await;
            if let Err(e) = tokio::fs::remove_dir_all(&timeline_path).await {
                warn!("failed to remove the directory of the timeline which failed to create: {e}");
            }
            return Err(e.context("upload the initial index"));
        }

        self.timelines.insert(Arc::clone(&timeline));
        Ok(timeline)
    }

    /// Removes a timeline from the remote storage and locally.
    ///
    /// Refused while other timelines have the timeline as their ancestor. A deletion
    /// which fails halfway leaves the timeline shut down; retrying completes it.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, %timeline_id))]
    pub async fn delete_timeline(
        &self,
        timeline_id: TimelineId,
    ) -> Result<(), DeleteTimelineError> {
        let _gc_cs = self.gc_cs.lock().await;

        let timeline = self
            .timelines
            .get(&timeline_id)
            .ok_or(DeleteTimelineError::NotFound)?;

        let children = self.timelines.children_of(&timeline_id);
        if !children.is_empty() {
            return Err(DeleteTimelineError::HasChildren(children));
        }

        timeline.shutdown().await;

        if let Err(e) = timeline.remote_client.delete_all(&self.cancel).await {
            if self.cancel.is_cancelled() {
                return Err(DeleteTimelineError::Cancelled);
            }
            return Err(DeleteTimelineError::Other(e.context("delete remote files")));
        }

        timeline.delete_local_layers().await;
        let timeline_path = self.conf.timeline_path(&self.tenant_id, &timeline_id);
        match tokio::fs::remove_dir_all(&timeline_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DeleteTimelineError::Other(
                    anyhow::Error::new(e).context(format!("remove {timeline_path}")),
                ))
            }
        }

        self.timelines.remove(&timeline_id);
        info!("timeline deleted");
        Ok(())
    }

    /// Perform one garbage collection iteration, removing old data files from disk.
    /// This function is periodically called by gc task.
    /// Also it can be explicitly requested through the management api.
    ///
    /// `horizon` specifies delta from last LSN to preserve all object versions (pitr interval).
    /// `target_timeline_id` specifies the timeline to GC, or None for all.
    ///
    /// The `pitr` duration is used to calculate a 'pitr_cutoff', which can be used to determine
    /// the cutoff from a wall-clock time, rather than an LSN. This is also known as the retention
    /// period. The GC cutoff is the later of the two.
    pub(crate) async fn gc_iteration(
        &self,
        target_timeline_id: Option<TimelineId>,
        horizon: u64,
        pitr: Duration,
        cancel: &CancellationToken,
    ) -> Result<GcResult, GcError> {
        let mut totals: GcResult = Default::default();
        let now = Instant::now();

        // Branch creation waits, so that no branch point appears below a cutoff which
        // is being computed.
        let _gc_cs = self.gc_cs.lock().await;

        let all_timelines = self.timelines.all();

        // Scan all timelines. For each timeline, remember the branch points
        // of its children: page versions at those LSNs must be kept.
        let mut all_branchpoints: HashMap<TimelineId, Vec<Lsn>> = HashMap::new();
        for timeline in &all_timelines {
            if let Some((ancestor_id, ancestor_lsn)) = timeline.get_ancestor() {
                all_branchpoints
                    .entry(ancestor_id)
                    .or_default()
                    .push(ancestor_lsn);
            }
        }

        let gc_timelines = all_timelines
            .into_iter()
            .filter(|tl| match target_timeline_id {
                Some(target) => tl.timeline_id == target,
                None => true,
            })
            .collect::<Vec<_>>();

        // If there is nothing to GC, we don't want any messages in the INFO log.
        if !gc_timelines.is_empty() {
            info!("{} timelines need GC", gc_timelines.len());
        } else {
            debug!("{} timelines need GC", gc_timelines.len());
        }

        for timeline in gc_timelines {
            if cancel.is_cancelled() {
                // We were requested to shut down. Stop and return with the progress we
                // made.
                break;
            }
            let mut retain_lsns = all_branchpoints
                .remove(&timeline.timeline_id)
                .unwrap_or_default();
            retain_lsns.sort();

            let result = match timeline.gc_timeline(horizon, pitr, retain_lsns).await {
                Err(GcError::TimelineCancelled) => {
                    if target_timeline_id.is_some() {
                        // If we were targetting this specific timeline, surface cancellation to caller
                        return Err(GcError::TimelineCancelled);
                    } else {
                        // A timeline may be shutting down independently of the tenant's lifecycle: we should
                        // skip past this and proceed to try GC on other timelines.
                        continue;
                    }
                }
                r => r?,
            };
            totals += result;
        }

        totals.elapsed = now.elapsed();
        Ok(totals)
    }

    /// Runs one compaction pass over every timeline.
    pub(crate) async fn compaction_iteration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CompactionError> {
        for timeline in self.timelines.all() {
            if cancel.is_cancelled() {
                return Err(CompactionError::ShuttingDown);
            }
            match timeline.compact(cancel).await {
                Ok(()) => {}
                // a timeline being deleted, the others go on
                Err(CompactionError::ShuttingDown) if !cancel.is_cancelled() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Detaches the timeline from its ancestor, see [`detach_ancestor`].
    pub(crate) async fn detach_ancestor(
        &self,
        timeline_id: TimelineId,
        options: detach_ancestor::Options,
    ) -> Result<AncestorDetached, detach_ancestor::Error> {
        let timeline = self
            .get_timeline(timeline_id)
            .map_err(|e| detach_ancestor::Error::Unexpected(e.into()))?;
        detach_ancestor::detach_and_reparent(&timeline, self, options).await
    }

    /// Shuts down the background loops and all timelines.
    ///
    /// Data which was not flushed is lost, it is still in the WAL of the producer.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id))]
    pub async fn shutdown(&self) {
        info!("shutting down tenant");
        self.cancel.cancel();

        self.background_tasks.close();
        self.background_tasks.wait().await;

        let timelines = self.timelines.all();
        futures::future::join_all(timelines.iter().map(|tl| tl.shutdown())).await;
        info!("tenant shut down");
    }

    pub fn update_conf(&self, f: impl FnOnce(&mut TenantConfOpt)) {
        f(&mut self.tenant_conf.write().unwrap());
    }

    fn effective_conf(&self) -> TenantConf {
        self.tenant_conf
            .read()
            .unwrap()
            .merge(self.conf.default_tenant_conf)
    }

    pub fn get_gc_horizon(&self) -> u64 {
        self.effective_conf().gc_horizon
    }

    pub fn get_pitr_interval(&self) -> Duration {
        self.effective_conf().pitr_interval
    }

    pub fn get_gc_period(&self) -> Duration {
        self.effective_conf().gc_period
    }

    pub fn get_compaction_period(&self) -> Duration {
        self.effective_conf().compaction_period
    }

    #[cfg(test)]
    pub(crate) async fn create_test_timeline(
        &self,
        new_timeline_id: TimelineId,
        initdb_lsn: Lsn,
    ) -> anyhow::Result<Arc<Timeline>> {
        Ok(self
            .create_empty_timeline(new_timeline_id, initdb_lsn)
            .await?)
    }

    #[cfg(test)]
    pub(crate) async fn branch_timeline_test(
        &self,
        src_timeline: &Arc<Timeline>,
        dst_id: TimelineId,
        ancestor_lsn: Lsn,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        self.branch_timeline(src_timeline, dst_id, Some(ancestor_lsn))
            .await
    }
}

/// Given a Vec of timelines and their ancestors (timeline_id, ancestor_id),
/// perform a topological sort, so that the parent of each timeline comes
/// before the children.
/// E extracts the ancestor from T
/// This allows for T to be different. It can be TimelineMetadata, can be Timeline itself, etc.
fn tree_sort_timelines<T, E>(
    timelines: HashMap<TimelineId, T>,
    extractor: E,
) -> anyhow::Result<Vec<(TimelineId, T)>>
where
    E: Fn(&T) -> Option<TimelineId>,
{
    let mut result = Vec::with_capacity(timelines.len());

    let mut now = Vec::with_capacity(timelines.len());
    // (ancestor, children)
    let mut later: HashMap<TimelineId, Vec<(TimelineId, T)>> =
        HashMap::with_capacity(timelines.len());

    for (timeline_id, value) in timelines {
        if let Some(ancestor_id) = extractor(&value) {
            let children = later.entry(ancestor_id).or_default();
            children.push((timeline_id, value));
        } else {
            now.push((timeline_id, value));
        }
    }

    while let Some((timeline_id, metadata)) = now.pop() {
        result.push((timeline_id, metadata));
        // All children of this can be loaded now
        if let Some(mut children) = later.remove(&timeline_id) {
            now.append(&mut children);
        }
    }

    // All timelines should be visited now. Unless there were timelines with missing ancestors.
    if !later.is_empty() {
        for (missing_id, orphan_ids) in later {
            for (orphan_id, _) in orphan_ids {
                error!(
                    "could not load timeline {orphan_id} because its ancestor timeline {missing_id} could not be loaded"
                );
            }
        }
        bail!("could not load tenant because some timelines are missing ancestors");
    }

    Ok(result)
}


#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::Bytes;
    use hex_literal::hex;
    use pageserver_api::key::Key;
    use pageserver_api::value::Value;

    use super::harness::*;
    use super::*;
    use crate::failpoint_support::{FailpointAction, FailpointKind};

    const CHILD_ID: TimelineId = TimelineId::from_array(hex!("AA223344556677881122334455667788"));

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

    #[test]
    fn tree_sort_puts_ancestors_first() {
        let root = TimelineId::generate();
        let child = TimelineId::generate();
        let grandchild = TimelineId::generate();
        let timelines = HashMap::from([
            (grandchild, Some(child)),
            (root, None),
            (child, Some(root)),
        ]);

        let sorted = tree_sort_timelines(timelines, |ancestor| *ancestor).unwrap();
        let order: Vec<_> = sorted.into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![root, child, grandchild]);

        let orphan = HashMap::from([(child, Some(root))]);
        assert!(tree_sort_timelines(orphan, |ancestor| *ancestor).is_err());
    }

    #[tokio::test]
    async fn branch_point_is_validated() {
        let harness = TenantHarness::create("branch_point_is_validated").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        put_and_flush(&tline, &[(Key::user(1, 0), Lsn(0x20), "a")]).await;

        // below the gc cutoff, which starts at the initdb LSN
        let err = tenant
            .branch_timeline_test(&tline, CHILD_ID, Lsn(0x08))
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("less than latest GC cutoff"),
            "unexpected error: {err}"
        );

        // ahead of the last record
        assert!(matches!(
            tenant.branch_timeline_test(&tline, CHILD_ID, Lsn(0x30)).await,
            Err(CreateTimelineError::AncestorLsn(_))
        ));

        assert!(matches!(
            tenant.create_empty_timeline(TIMELINE_ID, Lsn(0x10)).await,
            Err(CreateTimelineError::Conflict)
        ));

        // the default branch point is the last record
        let child = tenant
            .branch_timeline(&tline, CHILD_ID, None)
            .await
            .unwrap();
        assert_eq!(child.get_ancestor(), Some((TIMELINE_ID, Lsn(0x20))));
        assert!(matches!(
            tenant.branch_timeline_test(&tline, CHILD_ID, Lsn(0x20)).await,
            Err(CreateTimelineError::Conflict)
        ));
    }

    #[tokio::test]
    async fn delete_refuses_timelines_with_children() {
        let harness = TenantHarness::create("delete_refuses_timelines_with_children").unwrap();
        let tenant = harness.load().await;
        let tline = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        put_and_flush(&tline, &[(Key::user(1, 0), Lsn(0x20), "a")]).await;
        let child = tenant
            .branch_timeline_test(&tline, CHILD_ID, Lsn(0x20))
            .await
            .unwrap();
        put_and_flush(&child, &[(Key::user(1, 0), Lsn(0x30), "b")]).await;

        match tenant.delete_timeline(TIMELINE_ID).await {
            Err(DeleteTimelineError::HasChildren(children)) => assert_eq!(children, vec![CHILD_ID]),
            other => panic!("unexpected result: {other:?}"),
        }
        // the refused deletion did not touch the ancestor
        assert_eq!(tline.get(Key::user(1, 0), Lsn(0x20)).await.unwrap(), test_img("a"));

        tenant.delete_timeline(CHILD_ID).await.unwrap();
        assert!(tenant.get_timeline(CHILD_ID).is_err());
        assert!(!harness.timeline_path(&CHILD_ID).exists());
        assert!(!harness
            .remote_timeline_path(&CHILD_ID)
            .join(IndexPart::FILE_NAME)
            .exists());
        assert!(matches!(
            tenant.delete_timeline(CHILD_ID).await,
            Err(DeleteTimelineError::NotFound)
        ));

        tenant.delete_timeline(TIMELINE_ID).await.unwrap();
        assert!(tenant.list_timelines().is_empty());

        // nothing comes back after a restart
        tenant.shutdown().await;
        let tenant = harness.load().await;
        assert!(tenant.list_timelines().is_empty());
    }

    #[tokio::test]
    async fn attach_restores_timelines_from_remote() {
        let harness = TenantHarness::create("attach_restores_timelines_from_remote").unwrap();
        let key = Key::user(1, 0);
        {
            let tenant = harness.load().await;
            let tline = tenant
                .create_test_timeline(TIMELINE_ID, Lsn(0x10))
                .await
                .unwrap();
            put_and_flush(&tline, &[(key, Lsn(0x10), "a"), (Key::user(1, 1), Lsn(0x20), "b")])
                .await;
            let child = tenant
                .branch_timeline_test(&tline, CHILD_ID, Lsn(0x20))
                .await
                .unwrap();
            {
                let mut writer = child.writer().await;
                writer
                    .put(key, Lsn(0x30), &Value::WalRecord(Bytes::from_static(b" c")))
                    .await
                    .unwrap();
                writer.finish_write(Lsn(0x30));
            }
            child.freeze_and_flush().await.unwrap();
            tenant.shutdown().await;
        }

        // the local copy of the root is lost, the one of the child survives
        std::fs::remove_dir_all(harness.timeline_path(&TIMELINE_ID)).unwrap();
        let stray = TimelineId::generate();
        std::fs::create_dir_all(harness.timeline_path(&stray)).unwrap();

        let tenant = harness.load().await;
        assert!(!harness.timeline_path(&stray).exists());

        let root = tenant.get_timeline(TIMELINE_ID).unwrap();
        let child = tenant.get_timeline(CHILD_ID).unwrap();
        assert_eq!(child.get_ancestor(), Some((TIMELINE_ID, Lsn(0x20))));
        assert_eq!(child.get_disk_consistent_lsn(), Lsn(0x30));

        let info = root.timeline_info().await;
        assert_eq!(info.resident_physical_size, 0);
        assert_eq!(info.remote_physical_size, info.current_physical_size);
        let info = child.timeline_info().await;
        assert_eq!(info.remote_physical_size, 0);
        assert_eq!(info.resident_physical_size, info.current_physical_size);

        // reads download what they need
        assert_eq!(
            child.get(key, Lsn(0x30)).await.unwrap(),
            Bytes::from_static(b"a c")
        );
        assert_eq!(root.get(Key::user(1, 1), Lsn(0x20)).await.unwrap(), test_img("b"));
        let info = root.timeline_info().await;
        assert_eq!(info.remote_physical_size, 0);
        assert_eq!(info.resident_physical_size, info.current_physical_size);
    }

    #[tokio::test]
    async fn attach_retries_unreliable_remote() {
        let harness = TenantHarness::create("attach_retries_unreliable_remote").unwrap();
        {
            let tenant = harness.load().await;
            let tline = tenant
                .create_test_timeline(TIMELINE_ID, Lsn(0x10))
                .await
                .unwrap();
            put_and_flush(&tline, &[(Key::user(1, 0), Lsn(0x10), "a")]).await;
            tenant.shutdown().await;
        }

        assert!(TimelineResources::from_conf(harness.conf).is_err());

        let mut conf = harness.conf.clone();
        conf.remote_storage_config = Some(remote_storage::RemoteStorageConfig {
            storage: remote_storage::RemoteStorageKind::LocalFs {
                local_path: harness.remote_fs_dir.clone(),
            },
            timeout: remote_storage::DEFAULT_REMOTE_STORAGE_TIMEOUT,
        });
        conf.test_remote_failures = 1;
        let conf: &'static PageServerConf = Box::leak(Box::new(conf));

        let resources = TimelineResources::from_conf(conf).unwrap();
        let tenant = Tenant::attach(conf, harness.tenant_id, harness.tenant_conf, resources)
            .instrument(harness.span())
            .await
            .unwrap();
        let tline = tenant.get_timeline(TIMELINE_ID).unwrap();
        assert_eq!(tline.get_disk_consistent_lsn(), Lsn(0x10));
        assert_eq!(tline.get(Key::user(1, 0), Lsn(0x10)).await.unwrap(), test_img("a"));
    }

    #[tokio::test]
    async fn attach_continues_interrupted_detach() {
        let harness = TenantHarness::create("attach_continues_interrupted_detach").unwrap();
        let options = detach_ancestor::Options {
            batch_size: NonZeroUsize::new(1).unwrap(),
        };
        {
            let tenant = harness.load().await;
            let root = tenant
                .create_test_timeline(TIMELINE_ID, Lsn(0x10))
                .await
                .unwrap();
            put_and_flush(&root, &[(Key::user(1, 0), Lsn(0x10), "a")]).await;
            put_and_flush(
                &root,
                &[(Key::user(1, 1), Lsn(0x20), "b"), (Key::user(1, 0), Lsn(0x30), "c")],
            )
            .await;
            tenant
                .branch_timeline_test(&root, CHILD_ID, Lsn(0x20))
                .await
                .unwrap();

            harness
                .failpoints
                .arm(FailpointKind::DetachAfterBatch, FailpointAction::ReturnError);
            assert!(tenant.detach_ancestor(CHILD_ID, options).await.is_err());
            tenant.shutdown().await;
        }
        harness.failpoints.disarm_all();

        let tenant = harness.load().await;
        let child = tenant.get_timeline(CHILD_ID).unwrap();
        let ongoing = child.ongoing_detach().expect("detach progress was persisted");
        assert_eq!(ongoing.ancestor_timeline_id, TIMELINE_ID);
        assert_eq!(ongoing.prepared_layers.len(), 1);

        let res = tenant.detach_ancestor(CHILD_ID, options).await.unwrap();
        assert!(res.reparented_timelines.is_empty());
        assert_eq!(child.get_ancestor(), None);
        assert!(child.ongoing_detach().is_none());
        assert_eq!(child.get(Key::user(1, 0), Lsn(0x20)).await.unwrap(), test_img("a"));
        assert_eq!(child.get(Key::user(1, 1), Lsn(0x20)).await.unwrap(), test_img("b"));
    }

    #[tokio::test]
    async fn gc_iteration_sums_over_timelines() {
        let harness = TenantHarness::create("gc_iteration_sums_over_timelines").unwrap();
        let tenant = harness.load().await;
        let root = tenant
            .create_test_timeline(TIMELINE_ID, Lsn(0x10))
            .await
            .unwrap();
        put_and_flush(&root, &[(Key::user(1, 0), Lsn(0x10), "a")]).await;
        let child = tenant
            .branch_timeline_test(&root, CHILD_ID, Lsn(0x10))
            .await
            .unwrap();
        put_and_flush(&child, &[(Key::user(1, 0), Lsn(0x20), "b")]).await;

        let cancel = CancellationToken::new();
        let res = tenant
            .gc_iteration(None, 0, Duration::ZERO, &cancel)
            .await
            .unwrap();
        assert_eq!(res.layers_total, 2);
        assert_eq!(res.layers_removed, 0);

        let res = tenant
            .gc_iteration(Some(CHILD_ID), 0, Duration::ZERO, &cancel)
            .await
            .unwrap();
        assert_eq!(res.layers_total, 1);
    }
}

//! Detaching a timeline from its ancestor.
//!
//! The history of the ancestor up to the branch point is copied into the detached
//! timeline, which then no longer needs the ancestor to serve reads. Other children of
//! the ancestor which branched at or before the branch point are reparented to the
//! detached timeline.
//!
//! The detach is a saga: every step persists its progress in the [`OngoingDetach`] of
//! the detached timeline's index before the next step starts, so that a retry after a
//! failure or a restart resumes from the last finished step. Until the index without
//! the ancestor link has been uploaded, a failed detach leaves both timelines as they
//! were.

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use itertools::Itertools;
use pageserver_api::models::detach_ancestor::AncestorDetached;
use tokio::task::JoinSet;
use tracing::*;
use utils::id::TimelineId;
use utils::lsn::Lsn;

use super::layer_manager::LayerManager;
use super::{FlushLayerError, Timeline};
#[cfg(test)]
use crate::failpoint_support::FailpointKind;
use crate::metrics::StorageTimeOperation;
use crate::mgmt_api::ApiError;
use crate::tenant::remote_timeline_client::index::{LayerFileMetadata, OngoingDetach};
use crate::tenant::storage_layer::layer::{DownloadError, LayerKind};
use crate::tenant::storage_layer::{DeltaLayerName, DeltaLayerWriter, Layer, LayerName};
use crate::tenant::{Tenant, TimelineArena};

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("no ancestors")]
    NoAncestor,

    #[error("too many ancestors")]
    TooManyAncestors,

    #[error("another timeline has detach ancestor operation ongoing: {0}")]
    OtherTimelineDetachOngoing(TimelineId),

    #[error("shutting down, please retry later")]
    ShuttingDown,

    #[error("flushing the ancestor failed")]
    FlushAncestor(#[source] FlushLayerError),

    #[error("layer download failed")]
    RewrittenDeltaDownloadFailed(#[source] DownloadError),

    #[error("copying layer {0} failed")]
    CopyFailed(LayerName, #[source] anyhow::Error),

    #[error("preparing the layers failed")]
    Prepare(#[source] anyhow::Error),

    #[error("some reparentings failed, please retry")]
    Reparenting,

    #[error("unexpected error")]
    Unexpected(#[source] anyhow::Error),

    #[cfg(test)]
    #[error("failpoint: {0}")]
    Failpoint(FailpointKind),
}

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        match value {
            Error::NoAncestor => ApiError::Conflict(value.to_string()),
            Error::TooManyAncestors => ApiError::BadRequest(anyhow::Error::new(value)),
            Error::ShuttingDown => ApiError::ShuttingDown,
            Error::OtherTimelineDetachOngoing(_) | Error::Reparenting => {
                ApiError::ResourceUnavailable(value.to_string().into())
            }
            Error::FlushAncestor(FlushLayerError::Cancelled)
            | Error::RewrittenDeltaDownloadFailed(DownloadError::TimelineShutdown) => {
                ApiError::ShuttingDown
            }
            Error::FlushAncestor(_)
            | Error::RewrittenDeltaDownloadFailed(_)
            | Error::CopyFailed(..)
            | Error::Prepare(_)
            | Error::Unexpected(_) => ApiError::InternalServerError(anyhow::Error::new(value)),
            #[cfg(test)]
            Error::Failpoint(_) => ApiError::InternalServerError(anyhow::Error::new(value)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Options {
    /// How many layers are copied or rewritten before the progress is persisted.
    pub(crate) batch_size: NonZeroUsize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(100).unwrap(),
        }
    }
}

/// Allows one detach per tenant at a time.
#[derive(Default)]
pub(crate) struct SharedState {
    inner: std::sync::Mutex<Option<TimelineId>>,
}

impl SharedState {
    fn start_new_attempt(&self, detached: &Arc<Timeline>) -> Result<Attempt<'_>, Error> {
        if detached.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let gate_entered = detached.gate.enter().map_err(|_| Error::ShuttingDown)?;

        let mut guard = self.inner.lock().unwrap();
        if let Some(other) = *guard {
            return Err(Error::OtherTimelineDetachOngoing(other));
        }
        *guard = Some(detached.timeline_id);

        Ok(Attempt {
            state: self,
            _gate_entered: gate_entered,
        })
    }

    /// The timeline being detached, if any.
    pub(crate) fn ongoing(&self) -> Option<TimelineId> {
        *self.inner.lock().unwrap()
    }
}

/// Exclusive right of one detach to run, released on drop.
struct Attempt<'a> {
    state: &'a SharedState,
    _gate_entered: utils::sync::gate::GateGuard,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        *self.state.inner.lock().unwrap() = None;
    }
}

/// One layer of the ancestor which the detached timeline needs.
#[derive(Clone)]
enum Work {
    /// Wholly at or below the branch point, copied as is.
    Copy(Layer),
    /// A delta layer straddling the branch point, rewritten to its records at or
    /// below the branch point.
    Rewrite(Layer),
}

impl Work {
    fn target_name(&self, end_lsn: Lsn) -> LayerName {
        match self {
            Work::Copy(layer) => layer.layer_name(),
            Work::Rewrite(layer) => LayerName::Delta(DeltaLayerName {
                key_range: layer.layer_desc().key_range.clone(),
                lsn_range: layer.layer_desc().lsn_range.start..end_lsn,
            }),
        }
    }
}

/// Detaches the timeline from its ancestor, or continues a previous attempt, and
/// returns the reparented timelines.
#[instrument(skip_all, fields(tenant_id = %detached.tenant_id, timeline_id = %detached.timeline_id))]
pub(crate) async fn detach_and_reparent(
    detached: &Arc<Timeline>,
    tenant: &Tenant,
    options: Options,
) -> Result<AncestorDetached, Error> {
    use Error::*;

    let _attempt = tenant.ongoing_timeline_detach.start_new_attempt(detached)?;
    let timer = detached
        .metrics
        .start_timer(StorageTimeOperation::DetachAncestor);

    // gc of the tenant waits for the whole detach, the branch points it collects
    // would miss the timelines reparented meanwhile
    let _gc_cs = tenant.gc_cs.lock().await;

    // compaction and gc of both timelines wait until the detach is done
    let _compaction_guard = detached.compaction_lock.lock().await;
    let _gc_guard = detached.gc_lock.lock().await;

    let (ancestor_id, ancestor_lsn) = match detached.get_ancestor() {
        Some((ancestor_id, ancestor_lsn)) => {
            if let Some(ongoing) = detached.ongoing_detach() {
                let recorded = (ongoing.ancestor_timeline_id, ongoing.ancestor_lsn);
                if recorded != (ancestor_id, ancestor_lsn) {
                    return Err(Unexpected(anyhow!(
                        "ongoing detach from {}@{} does not match the ancestor {ancestor_id}@{ancestor_lsn}",
                        ongoing.ancestor_timeline_id,
                        ongoing.ancestor_lsn
                    )));
                }
            }
            if !ancestor_lsn.is_valid() {
                error!("ancestor is set, but ancestor_lsn is invalid, this timeline needs fixing");
                return Err(NoAncestor);
            }

            let ancestor = tenant
                .timelines
                .get(&ancestor_id)
                .ok_or_else(|| {
                    Unexpected(anyhow!("ancestor timeline {ancestor_id} is not loaded"))
                })?;
            if ancestor.get_ancestor().is_some() {
                // we could flatten N ancestors just as easily, but do not
                return Err(TooManyAncestors);
            }

            let _ancestor_compaction_guard = ancestor.compaction_lock.lock().await;
            let _ancestor_gc_guard = ancestor.gc_lock.lock().await;

            crate::failpoint!(detached.failpoints, DetachAfterLocking, Failpoint);

            prepare(detached, &ancestor, ancestor_lsn, options).await?;

            crate::failpoint!(detached.failpoints, DetachBeforeAttach, Failpoint);

            attach(detached, ancestor_id, ancestor_lsn).await?;
            (ancestor_id, ancestor_lsn)
        }
        None => match detached.ongoing_detach() {
            Some(ongoing) if ongoing.attached => {
                // the index without the ancestor might not have been uploaded
                detached.upload_index().await.map_err(Unexpected)?;
                info!(
                    ancestor_timeline_id = %ongoing.ancestor_timeline_id,
                    "continuing a detach with reparenting"
                );
                (ongoing.ancestor_timeline_id, ongoing.ancestor_lsn)
            }
            Some(ongoing) => {
                return Err(Unexpected(anyhow!(
                    "timeline has no ancestor but the detach from {} was not attached",
                    ongoing.ancestor_timeline_id
                )))
            }
            None => {
                return match detached.lineage().detach_reparented {
                    Some(reparented) => Ok(AncestorDetached {
                        reparented_timelines: reparented.into_iter().collect(),
                    }),
                    None => Err(NoAncestor),
                }
            }
        },
    };

    crate::failpoint!(detached.failpoints, DetachAfterAttach, Failpoint);

    reparent_siblings(detached, &tenant.timelines, ancestor_id, ancestor_lsn).await?;

    crate::failpoint!(detached.failpoints, DetachBeforeCompletion, Failpoint);

    let reparented = complete(detached).await?;
    timer.stop_and_record();
    info!(reparented = reparented.len(), "detach ancestor completed");

    Ok(AncestorDetached {
        reparented_timelines: reparented.into_iter().collect::<HashSet<_>>(),
    })
}

/// Copies or rewrites the history of the ancestor up to `ancestor_lsn` into the
/// detached timeline, without making it visible yet.
async fn prepare(
    detached: &Arc<Timeline>,
    ancestor: &Arc<Timeline>,
    ancestor_lsn: Lsn,
    options: Options,
) -> Result<(), Error> {
    use Error::*;

    if ancestor_lsn > ancestor.get_disk_consistent_lsn() {
        let span = info_span!("freeze_and_flush", ancestor_timeline_id = %ancestor.timeline_id);
        async {
            let started_at = std::time::Instant::now();
            ancestor.freeze_and_flush().await.map_err(FlushAncestor)?;
            info!(
                elapsed_ms = started_at.elapsed().as_millis(),
                "froze and flushed the ancestor"
            );
            Ok::<_, Error>(())
        }
        .instrument(span)
        .await?;
    }

    if detached.ongoing_detach().is_none() {
        detached.set_ongoing_detach(Some(OngoingDetach::new(
            ancestor.timeline_id,
            ancestor_lsn,
        )));
        detached.upload_index().await.map_err(Prepare)?;
    }

    let end_lsn = ancestor_lsn + 1;
    let work = {
        let layers = tokio::select! {
            layers = ancestor.layers_snapshot() => layers,
            _ = detached.cancel.cancelled() => return Err(ShuttingDown),
            _ = ancestor.cancel.cancelled() => return Err(ShuttingDown),
        };
        partition_work(ancestor_lsn, &layers)
    };

    drop_stale_prepared_layers(detached, &work, end_lsn).await?;

    let prepared = detached
        .ongoing_detach()
        .map(|ongoing| ongoing.prepared_layers)
        .unwrap_or_default();
    let remaining = work
        .into_iter()
        .filter(|w| !prepared.contains_key(&w.target_name(end_lsn)))
        .collect_vec();

    info!(
        already_prepared = prepared.len(),
        to_copy = remaining.iter().filter(|w| matches!(w, Work::Copy(_))).count(),
        to_rewrite = remaining.iter().filter(|w| matches!(w, Work::Rewrite(_))).count(),
        "collected layers"
    );

    let timeline_path = detached
        .conf
        .timeline_path(&detached.tenant_id, &detached.timeline_id);

    for (batch_no, batch) in remaining.chunks(options.batch_size.get()).enumerate() {
        let mut tasks = JoinSet::new();
        for work in batch {
            let work = work.clone();
            let detached = Arc::clone(detached);
            let ancestor_id = ancestor.timeline_id;
            tasks.spawn(
                async move {
                    match work {
                        Work::Copy(layer) => remote_copy(&layer, ancestor_id, &detached)
                            .await
                            .map(Some),
                        Work::Rewrite(layer) => copy_lsn_prefix(end_lsn, &layer, &detached).await,
                    }
                }
                .in_current_span(),
            );
        }

        let mut done = Vec::with_capacity(batch.len());
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Ok(Some(prepared))) => done.push(prepared),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => return Err(e),
                Err(je) => return Err(Unexpected(je.into())),
            }
        }

        // the files of the batch are durable before the index names them
        utils::crashsafe::fsync_async(&timeline_path)
            .await
            .with_context(|| format!("fsync timeline directory {timeline_path}"))
            .map_err(Prepare)?;

        let prepared_count = done.len();
        detached.update_ongoing_detach(|ongoing| {
            if let Some(ongoing) = ongoing {
                ongoing.prepared_layers.extend(done);
            }
        });
        detached.upload_index().await.map_err(Prepare)?;
        info!(batch = batch_no, prepared = prepared_count, "prepared a batch of layers");

        crate::failpoint!(detached.failpoints, DetachAfterBatch, Failpoint);
    }

    Ok(())
}

fn partition_work(ancestor_lsn: Lsn, source: &LayerManager) -> Vec<Work> {
    let mut work = Vec::new();

    for desc in source.layer_map().iter_historic_layers() {
        // start is inclusive, end is exclusive
        if desc.lsn_range.start > ancestor_lsn {
            continue;
        }

        let layer = source.get_from_desc(&desc);
        if desc.is_delta && desc.lsn_range.end > ancestor_lsn + 1 {
            work.push(Work::Rewrite(layer));
        } else {
            work.push(Work::Copy(layer));
        }
    }

    work
}

/// Forgets prepared layers which the current layers of the ancestor no longer map
/// to, which happens when the ancestor was compacted between attempts.
async fn drop_stale_prepared_layers(
    detached: &Arc<Timeline>,
    work: &[Work],
    end_lsn: Lsn,
) -> Result<(), Error> {
    let targets: HashSet<LayerName> = work.iter().map(|w| w.target_name(end_lsn)).collect();
    let stale = detached.update_ongoing_detach(|ongoing| {
        let Some(ongoing) = ongoing else {
            return Vec::new();
        };
        let stale = ongoing
            .prepared_layers
            .keys()
            .filter(|name| !targets.contains(name))
            .cloned()
            .collect_vec();
        for name in &stale {
            ongoing.prepared_layers.remove(name);
        }
        stale
    });
    if stale.is_empty() {
        return Ok(());
    }

    info!(stale = stale.len(), "dropping prepared layers the ancestor no longer has");
    detached.upload_index().await.map_err(Error::Prepare)?;
    for name in &stale {
        let path = detached
            .conf
            .layer_path(&detached.tenant_id, &detached.timeline_id, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Prepare(
                    anyhow::Error::new(e).context(format!("remove stale layer {path}")),
                ))
            }
        }
    }
    if let Err(e) = detached
        .remote_client
        .delete_layer_files(&stale, &detached.cancel)
        .await
    {
        warn!("failed to delete stale prepared layers: {e:#}");
    }
    Ok(())
}

/// Copies the layer in the remote storage, and shares the local file if the ancestor
/// has it.
async fn remote_copy(
    adopted: &Layer,
    ancestor_id: TimelineId,
    adoptee: &Arc<Timeline>,
) -> Result<(LayerName, LayerFileMetadata), Error> {
    let name = adopted.layer_name();
    if adoptee.cancel.is_cancelled() {
        return Err(Error::ShuttingDown);
    }

    adoptee
        .remote_client
        .copy_timeline_layer(&ancestor_id, &name, &adoptee.cancel)
        .await
        .map_err(|e| Error::CopyFailed(name.clone(), e))?;

    if let Some(resident) = adopted.keep_resident() {
        let target = adoptee
            .conf
            .layer_path(&adoptee.tenant_id, &adoptee.timeline_id, &name);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::CopyFailed(name, e.into())),
        }
        // without the link the layer is downloaded on demand
        if let Err(e) = tokio::fs::hard_link(resident.local_path(), &target).await {
            warn!(layer = %name, "failed to hardlink the ancestor's layer: {e}");
        }
    }

    debug!(layer = %name, "copied");
    Ok((name, adopted.metadata()))
}

/// Writes the records of `layer` below `end_lsn` into a new delta layer of the target
/// timeline and uploads it. Returns `None` if there are no such records.
async fn copy_lsn_prefix(
    end_lsn: Lsn,
    layer: &Layer,
    target_timeline: &Arc<Timeline>,
) -> Result<Option<(LayerName, LayerFileMetadata)>, Error> {
    use Error::{Prepare, RewrittenDeltaDownloadFailed, ShuttingDown, Unexpected};

    if target_timeline.cancel.is_cancelled() {
        return Err(ShuttingDown);
    }

    debug!(%layer, %end_lsn, "copying lsn prefix");

    let desc = layer.layer_desc();
    let mut writer = DeltaLayerWriter::new(
        target_timeline.conf,
        target_timeline.timeline_id,
        target_timeline.tenant_id,
        desc.key_range.start,
        desc.lsn_range.start..end_lsn,
    );

    {
        let resident = layer
            .download_and_keep_resident()
            .await
            .map_err(RewrittenDeltaDownloadFailed)?;
        let LayerKind::Delta(delta) = resident.load().await.map_err(|e| Prepare(e.into()))? else {
            return Err(Unexpected(anyhow!("layer {layer} is not a delta layer")));
        };
        for (key, lsn, value) in delta.records().iter().filter(|(_, lsn, _)| *lsn < end_lsn) {
            writer.put_value(*key, *lsn, value).map_err(Prepare)?;
        }
    }

    let records = writer.num_values();
    debug!(%layer, records, "copied records");
    if records == 0 {
        return Ok(None);
    }

    // reuse the key instead of adding more holes between layers by using the real
    // highest key in the layer.
    let copied = writer
        .finish(desc.key_range.end, target_timeline)
        .await
        .map_err(Prepare)?;
    target_timeline
        .remote_client
        .upload_layer_file(&copied, &target_timeline.cancel)
        .await
        .map_err(Prepare)?;

    debug!(%layer, %copied, "new layer produced");
    Ok(Some((copied.layer_desc().layer_name(), copied.metadata())))
}

/// Publishes the prepared layers and clears the ancestor. Past this, the detach can
/// only go forward.
async fn attach(
    detached: &Arc<Timeline>,
    ancestor_id: TimelineId,
    ancestor_lsn: Lsn,
) -> Result<(), Error> {
    let prepared = detached
        .ongoing_detach()
        .map(|ongoing| ongoing.prepared_layers)
        .ok_or_else(|| Error::Unexpected(anyhow!("no detach progress to attach")))?;

    let mut layers = Vec::with_capacity(prepared.len());
    for (name, metadata) in prepared {
        let path = detached
            .conf
            .layer_path(&detached.tenant_id, &detached.timeline_id, &name);
        let local_size = match tokio::fs::metadata(&path).await {
            Ok(m) => Some(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::Unexpected(
                    anyhow::Error::new(e).context(format!("stat {path}")),
                ))
            }
        };
        let layer = match local_size {
            Some(size) if size == metadata.file_size => {
                Layer::for_resident(detached.conf, detached, name, metadata).drop_eviction_guard()
            }
            Some(_) => {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("remove mismatching layer file {path}"))
                    .map_err(Error::Unexpected)?;
                Layer::for_evicted(detached.conf, detached, name, metadata)
            }
            None => Layer::for_evicted(detached.conf, detached, name, metadata),
        };
        layers.push(layer);
    }

    {
        // readers resolve the ancestor before taking the layers, so they either see
        // the ancestor or the copied layers
        let mut guard = detached.layers.write().await;
        Arc::make_mut(&mut guard).track_detached_layers(&layers);
        detached.set_ancestor(None);
        detached.update_lineage(|lineage| lineage.record_detaching(ancestor_id, ancestor_lsn));
        detached.update_ongoing_detach(|ongoing| {
            if let Some(ongoing) = ongoing {
                ongoing.attached = true;
            }
        });
    }

    detached.upload_index().await.map_err(Error::Unexpected)?;
    info!(
        layers = layers.len(),
        %ancestor_id,
        %ancestor_lsn,
        "detached from the ancestor"
    );
    Ok(())
}

/// Moves the children of the ancestor which branched at or before `ancestor_lsn` to
/// the detached timeline.
async fn reparent_siblings(
    detached: &Arc<Timeline>,
    timelines: &TimelineArena,
    ancestor_id: TimelineId,
    ancestor_lsn: Lsn,
) -> Result<(), Error> {
    let already = detached
        .ongoing_detach()
        .map(|ongoing| ongoing.reparented)
        .unwrap_or_default();

    let candidates = timelines
        .all()
        .into_iter()
        .filter(|tl| tl.timeline_id != detached.timeline_id)
        .filter(|tl| match tl.get_ancestor() {
            Some((id, lsn)) if id == ancestor_id => lsn <= ancestor_lsn,
            // reparented by an earlier attempt which might not have persisted it
            Some((id, _)) if id == detached.timeline_id => {
                tl.lineage().is_reparented_from(&ancestor_id)
                    && !already.contains(&tl.timeline_id)
            }
            _ => false,
        })
        .sorted_by_key(|tl| tl.timeline_id)
        .collect_vec();

    let mut failed = 0;
    for timeline in candidates {
        let span = info_span!("reparent", reparented = %timeline.timeline_id);
        match reparent(&timeline, detached, ancestor_id)
            .instrument(span)
            .await
        {
            Ok(()) => {
                info!(reparented = %timeline.timeline_id, "reparenting done");
                detached.update_ongoing_detach(|ongoing| {
                    if let Some(ongoing) = ongoing {
                        ongoing.reparented.insert(timeline.timeline_id);
                    }
                });
            }
            Err(e) => {
                warn!(reparented = %timeline.timeline_id, "reparenting failed: {e:#}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        if let Err(e) = detached.upload_index().await {
            warn!("failed to persist the reparenting progress: {e:#}");
        }
        return Err(Error::Reparenting);
    }
    Ok(())
}

async fn reparent(
    timeline: &Arc<Timeline>,
    new_parent: &Timeline,
    old_parent: TimelineId,
) -> anyhow::Result<()> {
    crate::failpoint!(new_parent.failpoints, DetachReparentTimeline, |kind| anyhow!(
        "failpoint {kind}"
    ));

    let ancestor_lsn = timeline.get_ancestor_lsn();
    timeline.set_ancestor(Some((new_parent.timeline_id, ancestor_lsn)));
    timeline.update_lineage(|lineage| lineage.record_reparenting(old_parent));
    timeline.upload_index().await
}

/// Replaces the detach progress with the final record of the reparented timelines.
async fn complete(detached: &Arc<Timeline>) -> Result<BTreeSet<TimelineId>, Error> {
    let ongoing = detached
        .ongoing_detach()
        .ok_or_else(|| Error::Unexpected(anyhow!("no detach progress to complete")))?;
    let reparented = ongoing.reparented.clone();

    detached.update_lineage(|lineage| lineage.detach_reparented = Some(reparented.clone()));
    detached.set_ongoing_detach(None);

    if let Err(e) = detached.upload_index().await {
        detached.update_lineage(|lineage| lineage.detach_reparented = None);
        detached.set_ongoing_detach(Some(ongoing));
        return Err(Error::Unexpected(e));
    }
    Ok(reparented)
}

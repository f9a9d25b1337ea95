//! Compaction of a timeline's layers.
//!
//! A compaction pass first merges the level 0 delta layers, which each cover the
//! whole key space, into level 1 delta layers with disjoint key ranges. Then it
//! materializes image layers for the key partitions which have accumulated enough
//! deltas since their last image.

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;

use anyhow::Context;
use itertools::Itertools;
use pageserver_api::key::Key;
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::lsn::Lsn;

use super::{CompactionError, PageReconstructError, Timeline};
use crate::metrics::StorageTimeOperation;
use crate::tenant::storage_layer::layer::LayerKind;
use crate::tenant::storage_layer::{DeltaLayerWriter, ImageLayerWriter, ResidentLayer};

/// Rough size of one materialized value, used to size the key partitions.
const PAGE_SZ: u64 = 8192;

/// Upper bound for the number of level 0 layers merged in one pass.
const L0_COMPACTION_MAX_NUM_DELTA_LAYERS: usize = 60;

impl Timeline {
    /// Runs one compaction pass: flushes the frozen layers, merges level 0 deltas
    /// and creates image layers at the disk consistent LSN.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id))]
    pub(crate) async fn compact(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<(), CompactionError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| CompactionError::ShuttingDown)?;
        let _compaction_guard = self.compaction_lock.lock().await;

        if cancel.is_cancelled() || self.cancel.is_cancelled() {
            trace!("Dropping out of compaction on timeline shutdown");
            return Err(CompactionError::ShuttingDown);
        }

        self.flush_frozen_layers().await?;

        let timer = self.metrics.start_timer(StorageTimeOperation::Compact);
        self.compact_level0(cancel).await?;
        timer.stop_and_record();

        let lsn = self.get_disk_consistent_lsn();
        self.create_image_layers(lsn, cancel).await?;
        Ok(())
    }

    /// Merges a contiguous run of level 0 deltas into level 1 deltas, once there are
    /// at least `compaction_threshold` of them.
    async fn compact_level0(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<(), CompactionError> {
        let layers = self.layers_snapshot().await;
        let mut level0_deltas = layers
            .layer_map()
            .level0_deltas()
            .iter()
            .map(|desc| layers.get_from_desc(desc))
            .collect_vec();
        drop(layers);

        // Only compact if enough layers have accumulated.
        let threshold = self.get_compaction_threshold();
        if level0_deltas.is_empty() || level0_deltas.len() < threshold {
            debug!(
                level0_deltas = level0_deltas.len(),
                threshold, "too few deltas to compact"
            );
            return Ok(());
        }

        // Gather the files to compact in this iteration.
        //
        // Start with the oldest Level 0 delta file, and collect any other
        // level 0 files that form a contiguous sequence, such that the end
        // LSN of previous file matches the start LSN of the next file.
        level0_deltas.sort_by_key(|l| l.layer_desc().lsn_range.start);
        let mut deltas_to_compact: Vec<ResidentLayer> = Vec::new();
        let mut prev_lsn_end = None;
        for l in &level0_deltas {
            let lsn_range = &l.layer_desc().lsn_range;
            if prev_lsn_end.is_some_and(|end| end != lsn_range.start) {
                break;
            }
            if cancel.is_cancelled() {
                return Err(CompactionError::ShuttingDown);
            }
            deltas_to_compact.push(l.download_and_keep_resident().await?);
            prev_lsn_end = Some(lsn_range.end);

            if deltas_to_compact.len() >= L0_COMPACTION_MAX_NUM_DELTA_LAYERS {
                info!(
                    "compaction picker hit max delta layers limit: {}",
                    L0_COMPACTION_MAX_NUM_DELTA_LAYERS
                );
                break;
            }
        }
        let lsn_range = Range {
            start: deltas_to_compact[0].layer_desc().lsn_range.start,
            end: deltas_to_compact[deltas_to_compact.len() - 1]
                .layer_desc()
                .lsn_range
                .end,
        };

        info!(
            "Starting Level0 compaction in LSN range {}-{} for {} layers ({} deltas in total)",
            lsn_range.start,
            lsn_range.end,
            deltas_to_compact.len(),
            level0_deltas.len()
        );
        for l in &deltas_to_compact {
            info!("compact includes {l}");
        }
        drop(level0_deltas);

        let mut all_values = Vec::new();
        for l in &deltas_to_compact {
            match l.load().await? {
                LayerKind::Delta(delta) => all_values.extend(delta.records().iter().cloned()),
                LayerKind::Image(_) => unreachable!("level 0 layers are deltas"),
            }
        }
        // The current stdlib sorting implementation is designed in a way where it is
        // particularly fast where the slice is made up of sorted sub-ranges.
        all_values.sort_by_key(|(key, lsn, _)| (*key, *lsn));

        let target_file_size = self.get_compaction_target_size();
        let mut new_layers = Vec::new();
        let mut writer: Option<DeltaLayerWriter> = None;
        let mut prev_key: Option<Key> = None;
        for (key, lsn, value) in &all_values {
            let same_key = prev_key == Some(*key);
            // values of one key stay in one layer
            if !same_key && writer.as_ref().is_some_and(|w| w.size() >= target_file_size) {
                if let (Some(w), Some(prev_key)) = (writer.take(), prev_key) {
                    new_layers.push(w.finish(prev_key.next(), self).await?);
                }
            }
            let w = writer.get_or_insert_with(|| {
                debug!("Create new layer {}..{}", lsn_range.start, lsn_range.end);
                DeltaLayerWriter::new(
                    self.conf,
                    self.timeline_id,
                    self.tenant_id,
                    *key,
                    lsn_range.clone(),
                )
            });
            w.put_value(*key, *lsn, value)?;
            prev_key = Some(*key);
        }
        if let (Some(w), Some(prev_key)) = (writer, prev_key) {
            new_layers.push(w.finish(prev_key.next(), self).await?);
        }

        if let Err(e) = self.upload_compacted_layers(&new_layers).await {
            for l in &new_layers {
                l.layer().delete_on_drop();
            }
            return Err(e);
        }

        let compacted = deltas_to_compact
            .into_iter()
            .map(|l| l.drop_eviction_guard())
            .collect_vec();
        {
            let mut guard = self.layers.write().await;
            Arc::make_mut(&mut guard).finish_compact_l0(&compacted, &new_layers);
        }
        self.upload_index().await?;

        let removed = compacted.iter().map(|l| l.layer_name()).collect_vec();
        if let Err(e) = self
            .remote_client
            .delete_layer_files(&removed, &self.cancel)
            .await
        {
            // the index no longer lists them
            warn!("failed to delete compacted layers from remote storage: {e:#}");
        }

        info!(
            compacted = compacted.len(),
            created = new_layers.len(),
            "Level0 compaction done"
        );
        Ok(())
    }

    async fn upload_compacted_layers(
        &self,
        new_layers: &[ResidentLayer],
    ) -> Result<(), CompactionError> {
        for l in new_layers {
            self.remote_client
                .upload_layer_file(l, &self.cancel)
                .await
                .map_err(|e| self.compaction_error(e))?;
        }
        crate::failpoint!(self.failpoints, CompactionAfterUpload, |kind| {
            CompactionError::Other(anyhow::anyhow!("failpoint {kind}"))
        });
        Ok(())
    }

    fn compaction_error(&self, e: anyhow::Error) -> CompactionError {
        if self.cancel.is_cancelled() {
            CompactionError::ShuttingDown
        } else {
            CompactionError::Other(e)
        }
    }

    /// All keys readable at `lsn`, including the ones inherited from the ancestors.
    /// Evicted layers are downloaded to list their keys.
    async fn collect_keyspace(&self, lsn: Lsn) -> Result<BTreeSet<Key>, CompactionError> {
        let mut keys = BTreeSet::new();
        let mut ancestor: Option<Arc<Timeline>> = None;
        let mut until = lsn;
        loop {
            let timeline = ancestor.as_deref().unwrap_or(self);
            let layers = timeline.layers_snapshot().await;
            for layer in layers.historic_layers() {
                if layer.layer_desc().lsn_range.start > until {
                    continue;
                }
                if self.cancel.is_cancelled() {
                    return Err(CompactionError::ShuttingDown);
                }
                let resident = layer.download_and_keep_resident().await?;
                match resident.load().await? {
                    LayerKind::Delta(delta) => keys.extend(
                        delta
                            .records()
                            .iter()
                            .filter(|(_, lsn, _)| *lsn <= until)
                            .map(|(key, _, _)| *key),
                    ),
                    LayerKind::Image(image) => keys.extend(image.keys()),
                }
            }
            match timeline.get_ancestor_timeline()? {
                Some((next, ancestor_lsn)) => {
                    until = std::cmp::min(until, ancestor_lsn);
                    ancestor = Some(next);
                }
                None => return Ok(keys),
            }
        }
    }

    /// Creates an image layer at `lsn` for every key partition which has at least
    /// `image_creation_threshold` deltas since its last image.
    async fn create_image_layers(
        self: &Arc<Self>,
        lsn: Lsn,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResidentLayer>, CompactionError> {
        let timer = self.metrics.start_timer(StorageTimeOperation::CreateImages);
        let keys = self.collect_keyspace(lsn).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let keys_per_partition =
            std::cmp::max(1, self.get_compaction_target_size() / PAGE_SZ) as usize;
        let keys = keys.into_iter().collect_vec();
        let chunks = keys.chunks(keys_per_partition).collect_vec();

        let threshold = self.get_image_creation_threshold();
        let mut image_layers = Vec::new();
        for (i, part) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CompactionError::ShuttingDown);
            }
            // partitions tile the whole key space
            let start = if i == 0 { Key::MIN } else { part[0] };
            let end = chunks.get(i + 1).map(|next| next[0]).unwrap_or(Key::MAX);
            let img_range = start..end;

            if !self.time_for_new_image_layer(&img_range, lsn, threshold).await {
                continue;
            }

            let mut writer =
                ImageLayerWriter::new(self.conf, self.timeline_id, self.tenant_id, &img_range, lsn);
            for key in part.iter() {
                match self.get(*key, lsn).await {
                    Ok(img) => writer.put_image(*key, img)?,
                    // not present at this LSN
                    Err(PageReconstructError::MissingKey { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if writer.num_keys() == 0 {
                continue;
            }
            let image_layer = writer.finish(self).await?;
            info!(layer = %image_layer, "created image layer");
            image_layers.push(image_layer);
        }

        if image_layers.is_empty() {
            return Ok(image_layers);
        }

        for l in &image_layers {
            if let Err(e) = self.remote_client.upload_layer_file(l, &self.cancel).await {
                for l in &image_layers {
                    l.layer().delete_on_drop();
                }
                return Err(self.compaction_error(e));
            }
        }
        {
            let mut guard = self.layers.write().await;
            Arc::make_mut(&mut guard).track_new_image_layers(&image_layers);
        }
        self.upload_index()
            .await
            .context("upload index after image layer creation")?;

        timer.stop_and_record();
        Ok(image_layers)
    }

    async fn time_for_new_image_layer(
        &self,
        partition: &Range<Key>,
        lsn: Lsn,
        threshold: usize,
    ) -> bool {
        let layers = self.layers_snapshot().await;
        let layer_map = layers.layer_map();

        if layer_map.image_layer_exists(partition, &(lsn..lsn + 1)) {
            debug!(
                "image layer for {}..{} at {lsn} already exists",
                partition.start, partition.end
            );
            return false;
        }

        let num_deltas = layer_map.count_deltas(partition, &(Lsn(0)..lsn + 1), Some(threshold));
        debug!(
            "key range {}-{}, has {} deltas on this timeline in LSN range ..{}",
            partition.start, partition.end, num_deltas, lsn
        );
        num_deltas >= threshold
    }
}

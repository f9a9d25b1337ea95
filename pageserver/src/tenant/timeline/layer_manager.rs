use anyhow::{bail, ensure, Context};
use itertools::Itertools;
use std::{collections::HashMap, sync::Arc};
use tracing::trace;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use crate::{
    config::PageServerConf,
    tenant::{
        layer_map::LayerMap,
        storage_layer::{
            InMemoryLayer, Layer, LayerName, PersistentLayerDesc, PersistentLayerKey,
            ResidentLayer,
        },
    },
};

/// Provides semantic APIs to manipulate the layer map.
///
/// The timeline keeps the manager behind an `Arc`: readers clone the `Arc` and work on
/// that snapshot, writers replace it with a modified copy (see [`Arc::make_mut`]).
#[derive(Default, Clone)]
pub(crate) struct LayerManager {
    layer_map: LayerMap,
    layer_fmgr: LayerFileManager,
}

impl std::fmt::Debug for LayerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerManager")
            .field("layer_count", &self.layer_fmgr.0.len())
            .finish()
    }
}

impl LayerManager {
    pub(crate) fn get_from_key(&self, key: &PersistentLayerKey) -> Layer {
        // A layer's descriptor is present in the LayerMap => the LayerFileManager contains a layer for the descriptor.
        self.try_get_from_key(key)
            .with_context(|| format!("get layer from key: {key}"))
            .expect("not found")
            .clone()
    }

    pub(crate) fn try_get_from_key(&self, key: &PersistentLayerKey) -> Option<&Layer> {
        self.layer_fmgr.0.get(key)
    }

    pub(crate) fn get_from_desc(&self, desc: &PersistentLayerDesc) -> Layer {
        self.get_from_key(&desc.key())
    }

    /// Get an immutable reference to the layer map.
    ///
    /// Modifications go through the semantic APIs below.
    pub(crate) fn layer_map(&self) -> &LayerMap {
        &self.layer_map
    }

    /// Sum up the historic layer sizes
    pub(crate) fn layer_size_sum(&self) -> u64 {
        self.layer_fmgr
            .0
            .values()
            .map(|l| l.layer_desc().file_size)
            .sum()
    }

    pub(crate) fn likely_resident_layers(&self) -> impl Iterator<Item = &'_ Layer> + '_ {
        self.layer_fmgr.0.values().filter(|l| l.is_likely_resident())
    }

    /// All historic layers, in layer map order.
    pub(crate) fn historic_layers(&self) -> Vec<Layer> {
        self.layer_map
            .iter_historic_layers()
            .map(|desc| self.get_from_desc(&desc))
            .collect_vec()
    }

    pub(crate) fn find_layer_by_name(&self, layer_name: &LayerName) -> Option<Layer> {
        self.layer_fmgr
            .0
            .values()
            .find(|l| &l.layer_name() == layer_name)
            .cloned()
    }

    pub(crate) fn contains(&self, layer: &Layer) -> bool {
        self.layer_fmgr.0.contains_key(&layer.layer_desc().key())
    }

    /// Called when loading the timeline. Initialize the layer manager with:
    /// 1. all known layers
    /// 2. next open layer (with disk disk_consistent_lsn LSN)
    pub(crate) fn initialize_local_layers(&mut self, layers: Vec<Layer>, next_open_layer_at: Lsn) {
        for layer in layers {
            self.insert_historic_layer(layer);
        }
        self.layer_map.next_open_layer_at = Some(next_open_layer_at);
    }

    /// Initialize when creating a new timeline.
    pub(crate) fn initialize_empty(&mut self, next_open_layer_at: Lsn) {
        self.layer_map.next_open_layer_at = Some(next_open_layer_at);
    }

    /// Open a new writable layer to append data if there is no open layer, otherwise return the
    /// current open layer.
    pub(crate) fn get_layer_for_write(
        &mut self,
        lsn: Lsn,
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
    ) -> anyhow::Result<Arc<InMemoryLayer>> {
        // Do we have a layer open for writing already?
        let layer = if let Some(open_layer) = &self.layer_map.open_layer {
            if open_layer.get_lsn_range().start > lsn {
                bail!(
                    "unexpected open layer in the future: open layers starts at {}, write lsn {}",
                    open_layer.get_lsn_range().start,
                    lsn
                );
            }

            Arc::clone(open_layer)
        } else {
            // No writeable layer yet. Create one.
            let start_lsn = self
                .layer_map
                .next_open_layer_at
                .context("No next open layer found")?;
            ensure!(
                lsn >= start_lsn,
                "write at {lsn} is below the next open layer start {start_lsn}"
            );

            trace!(
                "creating in-memory layer at {}/{} for record at {}",
                timeline_id,
                start_lsn,
                lsn
            );

            let layer = Arc::new(InMemoryLayer::create(conf, timeline_id, tenant_id, start_lsn));

            self.layer_map.open_layer = Some(layer.clone());
            self.layer_map.next_open_layer_at = None;

            layer
        };

        Ok(layer)
    }

    /// Freezes the open layer at `last_record_lsn + 1`.
    ///
    /// Returns true if anything was frozen.
    pub(crate) async fn try_freeze_in_memory_layer(&mut self, last_record_lsn: Lsn) -> bool {
        let end_lsn = last_record_lsn + 1;

        if let Some(open_layer) = &self.layer_map.open_layer {
            if open_layer.get_lsn_range().start >= end_lsn {
                // nothing was written to the layer yet
                return false;
            }
        }

        if let Some(open_layer) = self.layer_map.open_layer.take() {
            open_layer.freeze(end_lsn).await;

            // The layer is no longer open, update the layer map to reflect this.
            // It is replaced with an on-disk historic layer when flushed.
            self.layer_map.frozen_layers.push_back(open_layer);
            self.layer_map.next_open_layer_at = Some(end_lsn);

            true
        } else {
            false
        }
    }

    /// Add image layers to the layer map, called from compaction.
    pub(crate) fn track_new_image_layers(&mut self, image_layers: &[ResidentLayer]) {
        for layer in image_layers {
            self.insert_historic_layer(layer.layer().clone());
        }
    }

    /// Flush a frozen layer and add the written delta layer to the layer map.
    pub(crate) fn finish_flush_l0_layer(
        &mut self,
        delta_layer: Option<&ResidentLayer>,
        frozen_layer_for_check: &Arc<InMemoryLayer>,
    ) {
        let inmem = self
            .layer_map
            .frozen_layers
            .pop_front()
            .expect("there must be a inmem layer to flush");

        // Only one task may call this function at a time (for this
        // timeline). If two tasks tried to flush the same frozen
        // layer to disk at the same time, that would not work.
        assert_eq!(Arc::as_ptr(&inmem), Arc::as_ptr(frozen_layer_for_check));

        if let Some(l) = delta_layer {
            self.insert_historic_layer(l.layer().clone());
        }
    }

    /// Called when compaction is completed.
    pub(crate) fn finish_compact_l0(
        &mut self,
        compact_from: &[Layer],
        compact_to: &[ResidentLayer],
    ) {
        for l in compact_to {
            self.insert_historic_layer(l.layer().clone());
        }
        for l in compact_from {
            self.delete_historic_layer(l);
        }
    }

    /// Called when garbage collect has selected the layers to be removed.
    pub(crate) fn finish_gc_timeline(&mut self, gc_layers: &[Layer]) {
        for doomed_layer in gc_layers {
            self.delete_historic_layer(doomed_layer);
        }
    }

    /// Adds layers copied or rewritten from the ancestor while detaching.
    pub(crate) fn track_detached_layers(&mut self, layers: &[Layer]) {
        for layer in layers {
            if !self.contains(layer) {
                self.insert_historic_layer(layer.clone());
            }
        }
    }

    /// Drops every historic layer, leaving the files to be removed as the last
    /// references go away.
    pub(crate) fn delete_all(&mut self) {
        let layers = self.layer_fmgr.0.values().cloned().collect_vec();
        for layer in &layers {
            self.delete_historic_layer(layer);
        }
        self.layer_map.open_layer = None;
        self.layer_map.frozen_layers.clear();
    }

    /// Helper function to insert a layer into the layer map and file manager.
    fn insert_historic_layer(&mut self, layer: Layer) {
        self.layer_map.insert_historic(layer.layer_desc().clone());
        self.layer_fmgr.insert(layer);
    }

    /// Removes the layer from local FS (if present) and from memory.
    /// Remote storage is not affected by this operation.
    fn delete_historic_layer(&mut self, layer: &Layer) {
        let desc = layer.layer_desc();
        self.layer_map.remove_historic(desc);
        self.layer_fmgr.remove(layer);
        layer.delete_on_drop();
    }
}

#[derive(Default, Clone)]
pub(crate) struct LayerFileManager(HashMap<PersistentLayerKey, Layer>);

impl LayerFileManager {
    pub(crate) fn insert(&mut self, layer: Layer) {
        let key = layer.layer_desc().key();
        let present = self.0.insert(key, layer.clone());
        if present.is_some() && cfg!(debug_assertions) {
            panic!("overwriting a layer: {:?}", layer.layer_desc())
        }
    }

    pub(crate) fn remove(&mut self, layer: &Layer) {
        let present = self.0.remove(&layer.layer_desc().key());
        if present.is_none() && cfg!(debug_assertions) {
            panic!(
                "removing layer that is not present in layer mapping: {:?}",
                layer.layer_desc()
            )
        }
    }
}

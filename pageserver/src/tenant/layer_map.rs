//!
//! The layer map tracks what layers exist in a timeline.
//!
//! When a timeline is loaded, the layers listed in its index are inserted into
//! this map. When the first new value is received, we create an InMemoryLayer to
//! hold the incoming records. Now and then, in the checkpoint, the in-memory layer
//! is frozen and written to disk as a level 0 delta layer.
//!
//! Design overview:
//!
//! The layer map only holds layer descriptions: ranges and sizes. The layer values
//! themselves, with their residency, live in the
//! [`LayerManager`](crate::tenant::timeline::layer_manager::LayerManager) which owns
//! this map. Searches are linear scans over the historic layers, which are kept in
//! a `BTreeMap` for a stable iteration order.
//!

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;

use pageserver_api::key::Key;
use utils::lsn::Lsn;

use super::storage_layer::{range_overlaps, InMemoryLayer, PersistentLayerDesc};

///
/// LayerMap tracks what layers exist on a timeline.
///
#[derive(Default, Clone)]
pub struct LayerMap {
    //
    // 'open_layer' holds the current InMemoryLayer that is accepting new
    // records. If it is None, 'next_open_layer_at' will be set instead, indicating
    // where the start LSN of the next InMemoryLayer that is to be created.
    //
    pub open_layer: Option<Arc<InMemoryLayer>>,
    pub next_open_layer_at: Option<Lsn>,

    ///
    /// Frozen layers, if any. Frozen layers are in-memory layers that
    /// are no longer added to, but haven't been written out to disk
    /// yet. They contain WAL older than the current 'open_layer' or
    /// 'next_open_layer_at', but newer than any historic layer.
    /// The frozen layers are in order from oldest to newest, so that
    /// the newest one is in the 'back' of the VecDeque, and the oldest
    /// in the 'front'.
    ///
    pub frozen_layers: VecDeque<Arc<InMemoryLayer>>,

    /// All historic layers, ordered by (lsn start, key start, is_delta).
    historic: BTreeMap<HistoricKey, Arc<PersistentLayerDesc>>,

    /// L0 layers have key range Key::MIN..Key::MAX. They are also in `historic`.
    l0_delta_layers: Vec<Arc<PersistentLayerDesc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HistoricKey {
    lsn_start: Lsn,
    lsn_end: Lsn,
    key_start: Key,
    key_end: Key,
    is_delta: bool,
}

impl From<&PersistentLayerDesc> for HistoricKey {
    fn from(desc: &PersistentLayerDesc) -> Self {
        HistoricKey {
            lsn_start: desc.lsn_range.start,
            lsn_end: desc.lsn_range.end,
            key_start: desc.key_range.start,
            key_end: desc.key_range.end,
            is_delta: desc.is_delta,
        }
    }
}

/// A layer found by [`LayerMap::search`].
#[derive(Debug, Clone)]
pub enum SearchLayer {
    Persistent(Arc<PersistentLayerDesc>),
    InMemory(Arc<InMemoryLayer>),
}

/// Return value of LayerMap::search
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub layer: SearchLayer,
    /// The reader should read the layer at LSNs `lsn_floor..end_lsn` and continue
    /// below `lsn_floor` if the value is not complete.
    pub lsn_floor: Lsn,
}

impl LayerMap {
    ///
    /// Find the latest layer (by lsn.end) that covers the given
    /// 'key', with lsn range start <= end_lsn - 1.
    ///
    /// Layer types have an implicit priority (image > delta > in-memory). If we
    /// have the option of reading an LSN range from both an image and a delta,
    /// we read from the image.
    ///
    pub fn search(&self, key: Key, end_lsn: Lsn) -> Option<SearchResult> {
        let in_memory_layer = self.search_in_memory_layer(end_lsn);

        let covers = |l: &&Arc<PersistentLayerDesc>| {
            l.key_range.contains(&key) && l.lsn_range.start < end_lsn
        };
        let latest_delta = self
            .historic
            .values()
            .filter(|l| l.is_delta)
            .filter(covers)
            .max_by_key(|l| (l.lsn_range.start, l.lsn_range.end))
            .cloned();
        let latest_image = self
            .historic
            .values()
            .filter(|l| !l.is_delta)
            .filter(covers)
            .max_by_key(|l| l.lsn_range.start)
            .cloned();

        Self::select_layer(latest_delta, latest_image, in_memory_layer, end_lsn)
    }

    /// Select a layer from three potential candidates (in-memory, delta and image layer).
    fn select_layer(
        delta_layer: Option<Arc<PersistentLayerDesc>>,
        image_layer: Option<Arc<PersistentLayerDesc>>,
        in_memory_layer: Option<Arc<InMemoryLayer>>,
        end_lsn: Lsn,
    ) -> Option<SearchResult> {
        // The persistent candidate and the LSN floor below which it is not needed.
        let persistent = match (delta_layer, image_layer) {
            (None, None) => None,
            (None, Some(image)) => {
                let lsn_floor = image.get_lsn_range().start;
                Some((image, lsn_floor))
            }
            (Some(delta), None) => {
                let lsn_floor = delta.get_lsn_range().start;
                Some((delta, lsn_floor))
            }
            (Some(delta), Some(image)) => {
                let img_lsn = image.get_lsn_range().start;
                let image_is_newer = image.get_lsn_range().end >= delta.get_lsn_range().end;
                let image_exact_match = img_lsn + 1 == end_lsn;
                if image_is_newer || image_exact_match {
                    Some((image, img_lsn))
                } else {
                    // If the delta overlaps with the image in the LSN dimension, do a partial
                    // up to the image layer.
                    let lsn_floor =
                        std::cmp::max(delta.get_lsn_range().start, image.get_lsn_range().start + 1);
                    Some((delta, lsn_floor))
                }
            }
        };

        match (persistent, in_memory_layer) {
            (None, None) => None,
            (Some((layer, lsn_floor)), None) => Some(SearchResult {
                layer: SearchLayer::Persistent(layer),
                lsn_floor,
            }),
            (None, Some(inmem)) => Some(SearchResult {
                lsn_floor: inmem.get_lsn_range().start,
                layer: SearchLayer::InMemory(inmem),
            }),
            (Some((layer, lsn_floor)), Some(inmem)) => {
                let layer_end = layer.get_lsn_range().end;
                let inmem_range = inmem.get_lsn_range();
                if layer_end >= inmem_range.end {
                    Some(SearchResult {
                        layer: SearchLayer::Persistent(layer),
                        lsn_floor,
                    })
                } else {
                    // If the in-memory layer overlaps with the persistent layer in the LSN
                    // dimension, do a partial up to the persistent layer.
                    let lsn_floor = std::cmp::max(inmem_range.start, layer_end);
                    Some(SearchResult {
                        layer: SearchLayer::InMemory(inmem),
                        lsn_floor,
                    })
                }
            }
        }
    }

    /// The newest in-memory layer with values below `below`.
    pub(crate) fn search_in_memory_layer(&self, below: Lsn) -> Option<Arc<InMemoryLayer>> {
        let open = self.open_layer.iter();
        let frozen = self.frozen_layers.iter().rev();
        open.chain(frozen)
            .find(|layer| layer.get_lsn_range().start < below)
            .cloned()
    }

    ///
    /// Insert an on-disk layer
    ///
    pub fn insert_historic(&mut self, layer_desc: PersistentLayerDesc) {
        let layer_desc = Arc::new(layer_desc);
        if Self::is_l0(&layer_desc.key_range, layer_desc.is_delta) {
            self.l0_delta_layers.push(layer_desc.clone());
        }
        self.historic
            .insert(HistoricKey::from(&*layer_desc), layer_desc);
    }

    ///
    /// Remove an on-disk layer from the map.
    ///
    pub fn remove_historic(&mut self, layer_desc: &PersistentLayerDesc) {
        let removed = self.historic.remove(&HistoricKey::from(layer_desc));
        assert!(
            removed.is_some(),
            "removed layer {} is not in the layer map",
            layer_desc.short_id()
        );
        if Self::is_l0(&layer_desc.key_range, layer_desc.is_delta) {
            let layer_key = layer_desc.key();
            let len_before = self.l0_delta_layers.len();
            self.l0_delta_layers.retain(|other| other.key() != layer_key);
            assert_eq!(
                self.l0_delta_layers.len(),
                len_before - 1,
                "failed to locate removed historic layer from l0_delta_layers"
            );
        }
    }

    /// Is there a newer image layer for given key- and LSN-range? Or a set
    /// of image layers within the specified lsn range that cover the entire
    /// specified key range?
    ///
    /// This is used for garbage collection, to determine if an old layer can
    /// be deleted.
    pub fn image_layer_exists(&self, key: &Range<Key>, lsn: &Range<Lsn>) -> bool {
        if key.is_empty() {
            // Vacuously true. There's a newer image for all 0 of the keys in the range.
            return true;
        }

        let mut images: Vec<&Range<Key>> = self
            .historic
            .values()
            .filter(|l| !l.is_delta && lsn.contains(&l.image_layer_lsn()))
            .map(|l| &l.key_range)
            .filter(|r| range_overlaps(*r, key))
            .collect();
        images.sort_by_key(|r| r.start);

        // sweep from the start of the range over the sorted images
        let mut covered_until = key.start;
        for range in images {
            if range.start > covered_until {
                return false;
            }
            if range.end > covered_until {
                covered_until = range.end;
            }
            if covered_until >= key.end {
                return true;
            }
        }
        false
    }

    pub fn iter_historic_layers(
        &self,
    ) -> impl ExactSizeIterator<Item = Arc<PersistentLayerDesc>> + '_ {
        self.historic.values().cloned()
    }

    pub fn historic_layer_count(&self) -> usize {
        self.historic.len()
    }

    /// Check if the key range resembles that of an L0 layer.
    pub fn is_l0(key_range: &Range<Key>, is_delta_layer: bool) -> bool {
        is_delta_layer && key_range == &(Key::MIN..Key::MAX)
    }

    /// This function determines which layers are counted in `count_deltas`:
    /// layers that should count towards deciding whether or not to reimage
    /// a certain partition range.
    ///
    /// Non-L0 layers are reimage-worthy. Since L0 layers by definition cover the
    /// entire key space, we consider them reimage-worthy only when the entire key
    /// space is the partition.
    pub fn is_reimage_worthy(layer: &PersistentLayerDesc, partition_range: &Range<Key>) -> bool {
        !Self::is_l0(&layer.key_range, layer.is_delta) || partition_range == &(Key::MIN..Key::MAX)
    }

    /// Count the reimage-worthy deltas in this 2d region, above the newest image
    /// layers which cover the whole key range.
    ///
    /// If `limit` is provided we don't try to count above that number.
    ///
    /// This number bounds the number of deltas that we'll need to visit for any
    /// value reconstruction in this region. We use it to decide whether to create
    /// an image layer.
    pub fn count_deltas(&self, key: &Range<Key>, lsn: &Range<Lsn>, limit: Option<usize>) -> usize {
        if lsn.is_empty() || key.is_empty() || limit == Some(0) {
            return 0;
        }

        // Deltas below the newest image which covers the whole range don't count.
        let mut image_lsns: Vec<Lsn> = self
            .historic
            .values()
            .filter(|l| !l.is_delta && lsn.contains(&l.image_layer_lsn()))
            .filter(|l| range_overlaps(&l.key_range, key))
            .map(|l| l.image_layer_lsn())
            .collect();
        image_lsns.sort_unstable();
        image_lsns.dedup();
        let floor = image_lsns
            .into_iter()
            .rev()
            .find(|img_lsn| self.image_layer_exists(key, &(*img_lsn..lsn.end)))
            .map(|img_lsn| img_lsn + 1)
            .unwrap_or(lsn.start);
        let lsn = floor..lsn.end;
        if lsn.is_empty() {
            return 0;
        }

        let mut count = 0;
        for layer in self.historic.values().rev() {
            if !layer.is_delta
                || !range_overlaps(&layer.key_range, key)
                || !range_overlaps(&layer.lsn_range, &lsn)
            {
                continue;
            }
            if Self::is_reimage_worthy(layer, key) {
                count += 1;
            }
            if limit.is_some_and(|limit| count >= limit) {
                break;
            }
        }
        count
    }

    /// Return all L0 delta layers
    pub fn level0_deltas(&self) -> &Vec<Arc<PersistentLayerDesc>> {
        &self.l0_delta_layers
    }

    /// The newest LSN covered by a frozen or historic layer, plus one.
    pub fn next_open_layer_start(&self) -> Option<Lsn> {
        self.frozen_layers
            .back()
            .map(|l| l.get_lsn_range().end)
            .or_else(|| self.historic.values().map(|l| l.lsn_range.end).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageServerConf;
    use utils::id::{TenantId, TimelineId};

    fn delta(keys: Range<u32>, lsns: Range<u64>) -> PersistentLayerDesc {
        PersistentLayerDesc::new_delta(
            TenantId::from_array([1; 16]),
            TimelineId::from_array([2; 16]),
            Key::user(1, keys.start)..Key::user(1, keys.end),
            Lsn(lsns.start)..Lsn(lsns.end),
            100,
        )
    }

    fn l0(lsns: Range<u64>) -> PersistentLayerDesc {
        PersistentLayerDesc::new_delta(
            TenantId::from_array([1; 16]),
            TimelineId::from_array([2; 16]),
            Key::MIN..Key::MAX,
            Lsn(lsns.start)..Lsn(lsns.end),
            100,
        )
    }

    fn image(keys: Range<u32>, lsn: u64) -> PersistentLayerDesc {
        PersistentLayerDesc::new_img(
            TenantId::from_array([1; 16]),
            TimelineId::from_array([2; 16]),
            Key::user(1, keys.start)..Key::user(1, keys.end),
            Lsn(lsn),
            100,
        )
    }

    fn persistent(res: Option<SearchResult>) -> (PersistentLayerDesc, Lsn) {
        match res {
            Some(SearchResult {
                layer: SearchLayer::Persistent(desc),
                lsn_floor,
            }) => ((*desc).clone(), lsn_floor),
            other => panic!("expected a persistent layer, got {other:?}"),
        }
    }

    #[test]
    fn search_prefers_newer_image() {
        let mut map = LayerMap::default();
        map.insert_historic(l0(0x10..0x20));
        map.insert_historic(image(0..100, 0x20));
        map.insert_historic(l0(0x20..0x30));

        // the image at 0x20 covers reads at 0x20 exactly
        let (layer, floor) = persistent(map.search(Key::user(1, 5), Lsn(0x21)));
        assert_eq!(layer, image(0..100, 0x20));
        assert_eq!(floor, Lsn(0x20));

        // above it, the newer delta is read first, down to just above the image
        let (layer, floor) = persistent(map.search(Key::user(1, 5), Lsn(0x30)));
        assert_eq!(layer, l0(0x20..0x30));
        assert_eq!(floor, Lsn(0x21));

        // keys outside of the image are found in the older delta
        let (layer, floor) = persistent(map.search(Key::user(2, 0), Lsn(0x20)));
        assert_eq!(layer, l0(0x10..0x20));
        assert_eq!(floor, Lsn(0x10));

        assert!(map.search(Key::user(1, 5), Lsn(0x10)).is_none());
    }

    #[test]
    fn search_finds_in_memory_layers() {
        let conf = Box::leak(Box::new(PageServerConf::dummy_conf("/nonexistent".into())));
        let tenant_id = TenantId::from_array([1; 16]);
        let timeline_id = TimelineId::from_array([2; 16]);

        let mut map = LayerMap::default();
        map.insert_historic(l0(0x10..0x20));
        map.open_layer = Some(Arc::new(InMemoryLayer::create(
            conf,
            timeline_id,
            tenant_id,
            Lsn(0x20),
        )));

        match map.search(Key::user(1, 1), Lsn(0x31)) {
            Some(SearchResult {
                layer: SearchLayer::InMemory(_),
                lsn_floor,
            }) => assert_eq!(lsn_floor, Lsn(0x20)),
            other => panic!("unexpected {other:?}"),
        }
        let (layer, _) = persistent(map.search(Key::user(1, 1), Lsn(0x20)));
        assert_eq!(layer, l0(0x10..0x20));
    }

    #[test]
    fn image_layer_exists_requires_full_coverage() {
        let mut map = LayerMap::default();
        map.insert_historic(image(0..50, 0x30));
        map.insert_historic(image(40..100, 0x40));
        map.insert_historic(image(100..200, 0x10));

        let keys = |r: Range<u32>| Key::user(1, r.start)..Key::user(1, r.end);

        // union of two images within the LSN range
        assert!(map.image_layer_exists(&keys(0..100), &(Lsn(0x20)..Lsn(0x41))));
        // the second image is outside of the LSN range
        assert!(!map.image_layer_exists(&keys(0..100), &(Lsn(0x20)..Lsn(0x40))));
        // the third image is too old
        assert!(!map.image_layer_exists(&keys(0..200), &(Lsn(0x20)..Lsn(0x50))));
        assert!(map.image_layer_exists(&keys(0..200), &(Lsn(0x10)..Lsn(0x50))));
        // vacuously true
        assert!(map.image_layer_exists(&keys(5..5), &(Lsn(0x90)..Lsn(0x91))));
    }

    #[test]
    fn count_deltas_and_l0_tracking() {
        let mut map = LayerMap::default();
        map.insert_historic(l0(0x10..0x20));
        map.insert_historic(l0(0x20..0x30));
        map.insert_historic(delta(0..10, 0x30..0x40));
        map.insert_historic(image(0..10, 0x40));
        assert_eq!(map.level0_deltas().len(), 2);
        assert_eq!(map.historic_layer_count(), 4);

        let everything = Key::MIN..Key::MAX;
        let all_lsns = Lsn(0)..Lsn(0x50);
        assert_eq!(map.count_deltas(&everything, &all_lsns, None), 3);
        assert_eq!(map.count_deltas(&everything, &all_lsns, Some(2)), 2);

        // L0s don't count towards reimaging a partition
        let partition = Key::user(1, 0)..Key::user(1, 10);
        assert_eq!(map.count_deltas(&partition, &(Lsn(0)..Lsn(0x40)), None), 1);
        // nor do deltas below an image of the whole partition
        assert_eq!(map.count_deltas(&partition, &all_lsns, None), 0);

        map.remove_historic(&l0(0x10..0x20));
        assert_eq!(map.level0_deltas().len(), 1);
        assert_eq!(map.next_open_layer_start(), Some(Lsn(0x41)));
    }
}

//! An in-memory layer stores recently received key-value pairs.
//!
//! The open layer of a timeline accepts writes; once frozen, it waits to be written
//! out as a level 0 delta layer covering the whole key space.
//!
use crate::config::PageServerConf;
use crate::tenant::storage_layer::{ValueReconstructResult, ValueReconstructState};
use crate::tenant::timeline::Timeline;
use pageserver_api::key::Key;
use pageserver_api::models::InMemoryLayerInfo;
use pageserver_api::value::Value;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::*;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::{DeltaLayerWriter, ResidentLayer};

pub struct InMemoryLayer {
    conf: &'static PageServerConf,
    tenant_id: TenantId,
    timeline_id: TimelineId,

    /// This layer contains all the changes from 'start_lsn'. The
    /// start is inclusive.
    start_lsn: Lsn,

    /// Frozen layers have an exclusive end LSN.
    /// Writes are only allowed when this is `None`.
    end_lsn: OnceLock<Lsn>,

    inner: RwLock<InMemoryLayerInner>,
}

impl std::fmt::Debug for InMemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLayer")
            .field("start_lsn", &self.start_lsn)
            .field("end_lsn", &self.end_lsn)
            .finish()
    }
}

#[derive(Default)]
struct InMemoryLayerInner {
    /// All versions of all keys in the layer, ordered by LSN per key.
    index: BTreeMap<Key, Vec<(Lsn, Value)>>,

    /// Approximate size of the layer file it would be written to.
    size: u64,
}

impl InMemoryLayer {
    pub fn create(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        start_lsn: Lsn,
    ) -> InMemoryLayer {
        trace!("initializing new empty InMemoryLayer for writing on timeline {timeline_id} at {start_lsn}");
        InMemoryLayer {
            conf,
            tenant_id,
            timeline_id,
            start_lsn,
            end_lsn: OnceLock::new(),
            inner: RwLock::new(InMemoryLayerInner::default()),
        }
    }

    pub(crate) fn get_lsn_range(&self) -> Range<Lsn> {
        self.start_lsn..self.end_lsn_or_max()
    }

    fn end_lsn_or_max(&self) -> Lsn {
        self.end_lsn.get().copied().unwrap_or(Lsn::MAX)
    }

    pub(crate) fn info(&self) -> InMemoryLayerInfo {
        let lsn_start = self.start_lsn;
        match self.end_lsn.get() {
            Some(&lsn_end) => InMemoryLayerInfo::Frozen {
                lsn_start,
                lsn_end,
            },
            None => InMemoryLayerInfo::Open { lsn_start },
        }
    }

    pub(crate) async fn size(&self) -> u64 {
        self.inner.read().await.size
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.inner.read().await.index.is_empty()
    }

    /// Look up given value in the layer.
    pub(crate) async fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_state: &mut ValueReconstructState,
    ) -> ValueReconstructResult {
        let inner = self.inner.read().await;

        if let Some(versions) = inner.index.get(&key) {
            for (lsn, value) in versions.iter().rev() {
                if !lsn_range.contains(lsn) {
                    continue;
                }
                match value {
                    Value::Image(img) => {
                        reconstruct_state.img = Some((*lsn, img.clone()));
                        return ValueReconstructResult::Complete;
                    }
                    Value::WalRecord(rec) => {
                        reconstruct_state.records.push((*lsn, rec.clone()));
                    }
                }
            }
        }

        ValueReconstructResult::Continue
    }

    /// Adds the value to the layer. A second value for the same key and LSN replaces
    /// the first.
    pub(crate) async fn put_value(&self, key: Key, lsn: Lsn, val: &Value) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.end_lsn.get().is_none(),
            "cannot write to a frozen layer"
        );
        anyhow::ensure!(
            lsn >= self.start_lsn,
            "value at {lsn} is older than the layer start {}",
            self.start_lsn
        );
        let mut inner = self.inner.write().await;
        let versions = inner.index.entry(key).or_default();
        let size = val.serialized_size() as u64 + 18 + 8;
        match versions.binary_search_by_key(&lsn, |(l, _)| *l) {
            Ok(idx) => versions[idx].1 = val.clone(),
            Err(idx) => versions.insert(idx, (lsn, val.clone())),
        }
        inner.size += size;
        Ok(())
    }

    /// Records the end LSN of the layer. No more writes are accepted after this.
    pub(crate) async fn freeze(&self, end_lsn: Lsn) {
        // take the write lock so that no put_value is in the middle of writing
        let inner = self.inner.write().await;
        assert!(self.start_lsn < end_lsn);
        self.end_lsn
            .set(end_lsn)
            .expect("in-memory layer is frozen only once");
        for versions in inner.index.values() {
            for (lsn, _) in versions {
                assert!(*lsn < end_lsn);
            }
        }
    }

    /// Write this frozen in-memory layer to disk as a level 0 delta layer.
    ///
    /// Returns `None` if the layer holds no values.
    pub(crate) async fn write_to_disk(
        &self,
        timeline: &Arc<Timeline>,
    ) -> anyhow::Result<Option<ResidentLayer>> {
        let end_lsn = *self
            .end_lsn
            .get()
            .ok_or_else(|| anyhow::anyhow!("cannot write an open in-memory layer"))?;
        let inner = self.inner.read().await;
        if inner.index.is_empty() {
            return Ok(None);
        }

        let mut delta_layer_writer = DeltaLayerWriter::new(
            self.conf,
            self.timeline_id,
            self.tenant_id,
            Key::MIN,
            self.start_lsn..end_lsn,
        );
        for (key, versions) in inner.index.iter() {
            for (lsn, value) in versions {
                delta_layer_writer.put_value(*key, *lsn, value)?;
            }
        }

        let delta_layer = delta_layer_writer.finish(Key::MAX, timeline).await?;
        Ok(Some(delta_layer))
    }
}

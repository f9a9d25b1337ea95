use std::ops::Range;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use pageserver_api::key::Key;

use super::{DeltaLayerName, ImageLayerName, LayerName};

/// All the information needed to find a persistent layer and place it in a layer map,
/// without opening the file.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct PersistentLayerDesc {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub key_range: Range<Key>,
    /// For image layer, this is `[lsn, lsn+1)`.
    pub lsn_range: Range<Lsn>,
    /// Whether this is a delta layer.
    pub is_delta: bool,
    pub file_size: u64,
}

/// A unique identifier of a persistent layer within one timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistentLayerKey {
    pub key_range: Range<Key>,
    pub lsn_range: Range<Lsn>,
    pub is_delta: bool,
}

impl std::fmt::Display for PersistentLayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..{} {}..{} is_delta={}",
            self.key_range.start,
            self.key_range.end,
            self.lsn_range.start,
            self.lsn_range.end,
            self.is_delta
        )
    }
}

impl PersistentLayerDesc {
    pub fn key(&self) -> PersistentLayerKey {
        PersistentLayerKey {
            key_range: self.key_range.clone(),
            lsn_range: self.lsn_range.clone(),
            is_delta: self.is_delta,
        }
    }

    pub fn short_id(&self) -> String {
        self.layer_name().to_string()
    }

    pub fn new_img(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        key_range: Range<Key>,
        lsn: Lsn,
        file_size: u64,
    ) -> Self {
        Self {
            tenant_id,
            timeline_id,
            key_range,
            lsn_range: Self::image_layer_lsn_range(lsn),
            is_delta: false,
            file_size,
        }
    }

    pub fn new_delta(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        key_range: Range<Key>,
        lsn_range: Range<Lsn>,
        file_size: u64,
    ) -> Self {
        Self {
            tenant_id,
            timeline_id,
            key_range,
            lsn_range,
            is_delta: true,
            file_size,
        }
    }

    pub fn from_filename(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        filename: LayerName,
        file_size: u64,
    ) -> Self {
        match filename {
            LayerName::Image(i) => {
                Self::new_img(tenant_id, timeline_id, i.key_range, i.lsn, file_size)
            }
            LayerName::Delta(d) => Self::new_delta(
                tenant_id,
                timeline_id,
                d.key_range,
                d.lsn_range,
                file_size,
            ),
        }
    }

    /// Get the LSN that the image layer covers.
    pub fn image_layer_lsn(&self) -> Lsn {
        assert!(!self.is_delta);
        assert!(self.lsn_range.start + 1 == self.lsn_range.end);
        self.lsn_range.start
    }

    /// Get the LSN range corresponding to a single image layer LSN.
    pub fn image_layer_lsn_range(lsn: Lsn) -> Range<Lsn> {
        lsn..(lsn + 1)
    }

    pub fn layer_name(&self) -> LayerName {
        if self.is_delta {
            DeltaLayerName {
                key_range: self.key_range.clone(),
                lsn_range: self.lsn_range.clone(),
            }
            .into()
        } else {
            ImageLayerName {
                key_range: self.key_range.clone(),
                lsn: self.image_layer_lsn(),
            }
            .into()
        }
    }

    /// Level 0 deltas are the output of checkpoints: they span the whole key space.
    pub fn is_l0(&self) -> bool {
        self.is_delta && self.key_range == (Key::MIN..Key::MAX)
    }

    pub fn get_key_range(&self) -> Range<Key> {
        self.key_range.clone()
    }

    pub fn get_lsn_range(&self) -> Range<Lsn> {
        self.lsn_range.clone()
    }

    pub fn is_delta(&self) -> bool {
        self.is_delta
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

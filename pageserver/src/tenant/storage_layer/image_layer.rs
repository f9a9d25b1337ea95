//! An ImageLayer represents an image or a snapshot of a key-range at one
//! particular LSN. It contains an image of all key-value pairs in its key-range.
//! Any key that falls into the image layer's range but does not exist in the
//! layer does not exist.
//!
//! An image layer is stored in a file on disk. The file is stored in
//! timelines/<timeline_id> directory.  Currently, there are no
//! subdirectories, and each image layer file is named like this:
//!
//! ```text
//!    <key start>-<key end>__<LSN>
//! ```
//!
use crate::config::PageServerConf;
use crate::tenant::blob_io::{read_layer_file, BlobWriter, IMAGE_FILE_MAGIC};
use crate::tenant::storage_layer::{
    LayerFileError, PersistentLayerDesc, ResidentLayer, ValueReconstructResult,
    ValueReconstructState,
};
use crate::tenant::timeline::Timeline;
use bytes::Bytes;
use camino::Utf8Path;
use pageserver_api::key::Key;
use pageserver_api::value::Value;
use std::ops::Range;
use std::sync::Arc;

use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::delta_layer::{temp_path_for, write_and_finish};

///
/// A builder object for constructing a new image layer.
///
/// Keys must be written in ascending order.
pub struct ImageLayerWriter {
    conf: &'static PageServerConf,
    tenant_id: TenantId,
    timeline_id: TimelineId,
    key_range: Range<Key>,
    lsn: Lsn,
    last_key: Option<Key>,

    blob_writer: BlobWriter,
}

impl ImageLayerWriter {
    pub fn new(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        key_range: &Range<Key>,
        lsn: Lsn,
    ) -> ImageLayerWriter {
        let lsn_range = PersistentLayerDesc::image_layer_lsn_range(lsn);
        ImageLayerWriter {
            conf,
            tenant_id,
            timeline_id,
            key_range: key_range.clone(),
            lsn,
            last_key: None,
            blob_writer: BlobWriter::new(IMAGE_FILE_MAGIC, key_range.start, &lsn_range),
        }
    }

    ///
    /// Write next value to the file.
    ///
    pub fn put_image(&mut self, key: Key, img: Bytes) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.key_range.contains(&key),
            "key {key} is outside of the image layer range"
        );
        if let Some(last_key) = self.last_key {
            anyhow::ensure!(last_key < key, "keys must be appended in order");
        }
        self.last_key = Some(key);
        self.blob_writer.append(key, self.lsn, &Value::Image(img));
        Ok(())
    }

    pub fn num_keys(&self) -> u64 {
        self.blob_writer.count()
    }

    ///
    /// Finish writing the image layer.
    ///
    pub async fn finish(self, timeline: &Arc<Timeline>) -> anyhow::Result<ResidentLayer> {
        let lsn_range = PersistentLayerDesc::image_layer_lsn_range(self.lsn);
        let temp_path = temp_path_for(
            self.conf,
            &self.tenant_id,
            &self.timeline_id,
            self.key_range.start,
            &lsn_range,
        );
        let contents = self.blob_writer.finish(self.key_range.end);
        let desc = PersistentLayerDesc::new_img(
            self.tenant_id,
            self.timeline_id,
            self.key_range,
            self.lsn,
            contents.len() as u64,
        );
        write_and_finish(self.conf, timeline, desc, temp_path, contents).await
    }
}

/// The contents of an image layer file, loaded into memory.
pub struct ImageLayerInner {
    lsn: Lsn,
    images: Vec<(Key, Bytes)>,
}

impl std::fmt::Debug for ImageLayerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLayerInner")
            .field("lsn", &self.lsn)
            .field("images", &self.images.len())
            .finish()
    }
}

impl ImageLayerInner {
    pub(crate) async fn load(
        path: &Utf8Path,
        desc: &PersistentLayerDesc,
    ) -> Result<Self, LayerFileError> {
        let file = tokio::fs::read(path).await?;
        if file.len() as u64 != desc.file_size {
            return Err(LayerFileError::Corrupted(format!(
                "expected {} bytes, found {}",
                desc.file_size,
                file.len()
            )));
        }
        let (header, records) = read_layer_file(&file, IMAGE_FILE_MAGIC)?;
        if header.key_range != desc.key_range || header.lsn_range != desc.lsn_range {
            return Err(LayerFileError::Corrupted(
                "header does not match the file name".to_string(),
            ));
        }
        let lsn = desc.image_layer_lsn();
        let mut images = Vec::with_capacity(records.len());
        for (key, record_lsn, value) in records {
            match value {
                Value::Image(img) if record_lsn == lsn => images.push((key, img)),
                _ => {
                    return Err(LayerFileError::Corrupted(format!(
                        "unexpected record for key {key} at {record_lsn}"
                    )))
                }
            }
        }
        if !images.windows(2).all(|w| w[0].0 < w[1].0) {
            return Err(LayerFileError::Corrupted(
                "keys are not sorted".to_string(),
            ));
        }
        Ok(ImageLayerInner { lsn, images })
    }

    pub(crate) fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_state: &mut ValueReconstructState,
    ) -> ValueReconstructResult {
        debug_assert!(lsn_range.contains(&self.lsn));
        match self.images.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(idx) => {
                reconstruct_state.img = Some((self.lsn, self.images[idx].1.clone()));
                ValueReconstructResult::Complete
            }
            Err(_) => ValueReconstructResult::Missing,
        }
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.images.iter().map(|(k, _)| *k)
    }
}

//! A DeltaLayer represents a collection of WAL records or page images in a range of
//! LSNs, and in a range of Keys. It is stored on a file on disk.
//!
//! Usually a delta layer only contains differences, in the form of WAL records
//! against a base LSN. However, if a key is created within the LSN range, there is
//! no base for it and its oldest entry is an image.
//!
//! The delta files are stored in `timelines/<timeline_id>` directory. Currently,
//! there are no subdirectories, and each delta file is named like this:
//!
//! ```text
//!    <key start>-<key end>__<start LSN>-<end LSN>
//! ```
//!
//! Records are kept sorted by key, then LSN. See [`crate::tenant::blob_io`] for the
//! file format.
//!
use crate::config::PageServerConf;
use crate::tenant::blob_io::{read_layer_file, BlobWriter, DELTA_FILE_MAGIC};
use crate::tenant::storage_layer::{
    LayerFileError, PersistentLayerDesc, ResidentLayer, ValueReconstructResult,
    ValueReconstructState,
};
use crate::tenant::timeline::Timeline;
use crate::TEMP_FILE_SUFFIX;
use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use pageserver_api::key::Key;
use pageserver_api::value::Value;
use rand::{distributions::Alphanumeric, Rng};
use std::ops::Range;
use std::sync::Arc;
use tracing::*;

use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::layer::Layer;

pub(crate) fn temp_path_for(
    conf: &PageServerConf,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    key_start: Key,
    lsn_range: &Range<Lsn>,
) -> Utf8PathBuf {
    let rand_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    conf.timeline_path(tenant_id, timeline_id).join(format!(
        "{}-XXX__{:016X}-{:016X}.{}.{}",
        key_start,
        u64::from(lsn_range.start),
        u64::from(lsn_range.end),
        rand_string,
        TEMP_FILE_SUFFIX,
    ))
}

/// Writes the file to a temporary path, syncs it and hands it over to [`Layer::finish_creating`].
pub(super) async fn write_and_finish(
    conf: &'static PageServerConf,
    timeline: &Arc<Timeline>,
    desc: PersistentLayerDesc,
    temp_path: Utf8PathBuf,
    contents: bytes::Bytes,
) -> anyhow::Result<ResidentLayer> {
    let guard = scopeguard::guard(temp_path.clone(), |path| {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove temporary layer file {path}: {e}");
            }
        }
    });

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .with_context(|| format!("create temporary layer file {temp_path}"))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, &contents)
        .await
        .with_context(|| format!("write temporary layer file {temp_path}"))?;
    file.sync_all()
        .await
        .with_context(|| format!("fsync temporary layer file {temp_path}"))?;
    drop(file);

    let layer = Layer::finish_creating(conf, timeline, desc, &temp_path).await?;
    // renamed away
    scopeguard::ScopeGuard::into_inner(guard);
    Ok(layer)
}

/// A builder object for constructing a new delta layer.
///
/// Usage:
///
/// 1. Create the DeltaLayerWriter by calling DeltaLayerWriter::new(...)
///
/// 2. Write the contents by calling `put_value` for every page
///    version to store in the layer, ordered by key and LSN.
///
/// 3. Call `finish`.
///
pub struct DeltaLayerWriter {
    conf: &'static PageServerConf,
    tenant_id: TenantId,
    timeline_id: TimelineId,
    key_start: Key,
    lsn_range: Range<Lsn>,
    last: Option<(Key, Lsn)>,

    blob_writer: BlobWriter,
}

impl DeltaLayerWriter {
    pub fn new(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        key_start: Key,
        lsn_range: Range<Lsn>,
    ) -> Self {
        assert!(lsn_range.start < lsn_range.end);
        DeltaLayerWriter {
            conf,
            tenant_id,
            timeline_id,
            key_start,
            blob_writer: BlobWriter::new(DELTA_FILE_MAGIC, key_start, &lsn_range),
            lsn_range,
            last: None,
        }
    }

    ///
    /// Append a key-value pair to the file.
    ///
    /// The values must be appended in key, lsn order.
    ///
    pub fn put_value(&mut self, key: Key, lsn: Lsn, val: &Value) -> anyhow::Result<()> {
        anyhow::ensure!(
            key >= self.key_start && self.lsn_range.contains(&lsn),
            "value at {key}@{lsn} is outside of the layer"
        );
        if let Some(last) = self.last {
            anyhow::ensure!(last < (key, lsn), "values must be appended in key, lsn order");
        }
        self.last = Some((key, lsn));
        self.blob_writer.append(key, lsn, val);
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.blob_writer.size()
    }

    pub fn num_values(&self) -> u64 {
        self.blob_writer.count()
    }

    ///
    /// Finish writing the delta layer.
    ///
    pub async fn finish(
        self,
        key_end: Key,
        timeline: &Arc<Timeline>,
    ) -> anyhow::Result<ResidentLayer> {
        if let Some((last_key, _)) = self.last {
            anyhow::ensure!(last_key < key_end, "key_end must be past the last key");
        }
        let temp_path = temp_path_for(
            self.conf,
            &self.tenant_id,
            &self.timeline_id,
            self.key_start,
            &self.lsn_range,
        );
        let contents = self.blob_writer.finish(key_end);
        let desc = PersistentLayerDesc::new_delta(
            self.tenant_id,
            self.timeline_id,
            self.key_start..key_end,
            self.lsn_range,
            contents.len() as u64,
        );
        write_and_finish(self.conf, timeline, desc, temp_path, contents).await
    }
}

/// The contents of a delta layer file, loaded into memory.
pub struct DeltaLayerInner {
    records: Vec<(Key, Lsn, Value)>,
}

impl std::fmt::Debug for DeltaLayerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaLayerInner")
            .field("records", &self.records.len())
            .finish()
    }
}

impl DeltaLayerInner {
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
        let (header, records) = read_layer_file(&file, DELTA_FILE_MAGIC)?;
        if header.key_range != desc.key_range || header.lsn_range != desc.lsn_range {
            return Err(LayerFileError::Corrupted(format!(
                "header {}..{} {}..{} does not match the file name",
                header.key_range.start,
                header.key_range.end,
                header.lsn_range.start,
                header.lsn_range.end
            )));
        }
        let in_order = records
            .windows(2)
            .all(|w| (w[0].0, w[0].1) < (w[1].0, w[1].1));
        if !in_order {
            return Err(LayerFileError::Corrupted(
                "records are not sorted by key and lsn".to_string(),
            ));
        }
        Ok(DeltaLayerInner { records })
    }

    /// Collects the versions of `key` within `lsn_range`, newest first, stopping at
    /// the first image.
    pub(crate) fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_state: &mut ValueReconstructState,
    ) -> ValueReconstructResult {
        let start = self
            .records
            .partition_point(|(k, l, _)| (*k, *l) < (key, lsn_range.start));
        let end = self
            .records
            .partition_point(|(k, l, _)| (*k, *l) < (key, lsn_range.end));

        for (_, lsn, value) in self.records[start..end].iter().rev() {
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
        ValueReconstructResult::Continue
    }

    /// All records, sorted by key and LSN.
    pub(crate) fn records(&self) -> &[(Key, Lsn, Value)] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn inner(records: Vec<(Key, Lsn, Value)>) -> DeltaLayerInner {
        DeltaLayerInner { records }
    }

    #[test]
    fn reconstruct_stops_at_image() {
        let key = Key::user(1, 1);
        let layer = inner(vec![
            (key, Lsn(0x10), Value::Image(Bytes::from_static(b"a"))),
            (key, Lsn(0x20), Value::WalRecord(Bytes::from_static(b"b"))),
            (key, Lsn(0x30), Value::WalRecord(Bytes::from_static(b"c"))),
            (key.next(), Lsn(0x10), Value::Image(Bytes::from_static(b"x"))),
        ]);

        let mut state = ValueReconstructState::default();
        let res = layer.get_value_reconstruct_data(key, Lsn(0x10)..Lsn(0x31), &mut state);
        assert_eq!(res, ValueReconstructResult::Complete);
        assert_eq!(state.img, Some((Lsn(0x10), Bytes::from_static(b"a"))));
        assert_eq!(
            state.records.iter().map(|(lsn, _)| *lsn).collect::<Vec<_>>(),
            vec![Lsn(0x30), Lsn(0x20)]
        );

        // the image is below the requested range
        let mut state = ValueReconstructState::default();
        let res = layer.get_value_reconstruct_data(key, Lsn(0x11)..Lsn(0x25), &mut state);
        assert_eq!(res, ValueReconstructResult::Continue);
        assert_eq!(state.records.len(), 1);
        assert!(state.img.is_none());
    }
}

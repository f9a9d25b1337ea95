//! Common traits and structs for layers

pub mod delta_layer;
pub mod image_layer;
pub(crate) mod inmemory_layer;
pub(crate) mod layer;
mod layer_desc;
mod layer_name;

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use utils::lsn::Lsn;

pub use delta_layer::{DeltaLayerInner, DeltaLayerWriter};
pub use image_layer::{ImageLayerInner, ImageLayerWriter};
pub use inmemory_layer::InMemoryLayer;
pub use layer::{Layer, ResidentLayer};
pub use layer_desc::{PersistentLayerDesc, PersistentLayerKey};
pub use layer_name::{DeltaLayerName, ImageLayerName, LayerName};

pub fn range_overlaps<T>(a: &Range<T>, b: &Range<T>) -> bool
where
    T: PartialOrd<T>,
{
    if a.start < b.start {
        a.end > b.start
    } else {
        b.end > a.start
    }
}

/// Struct used to communicate across calls to 'get_value_reconstruct_data'.
///
/// When get_value_reconstruct_data returns Complete, 'img' is set to an image
/// of the value. If it returns Continue, some 'records' may have been collected
/// but there are more records outside the current layer. Pass the same
/// ValueReconstructState struct in the next call to collect more records.
///
/// Records are collected newest first.
#[derive(Debug, Default)]
pub struct ValueReconstructState {
    pub records: Vec<(Lsn, Bytes)>,
    pub img: Option<(Lsn, Bytes)>,
}

/// Return value from Layer::get_value_reconstruct_data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueReconstructResult {
    /// Got all the data needed to reconstruct the requested value
    Complete,
    /// This layer didn't contain all the required data, the caller should look up
    /// the predecessor layer and collect more data from there.
    Continue,
    /// An image layer covering the key has no value for it: the key does not
    /// exist at that LSN.
    Missing,
}

/// Failure to read a layer file that is present locally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LayerFileError {
    /// The file does not pass verification. Retrying does not help.
    #[error("layer file is corrupted: {0}")]
    Corrupted(String),
    #[error("failed to read layer file: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for LayerFileError {
    fn from(e: std::io::Error) -> Self {
        LayerFileError::Io(Arc::new(e))
    }
}

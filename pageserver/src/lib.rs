#![deny(clippy::undocumented_unsafe_blocks)]

pub mod config;
pub mod failpoint_support;
pub mod metrics;
pub mod mgmt_api;
pub mod pgdatadir_mapping;
pub mod tenant;

/// Suffix of files being written before they are renamed into place.
pub const TEMP_FILE_SUFFIX: &str = "___temp";

/// Whether the file is a leftover of an interrupted write or download and can be removed.
pub fn is_temporary(path: &camino::Utf8Path) -> bool {
    let is_temp_file = match path.file_name() {
        Some(name) => name.ends_with(TEMP_FILE_SUFFIX),
        None => false,
    };
    is_temp_file || tenant::remote_timeline_client::is_temp_download_file(path)
}

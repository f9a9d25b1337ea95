#![deny(clippy::undocumented_unsafe_blocks)]
//! Types shared between the storage engine and its management clients.

pub mod key;
pub mod models;
pub mod value;

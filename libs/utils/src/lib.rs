//! `utils` is intended to be a place to put code that is shared
//! between the pageserver crates and their supporting libraries.
#![deny(clippy::undocumented_unsafe_blocks)]

/// `Lsn` type implements common tasks on Log Sequence Numbers
pub mod lsn;

/// Tenant and timeline identifiers
pub mod id;

/// Retries with exponential backoff
pub mod backoff;

/// fsync and durable rename helpers
pub mod crashsafe;

pub mod logging;

pub mod sync;

#![deny(clippy::all, warnings)]

//! Content-addressed disk cache with an integrity-verifying garbage
//! collector.
//!
//! Blobs live in a content store at digest-derived paths; a bucket-file
//! index maps user keys to digests plus caller metadata. [`Cache::verify`]
//! re-derives a consistent cache from an inconsistent one: it sweeps the
//! scratch directory, rebuilds the index from surviving bucket records,
//! deletes unreferenced or corrupt content, and returns accounting stats.

mod cache;
mod integrity;

pub use cache::{Cache, CacheError, Entry, EntryFilter, PutOptions, VerifyOptions, VerifyStats};
pub use integrity::{Algorithm, Digest, Integrity};

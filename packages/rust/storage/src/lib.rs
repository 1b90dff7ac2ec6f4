//! On-disk caches for quire.
//!
//! Two tiers, both plain files inside the project:
//! - [`ChecksumStore`]: `_build/checksums.json`, source path → content hash
//! - [`NotebookCache`]: `_nbcache/<group-hash>.json`, executed notebook groups

pub mod checksums;
pub mod notebook_cache;

pub use checksums::ChecksumStore;
pub use notebook_cache::NotebookCache;

//! # Media Cache Module
//!
//! Content-addressed on-disk cache for downloaded audio.
//!
//! Every downloaded track is stored under the cache directory, keyed by the
//! normalized source key. A JSON index next to the files records size,
//! creation time, last access and the retain flag, so the cache survives
//! restarts without rescanning the directory.
//!
//! ## Eviction Policy
//!
//! - **Size pressure**: when the total size of non-retained entries exceeds
//!   `STORAGE_LIMIT_BYTES`, entries are evicted strictly least-recently-used
//!   first until the limit is satisfied.
//! - **Age**: any non-retained entry older than `STORAGE_LIMIT_DAYS` is
//!   evicted regardless of size pressure.
//! - A limit of zero disables that constraint.
//! - Entries flagged `retain` (autoplaylist media, when configured) are
//!   never evicted.
//! - File deletion is best-effort: a failed deletion keeps the index entry
//!   and is retried on the next eviction pass.
//!
//! ## Concurrency
//!
//! The index is shared by every guild actor. Mutations are atomic per key;
//! reads of unrelated keys never block each other.

pub mod media_cache;

pub use media_cache::{CacheEntryMeta, CacheStats, MediaCache};

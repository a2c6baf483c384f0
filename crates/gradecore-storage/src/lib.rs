//! Content-addressed blob storage (C2) and the read-through file cacher built
//! on top of it (C3).
//!
//! Blobs are immutable once committed and keyed by their SHA-1 digest (see
//! [`gradecore_digest`]). The store optionally wraps writes in an LZ4 frame;
//! the file cacher gives each task its own scratch directory backed by the
//! shared store, tolerating the scratch directory being wiped out from under
//! it at any time.

pub mod blobstore;
pub mod compression;
pub mod error;
pub mod filecacher;
pub mod metadata;

pub use blobstore::{BlobStore, PendingBlob};
pub use error::Error;
pub use filecacher::{FileCacher, PrecacheLock};
pub use metadata::{CompressionMetadata, COMPRESSION_KEY};

//! Per-blob structured metadata, stored alongside blob content but not part of
//! its digest.

use serde::{Deserialize, Serialize};

/// The well-known `compression` metadata key.
pub const COMPRESSION_KEY: &str = "compression";

/// Value stored under the `compression` metadata key when a blob is stored
/// LZ4-compressed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressionMetadata {
    /// The compression level the blob was written at.
    pub compression_level: i32,
}

//! Streaming SHA-1 digesting, matching the wire digest used throughout gradecore.
//!
//! A [`Digest`] is the 40-character lowercase hex SHA-1 of a byte stream. Everything
//! above this crate (blob store, cache keys, fingerprints) treats that string as an
//! opaque value; this crate is the only place that knows how it is computed.

pub mod error;

use std::io::Read;
use std::path::Path;

pub use error::Error;

/// Default chunk size used when streaming bytes into a [`Digester`].
///
/// Only affects throughput; the resulting digest is a pure function of the byte
/// stream regardless of how it is chunked.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// The sentinel digest value denoting a tombstoned blob.
///
/// Any read against this value must fail with a distinguished error; any write or
/// delete against it is a no-op. It is never the real output of [`Digester::finish`]
/// because a real SHA-1 hex digest is always 40 characters.
pub const TOMBSTONE: &str = "x";

/// Returns `true` if `digest` is the tombstone sentinel.
#[must_use]
pub fn is_tombstone(digest: &str) -> bool {
    digest == TOMBSTONE
}

/// Incremental SHA-1 hasher producing lowercase hex digests.
///
/// Thin wrapper around `sha1::Sha1` so callers never import the hashing crate
/// directly; the algorithm choice is an implementation detail of this module.
#[derive(Debug, Default, Clone)]
pub struct Digester {
    hasher: sha1::Sha1,
}

impl Digester {
    /// Creates a fresh digester with no bytes consumed yet.
    #[must_use]
    pub fn new() -> Self {
        use sha1::Digest as _;
        Self {
            hasher: sha1::Sha1::new(),
        }
    }

    /// Feeds `bytes` into the running hash state.
    pub fn update(&mut self, bytes: &[u8]) {
        use sha1::Digest as _;
        self.hasher.update(bytes);
    }

    /// Consumes the digester and returns the final lowercase hex digest.
    #[must_use]
    pub fn finish(self) -> String {
        use sha1::Digest as _;
        hex::encode(self.hasher.finalize())
    }
}

/// Streams `reader` in `chunk_size`-sized reads into `digester`.
///
/// Does not finalize `digester`; callers that want the digest call
/// [`Digester::finish`] afterwards. Exists separately from [`digest_reader`] so a
/// caller can digest several readers into one logical digester (e.g. concatenated
/// parts of a multipart upload).
pub fn digest_cooperatively_into_digester<R: Read>(
    mut reader: R,
    digester: &mut Digester,
    chunk_size: usize,
) -> std::io::Result<()> {
    let mut buf = vec![0_u8; chunk_size];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
    }
    Ok(())
}

/// Digests `reader` in full, using [`DEFAULT_CHUNK_SIZE`]-sized reads, and returns
/// the final hex digest.
pub fn digest_reader<R: Read>(reader: R) -> std::io::Result<String> {
    digest_reader_with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
}

/// Like [`digest_reader`] but with an explicit chunk size.
pub fn digest_reader_with_chunk_size<R: Read>(
    reader: R,
    chunk_size: usize,
) -> std::io::Result<String> {
    let mut digester = Digester::new();
    digest_cooperatively_into_digester(reader, &mut digester, chunk_size)?;
    Ok(digester.finish())
}

/// Digests the contents of `bytes` directly, without streaming.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut digester = Digester::new();
    digester.update(bytes);
    digester.finish()
}

/// Opens `path` and digests its full contents.
pub fn digest_file(path: impl AsRef<Path>) -> Result<String, Error> {
    let path = path.as_ref();
    let file =
        std::fs::File::open(path).map_err(|source| Error::io(source, path, "opening file"))?;
    digest_reader(file).map_err(|source| Error::io(source, path, "reading file"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write as _;

    #[test]
    fn empty_input_matches_known_sha1() {
        // SHA-1("") is a well-known constant.
        assert_eq!(digest_bytes(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn tombstone_is_not_a_valid_digest_shape() {
        assert_ne!(TOMBSTONE.len(), 40);
        assert!(is_tombstone(TOMBSTONE));
        assert!(!is_tombstone(&digest_bytes(b"")));
    }

    #[test]
    fn digest_file_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").expect("write");
        assert_eq!(digest_file(&path).expect("digest"), digest_bytes(b"hello world"));
    }

    #[test]
    fn digest_file_missing_is_io_error() {
        let err = digest_file("/nonexistent/path/does/not/exist").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    proptest! {
        /// Digest is a pure function of the bytes: chunk size must never change it.
        #[test]
        fn digest_is_stable_across_chunk_sizes(data: Vec<u8>, chunk_size in 1_usize..4096) {
            let whole = digest_bytes(&data);
            let mut cursor = std::io::Cursor::new(&data);
            let chunked = digest_reader_with_chunk_size(&mut cursor, chunk_size).expect("digest");
            prop_assert_eq!(whole, chunked);
        }

        /// Digest output is always 40 lowercase hex characters.
        #[test]
        fn digest_output_shape(data: Vec<u8>) {
            let d = digest_bytes(&data);
            prop_assert_eq!(d.len(), 40);
            prop_assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn digest_cooperatively_handles_multi_chunk_streams() {
        let mut data = Vec::new();
        for i in 0..3000u32 {
            data.extend_from_slice(&i.to_le_bytes());
        }
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        file.write_all(&data).expect("write");
        let digest = digest_file(file.path()).expect("digest");
        assert_eq!(digest, digest_bytes(&data));
    }
}

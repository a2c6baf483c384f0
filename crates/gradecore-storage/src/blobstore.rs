//! Content-addressed, immutable blob storage with optional transparent LZ4
//! compression and per-blob structured metadata.
//!
//! Layout on disk: blobs live at `<root>/<digest>`; metadata lives at
//! `<root>/.metadata/<digest>__<key>.json`, one JSON object per `(digest, key)`
//! pair.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::{NamedTempFile, TempPath};

use crate::compression::{compressing_writer, decompressing_reader};
use crate::error::Error;
use crate::metadata::{CompressionMetadata, COMPRESSION_KEY};

/// Bounded depth when following a chain of symlinks in [`BlobStore::filename_from_symlink`].
const MAX_SYMLINK_DEPTH: usize = 100;

/// A content-addressed store of immutable blobs.
pub struct BlobStore {
    root: PathBuf,
}

/// A writable handle returned by [`BlobStore::create`], not yet visible under its
/// digest until [`BlobStore::commit`] succeeds.
pub struct PendingBlob {
    digest: String,
    temp_path: TempPath,
    writer: PendingWriter,
    compression_level: Option<i32>,
}

enum PendingWriter {
    Raw(File),
    Compressed(lz4_flex::frame::FrameEncoder<File>),
}

impl Write for PendingBlob {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.writer {
            PendingWriter::Raw(f) => f.write(buf),
            PendingWriter::Compressed(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.writer {
            PendingWriter::Raw(f) => f.flush(),
            PendingWriter::Compressed(enc) => enc.flush(),
        }
    }
}

impl BlobStore {
    /// Opens (creating if necessary) a blob store rooted at `root`.
    #[tracing::instrument(skip_all)]
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "creating store root"))?;
        let metadata_dir = root.join(".metadata");
        std::fs::create_dir_all(&metadata_dir)
            .map_err(|e| Error::io(e, &metadata_dir, "creating metadata directory"))?;
        Ok(Self { root })
    }

    /// The root directory this store was opened with.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    fn metadata_path(&self, digest: &str, key: &str) -> PathBuf {
        self.root.join(".metadata").join(format!("{digest}__{key}.json"))
    }

    fn reject_tombstone(digest: &str) -> Result<(), Error> {
        if gradecore_digest::is_tombstone(digest) {
            return Err(Error::Tombstone);
        }
        Ok(())
    }

    /// Returns `true` if a blob exists under `digest`.
    pub fn exists(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Opens a streaming reader over the blob at `digest`, transparently
    /// decompressing if it was stored compressed.
    pub fn get(&self, digest: &str) -> Result<Box<dyn Read>, Error> {
        Self::reject_tombstone(digest)?;
        let path = self.blob_path(digest);
        if !path.is_file() {
            return Err(Error::NotFound {
                digest: digest.to_string(),
            });
        }
        let file = File::open(&path).map_err(|e| Error::io(e, &path, "opening blob"))?;
        if self.get_metadata::<CompressionMetadata>(digest, COMPRESSION_KEY)?.is_some() {
            Ok(Box::new(decompressing_reader(file)))
        } else {
            Ok(Box::new(file))
        }
    }

    /// Begins writing a new blob under `digest`.
    ///
    /// Returns `Ok(None)` if a blob with this digest already exists; the caller
    /// should discard its payload rather than recomputing it. `compress`
    /// controls whether the handle transparently LZ4-encodes writes.
    pub fn create(&self, digest: &str, compress: bool, compression_level: i32) -> Result<Option<PendingBlob>, Error> {
        Self::reject_tombstone(digest)?;
        if self.exists(digest) {
            return Ok(None);
        }
        let named = NamedTempFile::new_in(&self.root)
            .map_err(|e| Error::io(e, &self.root, "creating temp file"))?;
        let (file, temp_path) = named.into_parts();
        let writer = if compress {
            PendingWriter::Compressed(compressing_writer(file))
        } else {
            PendingWriter::Raw(file)
        };
        Ok(Some(PendingBlob {
            digest: digest.to_string(),
            temp_path,
            writer,
            compression_level: compress.then_some(compression_level),
        }))
    }

    /// Finalizes `pending`: flushes, writes metadata, and atomically renames the
    /// temp file into place. Returns `false` (without error) if a concurrent
    /// committer won the race for the same digest.
    #[tracing::instrument(skip_all, fields(digest = %pending.digest))]
    pub fn commit(
        &self,
        pending: PendingBlob,
        extra_metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<bool, Error> {
        let PendingBlob {
            digest,
            temp_path,
            writer,
            compression_level,
        } = pending;

        let file = match writer {
            PendingWriter::Raw(f) => f,
            PendingWriter::Compressed(enc) => enc
                .finish()
                .map_err(|e| Error::io(std::io::Error::other(e), &temp_path, "finishing lz4 frame"))?,
        };
        file.sync_all()
            .map_err(|e| Error::io(e, &temp_path, "syncing blob to disk"))?;
        drop(file);

        if self.exists(&digest) {
            // Another committer won the race; our temp file is discarded on drop.
            return Ok(false);
        }

        let final_path = self.blob_path(&digest);
        temp_path
            .persist(&final_path)
            .map_err(|e| Error::io(e.error, &final_path, "renaming blob into place"))?;

        if let Some(level) = compression_level {
            self.set_metadata(
                &digest,
                COMPRESSION_KEY,
                Some(&CompressionMetadata {
                    compression_level: level,
                }),
            )?;
        }
        for (key, value) in extra_metadata {
            self.set_raw_metadata(&digest, &key, Some(value))?;
        }
        Ok(true)
    }

    /// Stores, updates, or deletes (`value = None`) one metadata entry.
    ///
    /// Fails with [`Error::NotFound`] if `digest` is absent. Deleting a missing
    /// entry is silent.
    pub fn set_metadata<T: Serialize>(
        &self,
        digest: &str,
        key: &str,
        value: Option<&T>,
    ) -> Result<(), Error> {
        let json = value
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Metadata {
                digest: digest.to_string(),
                key: key.to_string(),
                message: e.to_string(),
            })?;
        self.set_raw_metadata(digest, key, json)
    }

    fn set_raw_metadata(
        &self,
        digest: &str,
        key: &str,
        value: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        if !self.exists(digest) {
            return Err(Error::NotFound {
                digest: digest.to_string(),
            });
        }
        let path = self.metadata_path(digest, key);
        match value {
            Some(v) => {
                let bytes = serde_json::to_vec_pretty(&v).map_err(|e| Error::Metadata {
                    digest: digest.to_string(),
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
                std::fs::write(&path, bytes).map_err(|e| Error::io(e, &path, "writing metadata"))?;
            }
            None => {
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| Error::io(e, &path, "deleting metadata"))?;
                }
            }
        }
        Ok(())
    }

    /// Returns the typed metadata value at `(digest, key)`, or `None` if absent.
    pub fn get_metadata<T: DeserializeOwned>(&self, digest: &str, key: &str) -> Result<Option<T>, Error> {
        let path = self.metadata_path(digest, key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| Error::io(e, &path, "reading metadata"))?;
        let value = serde_json::from_slice(&bytes).map_err(|e| Error::Metadata {
            digest: digest.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(value))
    }

    /// Lists every digest currently present in the store.
    pub fn list(&self) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|e| Error::io(e, &self.root, "listing store"))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e, &self.root, "listing store"))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == ".metadata" {
                continue;
            }
            if entry.path().is_file() {
                out.push(name.into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Returns the size in bytes of the blob at `digest` (compressed size if
    /// stored compressed, matching what is actually on disk).
    pub fn get_size(&self, digest: &str) -> Result<u64, Error> {
        let path = self.blob_path(digest);
        let meta = std::fs::metadata(&path).map_err(|_| Error::NotFound {
            digest: digest.to_string(),
        })?;
        Ok(meta.len())
    }

    /// Deletes the blob and all of its metadata. A delete against a tombstone or
    /// a missing digest is a no-op.
    #[tracing::instrument(skip(self))]
    pub fn delete(&self, digest: &str) -> Result<(), Error> {
        if gradecore_digest::is_tombstone(digest) {
            return Ok(());
        }
        let path = self.blob_path(digest);
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|e| Error::io(e, &path, "deleting blob"))?;
        }
        let metadata_dir = self.root.join(".metadata");
        if let Ok(entries) = std::fs::read_dir(&metadata_dir) {
            let prefix = format!("{digest}__");
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    /// Re-hashes the blob at `digest` and compares against the digest itself,
    /// detecting on-disk corruption. Transparently decompresses first.
    pub fn verify(&self, digest: &str) -> Result<bool, Error> {
        let reader = self.get(digest)?;
        let actual = gradecore_digest::digest_reader(reader).map_err(|e| {
            Error::io(e, self.blob_path(digest), "re-hashing blob for integrity check")
        })?;
        Ok(actual == digest)
    }

    /// Returns a host path suitable for symlinking into a scratch directory, or
    /// `None` when the blob is stored compressed (a symlink would expose
    /// compressed bytes to the consumer).
    pub fn path_for_symlink(&self, digest: &str) -> Result<Option<PathBuf>, Error> {
        if !self.exists(digest) {
            return Err(Error::NotFound {
                digest: digest.to_string(),
            });
        }
        if self.get_metadata::<CompressionMetadata>(digest, COMPRESSION_KEY)?.is_some() {
            return Ok(None);
        }
        Ok(Some(self.blob_path(digest)))
    }

    /// Follows a (possibly relative) symlink chain up to [`MAX_SYMLINK_DEPTH`]
    /// hops, returning the digest it names if the final target is a regular
    /// file strictly inside the store root.
    pub fn filename_from_symlink(&self, path: impl AsRef<Path>) -> Result<Option<String>, Error> {
        let mut current = path.as_ref().to_path_buf();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..MAX_SYMLINK_DEPTH {
            let meta = match std::fs::symlink_metadata(&current) {
                Ok(m) => m,
                Err(_) => return Ok(None),
            };
            if meta.file_type().is_symlink() {
                if !seen.insert(current.clone()) {
                    return Ok(None); // cycle
                }
                let target = std::fs::read_link(&current)
                    .map_err(|e| Error::io(e, &current, "reading symlink"))?;
                current = if target.is_absolute() {
                    target
                } else {
                    current
                        .parent()
                        .map(|p| p.join(&target))
                        .unwrap_or(target)
                };
                continue;
            }
            if !meta.is_file() {
                return Ok(None);
            }
            let canonical = std::fs::canonicalize(&current)
                .map_err(|e| Error::io(e, &current, "canonicalizing symlink target"))?;
            let canonical_root = std::fs::canonicalize(&self.root)
                .map_err(|e| Error::io(e, &self.root, "canonicalizing store root"))?;
            if !canonical.starts_with(&canonical_root) {
                return Ok(None);
            }
            let digest = canonical
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string);
            return Ok(digest.filter(|d| self.exists(d)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Read as _;

    fn open_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(dir.path()).expect("open");
        (dir, store)
    }

    fn put(store: &BlobStore, bytes: &[u8], compress: bool) -> String {
        let digest = gradecore_digest::digest_bytes(bytes);
        if let Some(mut pending) = store.create(&digest, compress, 5).expect("create") {
            pending.write_all(bytes).expect("write");
            assert!(store.commit(pending, BTreeMap::new()).expect("commit"));
        }
        digest
    }

    #[test]
    fn round_trip_uncompressed() {
        let (_dir, store) = open_store();
        let digest = put(&store, b"hello world", false);
        let mut reader = store.get(&digest).expect("get");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn round_trip_compressed() {
        let (_dir, store) = open_store();
        let payload = vec![7_u8; 2 * (1 << 20)];
        let digest = put(&store, &payload, true);
        let mut reader = store.get(&digest).expect("get");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, payload);
    }

    #[test]
    fn create_returns_none_for_existing_digest() {
        let (_dir, store) = open_store();
        let digest = put(&store, b"data", false);
        assert!(store.create(&digest, false, 5).expect("create").is_none());
    }

    #[test]
    fn tombstone_reads_fail_distinctively() {
        let (_dir, store) = open_store();
        let err = store.get(gradecore_digest::TOMBSTONE).err().expect("err");
        assert!(matches!(err, Error::Tombstone));
    }

    #[test]
    fn not_found_is_distinguished() {
        let (_dir, store) = open_store();
        let err = store.get(&"a".repeat(40)).err().expect("err");
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn symlink_opacity_uncompressed_round_trips() {
        let (dir, store) = open_store();
        let digest = put(&store, b"payload", false);
        let path = store.path_for_symlink(&digest).expect("path").expect("some");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&path, &link).expect("symlink");
        let recovered = store.filename_from_symlink(&link).expect("resolve");
        assert_eq!(recovered.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn symlink_opacity_compressed_returns_none() {
        let (_dir, store) = open_store();
        let payload = vec![1_u8; 1 << 21];
        let digest = put(&store, &payload, true);
        assert!(store.path_for_symlink(&digest).expect("path").is_none());
    }

    #[test]
    fn verify_detects_corruption() {
        let (_dir, store) = open_store();
        let digest = put(&store, b"original", false);
        std::fs::write(store.blob_path(&digest), b"corrupted").expect("corrupt");
        assert!(!store.verify(&digest).expect("verify"));
    }

    #[test]
    fn metadata_delete_of_missing_entry_is_silent() {
        let (_dir, store) = open_store();
        let digest = put(&store, b"data", false);
        store
            .set_metadata::<()>(&digest, "nonexistent", None)
            .expect("delete missing is ok");
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_bytes(data: Vec<u8>, compress: bool) {
            let (_dir, store) = open_store();
            let digest = put(&store, &data, compress);
            let mut reader = store.get(&digest).expect("get");
            let mut out = Vec::new();
            reader.read_to_end(&mut out).expect("read");
            prop_assert_eq!(out, data);
        }
    }
}

//! A local, read-through cache over a [`BlobStore`], giving each non-shared
//! cacher its own scratch directory.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::blobstore::BlobStore;
use crate::error::Error;

const PRECACHE_LOCK_FILE: &str = "cache_lock";

/// A read-through cache over a [`BlobStore`].
pub struct FileCacher {
    backend: Arc<BlobStore>,
    scratch: PathBuf,
    shared: bool,
    transient: bool,
    _scratch_guard: Option<TempDir>,
}

impl FileCacher {
    /// Creates a non-shared cacher with its own temporary scratch directory,
    /// deleted automatically when the cacher is dropped.
    pub fn new(backend: Arc<BlobStore>, transient: bool) -> Result<Self, Error> {
        let guard = TempDir::with_prefix("gradecore-filecacher-")
            .map_err(|e| Error::io(e, std::env::temp_dir(), "creating scratch directory"))?;
        let scratch = guard.path().to_path_buf();
        Ok(Self {
            backend,
            scratch,
            shared: false,
            transient,
            _scratch_guard: Some(guard),
        })
    }

    /// Creates a shared cacher backed by a fixed, caller-owned scratch
    /// directory. A shared cacher may never be [`FileCacher::destroy_cache`]'d.
    pub fn shared(backend: Arc<BlobStore>, scratch: impl Into<PathBuf>, transient: bool) -> Result<Self, Error> {
        let scratch = scratch.into();
        std::fs::create_dir_all(&scratch).map_err(|e| Error::io(e, &scratch, "creating shared scratch"))?;
        Ok(Self {
            backend,
            scratch,
            shared: true,
            transient,
            _scratch_guard: None,
        })
    }

    /// Whether this cacher owns a fixed, shared scratch directory.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    fn scratch_path(&self, digest: &str) -> PathBuf {
        self.scratch.join(digest)
    }

    /// Returns `true` if `digest` is resolvable, either from scratch or backend.
    pub fn exists(&self, digest: &str) -> bool {
        self.scratch_path(digest).exists() || self.backend.exists(digest)
    }

    /// Reads `digest` into memory, materializing it first if necessary.
    pub fn get_file_content(&self, digest: &str) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.get_file(digest)?.read_to_end(&mut out).map_err(|e| {
            Error::io(e, self.scratch_path(digest), "reading cached file content")
        })?;
        Ok(out)
    }

    /// Opens a stream over `digest`, materializing it into the scratch
    /// directory first if it is not already there.
    ///
    /// A broken symlink left over from a blob deleted out-of-band is treated as
    /// a cache miss and triggers a re-fetch, per the on-disk lifecycle: the
    /// cacher never assumes its scratch entries stay valid.
    #[tracing::instrument(skip(self))]
    pub fn get_file(&self, digest: &str) -> Result<Box<dyn Read>, Error> {
        if gradecore_digest::is_tombstone(digest) {
            return Err(Error::Tombstone);
        }
        let scratch_path = self.scratch_path(digest);
        if let Ok(file) = std::fs::File::open(&scratch_path) {
            return Ok(Box::new(file));
        }

        // Scratch miss (absent, or a dangling symlink): fetch through the backend.
        if let Some(target) = self.backend.path_for_symlink(digest)? {
            let _ = std::fs::remove_file(&scratch_path);
            std::os::unix::fs::symlink(&target, &scratch_path)
                .map_err(|e| Error::io(e, &scratch_path, "linking cached file"))?;
            return Ok(Box::new(std::fs::File::open(&scratch_path).map_err(|e| {
                Error::io(e, &scratch_path, "opening freshly linked cached file")
            })?));
        }

        let mut reader = self.backend.get(digest)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.scratch)
            .map_err(|e| Error::io(e, &self.scratch, "creating scratch temp file"))?;
        let (mut file, temp_path) = tmp.into_parts();
        std::io::copy(&mut reader, &mut file)
            .map_err(|e| Error::io(e, &scratch_path, "downloading into scratch"))?;
        drop(file);
        temp_path
            .persist(&scratch_path)
            .map_err(|e| Error::io(e.error, &scratch_path, "renaming into scratch"))?;
        Ok(Box::new(std::fs::File::open(&scratch_path).map_err(|e| {
            Error::io(e, &scratch_path, "opening freshly downloaded cached file")
        })?))
    }

    /// Streams `reader` into the scratch directory while computing its digest,
    /// then (unless [`FileCacher`] is in transient mode) commits it to the
    /// backend. Returns the digest.
    #[tracing::instrument(skip_all)]
    pub fn put_file_from_fobj<R: Read>(
        &self,
        mut reader: R,
        metadata: BTreeMap<String, serde_json::Value>,
        compress: bool,
        compression_level: i32,
    ) -> Result<String, Error> {
        let tmp = tempfile::NamedTempFile::new_in(&self.scratch)
            .map_err(|e| Error::io(e, &self.scratch, "creating scratch temp file"))?;
        let (mut file, temp_path) = tmp.into_parts();
        let mut digester = gradecore_digest::Digester::new();
        let mut buf = [0_u8; 1 << 16];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| Error::io(e, &self.scratch, "reading input stream"))?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            file.write_all(&buf[..n])
                .map_err(|e| Error::io(e, &self.scratch, "writing scratch temp file"))?;
        }
        file.sync_all().map_err(|e| Error::io(e, &self.scratch, "syncing scratch temp file"))?;
        let digest = digester.finish();

        if !self.transient {
            if let Some(mut pending) = self.backend.create(&digest, compress, compression_level)? {
                let mut source =
                    std::fs::File::open(&temp_path).map_err(|e| Error::io(e, &temp_path, "reopening scratch temp file"))?;
                std::io::copy(&mut source, &mut pending)
                    .map_err(|e| Error::io(e, &temp_path, "copying into backend"))?;
                self.backend.commit(pending, metadata)?;
            }
        }

        let scratch_path = self.scratch_path(&digest);
        if !scratch_path.exists() {
            temp_path
                .persist(&scratch_path)
                .map_err(|e| Error::io(e.error, &scratch_path, "renaming into scratch"))?;
        }
        Ok(digest)
    }

    /// Returns a host path suitable for symlinking, unless in transient mode
    /// (which must never let anything outside the cache depend on the backend).
    pub fn path_for_symlink(&self, digest: &str) -> Result<Option<PathBuf>, Error> {
        if self.transient {
            return Ok(None);
        }
        self.backend.path_for_symlink(digest)
    }

    /// Like [`FileCacher::path_for_symlink`] but returns the scratch copy
    /// (always valid even in transient mode, since it is process-local).
    pub fn transient_path_for_symlink(&self, digest: &str) -> Option<PathBuf> {
        let path = self.scratch_path(digest);
        path.exists().then_some(path)
    }

    /// Resolves a symlink back to the digest it names, if any.
    pub fn digest_from_symlink(&self, path: impl AsRef<Path>) -> Result<Option<String>, Error> {
        self.backend.filename_from_symlink(path)
    }

    /// Removes `digest` from the scratch directory (backend storage is
    /// untouched; use [`BlobStore::delete`] directly to evict it there too).
    pub fn delete(&self, digest: &str) -> Result<(), Error> {
        let path = self.scratch_path(digest);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| Error::io(e, &path, "deleting scratch entry"))?;
        }
        Ok(())
    }

    /// Empties the scratch directory without touching the backend.
    pub fn purge_cache(&self) -> Result<(), Error> {
        for entry in std::fs::read_dir(&self.scratch)
            .map_err(|e| Error::io(e, &self.scratch, "listing scratch directory"))?
        {
            let entry = entry.map_err(|e| Error::io(e, &self.scratch, "listing scratch directory"))?;
            if entry.path().is_file() || entry.path().is_symlink() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Deletes the entire scratch directory. Fails for shared cachers: they own
    /// a caller-provided directory that may be in use by others.
    pub fn destroy_cache(self) -> Result<(), Error> {
        if self.shared {
            return Err(Error::io(
                std::io::Error::other("refusing to destroy a shared cacher's scratch directory"),
                &self.scratch,
                "destroying cache",
            ));
        }
        std::fs::remove_dir_all(&self.scratch).map_err(|e| Error::io(e, &self.scratch, "destroying cache"))
    }

    /// Lists every digest materialized in the scratch directory.
    pub fn list(&self) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.scratch)
            .map_err(|e| Error::io(e, &self.scratch, "listing scratch directory"))?
        {
            let entry = entry.map_err(|e| Error::io(e, &self.scratch, "listing scratch directory"))?;
            if entry.file_name() != PRECACHE_LOCK_FILE {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Re-hashes every blob in the backend, optionally deleting mismatches.
    /// Returns the digests that failed verification.
    pub fn check_backend_integrity(&self, delete: bool) -> Result<Vec<String>, Error> {
        let mut bad = Vec::new();
        for digest in self.backend.list()? {
            if !self.backend.verify(&digest)? {
                if delete {
                    self.backend.delete(&digest)?;
                }
                bad.push(digest);
            }
        }
        Ok(bad)
    }

    /// Attempts an exclusive, non-blocking advisory lock on a well-known file
    /// in the scratch directory, used to serialize bulk prefetch across
    /// cooperating processes. Returns `None` if another holder has it.
    pub fn precache_lock(&self) -> Result<Option<PrecacheLock>, Error> {
        let path = self.scratch.join(PRECACHE_LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path, "opening precache lock file"))?;

        #[expect(unsafe_code, reason = "flock is the only POSIX primitive for advisory file locking")]
        let result = unsafe { libc::flock(std::os::unix::io::AsRawFd::as_raw_fd(&file), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            Ok(Some(PrecacheLock { _file: file }))
        } else {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(Error::io(err, &path, "acquiring precache lock"))
            }
        }
    }
}

/// A held advisory lock from [`FileCacher::precache_lock`]. Dropping it releases
/// the lock (the OS releases `flock` locks automatically when the file
/// descriptor is closed).
pub struct PrecacheLock {
    _file: std::fs::File,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, FileCacher) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(BlobStore::open(dir.path().join("store")).expect("open"));
        let cacher = FileCacher::new(store, false).expect("cacher");
        (dir, cacher)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, cacher) = fixture();
        let digest = cacher
            .put_file_from_fobj(b"hello".as_slice(), BTreeMap::new(), false, 5)
            .expect("put");
        assert_eq!(cacher.get_file_content(&digest).expect("get"), b"hello");
    }

    #[test]
    fn tombstone_get_fails() {
        let (_dir, cacher) = fixture();
        let err = cacher.get_file(gradecore_digest::TOMBSTONE).err().expect("err");
        assert!(matches!(err, Error::Tombstone));
    }

    #[test]
    fn transient_mode_skips_backend_and_symlink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(BlobStore::open(dir.path().join("store")).expect("open"));
        let cacher = FileCacher::new(Arc::clone(&store), true).expect("cacher");
        let digest = cacher
            .put_file_from_fobj(b"secret".as_slice(), BTreeMap::new(), false, 5)
            .expect("put");
        assert!(!store.exists(&digest));
        assert!(cacher.path_for_symlink(&digest).expect("path").is_none());
        assert_eq!(cacher.get_file_content(&digest).expect("get"), b"secret");
    }

    #[test]
    fn precache_lock_excludes_second_holder() {
        let (_dir, cacher) = fixture();
        let first = cacher.precache_lock().expect("lock").expect("held");
        assert!(cacher.precache_lock().expect("lock").is_none());
        drop(first);
        assert!(cacher.precache_lock().expect("lock").is_some());
    }

    #[test]
    fn destroy_cache_refuses_shared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(BlobStore::open(dir.path().join("store")).expect("open"));
        let cacher = FileCacher::shared(store, dir.path().join("scratch"), false).expect("shared");
        assert!(cacher.destroy_cache().is_err());
    }

    #[test]
    fn check_backend_integrity_detects_and_deletes_corruption() {
        let (_dir, cacher) = fixture();
        let digest = cacher
            .put_file_from_fobj(b"data".as_slice(), BTreeMap::new(), false, 5)
            .expect("put");
        let backend = &cacher.backend;
        std::fs::write(backend.root().join(&digest), b"corrupted").expect("corrupt");
        let bad = cacher.check_backend_integrity(true).expect("check");
        assert_eq!(bad, vec![digest.clone()]);
        assert!(!backend.exists(&digest));
    }
}

//! A store that keeps each value in its own directory on disk.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├─ <storage-version>/
//! │  ├─ <hashed-key>/
//! │  │  ├─ .lock
//! │  │  ├─ value
//! │  ├─ ...
//! ```
//!
//! Keys are hashed with SHA-256 so that arbitrary URLs map onto safe
//! directory names.
//!
//! ## Locking
//!
//! Advisory file locks are obtained on the `.lock` file as entries are read
//! and updated, which coordinates processes sharing the same root.
//!
//! The lock file also marks an entry as complete: a marker is written to it
//! at the end of a `put` and an entry without the marker is treated as
//! missing. Deleting an entry simply truncates the marker.
//!
//! The store performs no eviction of its own.

use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use crate::lock::LockedFile;
use crate::lock::OpenOptionsExt;
use crate::storage::KeyValueStore;

/// The current directory layout version.
const STORAGE_VERSION: &str = "v1";
/// The name of the lock file.
const LOCK_FILE_NAME: &str = ".lock";
/// The name of the value file.
const VALUE_FILE_NAME: &str = "value";
/// A marker present in a lock file to indicate a complete entry.
const VALID_MARKER: &str = "ok";

/// Hashes a key into a directory name.
fn hashed_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// A store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FileStore(PathBuf);

impl FileStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self(root_dir.into())
    }

    /// Calculates the path to a file of an entry.
    fn entry_path(&self, key: &str, file: &str) -> PathBuf {
        let mut path = self.0.clone();
        path.push(STORAGE_VERSION);
        path.push(hashed_key(key));
        path.push(file);
        path
    }

    /// Locks an entry for shared access.
    ///
    /// Returns `Ok(None)` if the entry has never been written.
    async fn lock_shared(&self, key: &str) -> Result<Option<LockedFile>> {
        let path = self.entry_path(key, LOCK_FILE_NAME);
        fs::OpenOptions::new()
            .read(true)
            .open_shared(&path)
            .await
            .map(Some)
            .or_else(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Ok(None)
                } else {
                    Err(e)
                }
            })
            .with_context(|| {
                format!(
                    "failed to open file `{path}` with a shared lock",
                    path = path.display()
                )
            })
    }

    /// Locks an entry for exclusive access, creating it if needed.
    ///
    /// The lock file is truncated once the lock is held, which invalidates
    /// the entry until a new marker is written.
    async fn lock_exclusive(&self, key: &str) -> Result<LockedFile> {
        let mut options = fs::OpenOptions::new();

        // Truncation has to wait until the lock is held, so `truncate` is not set
        options.create(true).read(true).write(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let path = self.entry_path(key, LOCK_FILE_NAME);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("failed to create directory `{dir}`", dir = dir.display())
            })?;
        }

        let file = options.open_exclusive(&path).await.with_context(|| {
            format!(
                "failed to open file `{path}` with an exclusive lock",
                path = path.display()
            )
        })?;

        file.set_len(0).with_context(|| {
            format!(
                "failed to truncate lock file `{path}`",
                path = path.display()
            )
        })?;
        Ok(file)
    }
}

impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut lock = match self.lock_shared(key).await? {
            Some(file) => file,
            None => return Ok(None),
        };

        let mut marker = String::new();
        lock.read_to_string(&mut marker)
            .with_context(|| format!("failed to read lock file for entry `{key}`"))?;
        if marker != VALID_MARKER {
            debug!(key, "entry is incomplete or deleted: treating as not present");
            return Ok(None);
        }

        let path = self.entry_path(key, VALUE_FILE_NAME);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "failed to read value file `{path}`",
                    path = path.display()
                )
            }),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let mut lock = self.lock_exclusive(key).await?;

        let path = self.entry_path(key, VALUE_FILE_NAME);
        fs::write(&path, &value).with_context(|| {
            format!(
                "failed to write value file `{path}`",
                path = path.display()
            )
        })?;

        lock.write_all(VALID_MARKER.as_bytes())
            .with_context(|| format!("failed to write to lock file for entry `{key}`"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.lock_shared(key).await?.is_none() {
            return Ok(());
        }

        // Taking the exclusive lock truncates the marker
        self.lock_exclusive(key).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

//! A minimal file system abstraction for shared state files.

use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::timer::ms_from_system_time;

/// Identifies a version of a file's contents without reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// The modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
    /// The file length in bytes.
    pub len: u64,
    /// Distinguishes files replaced by rename; zero where unsupported.
    pub id: u64,
}

/// Gets the identity of a file from its metadata.
#[cfg(unix)]
fn file_id(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Gets the identity of a file from its metadata.
#[cfg(not(unix))]
fn file_id(_: &fs::Metadata) -> u64 {
    0
}

/// File operations used by components that share state through files.
pub trait FileSystem: Send + Sync + 'static {
    /// Reads the raw contents of a file.
    ///
    /// Returns `Ok(None)` if the file does not exist. Decoding is left to the
    /// caller so that one damaged line cannot make the whole file unreadable.
    fn read_file(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the contents of a file so that readers observe either the old
    /// or the new contents, never a mix.
    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Gets the stamp of a file.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>>;
}

/// The file system of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(contents)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(FileStamp {
                modified_ms: ms_from_system_time(metadata.modified()?),
                len: metadata.len(),
                id: file_id(&metadata),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

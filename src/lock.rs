//! Advisory file locking.
//!
//! Two layers live here:
//!
//! * [`OpenOptionsExt`] opens files with an advisory (`flock`-style) lock.
//!   These locks are released when the file is closed, so they are only held
//!   across a short critical section.
//! * [`NamedLock`] is a long-lived lock whose ownership is recorded *inside*
//!   a lock file as a timestamp and owner token. Because the record survives
//!   its owner, a lock left behind by a crashed process can be stolen once it
//!   is old enough.
//!
//! Locking is best-effort: file systems without advisory lock support are
//! treated as if the lock had been granted.

use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use unix as sys;

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use windows as sys;

use crate::runtime;
use crate::timer::Timer;

/// How often a timed wait retries a contended named lock.
const NAMED_LOCK_POLL_MS: i64 = 50;

/// Represents a locked file; the lock is released on drop.
#[derive(Debug)]
pub struct LockedFile(File);

impl Deref for LockedFile {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = sys::unlock(&self.0);
    }
}

/// An extension trait for [`OpenOptions`] that locks the opened file.
pub trait OpenOptionsExt {
    /// Opens a file with a shared lock, waiting for the lock if needed.
    fn open_shared(&self, path: &Path) -> impl Future<Output = io::Result<LockedFile>> + Send;

    /// Opens a file with an exclusive lock, waiting for the lock if needed.
    fn open_exclusive(&self, path: &Path) -> impl Future<Output = io::Result<LockedFile>> + Send;

    /// Opens a file with an exclusive lock, blocking the current thread until
    /// the lock is acquired.
    ///
    /// Only suitable for locks that are never held for long.
    fn open_exclusive_blocking(&self, path: &Path) -> io::Result<LockedFile>;
}

impl OpenOptionsExt for OpenOptions {
    async fn open_shared(&self, path: &Path) -> io::Result<LockedFile> {
        lock(self.open(path)?, path, Access::Shared).await
    }

    async fn open_exclusive(&self, path: &Path) -> io::Result<LockedFile> {
        lock(self.open(path)?, path, Access::Exclusive).await
    }

    fn open_exclusive_blocking(&self, path: &Path) -> io::Result<LockedFile> {
        let file = self.open(path)?;
        match sys::lock(&file, Access::Exclusive, true) {
            Ok(()) => Ok(LockedFile(file)),
            Err(e) if sys::error_unsupported(&e) => Ok(LockedFile(file)),
            Err(e) => Err(e),
        }
    }
}

/// Represents how a resource is accessed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Access {
    /// Access to the resource is shared.
    Shared,
    /// Access to the resource is exclusive.
    Exclusive,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Attempts to take a lock without blocking.
///
/// Returns `Ok(false)` if the lock is contended.
fn try_lock(file: &File, access: Access) -> io::Result<bool> {
    match sys::lock(file, access, false) {
        Ok(()) => Ok(true),
        Err(e) if sys::error_unsupported(&e) => Ok(true),
        Err(e) if sys::error_contended(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Takes a lock on a file, waiting on a blocking task when contended.
async fn lock(file: File, path: &Path, access: Access) -> io::Result<LockedFile> {
    if try_lock(&file, access)? {
        return Ok(LockedFile(file));
    }

    debug!(
        "waiting to acquire {access} lock on file `{path}`",
        path = path.display()
    );
    match runtime::unwrap_task_output(
        runtime::spawn_blocking(move || match sys::lock(&file, access, true) {
            Ok(()) => Ok(LockedFile(file)),
            Err(e) if sys::error_unsupported(&e) => Ok(LockedFile(file)),
            Err(e) => Err(e),
        })
        .await,
    ) {
        Some(res) => res,
        None => Err(io::Error::other("failed to wait for file lock")),
    }
}

/// Creates [`NamedLock`]s backed by files in a directory.
#[derive(Clone)]
pub struct FileLockManager {
    /// The directory holding the lock files.
    base_dir: PathBuf,
    /// The timer used to stamp and age locks.
    timer: Arc<dyn Timer>,
}

impl FileLockManager {
    /// Creates a lock manager that keeps lock files in `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, timer: Arc<dyn Timer>) -> Self {
        Self {
            base_dir: base_dir.into(),
            timer,
        }
    }

    /// Creates a handle to the lock with the given name.
    ///
    /// Handles with the same name refer to the same lock, whether they are
    /// created in this process or another one; each handle is a distinct
    /// owner.
    pub fn create_named_lock(&self, name: &str) -> NamedLock {
        /// Distinguishes owners within this process.
        static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

        NamedLock {
            path: self.base_dir.join(format!("{name}.lock")),
            timer: self.timer.clone(),
            owner: format!(
                "{pid}:{n}",
                pid = std::process::id(),
                n = NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }
}

/// A lock whose holder and acquisition time are recorded in a file.
///
/// The lock file contains `<timestamp_ms> <owner>` while the lock is held and
/// is empty otherwise. A holder may refresh its claim by locking again after
/// the lock has aged past the steal threshold.
pub struct NamedLock {
    /// The path to the lock file.
    path: PathBuf,
    /// The timer used to stamp and age the lock.
    timer: Arc<dyn Timer>,
    /// The token identifying this handle as an owner.
    owner: String,
}

impl NamedLock {
    /// Gets the path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts to take the lock immediately.
    ///
    /// A lock held for at least `steal_ms` is taken over.
    pub fn try_lock_steal_old(&self, steal_ms: i64) -> io::Result<bool> {
        try_acquire(&self.path, &self.owner, self.timer.now_ms(), steal_ms)
    }

    /// Takes the lock, waiting up to `wait_ms` and stealing it if it has been
    /// held for at least `steal_ms`.
    ///
    /// Returns `Ok(false)` if the lock could not be acquired in time.
    pub async fn lock_timed_wait_steal_old(&self, wait_ms: i64, steal_ms: i64) -> io::Result<bool> {
        self.lock_timed_wait_steal_old_since(self.timer.now_ms(), wait_ms, steal_ms)
            .await
    }

    /// Like [`NamedLock::lock_timed_wait_steal_old`], but with the wait
    /// measured from `start_ms` rather than from the first attempt.
    ///
    /// Each attempt is judged as of the earlier of the current time and the
    /// wait deadline, so an attempt made late never steals a lock that was
    /// still fresh when the wait expired. Attempts run on a blocking task.
    pub async fn lock_timed_wait_steal_old_since(
        &self,
        start_ms: i64,
        wait_ms: i64,
        steal_ms: i64,
    ) -> io::Result<bool> {
        let deadline_ms = start_ms + wait_ms;
        loop {
            let now_ms = self.timer.now_ms();
            let at_ms = now_ms.min(deadline_ms);
            let path = self.path.clone();
            let owner = self.owner.clone();
            let acquired = runtime::unwrap_task_output(
                runtime::spawn_blocking(move || try_acquire(&path, &owner, at_ms, steal_ms)).await,
            )
            .unwrap_or_else(|| Err(io::Error::other("failed to wait for named lock")))?;

            if acquired {
                return Ok(true);
            }

            if now_ms >= deadline_ms {
                debug!(
                    "timed out waiting for lock `{path}`",
                    path = self.path.display()
                );
                return Ok(false);
            }

            self.timer
                .sleep_until_ms((now_ms + NAMED_LOCK_POLL_MS).min(deadline_ms))
                .await;
        }
    }

    /// Releases the lock if this handle holds it.
    pub fn unlock(&self) -> io::Result<()> {
        let mut file = open_lock_file(&self.path)?;
        if read_holder(&mut file)?.is_some_and(|(_, owner)| owner == self.owner) {
            file.set_len(0)?;
        }
        Ok(())
    }

    /// Determines if this handle currently holds the lock.
    pub fn held(&self) -> io::Result<bool> {
        let mut file = open_lock_file(&self.path)?;
        Ok(read_holder(&mut file)?.is_some_and(|(_, owner)| owner == self.owner))
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

impl fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLock")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Takes the named lock at `path` for `owner` if it is free or old enough as
/// of `at_ms`.
fn try_acquire(path: &Path, owner: &str, at_ms: i64, steal_ms: i64) -> io::Result<bool> {
    let mut file = open_lock_file(path)?;
    if let Some((stamp_ms, holder)) = read_holder(&mut file)? {
        if at_ms - stamp_ms < steal_ms {
            return Ok(false);
        }

        debug!(
            "stealing lock `{path}` held by `{holder}` since {stamp_ms}",
            path = path.display()
        );
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{at_ms} {owner}")?;
    Ok(true)
}

/// Opens a named lock file for a short critical section.
fn open_lock_file(path: &Path) -> io::Result<LockedFile> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut options = OpenOptions::new();
    options.create(true).read(true).write(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open_exclusive_blocking(path)
}

/// Reads the holder record from a lock file.
///
/// An empty or unreadable record means the lock is free.
fn read_holder(file: &mut File) -> io::Result<Option<(i64, String)>> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut contents)?;

    Ok(contents.trim().split_once(' ').and_then(|(stamp, owner)| {
        stamp
            .parse::<i64>()
            .ok()
            .map(|stamp| (stamp, owner.to_string()))
    }))
}

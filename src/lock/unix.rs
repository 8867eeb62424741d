//! `flock`-based advisory locks for unix-like systems.

use std::io::Error;
use std::io::Result;
use std::os::fd::AsRawFd;

use super::Access;

/// Takes a lock on a file.
///
/// When `wait` is false the call fails with a contention error instead of
/// blocking.
pub fn lock(file: &impl AsRawFd, access: Access, wait: bool) -> Result<()> {
    let mut operation = match access {
        Access::Shared => libc::LOCK_SH,
        Access::Exclusive => libc::LOCK_EX,
    };

    if !wait {
        operation |= libc::LOCK_NB;
    }

    flock(file, operation)
}

/// Releases any lock held on a file.
pub fn unlock(file: &impl AsRawFd) -> Result<()> {
    flock(file, libc::LOCK_UN)
}

/// Determines if the error means another holder has the lock.
pub fn error_contended(err: &Error) -> bool {
    err.raw_os_error() == Some(libc::EWOULDBLOCK)
}

/// Determines if the error means the file system has no lock support.
pub fn error_unsupported(err: &Error) -> bool {
    // These alias each other on some targets
    #[allow(unreachable_patterns)]
    let unsupported = matches!(
        err.raw_os_error(),
        Some(libc::ENOTSUP | libc::EOPNOTSUPP | libc::ENOSYS)
    );
    unsupported
}

/// Calls `flock` on the file's descriptor.
fn flock(file: &impl AsRawFd, operation: libc::c_int) -> Result<()> {
    // SAFETY: the descriptor is borrowed from a live file for the duration of
    // the call
    let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

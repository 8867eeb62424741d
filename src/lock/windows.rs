//! `LockFileEx`-based advisory locks for Windows.

use std::io::Error;
use std::io::Result;
use std::mem;
use std::os::windows::io::AsRawHandle;

use windows_sys::Win32::Foundation::ERROR_INVALID_FUNCTION;
use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Storage::FileSystem::LOCKFILE_EXCLUSIVE_LOCK;
use windows_sys::Win32::Storage::FileSystem::LOCKFILE_FAIL_IMMEDIATELY;
use windows_sys::Win32::Storage::FileSystem::LockFileEx;
use windows_sys::Win32::Storage::FileSystem::UnlockFile;

use super::Access;

/// Takes a lock on the whole of a file.
///
/// When `wait` is false the call fails with a contention error instead of
/// blocking.
pub fn lock(file: &impl AsRawHandle, access: Access, wait: bool) -> Result<()> {
    let mut flags = match access {
        Access::Shared => 0,
        Access::Exclusive => LOCKFILE_EXCLUSIVE_LOCK,
    };

    if !wait {
        flags |= LOCKFILE_FAIL_IMMEDIATELY;
    }

    // SAFETY: the handle is borrowed from a live file and the overlapped
    // structure outlives the synchronous call
    let ret = unsafe {
        let mut overlapped = mem::zeroed();
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            flags,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };

    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Releases any lock held on a file.
pub fn unlock(file: &impl AsRawHandle) -> Result<()> {
    // SAFETY: the handle is borrowed from a live file
    let ret = unsafe { UnlockFile(file.as_raw_handle() as HANDLE, 0, 0, !0, !0) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Determines if the error means another holder has the lock.
pub fn error_contended(err: &Error) -> bool {
    err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32)
}

/// Determines if the error means the file system has no lock support.
pub fn error_unsupported(err: &Error) -> bool {
    err.raw_os_error() == Some(ERROR_INVALID_FUNCTION as i32)
}

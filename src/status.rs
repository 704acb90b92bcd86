// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server-liveness probe. The server holds an exclusive advisory lock on a
// mutex file for as long as it is alive; the client tests liveness by
// trying to take that lock without blocking. Getting the lock means the
// server no longer holds it.

use std::ffi::CString;
use std::io;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, WireError};
use crate::segment::Segment;

/// Directory name of the status provider within a session segment.
pub const STATUS_PROVIDER_NAME: &str = "status_provider";

/// Fixed storage for the mutex-file path (UTF-8, null-terminated).
const PATH_CAPACITY: usize = 256;

#[repr(C)]
struct StatusState {
    path: [u8; PATH_CAPACITY],
}

/// Register a status provider storing `mutex_file`. Server side only.
pub(crate) fn construct_status_provider(seg: &Arc<Segment>, mutex_file: &str) -> Result<u64> {
    let bytes = mutex_file.as_bytes();
    if bytes.len() >= PATH_CAPACITY {
        return Err(WireError::Fatal(format!(
            "status mutex-file path too long: {mutex_file}"
        )));
    }
    let state = seg.construct(STATUS_PROVIDER_NAME, std::mem::size_of::<StatusState>())?;
    unsafe {
        let st = seg.at::<StatusState>(state);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), (*st).path.as_mut_ptr(), bytes.len());
    }
    Ok(state)
}

/// Client-side probe over the in-segment mutex-file path.
#[derive(Debug)]
pub struct StatusProvider {
    seg: Arc<Segment>,
    state: u64,
}

impl StatusProvider {
    pub(crate) fn new(seg: Arc<Segment>, state: u64) -> Self {
        Self { seg, state }
    }

    fn path_cstring(&self) -> Option<CString> {
        let st = unsafe { &*self.seg.at::<StatusState>(self.state) };
        let len = st.path.iter().position(|&b| b == 0).unwrap_or(PATH_CAPACITY);
        CString::new(&st.path[..len]).ok()
    }

    /// Probe the server's mutex file. `true` means the server is presumed
    /// alive (its exclusive lock is still held); any failure to open or a
    /// successful lock acquisition means it is gone.
    pub fn is_alive(&self) -> bool {
        let Some(path) = self.path_cstring() else {
            return false;
        };
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY) };
        if fd < 0 {
            return false;
        }
        let alive = if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            unsafe { libc::flock(fd, libc::LOCK_UN) };
            false
        } else {
            true
        };
        unsafe { libc::close(fd) };
        if !alive {
            warn!("status provider: server mutex file is unlocked");
        }
        alive
    }
}

/// Server-side holder of the liveness lock: creates (if needed) and
/// exclusively flocks the mutex file until dropped.
pub struct StatusLock {
    fd: i32,
}

impl StatusLock {
    pub fn hold(path: &str) -> Result<StatusLock> {
        let c_path = CString::new(path).map_err(|e| WireError::Fatal(e.to_string()))?;
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT,
                0o644 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }
        Ok(StatusLock { fd })
    }

    /// Release the lock early, simulating a server crash in tests.
    pub fn release(self) {}
}

impl Drop for StatusLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
            libc::close(self.fd);
        }
    }
}

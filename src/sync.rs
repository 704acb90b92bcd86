// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-shared synchronisation primitives embedded in the shared segment.
// POSIX only: pthread_mutex_t / pthread_cond_t with PTHREAD_PROCESS_SHARED
// (robust mutexes where the platform has them), plus a counting semaphore
// built on those two. All of them are placed inside #[repr(C)] segment
// structures and initialised in place by the segment creator; clients never
// initialise.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{Result, WireError};

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by the `libc` crate on all platforms.
// On macOS robust mutexes are not used.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

fn os_err(eno: i32) -> WireError {
    WireError::Fatal(io::Error::from_raw_os_error(eno).to_string())
}

/// Absolute CLOCK_REALTIME timespec `timeout` from now.
fn deadline_timespec(timeout: Duration) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let ns_total = ts.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    ts.tv_sec += timeout.as_secs() as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
    ts
}

// ---------------------------------------------------------------------------
// SharedMutex — pthread_mutex_t in the segment
// ---------------------------------------------------------------------------

/// An inter-process mutex living inside the shared segment.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialise the mutex in place with PTHREAD_PROCESS_SHARED (and
    /// PTHREAD_MUTEX_ROBUST where available). Creator side only.
    ///
    /// # Safety
    /// `this` must point to writable, zeroed segment memory that no other
    /// process is using yet.
    pub unsafe fn init(this: *mut SharedMutex) -> io::Result<()> {
        let mtx = (*this).inner.get();
        std::ptr::write_bytes(mtx, 0, 1);

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_mutexattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }

        eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }

        #[cfg(not(target_os = "macos"))]
        {
            eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(io::Error::from_raw_os_error(eno));
            }
        }

        eno = libc::pthread_mutex_init(mtx, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }

    /// Lock (blocking). `EOWNERDEAD` from a robust mutex is repaired with
    /// `pthread_mutex_consistent` and treated as acquired.
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>> {
        let eno = unsafe { libc::pthread_mutex_lock(self.raw()) };
        match eno {
            0 => Ok(SharedMutexGuard { mtx: self }),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => {
                let eno2 = unsafe { pthread_mutex_consistent(self.raw()) };
                if eno2 != 0 {
                    return Err(os_err(eno2));
                }
                Ok(SharedMutexGuard { mtx: self })
            }
            _ => Err(os_err(eno)),
        }
    }

    fn unlock(&self) {
        unsafe { libc::pthread_mutex_unlock(self.raw()) };
    }
}

/// RAII guard: unlocks the mutex on drop.
pub struct SharedMutexGuard<'a> {
    mtx: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mtx.unlock();
    }
}

// ---------------------------------------------------------------------------
// SharedCondvar — pthread_cond_t in the segment
// ---------------------------------------------------------------------------

/// An inter-process condition variable living inside the shared segment.
#[repr(C)]
pub struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initialise the condition variable in place with
    /// PTHREAD_PROCESS_SHARED. Creator side only.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SharedCondvar) -> io::Result<()> {
        let cond = (*this).inner.get();
        std::ptr::write_bytes(cond, 0, 1);

        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_condattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }

        eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }

        eno = libc::pthread_cond_init(cond, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.inner.get()
    }

    /// Wait until notified. The caller must hold `guard` on the mutex the
    /// waiters of this condition agree on.
    pub fn wait(&self, guard: &SharedMutexGuard<'_>) -> Result<()> {
        let eno = unsafe { libc::pthread_cond_wait(self.raw(), guard.mtx.raw()) };
        if eno != 0 {
            return Err(os_err(eno));
        }
        Ok(())
    }

    /// Wait with a timeout. Returns `Ok(true)` when signalled, `Ok(false)`
    /// when the timeout elapsed.
    pub fn wait_timeout(&self, guard: &SharedMutexGuard<'_>, timeout: Duration) -> Result<bool> {
        let ts = deadline_timespec(timeout);
        let eno = unsafe { libc::pthread_cond_timedwait(self.raw(), guard.mtx.raw(), &ts) };
        match eno {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            _ => Err(os_err(eno)),
        }
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        unsafe { libc::pthread_cond_signal(self.raw()) };
    }

    /// Wake all waiters.
    pub fn notify_all(&self) {
        unsafe { libc::pthread_cond_broadcast(self.raw()) };
    }
}

// ---------------------------------------------------------------------------
// SharedSemaphore — sem_t in the segment
// ---------------------------------------------------------------------------

/// A counting inter-process semaphore living inside the shared segment.
/// Used by response-box slots (blocking `recv`) and the connection queue's
/// terminate handshake.
///
/// Built from the process-shared mutex and condition above rather than
/// `sem_t`: unnamed POSIX semaphores are unavailable on macOS.
#[repr(C)]
pub struct SharedSemaphore {
    mutex: SharedMutex,
    cond: SharedCondvar,
    count: std::sync::atomic::AtomicU64,
}

unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    /// Initialise in place with an initial count of zero. Creator side only.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SharedSemaphore) -> io::Result<()> {
        SharedMutex::init(std::ptr::addr_of_mut!((*this).mutex))?;
        SharedCondvar::init(std::ptr::addr_of_mut!((*this).cond))?;
        (*this).count.store(0, Ordering::Release);
        Ok(())
    }

    /// Increment the count, waking one waiter if any.
    pub fn post(&self) -> Result<()> {
        let _guard = self.mutex.lock()?;
        self.count.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_one();
        Ok(())
    }

    /// Decrement the count, blocking until it is positive. With a timeout,
    /// returns `Ok(false)` when the deadline elapsed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let guard = self.mutex.lock()?;
        while self.count.load(Ordering::Acquire) == 0 {
            match deadline {
                None => self.cond.wait(&guard)?,
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() || !self.cond.wait_timeout(&guard, remaining)? {
                        return Ok(false);
                    }
                }
            }
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Decrement without blocking. Returns `Ok(true)` if a count was taken.
    pub fn try_wait(&self) -> Result<bool> {
        let _guard = self.mutex.lock()?;
        if self.count.load(Ordering::Acquire) == 0 {
            return Ok(false);
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// SpinLock — short critical sections in the segment header
// ---------------------------------------------------------------------------

/// Adaptive backoff: busy spin, then CPU pause hint, then yield, then sleep.
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A spin lock guarding the segment allocator and the name directory.
///
/// Its zero state is unlocked, so a freshly ftruncate'd (zero-filled)
/// segment needs no explicit initialisation for these.
#[repr(C)]
pub struct SpinLock {
    lc: AtomicU32,
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

impl SpinLock {
    pub const fn new() -> Self {
        Self { lc: AtomicU32::new(0) }
    }

    pub fn lock(&self) {
        let mut k = 0u32;
        while self.lc.swap(1, Ordering::Acquire) != 0 {
            adaptive_yield(&mut k);
        }
    }

    pub fn unlock(&self) {
        self.lc.store(0, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

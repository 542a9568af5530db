// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named shared memory and synchronization primitives
//!
//! Provides the POSIX objects both sides of a channel rendezvous on:
//! shared memory segments, auto-reset signals (named semaphores) and
//! cross-process locks (robust pthread mutexes in their own segment).

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as `sem_timedwait` wants it
fn deadline_after(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    Ok(libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

/// Shared memory segment mapped read/write
pub struct SharedSegment {
    /// Memory mapped region
    mmap: MmapMut,
    /// Object name, e.g. `/VdMonitor0FB`
    name: String,
    /// Whether this side created the object
    created: bool,
    /// Unlink the object when dropped (only honoured for the creator)
    unlink_on_drop: bool,
}

// SAFETY: the mapping is plain shared memory; every access goes through raw
// pointers or atomics and the segment never moves while mapped.
unsafe impl Send for SharedSegment {}
// SAFETY: see above, concurrent access is the point of the segment.
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create the named segment, or attach to it if it already exists
    ///
    /// An existing segment of a different size is rejected. A size of zero
    /// means the creator has not sized it yet, so the attacher does it.
    pub fn create_or_attach(name: &str, size: usize, mode: u32, unlink_on_drop: bool) -> io::Result<Self> {
        let cname = c_name(name)?;

        // SAFETY: `cname` is a valid NUL terminated string.
        let mut fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                mode as libc::mode_t,
            )
        };
        let mut created = true;

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }

            // SAFETY: `cname` is a valid NUL terminated string.
            fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, mode as libc::mode_t) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            created = false;
        }

        // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };

        let existing = file.metadata()?.len() as usize;
        if created || existing == 0 {
            file.set_len(size as u64)?;
        } else if existing != size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{name} exists with size {existing}, expected {size}"),
            ));
        }

        // SAFETY: the file is a shared memory object of exactly `size` bytes.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        debug!("Mapped {name} ({size} bytes, created: {created})");

        Ok(Self {
            mmap,
            name: name.to_string(),
            created,
            unlink_on_drop,
        })
    }

    /// Whether this side created the segment
    pub fn created(&self) -> bool {
        self.created
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the mapping in bytes
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Base pointer of the mapping
    ///
    /// Writes through this pointer race with the other process by design;
    /// callers only write plain bytes or go through atomics.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Reinterpret the bytes at `offset` as a `T`
    ///
    /// # Safety
    /// `T` must be valid for any bit pattern, shareable across processes
    /// (atomics or plain integers) and `offset` must be suitably aligned.
    pub unsafe fn view<T>(&self, offset: usize) -> &T {
        assert!(offset + std::mem::size_of::<T>() <= self.len(), "view out of bounds");
        // SAFETY: bounds checked above, alignment and validity are the caller's contract.
        unsafe { &*(self.as_ptr().add(offset) as *const T) }
    }

    /// Copy `data` into the segment at `offset`
    pub fn write_at(&self, offset: usize, data: &[u8]) -> io::Result<()> {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.len() => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Data too large for segment",
                ))
            }
        }

        // SAFETY: the destination range was bounds checked and `data` cannot
        // overlap a shared memory mapping we own.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy bytes out of the segment starting at `offset`
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> io::Result<()> {
        match offset.checked_add(out.len()) {
            Some(end) if end <= self.len() => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Read past end of segment",
                ))
            }
        }

        // SAFETY: the source range was bounds checked.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.created && self.unlink_on_drop {
            if let Ok(cname) = c_name(&self.name) {
                // SAFETY: `cname` is a valid NUL terminated string.
                unsafe { libc::shm_unlink(cname.as_ptr()) };
            }
        }
    }
}

/// Named POSIX semaphore behind a signal
struct Semaphore {
    sem: *mut libc::sem_t,
    name: String,
    unlink_on_drop: bool,
}

// SAFETY: POSIX semaphores are designed to be used from any thread.
unsafe impl Send for Semaphore {}
// SAFETY: see above.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn open(name: &str, initial: u32, mode: u32, unlink_on_drop: bool) -> io::Result<Self> {
        let cname = c_name(name)?;

        // SAFETY: `cname` is valid; O_CREAT takes the mode and initial value.
        let mut sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                mode as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        let mut created = true;

        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
            // SAFETY: `cname` is valid; without O_CREAT no extra arguments are read.
            sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            created = false;
        }

        Ok(Self {
            sem,
            name: name.to_string(),
            unlink_on_drop: created && unlink_on_drop,
        })
    }

    fn value(&self) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: `self.sem` is a live semaphore and `value` is writable.
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    fn post(&self) -> io::Result<()> {
        // SAFETY: `self.sem` is a live semaphore.
        if unsafe { libc::sem_post(self.sem) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Decrement, waiting up to `timeout` (forever when `None`)
    ///
    /// Returns false on timeout.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(deadline_after).transpose()?;

        loop {
            let rc = match &deadline {
                // SAFETY: `self.sem` is live and `ts` outlives the call.
                Some(ts) => unsafe { libc::sem_timedwait(self.sem, ts) },
                // SAFETY: `self.sem` is live.
                None => unsafe { libc::sem_wait(self.sem) },
            };
            if rc == 0 {
                return Ok(true);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Non-blocking decrement, returns false if the value was zero
    fn try_wait(&self) -> io::Result<bool> {
        loop {
            // SAFETY: `self.sem` is live.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(err),
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: `self.sem` came from sem_open and is closed exactly once.
        unsafe { libc::sem_close(self.sem) };
        if self.unlink_on_drop {
            if let Ok(cname) = c_name(&self.name) {
                // SAFETY: `cname` is a valid NUL terminated string.
                unsafe { libc::sem_unlink(cname.as_ptr()) };
            }
        }
    }
}

/// Auto-reset, payload-free wake-up shared with another process
///
/// At most one wake is pending at a time: raising an already raised signal
/// is a no-op, and a successful wait consumes it.
pub struct NamedSignal {
    sem: Semaphore,
}

impl NamedSignal {
    pub fn open(name: &str, mode: u32, unlink_on_drop: bool) -> io::Result<Self> {
        Ok(Self {
            sem: Semaphore::open(name, 0, mode, unlink_on_drop)?,
        })
    }

    /// Raise the signal. Nobody needs to be listening.
    pub fn signal(&self) -> io::Result<()> {
        if self.sem.value()? == 0 {
            self.sem.post()?;
        }
        Ok(())
    }

    /// Wait for the signal, returns false on timeout
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.sem.wait(timeout)
    }

    /// Consume a pending signal without blocking
    pub fn try_consume(&self) -> io::Result<bool> {
        self.sem.try_wait()
    }

    pub fn name(&self) -> &str {
        &self.sem.name
    }
}

/// Shared layout of a named lock object
#[repr(C)]
struct LockRecord {
    /// `LOCK_READY` once the creator initialised `mutex`
    state: AtomicU32,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}

const LOCK_READY: u32 = 1;
const LOCK_RECORD_SIZE: usize = std::mem::size_of::<LockRecord>();

fn check(rc: libc::c_int) -> io::Result<()> {
    match rc {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// Cross-process mutual exclusion
///
/// A robust, process shared pthread mutex kept in its own shared memory
/// object. When a holder dies with the lock held, the next acquirer gets
/// the lock and learns it through [`NamedLockGuard::was_abandoned`]. A live
/// holder is never preempted: waiting past the timeout is an error.
pub struct NamedLock {
    segment: SharedSegment,
    /// Longest wait for the current holder
    timeout: Duration,
}

impl NamedLock {
    pub fn open(name: &str, mode: u32, timeout: Duration, unlink_on_drop: bool) -> io::Result<Self> {
        let segment = SharedSegment::create_or_attach(name, LOCK_RECORD_SIZE, mode, unlink_on_drop)?;
        let lock = Self { segment, timeout };
        if lock.segment.created() {
            lock.init()?;
        } else {
            lock.wait_ready()?;
        }
        Ok(lock)
    }

    fn record(&self) -> &LockRecord {
        // SAFETY: offset 0 of a page aligned mapping of exactly one record;
        // the atomic and the pthread mutex bytes are valid for any pattern.
        unsafe { self.segment.view::<LockRecord>(0) }
    }

    fn init(&self) -> io::Result<()> {
        let mutex = self.record().mutex.get();
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        // SAFETY: `attr` is initialised by pthread_mutexattr_init before any
        // other use and destroyed once; `mutex` points into our mapping and
        // nobody uses it before `state` is published below.
        let result = unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let result = check(libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|()| {
                check(libc::pthread_mutexattr_setrobust(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_MUTEX_ROBUST,
                ))
            })
            .and_then(|()| check(libc::pthread_mutex_init(mutex, attr.as_ptr())));
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result
        };
        result?;

        self.record().state.store(LOCK_READY, Ordering::Release);
        Ok(())
    }

    /// Wait for the creator to initialise the mutex
    fn wait_ready(&self) -> io::Result<()> {
        let deadline = Instant::now() + self.timeout;
        while self.record().state.load(Ordering::Acquire) != LOCK_READY {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("lock {} was never initialised", self.name()),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Acquire the lock; released when the guard drops
    pub fn lock(&self) -> io::Result<NamedLockGuard<'_>> {
        let mutex = self.record().mutex.get();
        let deadline = deadline_after(self.timeout)?;

        // SAFETY: the mutex was initialised as process shared before the
        // record became ready and stays mapped for the lifetime of `self`.
        let abandoned = match unsafe { libc::pthread_mutex_timedlock(mutex, &deadline) } {
            0 => false,
            libc::EOWNERDEAD => {
                warn!("Holder of lock {} died, recovering it", self.name());
                // SAFETY: EOWNERDEAD hands the mutex to this thread.
                if let Err(e) = check(unsafe { libc::pthread_mutex_consistent(mutex) }) {
                    // SAFETY: still held by this thread.
                    unsafe { libc::pthread_mutex_unlock(mutex) };
                    return Err(e);
                }
                true
            }
            libc::ETIMEDOUT => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("lock {} still held after {:?}", self.name(), self.timeout),
                ))
            }
            errno => return Err(io::Error::from_raw_os_error(errno)),
        };

        Ok(NamedLockGuard {
            lock: self,
            abandoned,
            _owner_thread: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }
}

/// Scoped ownership of a [`NamedLock`]
///
/// Must be dropped on the thread that took it.
pub struct NamedLockGuard<'a> {
    lock: &'a NamedLock,
    abandoned: bool,
    _owner_thread: PhantomData<*const ()>,
}

impl NamedLockGuard<'_> {
    /// True if the previous holder died without releasing the lock
    pub fn was_abandoned(&self) -> bool {
        self.abandoned
    }
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard is not Send, so this thread is the owner.
        let rc = unsafe { libc::pthread_mutex_unlock(self.lock.record().mutex.get()) };
        if let Err(e) = check(rc) {
            warn!("Failed to release lock {}: {e}", self.lock.name());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    static NEXT_ID: AtomicU32 = AtomicU32::new(0);

    /// Process and test unique object name
    pub(crate) fn unique_name(tag: &str) -> String {
        format!(
            "/vdrelay-test-{}-{}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed),
            tag
        )
    }

    #[test]
    fn test_segment_create_then_attach() {
        let name = unique_name("seg");
        let first = SharedSegment::create_or_attach(&name, 4096, 0o600, true).unwrap();
        assert!(first.created());
        assert_eq!(first.len(), 4096);

        let second = SharedSegment::create_or_attach(&name, 4096, 0o600, true).unwrap();
        assert!(!second.created());

        first.write_at(10, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        second.read_at(10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_segment_size_mismatch() {
        let name = unique_name("mismatch");
        let _first = SharedSegment::create_or_attach(&name, 4096, 0o600, true).unwrap();
        let second = SharedSegment::create_or_attach(&name, 8192, 0o600, true);
        assert!(second.is_err());
    }

    #[test]
    fn test_segment_bounds() {
        let name = unique_name("bounds");
        let seg = SharedSegment::create_or_attach(&name, 4096, 0o600, true).unwrap();
        assert!(seg.write_at(4090, &[0u8; 6]).is_ok());
        assert!(seg.write_at(4090, &[0u8; 7]).is_err());
        assert!(seg.write_at(usize::MAX, &[0u8; 1]).is_err());
        let mut out = [0u8; 8];
        assert!(seg.read_at(4089, &mut out).is_err());
    }

    #[test]
    fn test_signal_is_auto_reset() {
        let name = unique_name("sig");
        let producer = NamedSignal::open(&name, 0o600, true).unwrap();
        let consumer = NamedSignal::open(&name, 0o600, true).unwrap();

        assert!(!consumer.wait(Some(Duration::from_millis(10))).unwrap());

        producer.signal().unwrap();
        producer.signal().unwrap();
        assert!(consumer.wait(Some(Duration::from_millis(100))).unwrap());
        // Two raises collapse into one wake
        assert!(!consumer.try_consume().unwrap());
    }

    #[test]
    fn test_lock_excludes_live_holder() {
        let name = unique_name("lock");
        let lock = NamedLock::open(&name, 0o600, Duration::from_millis(30), true).unwrap();
        let other = NamedLock::open(&name, 0o600, Duration::from_millis(30), true).unwrap();

        let guard = lock.lock().unwrap();
        assert!(!guard.was_abandoned());
        thread::scope(|s| {
            s.spawn(|| {
                let err = other.lock().err().unwrap();
                assert_eq!(err.kind(), io::ErrorKind::TimedOut);
            });
        });
        drop(guard);

        // Released exactly once: one holder again excludes the next
        thread::scope(|s| {
            s.spawn(|| {
                let held = other.lock().unwrap();
                assert!(!held.was_abandoned());
                thread::scope(|inner| {
                    inner.spawn(|| {
                        let err = lock.lock().err().unwrap();
                        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
                    });
                });
            });
        });

        let guard = lock.lock().unwrap();
        assert!(!guard.was_abandoned());
    }

    #[test]
    fn test_lock_recovers_from_dead_holder() {
        let name = unique_name("deadlock");
        let lock = NamedLock::open(&name, 0o600, Duration::from_secs(1), true).unwrap();
        let other = NamedLock::open(&name, 0o600, Duration::from_millis(30), true).unwrap();

        // The holder thread exits without releasing
        thread::scope(|s| {
            s.spawn(|| std::mem::forget(other.lock().unwrap()));
        });

        let recovered = lock.lock().unwrap();
        assert!(recovered.was_abandoned());
        thread::scope(|s| {
            s.spawn(|| {
                let err = other.lock().err().unwrap();
                assert_eq!(err.kind(), io::ErrorKind::TimedOut);
            });
        });
        drop(recovered);

        let guard = lock.lock().unwrap();
        assert!(!guard.was_abandoned());
    }
}

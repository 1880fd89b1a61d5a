//! Frame ring shared between one producer and one consumer process
//!
//! The region starts with a [`header::Header`] followed by `slot_count` slots of
//! `frame_size` bytes. Every read or write of the header happens while holding the lock;
//! slot bytes are written inside the critical section by [`Ring::publish`] and read outside
//! of it between [`Ring::acquire`] and [`Ring::release`], protected by the slot's "being read"
//! mark.
//!
//! The ring is generic over where its memory and lock live. [`SharedRing`] uses System V shared
//! memory and a semaphore; [`local`] provides in-process equivalents.

use std::io;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::{Error, Result};

pub mod header;
pub use header::{Acquire, Acquired, Geometry, Publish, Stats, HEADER_SIZE, MAX_SLOTS};
use header::Header;

pub mod local;

mod shared;
pub use shared::SharedRing;

/// Memory holding the ring, mapped at the same contents in every participant
pub trait Region {
    /// Start of the region, aligned to at least 8 bytes
    fn as_mut_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;
}

/// Mutual exclusion shared by every participant
pub trait Lock {
    /// Takes the lock, waiting at most `timeout`
    ///
    /// Returns `Ok(false)` if the lock was not granted in time.
    fn try_lock_for(&self, timeout: Duration) -> io::Result<bool>;

    fn unlock(&self) -> io::Result<()>;
}

impl<T: Region + ?Sized> Region for Arc<T> {
    fn as_mut_ptr(&self) -> *mut u8 {
        (**self).as_mut_ptr()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

impl<T: Lock + ?Sized> Lock for Arc<T> {
    fn try_lock_for(&self, timeout: Duration) -> io::Result<bool> {
        (**self).try_lock_for(timeout)
    }

    fn unlock(&self) -> io::Result<()> {
        (**self).unlock()
    }
}

/// How hard to try for the lock before giving up with [`Error::LockTimeout`]
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Wait of a single attempt
    pub timeout: Duration,
    /// Failed attempts after which a warning is logged
    pub warn_after: u32,
    /// Pause between failed attempts
    pub backoff: Backoff,
    /// Give up after this many attempts, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            timeout: Duration::from_millis(100),
            warn_after: 10,
            backoff: Backoff::default(),
            max_attempts: Some(50),
        }
    }
}

struct Guard<'a, L: Lock> {
    lock: &'a L,
}

impl<L: Lock> Drop for Guard<'_, L> {
    fn drop(&mut self) {
        // publish everything written under the lock before letting go
        fence(Ordering::SeqCst);
        if let Err(e) = self.lock.unlock() {
            warn!(error = %e, "failed to release ring lock");
        }
    }
}

pub struct Ring<R: Region, L: Lock> {
    region: R,
    lock: L,
    policy: LockPolicy,
    /// Set on the creating side only
    geometry: Option<Geometry>,
}

impl<R: Region, L: Lock> Ring<R, L> {
    /// Initializes a new ring in `region` and marks it ready
    pub fn create(region: R, lock: L, geometry: Geometry, policy: LockPolicy) -> Result<Self> {
        geometry.validate()?;
        if region.len() < geometry.region_len() {
            return Err(Error::Layout(format!(
                "ring needs {} bytes, region has {}",
                geometry.region_len(),
                region.len()
            )));
        }

        let ring = Ring {
            region,
            lock,
            policy,
            geometry: Some(geometry),
        };
        let pid = std::process::id() as i32;
        ring.critical(|header| header.init(&geometry, pid))?;

        debug!(
            slots = geometry.slot_count,
            frame_size = geometry.frame_size,
            "ring initialized"
        );
        Ok(ring)
    }

    /// Uses a ring initialized by another participant
    ///
    /// The ring may not be ready yet, see [`Ring::wait_for_ready`].
    pub fn attach(region: R, lock: L, policy: LockPolicy) -> Result<Self> {
        if region.len() < HEADER_SIZE {
            return Err(Error::Layout(format!(
                "region of {} bytes cannot hold a ring header",
                region.len()
            )));
        }

        Ok(Ring {
            region,
            lock,
            policy,
            geometry: None,
        })
    }

    /// Whether this handle created the ring
    pub fn is_creator(&self) -> bool {
        self.geometry.is_some()
    }

    fn header(&self) -> *mut Header {
        self.region.as_mut_ptr() as *mut Header
    }

    fn lock(&self) -> Result<Guard<'_, L>> {
        let started = Instant::now();
        let mut backoff = self.policy.backoff.clone();
        let mut attempts = 0u32;

        loop {
            if self
                .lock
                .try_lock_for(self.policy.timeout)
                .map_err(Error::ipc("lock"))?
            {
                fence(Ordering::SeqCst);
                if attempts >= self.policy.warn_after {
                    warn!(attempts, waited = ?started.elapsed(), "ring lock acquired after contention");
                }
                return Ok(Guard { lock: &self.lock });
            }

            attempts += 1;
            if attempts == self.policy.warn_after {
                warn!(attempts, waited = ?started.elapsed(), "ring lock contended");
            }
            if matches!(self.policy.max_attempts, Some(max) if attempts >= max) {
                return Err(Error::LockTimeout(started.elapsed()));
            }
            backoff.wait();
        }
    }

    /// Runs `f` on the header while holding the lock
    fn critical<T>(&self, f: impl FnOnce(&mut Header) -> T) -> Result<T> {
        let _guard = self.lock()?;
        let header = unsafe { &mut *self.header() };
        Ok(f(header))
    }

    /// Polls the ready flag until it is set or `timeout` expires
    ///
    /// Returns the validated geometry once ready, `None` on timeout.
    pub fn wait_for_ready(&self, timeout: Duration) -> Result<Option<Geometry>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = self.policy.backoff.clone();

        loop {
            let len = self.region.len();
            let geometry = self.critical(|header| {
                if header.is_ready() {
                    header.validate(len).map(Some)
                } else {
                    Ok(None)
                }
            })??;

            if geometry.is_some() {
                return Ok(geometry);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            backoff.wait();
        }
    }

    /// Session geometry, fails if the ring is not ready
    pub fn geometry(&self) -> Result<Geometry> {
        if let Some(geometry) = self.geometry {
            return Ok(geometry);
        }

        let len = self.region.len();
        self.critical(|header| {
            if header.is_ready() {
                header.validate(len)
            } else {
                Err(Error::Layout("ring is not ready".into()))
            }
        })?
    }

    /// Copies `frame` into the next slot
    ///
    /// Frames shorter than the slot are zero padded.
    pub fn publish(&self, frame: &[u8]) -> Result<Publish> {
        let geometry = self.geometry()?;
        if frame.len() > geometry.frame_size as usize {
            return Err(Error::FrameSize {
                len: frame.len(),
                frame_size: geometry.frame_size,
            });
        }

        let base = self.region.as_mut_ptr();
        let result = self.critical(|header| {
            let result = header.publish();
            if let Publish::Written { slot } | Publish::Overwritten { slot, .. } = result {
                unsafe {
                    let dst = base.add(header.slot_offset(slot));
                    ptr::copy_nonoverlapping(frame.as_ptr(), dst, frame.len());
                    ptr::write_bytes(
                        dst.add(frame.len()),
                        0,
                        geometry.frame_size as usize - frame.len(),
                    );
                }
            }
            result
        })?;

        match result {
            Publish::Overwritten {
                dropped_slot,
                dropped_generation,
                ..
            } => debug!(
                slot = dropped_slot,
                generation = dropped_generation,
                "ring full, dropped oldest frame"
            ),
            Publish::Full { slot } => debug!(slot, "slot is being read, dropped new frame"),
            Publish::Written { .. } => {}
        }
        Ok(result)
    }

    /// Hands the oldest unread frame to the caller
    ///
    /// The slot stays reserved until it is given back with [`Ring::release`].
    pub fn acquire(&self) -> Result<Acquire> {
        let len = self.region.len();
        self.critical(|header| {
            if !header.is_ready() {
                return Ok(Acquire::Empty);
            }
            header.validate(len)?;
            Ok(header.acquire())
        })?
    }

    /// Bytes of an acquired slot
    ///
    /// # Panics
    ///
    /// If `acquired` came from a ring whose slots do not fit this region.
    pub fn slot(&self, acquired: &Acquired) -> &[u8] {
        assert!(
            acquired
                .offset
                .checked_add(acquired.len)
                .map_or(false, |end| end <= self.region.len()),
            "slot {} lies outside the ring",
            acquired.slot
        );
        unsafe {
            slice::from_raw_parts(
                self.region.as_mut_ptr().add(acquired.offset) as *const u8,
                acquired.len,
            )
        }
    }

    /// Gives an acquired slot back to the producer
    pub fn release(&self, acquired: Acquired) -> Result<()> {
        self.critical(|header| header.release(acquired.slot, acquired.generation))?
    }

    pub fn stats(&self) -> Result<Stats> {
        self.critical(|header| header.stats())
    }

    /// Clears a "being read" mark left behind by a consumer that exited mid-read
    ///
    /// Only meaningful for a freshly attached consumer; the frame is handed out again by the
    /// next acquire.
    pub fn recover_reader(&self) -> Result<Option<u32>> {
        let slot = self.critical(|header| header.clear_reader())?;
        if let Some(slot) = slot {
            warn!(slot, "recovered slot held by a previous reader");
        }
        Ok(slot)
    }

    /// Whether the ring is ready and the process that created it still exists
    pub fn producer_alive(&self) -> bool {
        // session constants, a racy read is fine here
        let (ready, pid) = unsafe { Header::peek_session(self.header()) };
        ready && process_alive(pid)
    }
}

/// Whether a process with `pid` exists, possibly owned by another user
pub(crate) fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl<R: Region, L: Lock> Drop for Ring<R, L> {
    fn drop(&mut self) {
        if self.geometry.is_none() {
            return;
        }

        match self.critical(|header| header.retire()) {
            Ok(()) => debug!("ring retired"),
            Err(e) => warn!(error = %e, "failed to retire ring"),
        }
    }
}

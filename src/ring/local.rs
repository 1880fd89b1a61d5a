//! In-process region and lock
//!
//! Lets the ring run between threads of one process, e.g. for tests or a single process
//! pipeline, without touching System V IPC.

use std::cell::UnsafeCell;
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::{Lock, Region};

/// Zeroed heap memory standing in for a shared segment
pub struct HeapRegion {
    words: UnsafeCell<Box<[u64]>>,
    len: usize,
}

// Accessed through raw pointers only, under the ring lock.
unsafe impl Sync for HeapRegion {}
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        let words = vec![0u64; (len + 7) / 8].into_boxed_slice();
        HeapRegion {
            words: UnsafeCell::new(words),
            len,
        }
    }
}

impl Region for HeapRegion {
    fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (*self.words.get()).as_mut_ptr() as *mut u8 }
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Binary lock that, like a semaphore, may be released by anyone
#[derive(Debug, Default)]
pub struct LocalLock {
    locked: Mutex<bool>,
    cond: Condvar,
}

fn poisoned<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "lock state poisoned")
}

impl LocalLock {
    pub fn new() -> Self {
        LocalLock::default()
    }
}

impl Lock for LocalLock {
    fn try_lock_for(&self, timeout: Duration) -> io::Result<bool> {
        let locked = self.locked.lock().map_err(poisoned)?;
        let (mut locked, _) = self
            .cond
            .wait_timeout_while(locked, timeout, |locked| *locked)
            .map_err(poisoned)?;

        if *locked {
            return Ok(false);
        }
        *locked = true;
        Ok(true)
    }

    fn unlock(&self) -> io::Result<()> {
        let mut locked = self.locked.lock().map_err(poisoned)?;
        *locked = false;
        drop(locked);
        self.cond.notify_one();
        Ok(())
    }
}

use std::{io, mem, ptr};

use tracing::{debug, warn};

use super::MODE;

/// Attached System V shared memory segment
///
/// The segment is detached on drop. The creating side also marks it for removal, the kernel
/// frees it once the last process has detached.
#[derive(Debug)]
pub struct Segment {
    id: libc::c_int,
    ptr: *mut u8,
    len: usize,
    owner: bool,
}

// The mapping is shared memory; synchronization is the user's business.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn shmget(key: libc::key_t, len: usize, flags: libc::c_int) -> io::Result<libc::c_int> {
    let id = unsafe { libc::shmget(key, len, flags) };
    if id == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(id)
    }
}

fn remove(id: libc::c_int) -> io::Result<()> {
    if unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Segment {
    /// Creates a new segment of `len` bytes at `key` and attaches it
    ///
    /// Fails with `EEXIST` if a segment already exists at `key`.
    pub fn create(key: libc::key_t, len: usize) -> io::Result<Self> {
        let id = shmget(key, len, MODE | libc::IPC_CREAT | libc::IPC_EXCL)?;
        Self::attach_owned(id, true).map_err(|e| {
            let _ = remove(id);
            e
        })
    }

    /// Creates an anonymous segment, reachable only through its id
    pub fn private(len: usize) -> io::Result<Self> {
        let id = shmget(libc::IPC_PRIVATE, len, MODE | libc::IPC_CREAT)?;
        Self::attach_owned(id, true).map_err(|e| {
            let _ = remove(id);
            e
        })
    }

    /// Attaches the existing segment at `key`
    pub fn open(key: libc::key_t) -> io::Result<Self> {
        let id = shmget(key, 0, MODE)?;
        Self::attach(id)
    }

    /// Attaches an existing segment by id without taking ownership
    pub fn attach(id: libc::c_int) -> io::Result<Self> {
        Self::attach_owned(id, false)
    }

    fn attach_owned(id: libc::c_int, owner: bool) -> io::Result<Self> {
        let len = unsafe {
            let mut ds: libc::shmid_ds = mem::zeroed();
            if libc::shmctl(id, libc::IPC_STAT, &mut ds) == -1 {
                return Err(io::Error::last_os_error());
            }
            ds.shm_segsz as usize
        };

        let ptr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(io::Error::last_os_error());
        }

        debug!(id, len, owner, "attached shared memory");
        Ok(Segment {
            id,
            ptr: ptr as *mut u8,
            len,
            owner,
        })
    }

    pub fn id(&self) -> libc::c_int {
        self.id
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks the segment for removal, the kernel frees it once every process has detached
    pub fn remove(mut self) -> io::Result<()> {
        self.owner = false;
        remove(self.id)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if unsafe { libc::shmdt(self.ptr as *const libc::c_void) } == -1 {
            warn!(id = self.id, error = %io::Error::last_os_error(), "shmdt failed");
        }

        if self.owner {
            match remove(self.id) {
                Ok(()) => debug!(id = self.id, "removed shared memory"),
                // already gone, e.g. removed by an operator
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
                Err(e) => warn!(id = self.id, error = %e, "failed to remove shared memory"),
            }
        }
    }
}

use std::{ops::Deref, slice};

use tracing::warn;

use crate::v4l2;

/// Memory used for buffer exchange
#[allow(clippy::unreadable_literal)]
#[rustfmt::skip]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    Mmap        = 1,
}

/// Memory-mapped region of a device buffer
///
/// The backing memory is owned by the driver and shared with it.
/// The destructor automatically unmaps the memory.
pub struct Mmap {
    ptr: *mut std::os::raw::c_void,
    len: usize,
}

impl Mmap {
    /// Maps the buffer at `offset` of the device behind `fd`
    pub(crate) fn map(fd: std::os::raw::c_int, len: usize, offset: u32) -> std::io::Result<Self> {
        let ptr = unsafe {
            v4l2::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )?
        };

        Ok(Mmap { ptr, len })
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if let Err(e) = unsafe { v4l2::munmap(self.ptr, self.len) } {
            warn!(error = %e, len = self.len, "failed to unmap device buffer");
        }
    }
}

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

// The mapping is plain memory, only reachable through &self.
unsafe impl Send for Mmap {}

use std::{io, mem, sync::Arc};

use tracing::{debug, warn};

use crate::buffer::Type;
use crate::device::Handle;
use crate::memory::{Memory, Mmap};
use crate::v4l2;
use crate::v4l_sys::*;

/// Manage mapped buffers
///
/// All buffers are unmapped and handed back to the driver in the Drop impl.
pub struct Arena {
    handle: Arc<Handle>,
    bufs: Vec<Mmap>,
    buf_type: Type,
    /// buffers were requested from the driver and not yet freed
    requested: bool,
}

impl Arena {
    /// Returns a new buffer manager instance without any buffers
    ///
    /// # Arguments
    ///
    /// * `handle` - Device handle to get its file descriptor
    /// * `buf_type` - Type of the buffers
    pub fn new(handle: Arc<Handle>, buf_type: Type) -> Self {
        Arena {
            handle,
            bufs: Vec::new(),
            buf_type,
            requested: false,
        }
    }

    fn request(&self, count: u32) -> io::Result<u32> {
        let mut v4l2_reqbufs = v4l2_requestbuffers {
            count,
            type_: self.buf_type as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut v4l2_reqbufs as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        Ok(v4l2_reqbufs.count)
    }

    /// Allocates and maps buffers
    ///
    /// Returns the number of buffers as reported by the driver, which may differ from `count`.
    /// On error, the buffers mapped so far stay owned by the arena and are released with it.
    pub fn allocate(&mut self, count: u32) -> io::Result<u32> {
        let count = self.request(count)?;
        self.requested = true;
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "driver granted no buffers",
            ));
        }

        for index in 0..count {
            let mut v4l2_buf = v4l2_buffer {
                index,
                type_: self.buf_type as u32,
                memory: Memory::Mmap as u32,
                ..unsafe { mem::zeroed() }
            };
            let offset = unsafe {
                v4l2::ioctl(
                    self.handle.fd(),
                    v4l2::vidioc::VIDIOC_QUERYBUF,
                    &mut v4l2_buf as *mut _ as *mut std::os::raw::c_void,
                )?;
                v4l2_buf.m.offset
            };

            let map = Mmap::map(self.handle.fd(), v4l2_buf.length as usize, offset)?;
            debug!(index, length = v4l2_buf.length, "mapped device buffer");
            self.bufs.push(map);
        }

        Ok(count)
    }

    /// Unmaps all buffers and frees them in the driver by requesting zero buffers
    pub fn release(&mut self) -> io::Result<()> {
        if !self.requested {
            return Ok(());
        }

        self.bufs.clear();
        self.request(0)?;
        self.requested = false;
        Ok(())
    }

    /// Number of mapped buffers
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Access a single buffer
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.bufs.get(index).map(|buf| &buf[..])
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            // ENODEV: the device went away, nothing left to free
            if e.raw_os_error() != Some(libc::ENODEV) {
                warn!(error = %e, "failed to release device buffers");
            }
        }
    }
}

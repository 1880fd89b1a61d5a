use std::time::{Duration, Instant};
use std::{io, mem, sync::Arc};

use tracing::{debug, trace, warn};

use crate::buffer::{Metadata, Type};
use crate::device::{Device, Handle};
use crate::io::mmap::Arena;
use crate::io::traits::{CaptureStream, Stream as StreamTrait};
use crate::memory::Memory;
use crate::v4l2;
use crate::v4l_sys::*;

/// Stream of mapped buffers
///
/// An arena instance is used internally for buffer handling. Buffers move between the driver
/// (queued) and userspace (dequeued); a dequeued buffer has to be queued again before the
/// driver can fill it.
pub struct Stream {
    handle: Arc<Handle>,
    arena: Arena,
    buf_type: Type,
    /// one entry per buffer, true while the driver owns it
    queued: Vec<bool>,
    /// bytesused of the last dequeue, per buffer
    used: Vec<usize>,

    active: bool,
}

impl Stream {
    /// Returns a stream for frame capturing
    ///
    /// The driver may grant fewer or more buffers than `buf_count`.
    pub fn with_buffers(dev: &Device, buf_type: Type, buf_count: u32) -> io::Result<Self> {
        let mut arena = Arena::new(dev.handle(), buf_type);
        let count = arena.allocate(buf_count)? as usize;
        debug!(requested = buf_count, granted = count, "allocated capture buffers");

        Ok(Stream {
            handle: dev.handle(),
            arena,
            buf_type,
            queued: vec![false; count],
            used: vec![0; count],
            active: false,
        })
    }

    /// Number of buffers shared with the driver
    pub fn buffer_count(&self) -> usize {
        self.arena.len()
    }

    fn buffer_desc(&self) -> v4l2_buffer {
        v4l2_buffer {
            type_: self.buf_type as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.active {
            return;
        }

        if let Err(e) = self.stop() {
            // ENODEV means the file descriptor wrapped in the handle became invalid, most
            // likely because the device was unplugged.
            if e.raw_os_error() != Some(libc::ENODEV) {
                warn!(error = %e, "failed to stop stream");
            }
        }
    }
}

impl StreamTrait for Stream {
    fn start(&mut self) -> io::Result<()> {
        let mut typ = self.buf_type as u32;
        unsafe {
            // a previous session may have left the queue streaming, STREAMOFF also
            // hands every buffer back to userspace
            let _ = v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_STREAMOFF,
                &mut typ as *mut _ as *mut std::os::raw::c_void,
            );
        }

        // enqueue all buffers once on stream start
        for index in 0..self.arena.len() {
            self.queued[index] = false;
            CaptureStream::queue(self, index)?;
        }

        unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_STREAMON,
                &mut typ as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        self.active = true;
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        unsafe {
            let mut typ = self.buf_type as u32;
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_STREAMOFF,
                &mut typ as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        self.queued.iter_mut().for_each(|q| *q = false);
        self.active = false;
        Ok(())
    }
}

impl CaptureStream for Stream {
    fn queue(&mut self, index: usize) -> io::Result<()> {
        match self.queued.get(index) {
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no buffer with index {}", index),
                ))
            }
            Some(true) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("buffer {} is already queued", index),
                ))
            }
            Some(false) => {}
        }

        let mut v4l2_buf = v4l2_buffer {
            index: index as u32,
            ..self.buffer_desc()
        };
        unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                &mut v4l2_buf as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        self.queued[index] = true;
        Ok(())
    }

    fn dequeue(&mut self, timeout: Option<Duration>) -> io::Result<Option<(usize, Metadata)>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let wait_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    left.as_millis().min(i32::MAX as u128) as i32
                }
            };

            match self.handle.poll(libc::POLLIN, wait_ms) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    trace!("poll interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut v4l2_buf = self.buffer_desc();
            let ret = unsafe {
                v4l2::ioctl(
                    self.handle.fd(),
                    v4l2::vidioc::VIDIOC_DQBUF,
                    &mut v4l2_buf as *mut _ as *mut std::os::raw::c_void,
                )
            };
            match ret {
                Ok(()) => {}
                // readiness was signalled but nothing to dequeue yet
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    trace!("spurious readiness, retrying");
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }

            let index = v4l2_buf.index as usize;
            if index >= self.queued.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("driver returned unknown buffer index {}", index),
                ));
            }
            self.queued[index] = false;
            self.used[index] = v4l2_buf.bytesused as usize;

            let meta = Metadata {
                bytesused: v4l2_buf.bytesused,
                flags: v4l2_buf.flags.into(),
                timestamp: v4l2_buf.timestamp.into(),
                sequence: v4l2_buf.sequence,
            };
            return Ok(Some((index, meta)));
        }
    }

    fn get(&self, index: usize) -> Option<&[u8]> {
        let buf = self.arena.get(index)?;
        let used = self.used.get(index).copied().unwrap_or(0);
        Some(filled(buf, used))
    }
}

/// Valid bytes of a mapping after a dequeue reporting `used` bytes
///
/// Some drivers report 0 for bytesused, this falls back to the full mapping, which may be
/// longer than one image.
pub(crate) fn filled(buf: &[u8], used: usize) -> &[u8] {
    if used == 0 || used > buf.len() {
        buf
    } else {
        &buf[..used]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_falls_back_to_mapping() {
        let buf = [7u8; 16];
        assert_eq!(filled(&buf, 10).len(), 10);
        assert_eq!(filled(&buf, 0).len(), 16);
        assert_eq!(filled(&buf, 32).len(), 16);
    }
}

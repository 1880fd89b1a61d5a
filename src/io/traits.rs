use std::{io, time::Duration};

use crate::buffer::Metadata;

/// Streaming I/O
pub trait Stream {
    /// Start streaming, takes exclusive ownership of a device
    fn start(&mut self) -> io::Result<()>;

    /// Stop streaming, the driver returns all queued buffers to userspace
    fn stop(&mut self) -> io::Result<()>;
}

pub trait CaptureStream: Stream {
    /// Insert a buffer into the drivers' incoming queue
    fn queue(&mut self, index: usize) -> io::Result<()>;

    /// Wait for a filled buffer and remove it from the drivers' outgoing queue
    ///
    /// Returns `Ok(None)` if no buffer was filled before `timeout` expired.
    fn dequeue(&mut self, timeout: Option<Duration>) -> io::Result<Option<(usize, Metadata)>>;

    /// Get the valid bytes of the buffer at the specified index
    fn get(&self, index: usize) -> Option<&[u8]>;
}

//! Pull based frame sources
//!
//! A source hands out one filled buffer at a time as a [`FrameView`]. The view borrows
//! nothing, but the buffer behind it belongs to the caller until it is handed back with
//! [`FrameSource::return_frame`].

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::buffer::{Metadata, Type};
use crate::config::DeviceConfig;
use crate::device::Device;
use crate::format::{Format, FourCC};
use crate::io::mmap::Stream;
use crate::io::traits::{CaptureStream, Stream as _};
use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// A filled buffer on loan from a [`FrameSource`]
#[derive(Debug)]
pub struct FrameView {
    index: usize,
    meta: Metadata,
}

impl FrameView {
    /// Buffer index within the source
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }
}

pub trait FrameSource {
    /// Negotiated format, `size` is the size of one frame in bytes
    fn format(&self) -> Format;

    /// Allocates buffers and starts streaming
    fn start(&mut self) -> Result<()>;

    /// Waits for the next filled buffer
    ///
    /// Fails with [`Error::Timeout`] if nothing arrived within `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<FrameView>;

    /// Bytes of a loaned buffer
    fn data(&self, frame: &FrameView) -> &[u8];

    /// Hands a buffer back for refilling
    fn return_frame(&mut self, frame: FrameView) -> Result<()>;

    /// Stops streaming and releases all buffers
    fn stop(&mut self) -> Result<()>;
}

fn unavailable(config: &DeviceConfig, reason: impl ToString) -> Error {
    Error::DeviceUnavailable {
        path: config.path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Cuts a dequeued buffer down to one image
///
/// Mappings are often page aligned and longer than `sizeimage`; without a bytesused report
/// the whole mapping is all a stream can offer.
fn image_bytes(data: &[u8], size: u32) -> &[u8] {
    &data[..data.len().min(size as usize)]
}

/// Capture device streaming through mapped driver buffers
pub struct CaptureSource {
    device: Device,
    format: Format,
    buffer_count: u32,
    stream: Option<Stream>,
}

impl CaptureSource {
    /// Opens and configures the device
    ///
    /// Fails with [`Error::DeviceUnavailable`] if the node cannot be opened, is not a streaming
    /// capture device or does not accept the requested size and pixel format.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        config.validate()?;

        let device = Device::with_path(&config.path).map_err(|e| unavailable(config, e))?;
        let caps = device.query_caps().map_err(|e| unavailable(config, e))?;
        info!(path = %device.path().display(), "opened {}", caps);
        if !caps.can_stream_capture() {
            return Err(unavailable(
                config,
                format!("no streaming video capture support ({})", caps.capabilities),
            ));
        }

        match device.enum_formats() {
            Ok(formats) => {
                for desc in formats {
                    debug!("supported format {}", desc);
                }
            }
            Err(e) => warn!(error = %e, "failed to enumerate formats"),
        }

        if let Some(rect) = &config.crop {
            match device.set_crop(rect) {
                Ok(()) => debug!(?rect, "crop set"),
                Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOTTY)) => {
                    info!(error = %e, "cropping not supported, ignored")
                }
                Err(e) => return Err(unavailable(config, format!("crop: {}", e))),
            }
        }

        if let Some(rotation) = &config.rotation {
            match device.set_control(rotation.control, rotation.value) {
                Ok(()) => debug!(value = rotation.value, "rotation set"),
                Err(e) => warn!(control = rotation.control, error = %e, "rotation not applied"),
            }
        }

        let requested = config.format();
        let format = device
            .set_format(&requested)
            .map_err(|e| unavailable(config, format!("set format: {}", e)))?;
        if !format.matches(&requested) {
            return Err(unavailable(
                config,
                format!("requested {}, driver chose {}", requested, format),
            ));
        }
        if format.size == 0 {
            return Err(unavailable(config, "driver reported a zero image size"));
        }
        info!(%format, "format negotiated");

        Ok(CaptureSource {
            device,
            format,
            buffer_count: config.buffer_count,
            stream: None,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn stream(&mut self) -> Result<&mut Stream> {
        self.stream.as_mut().ok_or_else(|| Error::DeviceIo {
            op: "stream",
            source: io::Error::new(io::ErrorKind::NotConnected, "stream not started"),
        })
    }
}

impl FrameSource for CaptureSource {
    fn format(&self) -> Format {
        self.format
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(Error::StreamStart)?;
        // on failure the stream is dropped here, unmapping and freeing the buffers
        stream.start().map_err(Error::StreamStart)?;

        info!(buffers = stream.buffer_count(), "streaming");
        self.stream = Some(stream);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<FrameView> {
        let stream = self.stream()?;
        match stream.dequeue(Some(timeout)) {
            Ok(Some((index, meta))) => Ok(FrameView { index, meta }),
            Ok(None) => Err(Error::Timeout(timeout)),
            Err(e) => Err(Error::DeviceIo {
                op: "dequeue",
                source: e,
            }),
        }
    }

    fn data(&self, frame: &FrameView) -> &[u8] {
        let data = self
            .stream
            .as_ref()
            .and_then(|stream| stream.get(frame.index))
            .unwrap_or(&[]);
        image_bytes(data, self.format.size)
    }

    fn return_frame(&mut self, frame: FrameView) -> Result<()> {
        let index = frame.index;
        self.stream()?.queue(index).map_err(|e| {
            error!(index, error = %e, "failed to requeue buffer");
            Error::DeviceIo {
                op: "queue",
                source: e,
            }
        })
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.stop().map_err(Error::device_io("stream off"))?;
            debug!("streaming stopped");
        }
        Ok(())
    }
}

/// Synthetic source producing deterministic frames at a fixed rate
///
/// Frame `n` is filled with the bytes `(n + i) as u8` for every offset `i`, so a consumer can
/// verify content and order without hardware.
pub struct TestPattern {
    format: Format,
    buffers: Vec<Vec<u8>>,
    loaned: Vec<bool>,
    interval: Duration,
    started_at: Option<Instant>,
    next_at: Instant,
    sequence: u32,
}

impl TestPattern {
    /// A source of `width * height` single byte pixels
    pub fn new(width: u32, height: u32, buffer_count: u32, interval: Duration) -> Self {
        let size = width * height;
        let format = Format {
            stride: width,
            size,
            ..Format::new(width, height, FourCC::new(b"GREY"))
        };

        TestPattern {
            format,
            buffers: vec![vec![0; size as usize]; buffer_count.max(1) as usize],
            loaned: vec![false; buffer_count.max(1) as usize],
            interval,
            started_at: None,
            next_at: Instant::now(),
            sequence: 0,
        }
    }

    /// Expected content of frame `sequence`
    pub fn fill(sequence: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (sequence as usize).wrapping_add(i) as u8;
        }
    }

    fn not_started() -> Error {
        Error::DeviceIo {
            op: "test pattern",
            source: io::Error::new(io::ErrorKind::NotConnected, "source not started"),
        }
    }
}

impl FrameSource for TestPattern {
    fn format(&self) -> Format {
        self.format
    }

    fn start(&mut self) -> Result<()> {
        let now = Instant::now();
        self.started_at = Some(now);
        self.next_at = now;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<FrameView> {
        let started_at = self.started_at.ok_or_else(Self::not_started)?;
        let index = match self.loaned.iter().position(|loaned| !loaned) {
            Some(index) => index,
            // every buffer is out, like a driver with an empty incoming queue
            None => {
                thread::sleep(timeout);
                return Err(Error::Timeout(timeout));
            }
        };

        let wait = self.next_at.saturating_duration_since(Instant::now());
        if wait > timeout {
            thread::sleep(timeout);
            return Err(Error::Timeout(timeout));
        }
        thread::sleep(wait);
        self.next_at += self.interval;

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        Self::fill(sequence, &mut self.buffers[index]);
        self.loaned[index] = true;

        Ok(FrameView {
            index,
            meta: Metadata {
                bytesused: self.format.size,
                timestamp: Timestamp::from(started_at.elapsed()),
                sequence,
                ..Metadata::default()
            },
        })
    }

    fn data(&self, frame: &FrameView) -> &[u8] {
        self.buffers
            .get(frame.index)
            .map(|buf| buf.as_slice())
            .unwrap_or(&[])
    }

    fn return_frame(&mut self, frame: FrameView) -> Result<()> {
        match self.loaned.get_mut(frame.index) {
            Some(loaned) if *loaned => {
                *loaned = false;
                Ok(())
            }
            _ => Err(Error::DeviceIo {
                op: "test pattern",
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("buffer {} is not on loan", frame.index),
                ),
            }),
        }
    }

    fn stop(&mut self) -> Result<()> {
        if self.started_at.take().is_none() {
            return Ok(());
        }
        self.loaned.iter_mut().for_each(|loaned| *loaned = false);
        Ok(())
    }
}

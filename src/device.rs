use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{io, mem, str};

use tracing::warn;

use crate::buffer::Type;
use crate::capability::Capabilities;
use crate::format::{Description as FormatDescription, Format};
use crate::v4l2;
use crate::v4l_sys::*;

/// Raw device handle, closes the file descriptor on drop
#[derive(Debug)]
pub struct Handle {
    fd: std::os::raw::c_int,
}

impl Handle {
    fn new(fd: std::os::raw::c_int) -> Self {
        Handle { fd }
    }

    /// Returns the raw file descriptor
    pub fn fd(&self) -> std::os::raw::c_int {
        self.fd
    }

    /// Waits until one of `events` is signalled on the device
    ///
    /// Returns the number of ready descriptors, zero on timeout.
    ///
    /// # Arguments
    ///
    /// * `events` - Poll events, e.g. `libc::POLLIN`
    /// * `timeout` - Timeout in milliseconds, -1 waits forever
    pub fn poll(&self, events: i16, timeout: i32) -> io::Result<i32> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        if ret > 0 && pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("poll reported revents {:#x}", pfd.revents),
            ));
        }

        Ok(ret)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(e) = v4l2::close(self.fd) {
            warn!(fd = self.fd, error = %e, "failed to close device");
        }
    }
}

/// Crop rectangle in sensor pixel coordinates
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl str::FromStr for Rect {
    type Err = crate::Error;

    /// Parses `LEFT,TOP,WIDTHxHEIGHT`, e.g. `0,0,1024x720`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::Config(format!("invalid rectangle {:?}, want LEFT,TOP,WxH", s));

        let mut parts = s.splitn(3, ',');
        let (left, top, size) = match (parts.next(), parts.next(), parts.next()) {
            (Some(left), Some(top), Some(size)) => (left, top, size),
            _ => return Err(invalid()),
        };
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;

        Ok(Rect {
            left: left.trim().parse().map_err(|_| invalid())?,
            top: top.trim().parse().map_err(|_| invalid())?,
            width: width.trim().parse().map_err(|_| invalid())?,
            height: height.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Linux capture device abstraction
pub struct Device {
    handle: Arc<Handle>,
    path: PathBuf,
}

impl Device {
    /// Returns a capture device by path
    ///
    /// # Example
    ///
    /// ```no_run
    /// use v4l_relay::Device;
    /// let dev = Device::with_path("/dev/video0");
    /// ```
    pub fn with_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let fd = v4l2::open(&path, libc::O_RDWR | libc::O_NONBLOCK)?;

        Ok(Device {
            handle: Arc::new(Handle::new(fd)),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the raw device handle
    pub fn handle(&self) -> Arc<Handle> {
        self.handle.clone()
    }

    /// Returns the device node path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queries the driver and card identification and the capability flags
    pub fn query_caps(&self) -> io::Result<Capabilities> {
        unsafe {
            let mut v4l2_caps: v4l2_capability = mem::zeroed();
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_QUERYCAP,
                &mut v4l2_caps as *mut _ as *mut std::os::raw::c_void,
            )?;

            Ok(Capabilities::from(v4l2_caps))
        }
    }

    /// Returns all pixel formats the capture queue supports
    pub fn enum_formats(&self) -> io::Result<Vec<FormatDescription>> {
        let mut formats = Vec::new();
        let mut v4l2_fmt = v4l2_fmtdesc {
            index: 0,
            type_: Type::VideoCapture as u32,
            ..unsafe { mem::zeroed() }
        };

        loop {
            let ret = unsafe {
                v4l2::ioctl(
                    self.handle.fd(),
                    v4l2::vidioc::VIDIOC_ENUM_FMT,
                    &mut v4l2_fmt as *mut _ as *mut std::os::raw::c_void,
                )
            };

            match ret {
                Ok(()) => {
                    formats.push(FormatDescription::from(v4l2_fmt));
                    v4l2_fmt.index += 1;
                }
                // EINVAL marks the end of the list
                Err(e) if e.kind() == io::ErrorKind::InvalidInput && !formats.is_empty() => break,
                Err(e) => return Err(e),
            }
        }

        Ok(formats)
    }

    /// Returns the format currently in use
    pub fn format(&self) -> io::Result<Format> {
        unsafe {
            let mut v4l2_fmt = v4l2_format {
                type_: Type::VideoCapture as u32,
                ..mem::zeroed()
            };
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_G_FMT,
                &mut v4l2_fmt as *mut _ as *mut std::os::raw::c_void,
            )?;

            Ok(Format::from(v4l2_fmt.fmt.pix))
        }
    }

    /// Modifies the capture format and returns the actual format
    ///
    /// The driver matches the request on a best effort basis and reports back what it chose.
    pub fn set_format(&self, fmt: &Format) -> io::Result<Format> {
        unsafe {
            let mut v4l2_fmt = v4l2_format {
                type_: Type::VideoCapture as u32,
                ..mem::zeroed()
            };
            v4l2_fmt.fmt.pix = (*fmt).into();
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_S_FMT,
                &mut v4l2_fmt as *mut _ as *mut std::os::raw::c_void,
            )?;
        }

        self.format()
    }

    /// Sets the capture crop rectangle
    pub fn set_crop(&self, rect: &Rect) -> io::Result<()> {
        unsafe {
            let mut v4l2_crop = v4l2_crop {
                type_: Type::VideoCapture as u32,
                ..mem::zeroed()
            };
            v4l2_crop.c.left = rect.left;
            v4l2_crop.c.top = rect.top;
            v4l2_crop.c.width = rect.width;
            v4l2_crop.c.height = rect.height;
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_S_CROP,
                &mut v4l2_crop as *mut _ as *mut std::os::raw::c_void,
            )
        }
    }

    /// Sets a single integer control, e.g. rotation
    pub fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
        let mut v4l2_ctrl = v4l2_control { id, value };
        unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_S_CTRL,
                &mut v4l2_ctrl as *mut _ as *mut std::os::raw::c_void,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_from_str() {
        let rect: Rect = "8,-4,1024x720".parse().unwrap();
        assert_eq!(
            rect,
            Rect {
                left: 8,
                top: -4,
                width: 1024,
                height: 720
            }
        );

        for bad in ["", "1,2", "1,2,3", "a,0,1x1", "0,0,1x"] {
            assert!(bad.parse::<Rect>().is_err(), "{}", bad);
        }
    }
}

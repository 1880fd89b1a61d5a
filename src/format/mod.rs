use std::{fmt, mem};

use crate::v4l_sys::*;

pub mod description;
pub use description::Description;

pub mod fourcc;
pub use fourcc::FourCC;

/// V4L2_FIELD_ANY, let the driver pick the field order
const FIELD_ANY: u32 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Streaming format (single-planar)
pub struct Format {
    /// width in pixels
    pub width: u32,
    /// height in pixels
    pub height: u32,
    /// pixelformat code
    pub fourcc: FourCC,
    /// bytes per line
    pub stride: u32,
    /// maximum number of bytes required to store an image
    pub size: u32,
}

impl Format {
    /// Returns a capture format with driver-computed stride and size
    ///
    /// # Example
    ///
    /// ```
    /// use v4l_relay::format::{Format, FourCC};
    /// let fmt = Format::new(640, 480, FourCC::new(b"NV12"));
    /// ```
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Format {
            width,
            height,
            fourcc,
            stride: 0,
            size: 0,
        }
    }

    /// Whether the driver kept the geometry and pixel format we asked for
    pub fn matches(&self, requested: &Format) -> bool {
        self.width == requested.width
            && self.height == requested.height
            && self.fourcc == requested.fourcc
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} (stride {}, {} bytes)",
            self.width, self.height, self.fourcc, self.stride, self.size
        )
    }
}

impl From<v4l2_pix_format> for Format {
    fn from(fmt: v4l2_pix_format) -> Self {
        Self {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.pixelformat),
            stride: fmt.bytesperline,
            size: fmt.sizeimage,
        }
    }
}

impl From<Format> for v4l2_pix_format {
    fn from(format: Format) -> Self {
        Self {
            width: format.width,
            height: format.height,
            pixelformat: format.fourcc.into(),
            field: FIELD_ANY,
            bytesperline: format.stride,
            sizeimage: format.size,
            ..unsafe { mem::zeroed() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_adjusted_size_still_matches() {
        let requested = Format::new(640, 480, FourCC::new(b"NV12"));
        let actual = Format {
            stride: 640,
            size: 640 * 480 * 3 / 2,
            ..requested
        };
        assert!(actual.matches(&requested));

        let shrunk = Format::new(320, 240, FourCC::new(b"NV12"));
        assert!(!shrunk.matches(&requested));
    }

    #[test]
    fn pix_format_roundtrip_keeps_geometry() {
        let fmt = Format::new(1280, 720, FourCC::new(b"YUYV"));
        let raw: v4l2_pix_format = fmt.into();
        assert_eq!(raw.field, FIELD_ANY);
        assert_eq!(Format::from(raw), fmt);
    }
}

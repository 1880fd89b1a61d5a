use bitflags::bitflags;
use std::fmt;

use crate::v4l_sys::*;

bitflags! {
    /// Device capability flags as reported by `VIDIOC_QUERYCAP`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        const VIDEO_CAPTURE         = 0x00000001;
        const VIDEO_OUTPUT          = 0x00000002;
        const VIDEO_OVERLAY         = 0x00000004;
        const VIDEO_CAPTURE_MPLANE  = 0x00001000;
        const VIDEO_M2M             = 0x00008000;
        const READ_WRITE            = 0x01000000;
        const STREAMING             = 0x04000000;
        const DEVICE_CAPS           = 0x80000000;
    }
}

impl From<u32> for Flags {
    fn from(flags: u32) -> Self {
        Self::from_bits_retain(flags)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
/// Device capabilities
pub struct Capabilities {
    /// Driver name, e.g. uvc for usb video class devices
    pub driver: String,
    /// Card name
    pub card: String,
    /// Bus name, e.g. USB or PCI
    pub bus: String,
    /// Version number MAJOR.MINOR.PATCH
    pub version: (u8, u8, u8),
    /// Capabilities of the opened node (falls back to the physical device)
    pub capabilities: Flags,
}

impl Capabilities {
    /// Whether the node can be used as a streaming single-planar capture source
    pub fn can_stream_capture(&self) -> bool {
        self.capabilities
            .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING)
    }
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl From<v4l2_capability> for Capabilities {
    fn from(cap: v4l2_capability) -> Self {
        // device_caps is only valid when the driver sets V4L2_CAP_DEVICE_CAPS
        let flags = Flags::from(cap.capabilities);
        let capabilities = if flags.contains(Flags::DEVICE_CAPS) {
            Flags::from(cap.device_caps)
        } else {
            flags
        };

        Capabilities {
            driver: c_string(&cap.driver),
            card: c_string(&cap.card),
            bus: c_string(&cap.bus_info),
            version: (
                ((cap.version >> 16) & 0xff) as u8,
                ((cap.version >> 8) & 0xff) as u8,
                (cap.version & 0xff) as u8,
            ),
            capabilities,
        }
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) on {}, v{}.{}.{}, caps: {}",
            self.card,
            self.driver,
            self.bus,
            self.version.0,
            self.version.1,
            self.version.2,
            self.capabilities
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_string_stops_at_nul() {
        assert_eq!(c_string(b"uvcvideo\0\0\0junk"), "uvcvideo");
        assert_eq!(c_string(b"full"), "full");
    }

    #[test]
    fn streaming_capture_requires_both_flags() {
        let mut caps = Capabilities {
            driver: String::new(),
            card: String::new(),
            bus: String::new(),
            version: (0, 0, 0),
            capabilities: Flags::VIDEO_CAPTURE,
        };
        assert!(!caps.can_stream_capture());

        caps.capabilities |= Flags::STREAMING;
        assert!(caps.can_stream_capture());
    }
}

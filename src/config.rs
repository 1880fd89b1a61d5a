//! Session configuration
//!
//! Defaults reproduce the classic single camera setup: /dev/video0 at 640x480 NV12 with two
//! capture buffers, relayed through a two slot ring keyed on /tmp.

use std::path::PathBuf;
use std::time::Duration;

use crate::device::Rect;
use crate::format::{Format, FourCC};
use crate::ring::MAX_SLOTS;
use crate::{Error, Result};

/// V4L2_CID_ROTATE (V4L2_CID_BASE + 34)
pub const V4L2_CID_ROTATE: u32 = 0x0098_0922;

/// Rotation control pass-through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Control id, drivers with private controls use V4L2_CID_PRIVATE_BASE + n
    pub control: u32,
    /// Degrees or driver specific value
    pub value: i32,
}

/// Capture device settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    /// Number of driver buffers to request
    pub buffer_count: u32,
    pub crop: Option<Rect>,
    pub rotation: Option<Rotation>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            path: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            fourcc: FourCC::new(b"NV12"),
            buffer_count: 2,
            crop: None,
            rotation: None,
        }
    }
}

impl DeviceConfig {
    /// Accepts either a device index ("0") or a node path ("/dev/video0")
    pub fn device_path(arg: &str) -> PathBuf {
        if arg.parse::<u64>().is_ok() {
            PathBuf::from(format!("/dev/video{}", arg))
        } else {
            PathBuf::from(arg)
        }
    }

    /// The format to request from the driver
    pub fn format(&self) -> Format {
        Format::new(self.width, self.height, self.fourcc)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "frame size {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(Error::Config("at least one capture buffer is required".into()));
        }
        if let Some(crop) = self.crop {
            if crop.width == 0 || crop.height == 0 {
                return Err(Error::Config("crop rectangle is empty".into()));
            }
        }
        Ok(())
    }
}

/// Parses a decimal or `0x` prefixed hexadecimal number, as used for IPC ids and control ids
pub fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| Error::Config(format!("invalid number {:?}: {}", s, e)))
}

/// Well-known System V IPC keys, derived with ftok(3) from a path and two project ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcKeys {
    pub path: PathBuf,
    pub shm_id: i32,
    pub sem_id: i32,
}

impl Default for IpcKeys {
    fn default() -> Self {
        IpcKeys {
            path: PathBuf::from("/tmp"),
            shm_id: 0x123,
            sem_id: 0x391,
        }
    }
}

/// Shared ring settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    pub keys: IpcKeys,
    /// Power of two, at most [`MAX_SLOTS`]
    pub slot_count: u32,
    /// How long one attempt to take the lock may block
    pub lock_timeout: Duration,
    /// Consecutive lock timeouts after which a warning is logged
    pub lock_warn_after: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            keys: IpcKeys::default(),
            slot_count: 2,
            lock_timeout: Duration::from_millis(100),
            lock_warn_after: 10,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.slot_count.is_power_of_two() || self.slot_count > MAX_SLOTS {
            return Err(Error::Config(format!(
                "slot count {} must be a power of two no larger than {}",
                self.slot_count, MAX_SLOTS
            )));
        }
        // ftok only uses the low 8 bits of the project id
        if (self.keys.shm_id & 0xff) == 0 || (self.keys.sem_id & 0xff) == 0 {
            return Err(Error::Config("ipc project ids must be non-zero in the low 8 bits".into()));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::Config("lock timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Producer loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Wait for one frame before reporting a timeout and trying again
    pub frame_timeout: Duration,
    /// Stop after this many captured frames
    pub max_frames: Option<u64>,
    /// Log a drop summary every this many frames while frames are being dropped
    pub report_every: u64,
    /// Consecutive frame timeouts after which a warning is logged
    pub stall_warn_after: u32,
    /// Consecutive frame timeouts after which the device is given up, `None` waits forever
    pub max_stalls: Option<u32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            frame_timeout: Duration::from_secs(2),
            max_frames: None,
            report_every: 300,
            stall_warn_after: 3,
            max_stalls: Some(30),
        }
    }
}

/// Consumer side settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainConfig {
    /// Sleep between polls of an empty ring
    pub poll_interval: Duration,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
    /// How long to wait for the producer to mark the ring ready
    pub ready_timeout: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        DrainConfig {
            poll_interval: Duration::from_millis(10),
            max_frames: None,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DeviceConfig::default().validate().unwrap();
        RingConfig::default().validate().unwrap();
    }

    #[test]
    fn device_index_expands_to_node() {
        assert_eq!(DeviceConfig::device_path("2"), PathBuf::from("/dev/video2"));
        assert_eq!(
            DeviceConfig::device_path("/dev/v4l/by-id/cam"),
            PathBuf::from("/dev/v4l/by-id/cam")
        );
    }

    #[test]
    fn slot_count_must_be_power_of_two() {
        for bad in [0, 3, 6, MAX_SLOTS * 2] {
            let cfg = RingConfig {
                slot_count: bad,
                ..RingConfig::default()
            };
            assert!(matches!(cfg.validate(), Err(Error::Config(_))), "{}", bad);
        }

        for good in [1, 2, 4, MAX_SLOTS] {
            let cfg = RingConfig {
                slot_count: good,
                ..RingConfig::default()
            };
            assert!(cfg.validate().is_ok(), "{}", good);
        }
    }

    #[test]
    fn numbers_accept_hex() {
        assert_eq!(parse_number("0x391").unwrap(), 0x391);
        assert_eq!(parse_number("291").unwrap(), 291);
        assert!(parse_number("0xzz").is_err());
        assert!(parse_number("-1").is_err());
    }

    #[test]
    fn empty_frames_are_rejected() {
        let cfg = DeviceConfig {
            width: 0,
            ..DeviceConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = DeviceConfig {
            buffer_count: 0,
            ..DeviceConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

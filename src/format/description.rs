use bitflags::bitflags;
use std::fmt;

use crate::format::FourCC;
use crate::v4l_sys::*;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags : u32 {
        const COMPRESSED            = 0x0001;
        const EMULATED              = 0x0002;
        const CONTINUOUS_BITSTREAM  = 0x0004;
        const DYN_RESOLUTION        = 0x0008;
    }
}

impl From<u32> for Flags {
    fn from(flags: u32) -> Self {
        Self::from_bits_truncate(flags)
    }
}

#[derive(Debug)]
/// Format description as returned by [`crate::v4l2::vidioc::VIDIOC_ENUM_FMT`]
pub struct Description {
    pub index: u32,
    pub flags: Flags,
    pub description: String,
    pub fourcc: FourCC,
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.index, self.fourcc, self.description)?;
        if self.flags.contains(Flags::EMULATED) {
            write!(f, " emulated")?;
        }
        Ok(())
    }
}

impl From<v4l2_fmtdesc> for Description {
    fn from(desc: v4l2_fmtdesc) -> Self {
        let end = desc
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(desc.description.len());

        Self {
            index: desc.index,
            flags: Flags::from(desc.flags),
            description: String::from_utf8_lossy(&desc.description[..end]).into_owned(),
            fourcc: FourCC::from(desc.pixelformat),
        }
    }
}

use std::{fmt, str};

use crate::Error;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
/// Four character code representing a pixelformat
pub struct FourCC {
    pub repr: [u8; 4],
}

impl FourCC {
    /// Returns a pixelformat as four character code
    ///
    /// # Example
    ///
    /// ```
    /// use v4l_relay::format::FourCC;
    /// let fourcc = FourCC::new(b"NV12");
    /// assert_eq!(fourcc.str().unwrap(), "NV12");
    /// ```
    pub const fn new(repr: &[u8; 4]) -> FourCC {
        FourCC { repr: *repr }
    }

    /// Returns the string representation of a four character code
    pub fn str(&self) -> Result<&str, str::Utf8Error> {
        str::from_utf8(&self.repr)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.str() {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:#010x}", u32::from(*self)),
        }
    }
}

impl str::FromStr for FourCC {
    type Err = Error;

    /// Parses codes such as `NV12` or `YUYV`. Shorter codes are padded with spaces the way
    /// videodev2.h defines them (e.g. `Y8` is `"Y8  "`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 || !s.is_ascii() {
            return Err(Error::Config(format!("invalid fourcc: {:?}", s)));
        }

        let mut repr = [b' '; 4];
        repr[..bytes.len()].copy_from_slice(bytes);
        Ok(FourCC { repr })
    }
}

impl From<u32> for FourCC {
    fn from(code: u32) -> Self {
        FourCC::new(&code.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_le_bytes(fourcc.repr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_matches_videodev2_code() {
        // v4l2_fourcc('N', 'V', '1', '2')
        let code = u32::from(FourCC::new(b"NV12"));
        assert_eq!(code, 0x3231_564e);
        assert_eq!(FourCC::from(code), FourCC::new(b"NV12"));
    }

    #[test]
    fn parse_pads_short_codes() {
        let fourcc: FourCC = "Y8".parse().unwrap();
        assert_eq!(fourcc.repr, *b"Y8  ");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<FourCC>().is_err());
        assert!("TOOLONG".parse::<FourCC>().is_err());
    }

    #[test]
    fn display_falls_back_to_hex() {
        let fourcc = FourCC::new(&[0xff, 0xfe, 0x00, 0x01]);
        assert_eq!(fourcc.to_string(), "0x0100feff");
    }
}

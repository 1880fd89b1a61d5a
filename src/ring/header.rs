//! Shared ring header and its state machine
//!
//! Everything in here runs inside the cross-process critical section. The header is plain
//! `repr(C)` data at the start of the shared region; the frame slots follow at
//! [`HEADER_SIZE`].
//!
//! Per slot, `occupied` and `reading` encode three states:
//!
//! | occupied | reading | state                         |
//! |----------|---------|-------------------------------|
//! | 0        | 0       | empty, writable               |
//! | 1        | 0       | filled, unread                |
//! | 1        | 1       | handed to the reader          |

use std::{mem, ptr};

use crate::format::{Format, FourCC};
use crate::{Error, Result};

/// "V4RR" in memory
pub const MAGIC: u32 = u32::from_le_bytes(*b"V4RR");
pub const VERSION: u32 = 1;

/// Upper bound for the slot count, one bit per slot in a 64-bit word
pub const MAX_SLOTS: u32 = 64;

const SLOT_ALIGN: usize = 64;

/// Offset of the first slot in the region
pub const HEADER_SIZE: usize = (mem::size_of::<Header>() + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1);

/// Immutable session parameters, fixed when the ring is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub slot_count: u32,
    pub frame_size: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: FourCC,
}

impl Geometry {
    /// Slots sized for frames of the negotiated capture format
    pub fn for_format(format: &Format, slot_count: u32) -> Self {
        Geometry {
            slot_count,
            frame_size: format.size,
            width: format.width,
            height: format.height,
            pixel_format: format.fourcc,
        }
    }

    /// Bytes needed for the header plus all slots
    pub fn region_len(&self) -> usize {
        HEADER_SIZE + self.slot_count as usize * self.frame_size as usize
    }

    pub fn validate(&self) -> Result<()> {
        if !self.slot_count.is_power_of_two() || self.slot_count > MAX_SLOTS {
            return Err(Error::Config(format!(
                "slot count {} must be a power of two no larger than {}",
                self.slot_count, MAX_SLOTS
            )));
        }
        if self.frame_size == 0 {
            return Err(Error::Config("frame size must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The frame went into an empty slot
    Written { slot: u32 },
    /// The ring was full; the oldest unread frame was dropped to make room
    Overwritten {
        slot: u32,
        dropped_slot: u32,
        dropped_generation: u64,
    },
    /// The only candidate slot is being read; the new frame was dropped
    Full { slot: u32 },
}

impl Publish {
    /// Whether the published frame is now in the ring
    pub fn is_stored(&self) -> bool {
        !matches!(self, Publish::Full { .. })
    }
}

/// A slot handed to the reader
///
/// Not `Clone`: it has to be given back through [`crate::ring::Ring::release`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct Acquired {
    pub(crate) slot: u32,
    pub(crate) generation: u64,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl Acquired {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Publish sequence number of the frame, counting from zero
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Outcome of an acquire
#[derive(Debug, PartialEq, Eq)]
pub enum Acquire {
    Ready(Acquired),
    Empty,
}

/// Counters snapshot
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub write_cursor: u64,
    pub read_cursor: u64,
    /// Frames dropped by overwrite-oldest
    pub overwritten: u64,
    /// Frames dropped because their slot was being read
    pub rejected: u64,
}

impl Stats {
    /// Unread frames in the ring
    pub fn pending(&self) -> u64 {
        self.write_cursor - self.read_cursor
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct Header {
    magic: u32,
    version: u32,
    slot_count: u32,
    frame_size: u32,
    width: u32,
    height: u32,
    pixel_format: u32,
    ready: u32,
    creator_pid: i32,
    _reserved: u32,
    write_cursor: u64,
    read_cursor: u64,
    occupied: u64,
    reading: u64,
    overwritten: u64,
    rejected: u64,
}

impl Header {
    /// Resets the header for a new session and marks it ready
    pub fn init(&mut self, geometry: &Geometry, creator_pid: i32) {
        self.ready = 0;
        self.magic = MAGIC;
        self.version = VERSION;
        self.slot_count = geometry.slot_count;
        self.frame_size = geometry.frame_size;
        self.width = geometry.width;
        self.height = geometry.height;
        self.pixel_format = geometry.pixel_format.into();
        self.creator_pid = creator_pid;
        self._reserved = 0;
        self.write_cursor = 0;
        self.read_cursor = 0;
        self.occupied = 0;
        self.reading = 0;
        self.overwritten = 0;
        self.rejected = 0;
        // last: nothing above may be observed half-written
        self.ready = 1;
    }

    pub fn is_ready(&self) -> bool {
        self.ready != 0
    }

    /// Clears the ready flag, consumers stop acquiring
    pub fn retire(&mut self) {
        self.ready = 0;
    }

    /// Checks that a ready header describes a ring that fits into `region_len` bytes
    pub fn validate(&self, region_len: usize) -> Result<Geometry> {
        if self.magic != MAGIC {
            return Err(Error::Layout(format!("bad magic {:#010x}", self.magic)));
        }
        if self.version != VERSION {
            return Err(Error::Layout(format!(
                "layout version {}, expected {}",
                self.version, VERSION
            )));
        }

        let geometry = self.geometry();
        geometry
            .validate()
            .map_err(|e| Error::Layout(e.to_string()))?;
        if geometry.region_len() > region_len {
            return Err(Error::Layout(format!(
                "ring needs {} bytes, region has {}",
                geometry.region_len(),
                region_len
            )));
        }
        Ok(geometry)
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            slot_count: self.slot_count,
            frame_size: self.frame_size,
            width: self.width,
            height: self.height,
            pixel_format: FourCC::from(self.pixel_format),
        }
    }

    pub fn creator_pid(&self) -> i32 {
        self.creator_pid
    }

    /// Reads the ready flag and creator pid without holding the lock
    ///
    /// # Safety
    ///
    /// `header` must point to a mapped, aligned header.
    pub unsafe fn peek_session(header: *const Header) -> (bool, i32) {
        let ready = ptr::read_volatile(ptr::addr_of!((*header).ready));
        let pid = ptr::read_volatile(ptr::addr_of!((*header).creator_pid));
        (ready != 0, pid)
    }

    fn mask(&self) -> u64 {
        self.slot_count as u64 - 1
    }

    fn slot_of(&self, cursor: u64) -> u32 {
        (cursor & self.mask()) as u32
    }

    fn bit(slot: u32) -> u64 {
        1u64 << slot
    }

    pub fn slot_offset(&self, slot: u32) -> usize {
        HEADER_SIZE + slot as usize * self.frame_size as usize
    }

    /// Claims the slot for the next frame
    ///
    /// On `Written`/`Overwritten` the caller copies the frame into the returned slot before
    /// leaving the critical section.
    pub fn publish(&mut self) -> Publish {
        let slot = self.slot_of(self.write_cursor);
        let bit = Self::bit(slot);

        if self.reading & bit != 0 {
            self.rejected += 1;
            return Publish::Full { slot };
        }

        let result = if self.occupied & bit != 0 {
            // full: this slot holds the oldest unread frame
            let dropped_generation = self.read_cursor;
            self.read_cursor += 1;
            self.overwritten += 1;
            Publish::Overwritten {
                slot,
                dropped_slot: slot,
                dropped_generation,
            }
        } else {
            Publish::Written { slot }
        };

        self.occupied |= bit;
        self.write_cursor += 1;
        result
    }

    /// Hands the oldest unread slot to the reader without clearing its occupied bit
    ///
    /// Acquiring again before releasing returns the same slot.
    pub fn acquire(&mut self) -> Acquire {
        if !self.is_ready() || self.read_cursor == self.write_cursor {
            return Acquire::Empty;
        }

        let slot = self.slot_of(self.read_cursor);
        let bit = Self::bit(slot);
        if self.occupied & bit == 0 {
            // an overwrite already moved past this position
            return Acquire::Empty;
        }

        self.reading |= bit;
        Acquire::Ready(Acquired {
            slot,
            generation: self.read_cursor,
            offset: self.slot_offset(slot),
            len: self.frame_size as usize,
        })
    }

    /// Returns a slot handed out by [`Header::acquire`] to the writer
    pub fn release(&mut self, slot: u32, generation: u64) -> Result<()> {
        let bit = Self::bit(slot);
        if slot >= self.slot_count
            || self.reading & bit == 0
            || generation != self.read_cursor
            || self.slot_of(self.read_cursor) != slot
        {
            return Err(Error::InvalidRelease { slot });
        }

        self.reading &= !bit;
        self.occupied &= !bit;
        self.read_cursor += 1;
        Ok(())
    }

    /// Drops a "being read" mark left behind by a reader that went away
    pub fn clear_reader(&mut self) -> Option<u32> {
        if self.reading == 0 {
            return None;
        }

        let slot = self.reading.trailing_zeros();
        self.reading = 0;
        Some(slot)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            write_cursor: self.write_cursor,
            read_cursor: self.read_cursor,
            overwritten: self.overwritten,
            rejected: self.rejected,
        }
    }
}

//! Relay video4linux capture frames to an unrelated consumer process
//!
//! The producer side opens a capture device ([`source::CaptureSource`]), streams from
//! memory-mapped driver buffers and publishes every completed frame into a ring of fixed size
//! slots living in System V shared memory ([`ring::SharedRing`]). The consumer side attaches to
//! the same ring through well-known keys and drains frames in arrival order
//! ([`drain::Drain`]). All ring state changes happen under one cross-process semaphore.
//!
//! The ring is full when the consumer falls behind; the oldest unread frame is then
//! overwritten and reported as dropped.
//!
//! # Example
//!
//! ```no_run
//! use v4l_relay::prelude::*;
//!
//! let config = DeviceConfig::default();
//! let mut source = CaptureSource::open(&config)?;
//! let ring = SharedRing::create_shared(&RingConfig::default(), Geometry::for_format(&source.format(), 2))?;
//!
//! Relay::new(RelayConfig::default(), Cancel::with_signals()?).run(&mut source, &ring)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use v4l2_sys as v4l_sys;

pub mod v4l2;

pub mod backoff;
pub mod buffer;
pub mod capability;
pub mod config;
pub mod device;
pub mod drain;
pub mod format;
pub mod io;
pub mod ipc;
pub mod memory;
pub mod relay;
pub mod ring;
pub mod signal;
pub mod source;
pub mod timestamp;

mod error;
pub use error::{Error, Result};

pub use capability::Capabilities;
pub use device::Device;
pub use timestamp::Timestamp;

pub mod prelude {
    pub use crate::config::{DeviceConfig, DrainConfig, RelayConfig, RingConfig};
    pub use crate::drain::Drain;
    pub use crate::relay::Relay;
    pub use crate::ring::{Acquire, Geometry, Publish, SharedRing};
    pub use crate::signal::Cancel;
    pub use crate::source::{CaptureSource, FrameSource, TestPattern};
    pub use crate::{Error, Result};
}

use std::io;
use std::time::Duration;

/// Errors of the capture, transport and drain components
///
/// `Empty` and `Full` ring conditions are not errors, they are reported through
/// [`crate::ring::Acquire`] and [`crate::ring::Publish`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device could not be opened or configured as requested
    #[error("device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    /// Buffer allocation or STREAMON was rejected
    #[error("failed to start streaming: {0}")]
    StreamStart(#[source] io::Error),

    /// Dequeue, requeue or readiness wait failed while streaming
    #[error("device I/O failed during {op}: {source}")]
    DeviceIo {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// No frame was filled within the timeout
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    /// Shared memory or semaphore could not be created
    #[error("failed to create {what}: {source}")]
    PoolCreation {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// The cross-process lock was not granted within the timeout
    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// A shared memory or semaphore syscall failed outside of creation
    #[error("{op} failed: {source}")]
    Ipc {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The attached region does not carry a compatible ring
    #[error("incompatible ring layout: {0}")]
    Layout(String),

    /// A frame larger than a ring slot
    #[error("frame of {len} bytes does not fit a {frame_size} byte slot")]
    FrameSize { len: usize, frame_size: u32 },

    /// A release that does not match the outstanding acquire
    #[error("slot {slot} is not held by this reader")]
    InvalidRelease { slot: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Writing a drained frame to the sink failed
    #[error("sink write failed: {0}")]
    Sink(#[source] io::Error),
}

impl Error {
    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::LockTimeout(_) | Error::Timeout(_))
    }

    pub(crate) fn device_io(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::DeviceIo { op, source }
    }

    pub(crate) fn ipc(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Ipc { op, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Streaming I/O with driver-owned, memory-mapped buffers

pub mod mmap;
pub mod traits;

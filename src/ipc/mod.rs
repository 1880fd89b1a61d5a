//! System V shared memory and semaphores
//!
//! Both objects are located through keys derived with ftok(3), so producer and consumer find
//! them without any other coordination. Objects are created world read/writable.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

mod sem;
pub use sem::Semaphore;

mod shm;
pub use shm::Segment;

/// Permission bits for created objects
const MODE: libc::c_int = 0o666;

/// Derives a System V IPC key from an existing path and a project id
pub fn key<P: AsRef<Path>>(path: P, id: i32) -> io::Result<libc::key_t> {
    let c_path = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let key = unsafe { libc::ftok(c_path.as_ptr(), id) };
    if key == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_depends_on_id() {
        let a = key("/tmp", 0x23).unwrap();
        assert_eq!(a, key("/tmp", 0x23).unwrap());
        assert_ne!(a, key("/tmp", 0x91).unwrap());
    }

    #[test]
    fn key_requires_existing_path() {
        assert!(key("/nonexistent/v4l-relay", 1).is_err());
    }
}

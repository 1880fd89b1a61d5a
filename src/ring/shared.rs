use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::header::{Header, HEADER_SIZE};
use super::{process_alive, Geometry, Lock, LockPolicy, Region, Ring};
use crate::backoff::Backoff;
use crate::config::RingConfig;
use crate::ipc::{self, Segment, Semaphore};
use crate::{Error, Result};

/// Ring in System V shared memory, guarded by a System V semaphore
pub type SharedRing = Ring<Segment, Semaphore>;

impl Region for Segment {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.as_ptr()
    }

    fn len(&self) -> usize {
        Segment::len(self)
    }
}

impl Lock for Semaphore {
    fn try_lock_for(&self, timeout: Duration) -> io::Result<bool> {
        self.lock(timeout)
    }

    fn unlock(&self) -> io::Result<()> {
        Semaphore::unlock(self)
    }
}

impl From<&RingConfig> for LockPolicy {
    fn from(config: &RingConfig) -> Self {
        LockPolicy {
            timeout: config.lock_timeout,
            warn_after: config.lock_warn_after,
            ..LockPolicy::default()
        }
    }
}

fn keys(config: &RingConfig) -> io::Result<(libc::key_t, libc::key_t)> {
    Ok((
        ipc::key(&config.keys.path, config.keys.shm_id)?,
        ipc::key(&config.keys.path, config.keys.sem_id)?,
    ))
}

impl Ring<Segment, Semaphore> {
    /// Creates the pool and its lock at the configured keys and initializes the ring
    ///
    /// Objects left at the keys by a creator that is no longer running are replaced. While
    /// that creator is alive this fails with [`Error::PoolCreation`] (`EEXIST`). Both objects
    /// are removed again when the returned ring is dropped.
    pub fn create_shared(config: &RingConfig, geometry: Geometry) -> Result<Self> {
        config.validate()?;
        geometry.validate()?;

        let (shm_key, sem_key) = keys(config).map_err(|source| Error::PoolCreation {
            what: "ipc key",
            source,
        })?;
        clear_stale(shm_key, sem_key)?;

        let sem = Semaphore::create(sem_key).map_err(|source| Error::PoolCreation {
            what: "semaphore",
            source,
        })?;
        let segment =
            Segment::create(shm_key, geometry.region_len()).map_err(|source| {
                Error::PoolCreation {
                    what: "shared memory",
                    source,
                }
            })?;

        info!(
            shm = segment.id(),
            sem = sem.id(),
            bytes = segment.len(),
            slots = geometry.slot_count,
            "created shared ring"
        );
        Ring::create(segment, sem, geometry, LockPolicy::from(config))
    }

    /// Attaches the pool created by the producer, waiting up to `timeout` for it to appear
    pub fn open_shared(config: &RingConfig, timeout: Duration) -> Result<Self> {
        config.validate()?;

        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(250));
        loop {
            match open(config) {
                Ok((segment, sem)) => {
                    info!(
                        shm = segment.id(),
                        sem = sem.id(),
                        bytes = segment.len(),
                        "attached shared ring"
                    );
                    return Ring::attach(segment, sem, LockPolicy::from(config));
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) && Instant::now() < deadline => {
                    debug!("shared ring not there yet");
                    backoff.wait();
                }
                Err(source) => {
                    return Err(Error::Ipc {
                        op: "open shared ring",
                        source,
                    })
                }
            }
        }
    }
}

/// Removes the pool and lock at the keys unless their creator is still running
fn clear_stale(shm_key: libc::key_t, sem_key: libc::key_t) -> Result<()> {
    match Segment::open(shm_key) {
        Ok(segment) => {
            let pid = if segment.len() >= HEADER_SIZE {
                // creator_pid is written once during init
                unsafe { Header::peek_session(segment.as_ptr() as *const Header).1 }
            } else {
                0
            };
            if process_alive(pid) {
                warn!(pid, "shared ring is in use by a running producer");
                return Err(Error::PoolCreation {
                    what: "shared memory",
                    source: io::Error::from_raw_os_error(libc::EEXIST),
                });
            }

            warn!(id = segment.id(), pid, "removing stale shared memory segment");
            segment.remove().map_err(|source| Error::PoolCreation {
                what: "shared memory",
                source,
            })?;
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
        Err(source) => {
            return Err(Error::PoolCreation {
                what: "shared memory",
                source,
            })
        }
    }

    match Semaphore::open(sem_key) {
        Ok(sem) => {
            warn!(id = sem.id(), "removing stale semaphore");
            sem.remove().map_err(|source| Error::PoolCreation {
                what: "semaphore",
                source,
            })
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
        Err(source) => Err(Error::PoolCreation {
            what: "semaphore",
            source,
        }),
    }
}

fn open(config: &RingConfig) -> io::Result<(Segment, Semaphore)> {
    let (shm_key, sem_key) = keys(config)?;
    let sem = Semaphore::open(sem_key)?;
    let segment = Segment::open(shm_key)?;
    Ok((segment, sem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcKeys;
    use crate::format::FourCC;
    use std::process::Command;

    fn geometry() -> Geometry {
        Geometry {
            slot_count: 2,
            frame_size: 16,
            width: 4,
            height: 4,
            pixel_format: FourCC::new(b"GREY"),
        }
    }

    fn exited_pid() -> i32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn only_dead_creators_are_replaced() {
        let path = std::env::temp_dir().join(format!("v4l-relay-owner-{}", std::process::id()));
        std::fs::create_dir_all(&path).unwrap();
        let config = RingConfig {
            keys: IpcKeys {
                path,
                shm_id: 0x17,
                sem_id: 0x71,
            },
            ..RingConfig::default()
        };
        let (shm_key, sem_key) = keys(&config).unwrap();

        let previous = Ring::attach(
            Segment::create(shm_key, geometry().region_len()).unwrap(),
            Semaphore::create(sem_key).unwrap(),
            LockPolicy::default(),
        )
        .unwrap();

        // pid 1 always exists
        previous.critical(|h| h.init(&geometry(), 1)).unwrap();
        assert!(matches!(
            SharedRing::create_shared(&config, geometry()),
            Err(Error::PoolCreation { .. })
        ));
        assert!(previous.stats().is_ok());

        let pid = exited_pid();
        previous.critical(|h| h.init(&geometry(), pid)).unwrap();
        let ring = SharedRing::create_shared(&config, geometry()).unwrap();
        assert_eq!(ring.stats().unwrap().write_cursor, 0);
        assert!(previous.stats().is_err());

        // its objects are gone already
        std::mem::forget(previous);
    }
}

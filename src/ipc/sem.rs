use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::MODE;

/// Binary System V semaphore used as a cross-process mutex
///
/// Every operation carries `SEM_UNDO`: if a process dies while holding the lock, the kernel
/// reverts its decrement and the lock becomes free again.
#[derive(Debug)]
pub struct Semaphore {
    id: libc::c_int,
    owner: bool,
}

fn semget(key: libc::key_t, flags: libc::c_int) -> io::Result<libc::c_int> {
    let id = unsafe { libc::semget(key, 1, flags) };
    if id == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(id)
    }
}

fn remove(id: libc::c_int) -> io::Result<()> {
    if unsafe { libc::semctl(id, 0, libc::IPC_RMID) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn set_value(id: libc::c_int, value: libc::c_int) -> io::Result<()> {
    if unsafe { libc::semctl(id, 0, libc::SETVAL, value) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64"
))]
fn semtimedop(id: libc::c_int, op: &mut libc::sembuf, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let ts = libc::timespec {
            tv_sec: left.as_secs() as libc::time_t,
            tv_nsec: left.subsec_nanos() as libc::c_long,
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_semtimedop,
                id,
                op as *mut libc::sembuf,
                1usize,
                &ts as *const libc::timespec,
            )
        };
        if ret == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => return Ok(false),
            Some(libc::EINTR) if !left.is_zero() => continue,
            Some(libc::EINTR) => return Ok(false),
            _ => return Err(err),
        }
    }
}

// Targets without a semtimedop syscall number: poll with IPC_NOWAIT.
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64"
)))]
fn semtimedop(id: libc::c_int, op: &mut libc::sembuf, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    op.sem_flg |= libc::IPC_NOWAIT as libc::c_short;
    loop {
        if unsafe { libc::semop(id, op, 1) } == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
            _ => return Err(err),
        }
    }
}

impl Semaphore {
    /// Creates the semaphore at `key`, initialized to 1 (unlocked)
    ///
    /// Fails with `EEXIST` if a semaphore already exists at `key`.
    pub fn create(key: libc::key_t) -> io::Result<Self> {
        let id = semget(key, MODE | libc::IPC_CREAT | libc::IPC_EXCL)?;
        Self::init_owned(id)
    }

    /// Creates an anonymous semaphore, reachable only through its id
    pub fn private() -> io::Result<Self> {
        let id = semget(libc::IPC_PRIVATE, MODE | libc::IPC_CREAT)?;
        Self::init_owned(id)
    }

    fn init_owned(id: libc::c_int) -> io::Result<Self> {
        if let Err(e) = set_value(id, 1) {
            let _ = remove(id);
            return Err(e);
        }

        debug!(id, "created semaphore");
        Ok(Semaphore { id, owner: true })
    }

    /// Opens the existing semaphore at `key`
    ///
    /// The value is left untouched, only the creator initializes it.
    pub fn open(key: libc::key_t) -> io::Result<Self> {
        let id = semget(key, MODE)?;
        Ok(Semaphore { id, owner: false })
    }

    /// Uses an existing semaphore by id without taking ownership
    pub fn attach(id: libc::c_int) -> io::Result<Self> {
        let sem = Semaphore { id, owner: false };
        sem.value()?;
        Ok(sem)
    }

    pub fn id(&self) -> libc::c_int {
        self.id
    }

    /// Removes the semaphore, waking every waiter with `EIDRM`
    pub fn remove(mut self) -> io::Result<()> {
        self.owner = false;
        remove(self.id)
    }

    /// Current semaphore value, 1 while unlocked
    pub fn value(&self) -> io::Result<i32> {
        let ret = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    /// Decrements the semaphore, waiting at most `timeout`
    ///
    /// Returns `Ok(false)` if the lock was not granted in time.
    pub fn lock(&self, timeout: Duration) -> io::Result<bool> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: -1,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        semtimedop(self.id, &mut op, timeout)
    }

    /// Increments the semaphore
    pub fn unlock(&self) -> io::Result<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: 1,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        loop {
            if unsafe { libc::semop(self.id, &mut op, 1) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }

        match remove(self.id) {
            Ok(()) => debug!(id = self.id, "removed semaphore"),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => warn!(id = self.id, error = %e, "failed to remove semaphore"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_times_out_while_held() {
        let sem = Semaphore::private().unwrap();
        assert_eq!(sem.value().unwrap(), 1);

        assert!(sem.lock(Duration::from_millis(10)).unwrap());
        assert_eq!(sem.value().unwrap(), 0);
        assert!(!sem.lock(Duration::from_millis(20)).unwrap());

        sem.unlock().unwrap();
        assert!(sem.lock(Duration::from_millis(10)).unwrap());
        sem.unlock().unwrap();
    }

    #[test]
    fn attached_handle_does_not_remove() {
        let sem = Semaphore::private().unwrap();
        {
            let other = Semaphore::attach(sem.id()).unwrap();
            assert!(other.lock(Duration::from_millis(10)).unwrap());
            other.unlock().unwrap();
        }
        assert_eq!(sem.value().unwrap(), 1);
    }
}

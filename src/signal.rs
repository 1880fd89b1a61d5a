//! Process-wide shutdown flag driven by SIGINT and SIGTERM

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    // only async-signal-safe work here
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Cancellation token checked by the relay and drain loops at iteration boundaries
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    local: Arc<AtomicBool>,
    signals: bool,
}

impl Cancel {
    /// A token that is only cancelled through [`Cancel::cancel`]
    pub fn new() -> Self {
        Cancel::default()
    }

    /// A token that is additionally cancelled by SIGINT and SIGTERM
    pub fn with_signals() -> io::Result<Self> {
        for sig in [libc::SIGINT, libc::SIGTERM] {
            let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            if unsafe { libc::signal(sig, handler) } == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Cancel {
            local: Arc::new(AtomicBool::new(false)),
            signals: true,
        })
    }

    pub fn cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.local.load(Ordering::SeqCst) || (self.signals && SHUTDOWN.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let cancel = Cancel::new();
        let other = cancel.clone();
        assert!(!other.is_cancelled());

        cancel.cancel();
        assert!(other.is_cancelled());
    }
}

//! Producer loop: frame source to ring

use std::io;

use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::ring::{Lock, Publish, Region, Ring};
use crate::signal::Cancel;
use crate::source::FrameSource;
use crate::{Error, Result};

/// Counters of one relay session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Frames taken from the source
    pub frames: u64,
    /// Frames stored in an empty slot
    pub written: u64,
    /// Frames stored by dropping the oldest unread frame
    pub overwritten: u64,
    /// Frames dropped because their slot was being read
    pub rejected: u64,
    /// Frames dropped because the ring lock could not be taken
    pub lock_timeouts: u64,
    /// Source waits that ended without a frame
    pub timeouts: u64,
}

impl RelayStats {
    /// Frames lost on the way into the ring
    pub fn dropped(&self) -> u64 {
        self.overwritten + self.rejected + self.lock_timeouts
    }
}

pub struct Relay {
    config: RelayConfig,
    cancel: Cancel,
}

impl Relay {
    pub fn new(config: RelayConfig, cancel: Cancel) -> Self {
        Relay { config, cancel }
    }

    /// Streams frames from `source` into `ring` until cancelled, the frame limit is reached or
    /// the source fails
    ///
    /// The source is started here and stopped on every exit path.
    pub fn run<S, R, L>(&self, source: &mut S, ring: &Ring<R, L>) -> Result<RelayStats>
    where
        S: FrameSource,
        R: Region,
        L: Lock,
    {
        source.start()?;
        info!(format = %source.format(), "relay started");

        let mut stats = RelayStats::default();
        let res = self.pump(source, ring, &mut stats);

        match (res, source.stop()) {
            (Ok(()), Ok(())) => {}
            (Ok(()), Err(e)) => return Err(e),
            (Err(e), stop) => {
                if let Err(stop) = stop {
                    warn!(error = %stop, "failed to stop source");
                }
                error!(error = %e, frames = stats.frames, "relay failed");
                return Err(e);
            }
        }

        info!(
            frames = stats.frames,
            overwritten = stats.overwritten,
            rejected = stats.rejected,
            lock_timeouts = stats.lock_timeouts,
            "relay stopped"
        );
        Ok(stats)
    }

    fn pump<S, R, L>(&self, source: &mut S, ring: &Ring<R, L>, stats: &mut RelayStats) -> Result<()>
    where
        S: FrameSource,
        R: Region,
        L: Lock,
    {
        let mut reported = 0;
        let mut stalls = 0u32;

        while !self.cancel.is_cancelled() {
            if matches!(self.config.max_frames, Some(max) if stats.frames >= max) {
                debug!(max = stats.frames, "frame limit reached");
                break;
            }

            let frame = match source.next_frame(self.config.frame_timeout) {
                Ok(frame) => frame,
                Err(e) if e.is_transient() => {
                    stats.timeouts += 1;
                    stalls += 1;
                    if matches!(self.config.max_stalls, Some(max) if stalls >= max) {
                        error!(stalls, "no frames from source, giving up");
                        return Err(Error::DeviceIo {
                            op: "dequeue",
                            source: io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("no frame in {} consecutive waits", stalls),
                            ),
                        });
                    }
                    if stalls >= self.config.stall_warn_after {
                        warn!(stalls, error = %e, "source is not delivering frames");
                    } else {
                        debug!(error = %e, "no frame, waiting again");
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            stalls = 0;

            let published = ring.publish(source.data(&frame));
            source.return_frame(frame)?;
            stats.frames += 1;

            match published {
                Ok(Publish::Written { .. }) => stats.written += 1,
                Ok(Publish::Overwritten { .. }) => stats.overwritten += 1,
                Ok(Publish::Full { .. }) => stats.rejected += 1,
                Err(e) if e.is_transient() => {
                    stats.lock_timeouts += 1;
                    warn!(error = %e, "frame dropped");
                }
                Err(e) => return Err(e),
            }

            let dropped = stats.dropped();
            if dropped > reported && stats.frames % self.config.report_every.max(1) == 0 {
                warn!(
                    frames = stats.frames,
                    dropped,
                    "consumer is not keeping up"
                );
                reported = dropped;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::local::{HeapRegion, LocalLock};
    use crate::ring::{Geometry, LockPolicy};
    use crate::format::Format;
    use crate::source::{FrameView, TestPattern};
    use std::sync::Arc;
    use std::time::Duration;

    fn ring_for(source: &TestPattern, slot_count: u32) -> Ring<Arc<HeapRegion>, Arc<LocalLock>> {
        let geometry = Geometry::for_format(&source.format(), slot_count);
        Ring::create(
            Arc::new(HeapRegion::new(geometry.region_len())),
            Arc::new(LocalLock::new()),
            geometry,
            LockPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn frame_limit_stops_the_relay() {
        let mut source = TestPattern::new(4, 4, 2, Duration::ZERO);
        let ring = ring_for(&source, 4);
        let relay = Relay::new(
            RelayConfig {
                max_frames: Some(10),
                ..RelayConfig::default()
            },
            Cancel::new(),
        );

        let stats = relay.run(&mut source, &ring).unwrap();
        assert_eq!(stats.frames, 10);
        assert_eq!(stats.written, 4);
        assert_eq!(stats.overwritten, 6);
        assert_eq!(ring.stats().unwrap().write_cursor, 10);
    }

    #[test]
    fn cancelled_relay_does_nothing() {
        let mut source = TestPattern::new(4, 4, 2, Duration::ZERO);
        let ring = ring_for(&source, 2);
        let cancel = Cancel::new();
        cancel.cancel();

        let stats = Relay::new(RelayConfig::default(), cancel)
            .run(&mut source, &ring)
            .unwrap();
        assert_eq!(stats.frames, 0);
    }

    /// Streams fine, never delivers a frame
    struct Wedged {
        waits: u32,
    }

    impl FrameSource for Wedged {
        fn format(&self) -> Format {
            TestPattern::new(4, 4, 1, Duration::ZERO).format()
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self, timeout: Duration) -> Result<FrameView> {
            self.waits += 1;
            Err(Error::Timeout(timeout))
        }

        fn data(&self, _frame: &FrameView) -> &[u8] {
            &[]
        }

        fn return_frame(&mut self, _frame: FrameView) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn wedged_source_is_given_up() {
        let mut source = Wedged { waits: 0 };
        let ring = ring_for(&TestPattern::new(4, 4, 1, Duration::ZERO), 2);
        let relay = Relay::new(
            RelayConfig {
                frame_timeout: Duration::from_millis(1),
                max_stalls: Some(5),
                ..RelayConfig::default()
            },
            Cancel::new(),
        );

        let res = relay.run(&mut source, &ring);
        assert!(matches!(res, Err(Error::DeviceIo { op: "dequeue", .. })));
        assert_eq!(source.waits, 5);
    }

    #[test]
    fn oversized_frames_abort_the_relay() {
        let mut source = TestPattern::new(8, 8, 2, Duration::ZERO);
        let small = TestPattern::new(2, 2, 1, Duration::ZERO);
        let ring = ring_for(&small, 2);

        let res = Relay::new(RelayConfig::default(), Cancel::new()).run(&mut source, &ring);
        assert!(matches!(res, Err(Error::FrameSize { len: 64, .. })));
        // source was stopped, its buffers are back
        assert!(source.next_frame(Duration::from_millis(1)).is_err());
    }
}

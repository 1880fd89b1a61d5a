//! Consumer loop: ring to sink

use std::io::Write;
use std::thread;

use tracing::{debug, info, warn};

use crate::config::DrainConfig;
use crate::ring::{Acquire, Geometry, Lock, Region, Ring};
use crate::signal::Cancel;
use crate::{Error, Result};

/// Counters of one drain session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub frames: u64,
    pub bytes: u64,
    /// Gaps in the frame generations, i.e. frames the producer dropped before we saw them
    pub skipped: u64,
}

pub struct Drain {
    config: DrainConfig,
    cancel: Cancel,
}

impl Drain {
    pub fn new(config: DrainConfig, cancel: Cancel) -> Self {
        Drain { config, cancel }
    }

    /// Waits for the ring to become ready and returns its geometry
    pub fn wait<R: Region, L: Lock>(&self, ring: &Ring<R, L>) -> Result<Geometry> {
        let geometry = ring
            .wait_for_ready(self.config.ready_timeout)?
            .ok_or(Error::Timeout(self.config.ready_timeout))?;

        if ring.recover_reader()?.is_some() {
            debug!("previous reader left a slot behind");
        }
        info!(
            width = geometry.width,
            height = geometry.height,
            pixel_format = %geometry.pixel_format,
            frame_size = geometry.frame_size,
            slots = geometry.slot_count,
            "ring ready"
        );
        Ok(geometry)
    }

    /// Copies frames from `ring` to `sink` in arrival order
    ///
    /// Runs until cancelled, the frame limit is reached, or the producer is gone and nothing is
    /// left to read.
    pub fn run<W, R, L>(&self, ring: &Ring<R, L>, sink: &mut W) -> Result<DrainStats>
    where
        W: Write,
        R: Region,
        L: Lock,
    {
        self.wait(ring)?;

        let mut stats = DrainStats::default();
        let mut expected = None;

        while !self.cancel.is_cancelled() {
            if matches!(self.config.max_frames, Some(max) if stats.frames >= max) {
                debug!(max = stats.frames, "frame limit reached");
                break;
            }

            let acquired = match ring.acquire() {
                Ok(Acquire::Ready(acquired)) => acquired,
                Ok(Acquire::Empty) => {
                    if !ring.producer_alive() {
                        info!("producer is gone");
                        break;
                    }
                    thread::sleep(self.config.poll_interval);
                    continue;
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "ring busy");
                    continue;
                }
                // the producer removes the lock on exit
                Err(e @ Error::Ipc { .. }) if !ring.producer_alive() => {
                    debug!(error = %e, "ring torn down");
                    info!("producer is gone");
                    break;
                }
                Err(e) => return Err(e),
            };

            let generation = acquired.generation();
            if let Some(expected) = expected {
                stats.skipped += generation.saturating_sub(expected);
            }
            expected = Some(generation + 1);

            let data = ring.slot(&acquired);
            let written = sink.write_all(data);
            let len = data.len() as u64;
            ring.release(acquired)?;
            written.map_err(Error::Sink)?;

            stats.frames += 1;
            stats.bytes += len;
        }

        sink.flush().map_err(Error::Sink)?;
        info!(
            frames = stats.frames,
            bytes = stats.bytes,
            skipped = stats.skipped,
            "drain stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FourCC;
    use crate::ring::local::{HeapRegion, LocalLock};
    use crate::ring::LockPolicy;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    type LocalRing = Ring<Arc<HeapRegion>, Arc<LocalLock>>;

    fn pair() -> (LocalRing, LocalRing) {
        let geometry = Geometry {
            slot_count: 4,
            frame_size: 4,
            width: 2,
            height: 2,
            pixel_format: FourCC::new(b"GREY"),
        };
        let region = Arc::new(HeapRegion::new(geometry.region_len()));
        let lock = Arc::new(LocalLock::new());
        let producer =
            Ring::create(region.clone(), lock.clone(), geometry, LockPolicy::default()).unwrap();
        let consumer = Ring::attach(region, lock, LockPolicy::default()).unwrap();
        (producer, consumer)
    }

    fn config(max_frames: Option<u64>) -> DrainConfig {
        DrainConfig {
            poll_interval: Duration::from_millis(1),
            max_frames,
            ready_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn drains_in_order_up_to_limit() {
        let (producer, consumer) = pair();
        for n in 0..3u8 {
            producer.publish(&[n; 4]).unwrap();
        }

        let mut out = Vec::new();
        let stats = Drain::new(config(Some(2)), Cancel::new())
            .run(&consumer, &mut out)
            .unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(out, vec![0, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(producer.stats().unwrap().pending(), 1);
    }

    #[test]
    fn stops_when_producer_is_gone() {
        let (producer, consumer) = pair();
        let drain = Drain::new(config(None), Cancel::new());
        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            let stats = drain.run(&consumer, &mut out).unwrap();
            (stats, out)
        });

        producer.publish(&[1; 4]).unwrap();
        producer.publish(&[2; 4]).unwrap();
        while producer.stats().unwrap().pending() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(producer);

        let (stats, out) = reader.join().unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn retired_ring_never_becomes_ready() {
        let (producer, consumer) = pair();
        drop(producer);

        let res = Drain::new(config(None), Cancel::new()).run(&consumer, &mut Vec::<u8>::new());
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[test]
    fn resumes_after_overwritten_frames() {
        let (producer, consumer) = pair();
        producer.publish(&[0; 4]).unwrap();

        let drain = Drain::new(config(Some(1)), Cancel::new());
        let mut out = Vec::new();
        drain.run(&consumer, &mut out).unwrap();

        // 1..=6 published, 1 and 2 overwritten
        for n in 1..7u8 {
            producer.publish(&[n; 4]).unwrap();
        }
        let drain = Drain::new(config(Some(4)), Cancel::new());
        let mut out = Vec::new();
        let stats = drain.run(&consumer, &mut out).unwrap();
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.skipped, 0);
        assert_eq!(out[0], 3);
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sink_failure_releases_the_slot() {
        let (producer, consumer) = pair();
        producer.publish(&[7; 4]).unwrap();

        let res = Drain::new(config(None), Cancel::new()).run(&consumer, &mut FailingSink);
        assert!(matches!(res, Err(Error::Sink(_))));
        let stats = producer.stats().unwrap();
        assert_eq!(stats.read_cursor, 1);
    }
}

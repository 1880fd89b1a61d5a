use std::sync::Arc;
use std::thread;
use std::time::Duration;

use v4l_relay::config::{DrainConfig, RelayConfig};
use v4l_relay::drain::Drain;
use v4l_relay::relay::Relay;
use v4l_relay::ring::local::{HeapRegion, LocalLock};
use v4l_relay::ring::{Geometry, LockPolicy, Ring};
use v4l_relay::signal::Cancel;
use v4l_relay::source::{FrameSource, TestPattern};

const FRAMES: u64 = 300;

#[test]
fn pattern_frames_arrive_intact_and_in_order() {
    let mut source = TestPattern::new(16, 4, 2, Duration::from_millis(1));
    let geometry = Geometry::for_format(&source.format(), 8);
    let frame_size = geometry.frame_size as usize;

    let region = Arc::new(HeapRegion::new(geometry.region_len()));
    let lock = Arc::new(LocalLock::new());
    let producer = Ring::create(region.clone(), lock.clone(), geometry, LockPolicy::default()).unwrap();
    let consumer = Ring::attach(region, lock, LockPolicy::default()).unwrap();

    let reader = thread::spawn(move || {
        let drain = Drain::new(
            DrainConfig {
                poll_interval: Duration::from_millis(1),
                max_frames: None,
                ready_timeout: Duration::from_secs(1),
            },
            Cancel::new(),
        );
        let mut out = Vec::new();
        let stats = drain.run(&consumer, &mut out).unwrap();
        (stats, out)
    });

    let relay = Relay::new(
        RelayConfig {
            max_frames: Some(FRAMES),
            ..RelayConfig::default()
        },
        Cancel::new(),
    );
    let relay_stats = relay.run(&mut source, &producer).unwrap();
    while producer.stats().unwrap().pending() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    drop(producer);

    let (drain_stats, out) = reader.join().unwrap();
    assert_eq!(relay_stats.frames, FRAMES);
    assert_eq!(drain_stats.frames + relay_stats.dropped(), FRAMES);
    assert_eq!(out.len(), drain_stats.frames as usize * frame_size);

    let mut expected = vec![0u8; frame_size];
    let mut last = None;
    for chunk in out.chunks(frame_size) {
        // first byte is the sequence number modulo 256
        let first = chunk[0];
        TestPattern::fill(first as u32, &mut expected);
        assert_eq!(chunk, &expected[..]);
        if let Some(last) = last {
            assert_ne!(first, last);
        }
        last = Some(first);
    }
}

#[test]
fn cancel_stops_both_loops() {
    let mut source = TestPattern::new(4, 4, 2, Duration::from_millis(1));
    let geometry = Geometry::for_format(&source.format(), 4);
    let region = Arc::new(HeapRegion::new(geometry.region_len()));
    let lock = Arc::new(LocalLock::new());
    let producer = Ring::create(region.clone(), lock.clone(), geometry, LockPolicy::default()).unwrap();
    let consumer = Ring::attach(region, lock, LockPolicy::default()).unwrap();

    let cancel = Cancel::new();
    let drain = Drain::new(DrainConfig::default(), cancel.clone());
    let reader = thread::spawn(move || drain.run(&consumer, &mut Vec::<u8>::new()).unwrap());

    let stopper = cancel.clone();
    let timer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stopper.cancel();
    });

    let stats = Relay::new(RelayConfig::default(), cancel)
        .run(&mut source, &producer)
        .unwrap();
    timer.join().unwrap();
    reader.join().unwrap();
    assert!(stats.frames > 0);
}

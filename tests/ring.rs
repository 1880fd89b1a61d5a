use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use v4l_relay::config::{IpcKeys, RelayConfig, RingConfig};
use v4l_relay::format::FourCC;
use v4l_relay::ipc::{self, Segment, Semaphore};
use v4l_relay::ring::{Acquire, Geometry, LockPolicy, Publish, Ring, SharedRing};
use v4l_relay::relay::Relay;
use v4l_relay::signal::Cancel;
use v4l_relay::source::TestPattern;
use v4l_relay::Error;

const FRAMES: u64 = 10_000;

fn geometry(slot_count: u32) -> Geometry {
    Geometry {
        slot_count,
        frame_size: 64,
        width: 8,
        height: 8,
        pixel_format: FourCC::new(b"GREY"),
    }
}

fn frame(n: u64) -> [u8; 64] {
    let mut buf = [0u8; 64];
    buf[..8].copy_from_slice(&n.to_le_bytes());
    for (i, b) in buf[8..].iter_mut().enumerate() {
        *b = (n as usize + i) as u8;
    }
    buf
}

fn private_pair(slot_count: u32) -> (SharedRing, SharedRing) {
    let geometry = geometry(slot_count);
    let segment = Segment::private(geometry.region_len()).unwrap();
    let sem = Semaphore::private().unwrap();
    let (shm_id, sem_id) = (segment.id(), sem.id());

    let producer = Ring::create(segment, sem, geometry, LockPolicy::default()).unwrap();
    let consumer = Ring::attach(
        Segment::attach(shm_id).unwrap(),
        Semaphore::attach(sem_id).unwrap(),
        LockPolicy::default(),
    )
    .unwrap();
    (producer, consumer)
}

#[test]
fn fixed_rate_producer_loses_nothing() {
    let slot_count = 16;
    let (producer, consumer) = private_pair(slot_count);
    consumer
        .wait_for_ready(Duration::from_secs(1))
        .unwrap()
        .unwrap();

    // 8x8 GREY frames, one every 200us, on the source's own clock
    let writer = thread::spawn(move || {
        let mut source = TestPattern::new(8, 8, 2, Duration::from_micros(200));
        let relay = Relay::new(
            RelayConfig {
                max_frames: Some(FRAMES),
                ..RelayConfig::default()
            },
            Cancel::new(),
        );
        let stats = relay.run(&mut source, &producer).unwrap();
        (stats, producer)
    });

    let mut expected = vec![0u8; 64];
    let mut next = 0;
    while next < FRAMES {
        match consumer.acquire().unwrap() {
            Acquire::Ready(acquired) => {
                assert_eq!(acquired.generation(), next, "frame lost");
                TestPattern::fill(next as u32, &mut expected);
                assert_eq!(consumer.slot(&acquired), &expected[..]);
                consumer.release(acquired).unwrap();
                next += 1;
            }
            Acquire::Empty if writer.is_finished() => break,
            Acquire::Empty => thread::yield_now(),
        }
    }

    let (stats, producer) = writer.join().unwrap();
    assert_eq!(next, FRAMES);
    assert_eq!(stats.frames, FRAMES);
    assert_eq!(stats.dropped(), 0);
    assert_eq!(producer.stats().unwrap().read_cursor, FRAMES);
}

#[test]
fn backpressured_transfer_keeps_order() {
    let slot_count = 4;
    let (producer, consumer) = private_pair(slot_count);
    consumer
        .wait_for_ready(Duration::from_secs(1))
        .unwrap()
        .unwrap();

    let writer = thread::spawn(move || {
        for n in 0..FRAMES {
            while producer.stats().unwrap().pending() >= slot_count as u64 {
                thread::yield_now();
            }
            let res = producer.publish(&frame(n)).unwrap();
            assert!(matches!(res, Publish::Written { .. }), "{:?}", res);
        }
        producer
    });

    let mut next = 0;
    while next < FRAMES {
        match consumer.acquire().unwrap() {
            Acquire::Ready(acquired) => {
                assert_eq!(acquired.generation(), next);
                assert_eq!(consumer.slot(&acquired), &frame(next)[..]);
                consumer.release(acquired).unwrap();
                next += 1;
            }
            Acquire::Empty => thread::yield_now(),
        }
    }

    let producer = writer.join().unwrap();
    let stats = producer.stats().unwrap();
    assert_eq!(stats.write_cursor, FRAMES);
    assert_eq!(stats.read_cursor, FRAMES);
    assert_eq!(stats.overwritten, 0);
    assert_eq!(stats.rejected, 0);
}

#[test]
fn concurrent_overflow_never_tears_frames() {
    let (producer, consumer) = private_pair(2);

    let writer = thread::spawn(move || {
        let mut rejected = 0;
        for n in 0..2_000 {
            if let Publish::Full { .. } = producer.publish(&frame(n)).unwrap() {
                rejected += 1;
            }
        }
        // keep the ring alive until the reader has caught up
        while producer.stats().unwrap().pending() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        (producer.stats().unwrap(), rejected)
    });

    let mut last = None;
    let mut drained = 0u64;
    loop {
        match consumer.acquire() {
            Ok(Acquire::Ready(acquired)) => {
                let data = consumer.slot(&acquired);
                let mut n = [0u8; 8];
                n.copy_from_slice(&data[..8]);
                let n = u64::from_le_bytes(n);
                assert_eq!(data, &frame(n)[..], "torn frame {}", n);
                assert!(last.map_or(true, |last| n > last));
                last = Some(n);
                consumer.release(acquired).unwrap();
                drained += 1;
            }
            Ok(Acquire::Empty) if !consumer.producer_alive() => break,
            Ok(Acquire::Empty) => thread::yield_now(),
            // lock removed by the exiting producer
            Err(Error::Ipc { .. }) if !consumer.producer_alive() => break,
            Err(e) => panic!("{}", e),
        }
    }

    let (stats, rejected) = writer.join().unwrap();
    assert_eq!(stats.rejected, rejected);
    assert_eq!(stats.write_cursor + rejected, 2_000);
    assert_eq!(drained + stats.overwritten, stats.write_cursor);
}

fn keys(name: &str) -> RingConfig {
    let path: PathBuf = std::env::temp_dir().join(format!("v4l-relay-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&path).unwrap();
    RingConfig {
        keys: IpcKeys {
            path,
            shm_id: 0x23,
            sem_id: 0x91,
        },
        slot_count: 4,
        ..RingConfig::default()
    }
}

#[test]
fn keyed_ring_is_found_and_torn_down() {
    let config = keys("keyed");
    let producer = SharedRing::create_shared(&config, geometry(4)).unwrap();
    let consumer = SharedRing::open_shared(&config, Duration::from_secs(1)).unwrap();

    assert_eq!(
        consumer.wait_for_ready(Duration::from_secs(1)).unwrap(),
        Some(geometry(4))
    );
    assert!(consumer.producer_alive());

    producer.publish(&frame(42)).unwrap();
    match consumer.acquire().unwrap() {
        Acquire::Ready(acquired) => {
            assert_eq!(consumer.slot(&acquired), &frame(42)[..]);
            consumer.release(acquired).unwrap();
        }
        Acquire::Empty => panic!("frame expected"),
    }

    drop(producer);
    assert!(!consumer.producer_alive());
    assert!(matches!(consumer.acquire(), Err(Error::Ipc { .. })));
}

#[test]
fn running_producer_keeps_its_pool() {
    let config = keys("running");
    let first = SharedRing::create_shared(&config, geometry(2)).unwrap();

    match SharedRing::create_shared(&config, geometry(4)) {
        Err(Error::PoolCreation { source, .. }) => {
            assert_eq!(source.raw_os_error(), Some(libc::EEXIST))
        }
        Err(e) => panic!("{}", e),
        Ok(_) => panic!("second producer took over a live pool"),
    }

    // the first producer is untouched
    let consumer = SharedRing::open_shared(&config, Duration::from_secs(1)).unwrap();
    assert_eq!(consumer.geometry().unwrap().slot_count, 2);
    assert!(first.publish(&frame(1)).unwrap().is_stored());
    assert!(matches!(consumer.acquire().unwrap(), Acquire::Ready(_)));
}

#[test]
fn pool_of_crashed_producer_is_replaced() {
    let config = keys("crashed");
    let shm_key = ipc::key(&config.keys.path, config.keys.shm_id).unwrap();
    let sem_key = ipc::key(&config.keys.path, config.keys.sem_id).unwrap();

    // a producer that died before initializing its header, nothing cleaned up
    let segment = Segment::create(shm_key, geometry(2).region_len()).unwrap();
    let sem = Semaphore::create(sem_key).unwrap();
    assert!(sem.lock(Duration::from_millis(10)).unwrap());
    std::mem::forget(segment);
    std::mem::forget(sem);

    let producer = SharedRing::create_shared(&config, geometry(4)).unwrap();
    let consumer = SharedRing::open_shared(&config, Duration::from_secs(1)).unwrap();
    assert_eq!(consumer.geometry().unwrap().slot_count, 4);

    producer.publish(&frame(3)).unwrap();
    match consumer.acquire().unwrap() {
        Acquire::Ready(acquired) => {
            assert_eq!(consumer.slot(&acquired), &frame(3)[..]);
            consumer.release(acquired).unwrap();
        }
        Acquire::Empty => panic!("frame expected"),
    }
}

#[test]
fn missing_pool_times_out() {
    let config = keys("missing");
    let res = SharedRing::open_shared(&config, Duration::from_millis(30));
    assert!(matches!(res, Err(Error::Ipc { .. })));
}

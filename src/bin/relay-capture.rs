use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use v4l_relay::config::{parse_number, Rotation, V4L2_CID_ROTATE};
use v4l_relay::device::Rect;
use v4l_relay::format::FourCC;
use v4l_relay::ipc;
use v4l_relay::prelude::*;

/// Capture frames from a video4linux device into a shared memory ring
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Device index or node path
    #[arg(short, long, default_value = "0")]
    device: String,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Pixel format code, e.g. NV12 or YUYV
    #[arg(long, default_value = "NV12")]
    fourcc: FourCC,

    /// Driver buffers to request
    #[arg(long, default_value_t = 2)]
    buffers: u32,

    /// Crop rectangle LEFT,TOP,WIDTHxHEIGHT
    #[arg(long)]
    crop: Option<Rect>,

    /// Rotation value written to the rotation control
    #[arg(long, allow_negative_numbers = true)]
    rotate: Option<i32>,

    /// Control id used for --rotate
    #[arg(long, value_parser = parse_number, default_value_t = V4L2_CID_ROTATE)]
    rotate_control: u32,

    /// Ring slots, a power of two
    #[arg(long, default_value_t = 2)]
    slots: u32,

    /// Existing path the IPC keys are derived from
    #[arg(long, default_value = "/tmp")]
    key_path: PathBuf,

    #[arg(long, value_parser = parse_number, default_value = "0x123")]
    shm_id: u32,

    #[arg(long, value_parser = parse_number, default_value = "0x391")]
    sem_id: u32,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Generate a synthetic pattern instead of opening a device
    #[arg(long)]
    test_pattern: bool,

    /// Frame rate of the test pattern
    #[arg(long, default_value_t = 30)]
    fps: u32,
}

impl Args {
    fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            path: DeviceConfig::device_path(&self.device),
            width: self.width,
            height: self.height,
            fourcc: self.fourcc,
            buffer_count: self.buffers,
            crop: self.crop,
            rotation: self.rotate.map(|value| Rotation {
                control: self.rotate_control,
                value,
            }),
        }
    }

    fn ring_config(&self) -> RingConfig {
        let mut config = RingConfig {
            slot_count: self.slots,
            ..RingConfig::default()
        };
        config.keys.path = self.key_path.clone();
        config.keys.shm_id = self.shm_id as i32;
        config.keys.sem_id = self.sem_id as i32;
        config
    }
}

fn run<S: FrameSource>(source: &mut S, ring_config: &RingConfig, relay: &Relay) -> anyhow::Result<()> {
    let geometry = Geometry::for_format(&source.format(), ring_config.slot_count);
    let ring = SharedRing::create_shared(ring_config, geometry)
        .context("failed to create the shared ring")?;

    let stats = relay.run(source, &ring)?;
    let ring_stats = ring.stats()?;
    info!(
        frames = stats.frames,
        dropped = stats.dropped(),
        unread = ring_stats.pending(),
        "done"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("v4l_relay=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let ring_config = args.ring_config();
    ring_config.validate()?;
    // fail early on a key path ftok cannot use
    ipc::key(&ring_config.keys.path, ring_config.keys.shm_id)
        .with_context(|| format!("invalid key path {}", ring_config.keys.path.display()))?;

    let cancel = Cancel::with_signals().context("failed to install signal handlers")?;
    let relay_loop = Relay::new(
        RelayConfig {
            max_frames: args.frames,
            ..RelayConfig::default()
        },
        cancel,
    );

    if args.test_pattern {
        let interval = Duration::from_secs(1) / args.fps.max(1);
        let mut source = TestPattern::new(args.width, args.height, args.buffers, interval);
        return run(&mut source, &ring_config, &relay_loop);
    }

    let config = args.device_config();
    let mut source = CaptureSource::open(&config)
        .with_context(|| format!("failed to open {}", config.path.display()))?;
    info!("capturing from {}", source.device().path().display());
    run(&mut source, &ring_config, &relay_loop)
}

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use v4l_relay::config::parse_number;
use v4l_relay::prelude::*;

/// Drain frames from a shared memory ring into a file
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// File receiving the raw frames
    #[arg(short, long, default_value = "/tmp/stream.out")]
    output: PathBuf,

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

    /// Milliseconds to sleep while the ring is empty
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,

    /// Seconds to wait for the producer
    #[arg(long, default_value_t = 10)]
    wait: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("v4l_relay=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut ring_config = RingConfig::default();
    ring_config.keys.path = args.key_path.clone();
    ring_config.keys.shm_id = args.shm_id as i32;
    ring_config.keys.sem_id = args.sem_id as i32;

    let wait = Duration::from_secs(args.wait);
    let ring = SharedRing::open_shared(&ring_config, wait).context("no shared ring to drain")?;

    let file = File::create(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let mut sink = BufWriter::new(file);

    let cancel = Cancel::with_signals().context("failed to install signal handlers")?;
    let drain = Drain::new(
        DrainConfig {
            poll_interval: Duration::from_millis(args.poll_ms),
            max_frames: args.frames,
            ready_timeout: wait,
        },
        cancel,
    );

    let stats = drain.run(&ring, &mut sink)?;
    info!(
        frames = stats.frames,
        bytes = stats.bytes,
        skipped = stats.skipped,
        "wrote {}",
        args.output.display()
    );
    Ok(())
}

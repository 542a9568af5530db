// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Monitor relay CLI entry point
//!
//! Producer mode drives one monitor from the synthetic backend; consumer
//! mode attaches to a monitor's channels and reports what arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{debug, info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use vd_monitor_relay::backend::synthetic::{SyntheticCursorSource, SyntheticSurfaceSource};
use vd_monitor_relay::{CursorReader, FrameReader, MonitorContext, RelayConfig};

/// Cursor shape installed by the producer, a solid 16x16 square
const DEMO_CURSOR_SIZE: u32 = 16;

fn build_cli() -> Command {
    Command::new("vd-monitor-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Cloud Hypervisor Authors")
        .about("Relays virtual monitor frames and cursor state over shared memory")
        .arg(
            Arg::new("connector")
                .short('c')
                .long("connector")
                .value_name("INDEX")
                .default_value("0")
                .value_parser(value_parser!(u32))
                .help("Connector index of the monitor"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .default_value("1920")
                .value_parser(value_parser!(u32))
                .help("Mode width"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .default_value("1080")
                .value_parser(value_parser!(u32))
                .help("Mode height"),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .default_value("60")
                .value_parser(value_parser!(u32))
                .help("Mode refresh rate"),
        )
        .arg(
            Arg::new("namespace")
                .short('n')
                .long("namespace")
                .value_name("PREFIX")
                .help("Prefix of the shared object names (overrides the config file)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("JSON relay configuration"),
        )
        .arg(
            Arg::new("consume")
                .long("consume")
                .action(ArgAction::SetTrue)
                .help("Attach as the consumer instead of producing frames"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
}

fn get_u32(matches: &ArgMatches, id: &str) -> anyhow::Result<u32> {
    matches
        .get_one::<u32>(id)
        .copied()
        .with_context(|| format!("missing --{id}"))
}

fn run_producer(
    connector: u32,
    config: RelayConfig,
    (width, height, fps): (u32, u32, u32),
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut monitor = MonitorContext::new(connector, config)?;
    monitor.commit_modes(width, height, fps);
    monitor.assign_swap_chain(Box::new(SyntheticSurfaceSource::new(width, height, fps)?))?;

    let (cursor_source, cursor) = SyntheticCursorSource::new()?;
    monitor.attach_cursor_source(Box::new(cursor_source))?;
    let side = DEMO_CURSOR_SIZE;
    cursor.set_shape(side, side, vec![0xFF; (side * side * 4) as usize]);
    cursor.set_visible(true);

    info!("Monitor {connector} producing {width}x{height}@{fps}, press Ctrl+C to stop");

    let start = Instant::now();
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        // Move the cursor on a circle around the centre
        let t = start.elapsed().as_secs_f64();
        let radius = f64::from(width.min(height)) / 4.0;
        cursor.move_to(
            (f64::from(width) / 2.0 + radius * t.cos()) as i32,
            (f64::from(height) / 2.0 + radius * t.sin()) as i32,
        );

        if monitor.swap_chain_lost() {
            warn!("Swap chain of monitor {connector} lost, assigning a new one");
            let exit = monitor.unassign_swap_chain();
            debug!("Previous swap chain exit: {exit:?}");
            monitor.assign_swap_chain(Box::new(SyntheticSurfaceSource::new(width, height, fps)?))?;
        }

        if last_report.elapsed() >= Duration::from_secs(5) {
            if let Some(stats) = monitor.swap_chain_stats() {
                info!("Monitor {connector} swap chain: {stats:?}");
            }
            last_report = Instant::now();
        }

        thread::sleep(Duration::from_millis(16));
    }

    info!("Stopping monitor {connector}...");
    let exit = monitor.unassign_swap_chain();
    info!("Swap chain finished: {exit:?}");
    Ok(())
}

fn run_consumer(connector: u32, config: &RelayConfig, running: &AtomicBool) -> anyhow::Result<()> {
    let frames = FrameReader::open(connector, config)?;
    let cursor = CursorReader::open(connector, config)?;
    let poll = Some(Duration::from_millis(100));

    info!("Attached to monitor {connector}, press Ctrl+C to stop");

    let mut frame = Vec::new();
    let mut frame_count = 0u64;
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(configuration) = frames.wait_configured(Some(Duration::ZERO))? {
            info!("Monitor {connector} configured: {configuration:?}");
        }

        if frames.wait_frame(poll)? && frames.read_frame(&mut frame)?.is_some() {
            frame_count += 1;
        }

        if cursor.wait_image(Some(Duration::ZERO))? {
            if let Some(image) = cursor.image()? {
                info!("Cursor image {}x{}", image.width, image.height);
            }
        }
        if cursor.wait_position(Some(Duration::ZERO))? {
            debug!("Cursor at {:?}", cursor.position());
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            info!(
                "Monitor {connector}: {frame_count} frames/s, config {:?}",
                frames.configuration()
            );
            frame_count = 0;
            last_report = Instant::now();
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => RelayConfig::default(),
    };
    if let Some(namespace) = matches.get_one::<String>("namespace") {
        config.namespace = namespace.clone();
    }
    config.validate()?;

    let connector = get_u32(&matches, "connector")?;
    let mode = (
        get_u32(&matches, "width")?,
        get_u32(&matches, "height")?,
        get_u32(&matches, "fps")?,
    );

    info!("Starting vd-monitor-relay with config: {config:?}");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl+C handler")?;

    if matches.get_flag("consume") {
        run_consumer(connector, &config, &running)
    } else {
        run_producer(connector, config, mode, &running)
    }
}

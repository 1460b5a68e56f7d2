//! Capture orchestration
//!
//! Builds the DAQ context for the station-beam pipeline, runs it for the
//! requested duration and tears it down. In simulation mode a generator
//! thread stands in for the station hardware, and `--test_acquisition`
//! checks the files it produced for gaps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{NaiveDateTime, TimeZone, Utc};
use log::info;

use speadrx::station_file::CaptureFileConfig;
use speadrx::{
    DaqContext, IngressBackend, IngressConfig, IngressStats, StationFileWriter,
};

use crate::cli::Args;
use crate::simulate;

/// Run one capture session
pub fn run(args: &Args) -> anyhow::Result<()> {
    let capture_start_time = args
        .capture_time
        .as_deref()
        .map(parse_capture_time)
        .transpose()?;

    let mut daq = DaqContext::new();

    // Receiver-level losses accumulate for the end-of-capture report
    let lost_packets = Arc::new(AtomicU64::new(0));
    let receiver_stats = {
        let lost_packets = Arc::clone(&lost_packets);
        Box::new(move |stats: &IngressStats| {
            lost_packets.fetch_add(stats.lost_packets, Ordering::Relaxed);
        })
    };

    daq.start_receiver_with_diagnostics(
        IngressConfig {
            interface: args.interface.clone(),
            ip: args.ip,
            frame_size: 9000,
            frames_per_block: 32,
            nof_blocks: 64,
            nof_threads: 1,
            backend: if args.simulate {
                IngressBackend::UdpSocket
            } else {
                IngressBackend::KernelBypass
            },
            diagnostics: args.verbose > 0,
        },
        Some(receiver_stats),
    )
    .context("could not start the packet receiver")?;
    daq.add_receiver_port(args.port)?;

    let consumer_config = serde_json::json!({
        "start_channel": args.start_channel,
        "nof_channels": args.nof_channels,
        "nof_samples": args.nof_samples,
        "max_packet_size": 9000,
    })
    .to_string();

    let file_config = CaptureFileConfig {
        directory: args.directory.clone(),
        start_channel: args.start_channel,
        nof_channels: args.nof_channels as usize,
        nof_samples: args.nof_samples as usize,
        max_file_size: args.max_file_size,
        individual_channel_files: args.individual,
        dada_header: args.dada,
        source: args.source.clone(),
        capture_start_time,
    };

    // Track delivery for the post-run report
    let buffers_written = Arc::new(AtomicU64::new(0));
    {
        let writer = StationFileWriter::new(file_config)?;
        let mut callback = writer.into_callback();
        let buffers_written = Arc::clone(&buffers_written);
        daq.start_station_consumer(
            &consumer_config,
            Box::new(move |data, timestamp, metadata| {
                buffers_written.fetch_add(1, Ordering::Relaxed);
                callback(data, timestamp, metadata);
            }),
        )?;
    }

    let generator = if args.simulate {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = simulate::spawn(
            args.ip,
            args.port,
            args.start_channel,
            args.nof_channels,
            args.nof_samples,
            Arc::clone(&stop),
        )?;
        Some((stop, handle))
    } else {
        None
    };

    info!(
        "capturing {} channel(s) from {} for {} s into {}",
        args.nof_channels,
        args.interface,
        args.duration,
        args.directory.display()
    );
    std::thread::sleep(Duration::from_secs(args.duration));

    if let Some((stop, handle)) = generator {
        stop.store(true, Ordering::Release);
        let _ = handle.join();
    }
    daq.stop();

    let buffers = buffers_written.load(Ordering::Relaxed);
    info!("capture finished: {buffers} buffer(s) written");
    let lost = lost_packets.load(Ordering::Relaxed);
    if lost > 0 {
        log::warn!("{lost} packet(s) lost at the receiver during capture");
    }

    if args.test_acquisition {
        verify_capture(args, buffers)?;
    }
    Ok(())
}

/// Parse a `YYYY/MM/DD_HH:MM` UTC time into UNIX seconds
fn parse_capture_time(text: &str) -> anyhow::Result<f64> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y/%m/%d_%H:%M")
        .with_context(|| format!("invalid capture time \"{text}\", expected YYYY/MM/DD_HH:MM"))?;
    Ok(Utc.from_utc_datetime(&naive).timestamp() as f64)
}

/// Validate the files of a simulated run
///
/// The generator ramps every sample frame through non-zero values, so any
/// zero frame inside a completed buffer marks a dropped packet.
fn verify_capture(args: &Args, buffers: u64) -> anyhow::Result<()> {
    if buffers == 0 {
        bail!("test acquisition failed: no buffers were captured");
    }

    let mut checked_files = 0usize;
    for entry in std::fs::read_dir(&args.directory)? {
        let path = entry?.path();
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if !name.starts_with("channel_") {
            continue;
        }

        let mut contents = std::fs::read(&path)?;
        if args.dada {
            if contents.len() < 4096 {
                bail!("test acquisition failed: {name} is shorter than its header");
            }
            contents.drain(..4096);
        }
        if contents.is_empty() {
            bail!("test acquisition failed: {name} holds no data");
        }

        // The stream stops mid-buffer, so the last two buffers of a file
        // may legitimately be incomplete
        let channels_in_file = if args.individual {
            1
        } else {
            args.nof_channels as usize
        };
        let slot_bytes = args.nof_samples as usize * channels_in_file * 4;
        let checked = contents.len().saturating_sub(2 * slot_bytes);
        let zeros = contents[..checked].iter().filter(|&&b| b == 0).count();
        if zeros > 0 {
            bail!(
                "test acquisition failed: {name} has {zeros} zero byte(s) across {checked} bytes"
            );
        }
        checked_files += 1;
    }

    if checked_files == 0 {
        bail!("test acquisition failed: no capture files found");
    }
    info!("test acquisition passed: {checked_files} file(s) verified");
    Ok(())
}

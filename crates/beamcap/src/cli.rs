//! Command-line arguments

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

const USAGE: &str = r#"
Captures the raw station beam emitted by a SPEAD station and writes it to
binary files, one buffer at a time, rotating files at --max_file_size.

The receiving NIC must see the station streams directly; capturing at line
rate requires root (or CAP_NET_RAW) for the kernel-bypass packet socket.

A capture aligned to an absolute start time:

    beamcap --directory /data --duration 600 \
        --interface eth2 --ip 10.0.10.40 \
        --start_channel 0 --nof_channels 8 \
        --capture_time 2024/06/01_14:30

With --simulate no hardware is needed: a synthetic packet generator feeds
the capture through the loopback UDP path.
"#;

/// Station beam capture options
#[derive(Parser, Clone, Debug)]
#[command(version)]
#[command(about = "Acquire a raw station beam to disk", long_about = None)]
#[command(after_help = USAGE)]
#[command(max_term_width = 100)]
pub struct Args {
    /// Verbosity level (-vvv for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory where capture files are stored
    #[arg(short, long, default_value = "/data")]
    pub directory: PathBuf,

    /// Capture duration in seconds
    #[arg(short = 't', long, default_value_t = 60)]
    pub duration: u64,

    /// Samples per buffer
    #[arg(long = "nof_samples", default_value_t = 262144)]
    pub nof_samples: u32,

    /// First logical channel to store
    #[arg(long = "start_channel", default_value_t = 0)]
    pub start_channel: u16,

    /// Number of logical channels to store
    #[arg(long = "nof_channels", default_value_t = 1)]
    pub nof_channels: u16,

    /// Network interface receiving the streams
    #[arg(short, long, default_value = "eth2")]
    pub interface: String,

    /// Destination IP of the streams
    #[arg(short = 'p', long, default_value = "10.0.10.40")]
    pub ip: Ipv4Addr,

    /// Destination UDP port of the streams
    #[arg(long, default_value_t = 4660)]
    pub port: u16,

    /// File rotation threshold in bytes
    #[arg(long = "max_file_size", default_value_t = 1024 * 1024 * 1024)]
    pub max_file_size: u64,

    /// Source name recorded in DADA headers
    #[arg(long, default_value = "")]
    pub source: String,

    /// Write PSRDADA files (4096-byte ASCII header) instead of raw .dat
    #[arg(long)]
    pub dada: bool,

    /// One output file per logical channel
    #[arg(long)]
    pub individual: bool,

    /// Generate a synthetic station beam over loopback UDP
    #[arg(long)]
    pub simulate: bool,

    /// Verify the captured data after a simulated run
    #[arg(long = "test_acquisition")]
    pub test_acquisition: bool,

    /// Discard data before this UTC time (format YYYY/MM/DD_HH:MM)
    #[arg(long = "capture_time")]
    pub capture_time: Option<String>,
}

//! # speadrx: station DAQ for SPEAD telescope streams
//!
//! This crate captures the multi-gigabit UDP/SPEAD streams emitted by the
//! Tile Processing Modules of a radio-telescope station, reassembles them
//! into time-ordered sample buffers and delivers every completed buffer to
//! a caller-supplied callback (file writer, correlator, statistics
//! engine).
//!
//! The pipeline is built from parallel OS threads connected by lock-light
//! rings:
//!
//! 1. [`PacketIngress`](ingress::PacketIngress) captures frames on one NIC
//!    (kernel-bypass PACKET_MMAP rings on Linux, plain UDP sockets
//!    elsewhere), filters them by destination IP and port, and copies each
//!    accepted payload into the ring of every consumer whose packet filter
//!    matches.
//! 2. One [`Consumer`](consumer::Consumer) per stream family pulls from
//!    its [`SpscRing`](ring::SpscRing), decodes the SPEAD items with the
//!    zero-copy [`SpeadView`](spead::SpeadView) and scatters the payload
//!    into rotating containers.
//! 3. Completed containers are persisted through callbacks, optionally via
//!    a buffer-granular [`DoubleBuffer`](double_buffer::DoubleBuffer)
//!    hand-off to a compute stage, or the
//!    [station-beam file sink](station_file::StationFileWriter).
//!
//! A [`DaqContext`](registry::DaqContext) ties the pieces together:
//!
//! ```no_run
//! use speadrx::ingress::IngressConfig;
//! use speadrx::registry::DaqContext;
//!
//! # fn main() -> Result<(), speadrx::DaqError> {
//! let mut daq = DaqContext::new();
//! daq.start_receiver(IngressConfig {
//!     interface: "eth2".to_string(),
//!     ip: "10.0.10.40".parse().unwrap(),
//!     ..IngressConfig::default()
//! })?;
//! daq.add_receiver_port(4660)?;
//!
//! daq.load_consumer("burstchannel")?;
//! daq.initialise_consumer(
//!     "burstchannel",
//!     r#"{"nof_tiles": 16, "nof_channels": 512, "nof_samples": 256,
//!         "nof_antennas": 16, "nof_pols": 2, "max_packet_size": 9000}"#,
//! )?;
//! daq.start_consumer(
//!     "burstchannel",
//!     Box::new(|data, timestamp, tile, _| {
//!         println!("tile {tile}: {} bytes at {timestamp}", data.len());
//!     }),
//!     None,
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! Receiving at line rate needs a packet socket (root or
//! `CAP_NET_RAW`), a NIC ring sized with `ethtool -G`, and CPU isolation
//! for the ingress workers; without them the receiver still runs, at
//! reduced throughput and with warnings about the capabilities it could
//! not obtain.

pub mod config;
pub mod consumer;
pub mod container;
pub mod double_buffer;
mod error;
pub mod ingress;
pub mod mem;
pub mod reassembly;
pub mod registry;
pub mod ring;
pub mod spead;
pub mod station_file;
pub mod testing;
pub mod thread;

pub use config::ConsumerConfig;
pub use consumer::{Consumer, DataCallback, DiagnosticCallback, ProcessResult};
pub use error::{DaqError, DaqResult};
pub use ingress::{
    IngressBackend, IngressConfig, IngressDiagnosticCallback, IngressStats, PacketIngress,
};
pub use registry::DaqContext;
pub use spead::{CaptureMode, SpeadView};
pub use station_file::{CaptureFileConfig, StationFileWriter};

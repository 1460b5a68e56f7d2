//! Synthetic station-beam generator
//!
//! Stands in for the station hardware during `--simulate` runs: emits
//! well-formed station-beam SPEAD packets over ordinary UDP at a modest,
//! paced rate. Every sample frame of packet `n` carries the byte value
//! `(n % 255) + 1`, which keeps all payload bytes non-zero so a dropped
//! packet shows up as a zero-filled hole in the capture.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use log::info;

use speadrx::testing::StationPacket;

/// Samples carried by each generated packet
const SAMPLES_PER_PACKET: usize = 256;

/// Nanoseconds per sample at the station sampling period
const SAMPLE_NS: u64 = 1080;

/// Pause between counter ticks, pacing the stream
const TICK_PAUSE: Duration = Duration::from_micros(100);

/// Start the generator thread
pub fn spawn(
    ip: Ipv4Addr,
    port: u16,
    start_channel: u16,
    nof_channels: u16,
    nof_samples: u32,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .context("could not bind the simulation socket")?;
    let target = SocketAddrV4::new(ip, port);
    let sync_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    info!(
        "simulating a station beam to {target}: {nof_channels} channel(s), \
         {nof_samples} samples per buffer"
    );

    let handle = std::thread::Builder::new()
        .name("beamcap-simulate".to_string())
        .spawn(move || {
            let mut counter = 1u64;
            while !stop.load(Ordering::Acquire) {
                let fill = (counter % 255) as u8 + 1;
                let payload = vec![fill; SAMPLES_PER_PACKET * 2 * 2];

                for channel in start_channel..start_channel + nof_channels {
                    let packet = StationPacket {
                        counter,
                        logical_channel: channel,
                        sync_time,
                        timestamp: counter * SAMPLES_PER_PACKET as u64 * SAMPLE_NS,
                        frequency_hz: 159_375_000,
                        scan_id: None,
                    }
                    .build(&payload);
                    let _ = socket.send_to(&packet, target);
                }

                counter += 1;
                std::thread::sleep(TICK_PAUSE);
            }
        })
        .expect("failed to spawn the simulation thread");
    Ok(handle)
}

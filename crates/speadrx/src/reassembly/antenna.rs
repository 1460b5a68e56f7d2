//! Continuous antenna buffer reassembly
//!
//! Antenna-buffer streams replay raw ADC samples from the DDR buffer of
//! each TPM. Every tile emits two FPGA streams whose payloads interleave
//! half of the tile's antennas in four-sample groups; both land in the same
//! `[antenna][sample][pol]` tile row.
//!
//! The streams are aligned through a discovery phase: the first packet of
//! every FPGA reports its first global sample index, and once all FPGAs
//! have reported (or a short timeout expires) the largest of them becomes
//! the common base. Samples before the base are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(not(test))]
use log::warn;
#[cfg(test)]
use std::println as warn;

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, DataCallback, PacketFilter, ProcessResult};
use crate::container::TileBuffers;
use crate::error::DaqResult;
use crate::reassembly::{TileItems, NOF_CONTAINERS};
use crate::ring::RingConfig;
use crate::spead::{CaptureMode, SpeadView, ADC_SAMPLE_RATE};

/// Antenna streams always carry two polarisations
const NOF_POLS: usize = 2;

/// ADC samples per timestamp unit
const TIMESTAMP_FACTOR: u64 = 864 * 256 / 8;

/// Samples per interleave group within a packet
const SAMPLE_GROUP: usize = 4;

/// Wall-clock limit of the discovery phase
const DISCOVERY_TIMEOUT: Duration = Duration::from_micros(100);

/// Stream summary handed to the capture callback per tile
#[derive(Clone, Copy, Debug, Default)]
pub struct AntennaMetadata {
    pub tile_id: u16,
    pub station_id: u16,
    pub antenna_ids: [u8; 4],
    pub first_counter: u32,
    pub last_counter: u32,
    pub nof_packets: u64,
}

/// Antenna buffer completion callback, invoked once per tile
pub type AntennaCallback = Box<dyn FnMut(&[u8], f64, &AntennaMetadata) + Send>;

struct AntennaContainer {
    buffers: TileBuffers,
    meta: Vec<AntennaMetadata>,
}

impl AntennaContainer {
    fn new(nof_tiles: usize, row_len: usize) -> Self {
        Self {
            buffers: TileBuffers::new(nof_tiles, row_len),
            meta: vec![AntennaMetadata::default(); nof_tiles],
        }
    }

    fn clear(&mut self) {
        self.buffers.clear();
        self.meta.fill(AntennaMetadata::default());
    }
}

/// Consumer for antenna-buffer streams
#[derive(Default)]
pub struct AntennaBufferConsumer {
    containers: Vec<AntennaContainer>,
    callback: Option<AntennaCallback>,

    // discovery state
    first_samples: HashMap<u16, u64>,
    discovery_started: Option<Instant>,
    base_sample: Option<u64>,
    current_buffer: u64,

    nof_antennas: usize,
    nof_tiles: usize,
    nof_samples: usize,
    max_packet_size: usize,
}

impl AntennaBufferConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a callback receiving the per-tile stream summary
    pub fn set_antenna_callback(&mut self, callback: AntennaCallback) {
        self.callback = Some(callback);
    }

    fn antennas_per_fpga(&self) -> usize {
        (self.nof_antennas / 2).max(1)
    }

    /// Track the discovery phase; returns the base once it is established
    fn discover(&mut self, global_fpga: u16, first_sample: u64) -> Option<u64> {
        if let Some(base) = self.base_sample {
            return Some(base);
        }

        let started = *self.discovery_started.get_or_insert_with(Instant::now);
        self.first_samples.entry(global_fpga).or_insert(first_sample);

        let all_reported = self.first_samples.len() == 2 * self.nof_tiles;
        if all_reported || started.elapsed() >= DISCOVERY_TIMEOUT {
            let base = self.first_samples.values().copied().max().unwrap_or(0);
            self.base_sample = Some(base);
            return Some(base);
        }
        None
    }

    fn persist(&mut self, container: usize) {
        let container = &mut self.containers[container];
        if container.buffers.nof_packets == 0 {
            return;
        }
        if let Some(callback) = self.callback.as_mut() {
            for (row, (_, data)) in container.buffers.rows().enumerate() {
                callback(data, container.buffers.timestamp, &container.meta[row]);
            }
        } else {
            warn!("no callback for antenna buffer data defined");
        }
        container.clear();
    }
}

impl Consumer for AntennaBufferConsumer {
    fn name(&self) -> &'static str {
        "antennabuffer"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_antennas = config.require_u16(self.name(), "nof_antennas")? as usize;
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.nof_samples = config.require_u32(self.name(), "nof_samples")? as usize;
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;

        let row_len = self.nof_antennas * self.nof_samples * NOF_POLS;
        self.containers = (0..NOF_CONTAINERS)
            .map(|_| AntennaContainer::new(self.nof_tiles, row_len))
            .collect();
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: 32768 * self.nof_tiles,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        Arc::new(|packet: &[u8]| {
            SpeadView::open(packet)
                .and_then(|view| view.capture_mode())
                .is_some_and(|mode| mode == CaptureMode::AntennaBuffer)
        })
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());
        let payload = view.payload();

        // tile info carries the FPGA id in place of a polarisation
        let fpga_id = items.tile.pol_id as u16;
        let tile_id = items.tile.tile_id;
        let antennas_per_fpga = self.antennas_per_fpga();

        let samples = (items.payload_length.saturating_sub(items.payload_offset) as usize)
            / (antennas_per_fpga * NOF_POLS);
        if samples == 0 {
            return ProcessResult::Skipped;
        }

        // Global ADC sample index of the packet's first sample
        let global_sample = items.timestamp * TIMESTAMP_FACTOR
            + u64::from(items.counter.counter) * samples as u64;
        let packet_time =
            items.sync_time as f64 + global_sample as f64 / ADC_SAMPLE_RATE;

        let global_fpga = tile_id * 2 + fpga_id;
        let Some(base_sample) = self.discover(global_fpga, global_sample) else {
            return ProcessResult::Skipped;
        };
        if global_sample < base_sample {
            return ProcessResult::Skipped;
        }

        let sample_offset = global_sample - base_sample;
        let buffer_index = sample_offset / self.nof_samples as u64;
        let start_sample = (sample_offset % self.nof_samples as u64) as usize;

        // Rotation: persist each container the stream moves past
        if buffer_index > self.current_buffer {
            let steps = (buffer_index - self.current_buffer).min(NOF_CONTAINERS as u64);
            for step in 1..=steps {
                let reused = ((self.current_buffer + step) % NOF_CONTAINERS as u64) as usize;
                self.persist(reused);
            }
            self.current_buffer = buffer_index;
        } else if self.current_buffer.saturating_sub(buffer_index) >= NOF_CONTAINERS as u64 {
            // Too old; its container has already been recycled
            return ProcessResult::Skipped;
        }

        let container =
            &mut self.containers[(buffer_index % NOF_CONTAINERS as u64) as usize];
        let Some(row) = container.buffers.row_index(tile_id) else {
            return ProcessResult::Skipped;
        };

        // Scatter: four samples per antenna at a time, this FPGA's antennas
        // landing in the upper or lower half of the tile row
        let group_bytes = SAMPLE_GROUP * NOF_POLS;
        let nof_samples = self.nof_samples;
        let row_data = container.buffers.row_mut(row);
        for antenna in 0..antennas_per_fpga {
            let antenna_row = antennas_per_fpga * usize::from(fpga_id) + antenna;
            let dst_base = (antenna_row * nof_samples + start_sample) * NOF_POLS;
            for group in (0..samples).step_by(SAMPLE_GROUP) {
                let src = (group * antennas_per_fpga + antenna * SAMPLE_GROUP) * NOF_POLS;
                let dst = dst_base + group * NOF_POLS;
                if src + group_bytes > payload.len() || dst + group_bytes > row_data.len() {
                    break;
                }
                row_data[dst..dst + group_bytes]
                    .copy_from_slice(&payload[src..src + group_bytes]);
            }
        }

        container.buffers.update_timestamp(packet_time);
        container.buffers.nof_packets += 1;

        let meta = &mut container.meta[row];
        if meta.nof_packets == 0 {
            *meta = AntennaMetadata {
                tile_id,
                station_id: items.tile.station_id,
                antenna_ids: items.antenna_ids.antenna_ids,
                first_counter: items.counter.counter,
                last_counter: items.counter.counter,
                nof_packets: 1,
            };
        } else {
            meta.last_counter = items.counter.counter;
            meta.nof_packets += 1;
        }

        ProcessResult::Stored
    }

    fn on_stream_end(&mut self) {
        // Flush forward from the oldest container
        for step in 1..=NOF_CONTAINERS as u64 {
            let container = ((self.current_buffer + step) % NOF_CONTAINERS as u64) as usize;
            self.persist(container);
        }
    }

    fn pull_timeout(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn set_callback(&mut self, mut callback: DataCallback) {
        self.set_antenna_callback(Box::new(move |data, timestamp, metadata| {
            callback(data, timestamp, u32::from(metadata.tile_id), 0)
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::AntennaBufferPacket;
    use std::sync::Mutex;

    const SYNC_TIME: u64 = 1_700_000_000;

    /// One tile of four antennas, eight samples per buffer, four samples
    /// per packet (one interleave group per antenna)
    fn consumer() -> AntennaBufferConsumer {
        let mut consumer = AntennaBufferConsumer::new();
        consumer
            .init(
                &ConsumerConfig::from_json(
                    r#"{"nof_antennas": 4, "nof_samples": 8, "nof_tiles": 1,
                        "max_packet_size": 9000}"#,
                )
                .unwrap(),
            )
            .unwrap();
        consumer
    }

    fn packet(counter: u32, fpga_id: u8, fill: u8) -> Vec<u8> {
        // 4 samples × 2 antennas-per-fpga × 2 pols
        AntennaBufferPacket {
            counter,
            tile_id: 0,
            fpga_id,
            sync_time: SYNC_TIME,
            timestamp: 0,
        }
        .build(&vec![fill; 4 * 2 * 2])
    }

    type Captured = Arc<Mutex<Vec<(Vec<u8>, AntennaMetadata)>>>;

    fn capture(consumer: &mut AntennaBufferConsumer) -> Captured {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        consumer.set_antenna_callback(Box::new(move |data, _, metadata| {
            sink.lock().unwrap().push((data.to_vec(), *metadata));
        }));
        captured
    }

    #[test]
    fn test_discovery_base_is_max_of_first_samples() {
        let mut consumer = consumer();

        // FPGA 0 first appears at sample 8, FPGA 1 at sample 4; discovery
        // completes on the second packet with base 8
        assert_eq!(consumer.process(&packet(2, 0, 1)), ProcessResult::Skipped);
        assert_eq!(consumer.process(&packet(1, 1, 1)), ProcessResult::Skipped);
        assert_eq!(consumer.base_sample, Some(8));

        // samples before the base are dropped, later ones kept
        assert_eq!(consumer.process(&packet(1, 0, 1)), ProcessResult::Skipped);
        assert_eq!(consumer.process(&packet(2, 0, 1)), ProcessResult::Stored);
    }

    #[test]
    fn test_fpga_halves_interleave() {
        let mut consumer = consumer();
        let captured = capture(&mut consumer);

        // complete discovery at base 0... both FPGAs start at sample 8
        consumer.process(&packet(2, 0, 0xAA));
        consumer.process(&packet(2, 1, 0xBB));
        // first real write for both halves
        consumer.process(&packet(2, 0, 0xAA));
        consumer.process(&packet(2, 1, 0xBB));
        consumer.on_stream_end();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (data, metadata) = &captured[0];
        assert_eq!(metadata.tile_id, 0);
        assert!(metadata.nof_packets >= 3);

        // row layout [antenna][sample][pol]: antennas 0-1 from FPGA 0,
        // antennas 2-3 from FPGA 1; each packet covers samples 0..4
        let samples_per_antenna = 8 * 2;
        for antenna in 0..2 {
            let row = &data[antenna * samples_per_antenna..][..8];
            assert!(row.iter().all(|&b| b == 0xAA), "antenna {antenna}");
        }
        for antenna in 2..4 {
            let row = &data[antenna * samples_per_antenna..][..8];
            assert!(row.iter().all(|&b| b == 0xBB), "antenna {antenna}");
        }
    }

    #[test]
    fn test_late_packet_three_buffers_back_still_lands() {
        let mut consumer = consumer();
        let captured = capture(&mut consumer);

        // discovery at base 8 (counter 2), then fill buffer 0
        consumer.process(&packet(2, 0, 1));
        consumer.process(&packet(2, 1, 1));
        consumer.process(&packet(3, 0, 1));

        // advance straight to buffer 3; the stepped-past containers were
        // empty, so buffer 0's container is still live
        assert_eq!(consumer.process(&packet(8, 0, 2)), ProcessResult::Stored);

        // a buffer-0 packet is now exactly three buffers behind and must
        // still land in its container
        assert_eq!(consumer.process(&packet(3, 1, 1)), ProcessResult::Stored);

        // the next rotation recycles buffer 0's container, carrying the
        // late packet out with it
        assert_eq!(consumer.process(&packet(10, 0, 2)), ProcessResult::Stored);
        {
            let captured = captured.lock().unwrap();
            assert_eq!(captured.len(), 1);
            assert_eq!(captured[0].1.nof_packets, 3);
        }

        // four buffers behind is past the container window
        assert_eq!(consumer.process(&packet(3, 0, 1)), ProcessResult::Skipped);
    }

    #[test]
    fn test_buffer_rotation_persists_previous() {
        let mut consumer = consumer();
        let captured = capture(&mut consumer);

        // discovery with both FPGAs at sample 0 is not possible (counter 0
        // puts them at the base); start at counter 2 → base 8
        consumer.process(&packet(2, 0, 1));
        consumer.process(&packet(2, 1, 1));
        consumer.process(&packet(2, 0, 1));
        consumer.process(&packet(3, 0, 1));

        // jump a full container rotation ahead: the filled buffer's
        // container is recycled and persists on the way
        assert_eq!(consumer.process(&packet(10, 0, 2)), ProcessResult::Stored);
        assert_eq!(captured.lock().unwrap().len(), 1);
    }
}

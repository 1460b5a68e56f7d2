//! Channelised data reassembly
//!
//! Channelised streams carry 16-bit complex samples for one or more
//! frequency channels. Three cadences share the container layout
//! `[channel][sample][antenna][pol]` per tile:
//!
//! * **burst**: one-shot capture, persisted when the stream pauses
//! * **continuous**: endless stream cut into fixed buffers, with counter
//!   rollover, late-packet routing and an optional buffer-skip cadence
//! * **integrated**: on-FPGA integrated spectra, one sample per window

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, DataCallback, PacketFilter, ProcessResult};
use crate::container::TileBuffers;
use crate::error::DaqResult;
use crate::reassembly::{Rollover, TileItems, NOF_CONTAINERS};
use crate::ring::RingConfig;
use crate::spead::{CaptureMode, SpeadView, SAMPLING_PERIOD, TIMESTAMP_SCALE};

/// Bytes per complex 16-bit sample
const SAMPLE_BYTES: usize = 2;

/// Shared channel dimensions
#[derive(Clone, Copy, Debug, Default)]
struct Dimensions {
    nof_antennas: usize,
    nof_channels: usize,
    nof_samples: usize,
    nof_pols: usize,
}

/// One container of channelised data for all tiles
struct ChannelContainer {
    buffers: TileBuffers,
    dims: Dimensions,
    cont_channel_id: u32,
}

impl ChannelContainer {
    fn new(nof_tiles: usize, dims: Dimensions) -> Self {
        let row_len =
            dims.nof_channels * dims.nof_samples * dims.nof_antennas * dims.nof_pols * SAMPLE_BYTES;
        Self {
            buffers: TileBuffers::new(nof_tiles, row_len),
            dims,
            cont_channel_id: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_data(
        &mut self,
        tile: u16,
        start_channel: usize,
        start_sample: usize,
        samples: usize,
        start_antenna: usize,
        included_channels: usize,
        included_antennas: usize,
        payload: &[u8],
        timestamp: f64,
        cont_channel_id: u32,
    ) {
        let Some(row) = self.buffers.row_index(tile) else {
            return;
        };
        let dims = self.dims;
        let row_data = self.buffers.row_mut(row);

        let pol_bytes = dims.nof_pols * SAMPLE_BYTES;
        for channel in 0..included_channels {
            for sample in 0..samples {
                for antenna in 0..included_antennas {
                    let dst = ((start_channel + channel) * dims.nof_samples * dims.nof_antennas
                        + (start_sample + sample) * dims.nof_antennas
                        + (start_antenna + antenna))
                        * pol_bytes;
                    let src = (channel * samples * included_antennas
                        + sample * included_antennas
                        + antenna)
                        * pol_bytes;
                    if dst + pol_bytes > row_data.len() || src + pol_bytes > payload.len() {
                        continue;
                    }
                    row_data[dst..dst + pol_bytes].copy_from_slice(&payload[src..src + pol_bytes]);
                }
            }
        }

        if self.buffers.timestamp > timestamp {
            self.buffers.timestamp = timestamp;
            self.cont_channel_id = cont_channel_id;
        }
        self.buffers.nof_packets += 1;
    }

    fn nof_packets(&self) -> u32 {
        self.buffers.nof_packets
    }

    /// Invoke the callback once per tile, then reset for the next cycle
    fn persist(&mut self, callback: Option<&mut DataCallback>) {
        if let Some(callback) = callback {
            for (tile, data) in self.buffers.rows() {
                callback(
                    data,
                    self.buffers.timestamp,
                    u32::from(tile),
                    self.cont_channel_id,
                );
            }
        } else {
            log::warn!("no callback for channel data defined");
        }
        self.buffers.clear();
        self.cont_channel_id = 0;
    }
}

fn mode_filter(accept: fn(CaptureMode) -> bool) -> PacketFilter {
    Arc::new(move |packet: &[u8]| {
        SpeadView::open(packet)
            .and_then(|view| view.capture_mode())
            .is_some_and(accept)
    })
}

/// Samples carried by one packet, from its payload extent
fn samples_in_packet(items: &TileItems, dims: &Dimensions) -> usize {
    let payload = items.payload_length.saturating_sub(items.payload_offset) as usize;
    let included_antennas = usize::from(items.channel.nof_included_antennas).max(1);
    let included_channels = usize::from(items.channel.nof_included_channels).max(1);
    payload / (included_antennas * included_channels * dims.nof_pols * SAMPLE_BYTES)
}

// ---------------------------------------------------------------------------
// Burst
// ---------------------------------------------------------------------------

/// Consumer for one-shot channelised captures
#[derive(Default)]
pub struct BurstChannelConsumer {
    container: Option<ChannelContainer>,
    callback: Option<DataCallback>,
    dims: Dimensions,
    nof_tiles: usize,
    max_packet_size: usize,
}

impl BurstChannelConsumer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Consumer for BurstChannelConsumer {
    fn name(&self) -> &'static str {
        "burstchannel"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.dims = Dimensions {
            nof_channels: config.require_u16(self.name(), "nof_channels")? as usize,
            nof_samples: config.require_u32(self.name(), "nof_samples")? as usize,
            nof_antennas: config.require_u16(self.name(), "nof_antennas")? as usize,
            nof_pols: config.require_u16(self.name(), "nof_pols")? as usize,
        };
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;
        self.container = Some(ChannelContainer::new(self.nof_tiles, self.dims));
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: self.dims.nof_samples * self.nof_tiles,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        mode_filter(|mode| mode == CaptureMode::ChannelBurst)
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());
        let samples = samples_in_packet(&items, &self.dims);
        if samples == 0 {
            return ProcessResult::Skipped;
        }

        let packets_per_buffer = (self.dims.nof_samples / samples).max(1);
        let sample_index = items.counter.counter as usize % packets_per_buffer;

        let container = self.container.as_mut().expect("consumer not initialised");
        container.add_data(
            items.tile.tile_id,
            usize::from(items.channel.start_channel_id),
            sample_index * samples,
            samples,
            usize::from(items.channel.start_antenna_id),
            usize::from(items.channel.nof_included_channels).max(1),
            usize::from(items.channel.nof_included_antennas).max(1),
            view.payload(),
            items.packet_time(TIMESTAMP_SCALE),
            0,
        );
        ProcessResult::Stored
    }

    fn on_stream_end(&mut self) {
        if let Some(container) = self.container.as_mut() {
            container.persist(self.callback.as_mut());
        }
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }
}

// ---------------------------------------------------------------------------
// Continuous
// ---------------------------------------------------------------------------

/// Consumer for continuous channelised streams
///
/// Keeps four rotating containers. The buffer boundary fires on the pivot
/// stream (tile 0, polarisation 0) when a zero-index packet lands a full
/// buffer span past the reference time; late packets are routed into the
/// previous container. With `nof_buffer_skips = N`, N buffers are dropped
/// after every captured one.
#[derive(Default)]
pub struct ContinuousChannelConsumer {
    containers: Vec<ChannelContainer>,
    callback: Option<DataCallback>,

    current_container: usize,
    current_buffer: usize,
    nof_buffer_skips: usize,
    rollover: Rollover,
    reference_time: f64,
    num_packets: u32,
    start_time: f64,

    dims: Dimensions,
    nof_tiles: usize,
    max_packet_size: usize,
}

impl ContinuousChannelConsumer {
    pub fn new() -> Self {
        Self {
            rollover: Rollover::new(24),
            start_time: -1.0,
            ..Self::default()
        }
    }

    fn previous_container(&self) -> usize {
        (self.current_container + NOF_CONTAINERS - 1) % NOF_CONTAINERS
    }
}

impl Consumer for ContinuousChannelConsumer {
    fn name(&self) -> &'static str {
        "continuouschannel"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.dims = Dimensions {
            nof_channels: config.require_u16(self.name(), "nof_channels")? as usize,
            nof_samples: config.require_u32(self.name(), "nof_samples")? as usize,
            nof_antennas: config.require_u16(self.name(), "nof_antennas")? as usize,
            nof_pols: config.require_u16(self.name(), "nof_pols")? as usize,
        };
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;
        self.nof_buffer_skips = config.u32_or("nof_buffer_skips", 0) as usize;
        // acquisition gate, rounded to the nearest second
        self.start_time = config.f64_or("start_time", -1.0).round();

        self.containers = (0..NOF_CONTAINERS)
            .map(|_| ChannelContainer::new(self.nof_tiles, self.dims))
            .collect();
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: 131072 * self.nof_tiles,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        mode_filter(|mode| mode == CaptureMode::ChannelContinuous)
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());
        let samples = samples_in_packet(&items, &self.dims);
        if samples == 0 {
            return ProcessResult::Skipped;
        }

        let packet_time = items.packet_time(TIMESTAMP_SCALE);
        if self.start_time > 0.0 && packet_time < self.start_time {
            return ProcessResult::Skipped;
        }

        let pivot = items.tile.tile_id == 0 && items.tile.pol_id == 0;
        let counter = self.rollover.extend(u64::from(items.counter.counter), pivot);

        let packets_per_buffer = (self.dims.nof_samples / samples).max(1) as u64;
        let packet_index = (counter.wrapping_sub(self.rollover.reference_counter)
            % packets_per_buffer) as usize;

        // The wire channel ID identifies the stream; container indexing
        // always starts at channel zero
        let cont_channel_id = u32::from(items.channel.start_channel_id);

        if self.reference_time == 0.0 {
            self.reference_time = packet_time;
        }

        let buffer_span = self.dims.nof_samples as f64 * SAMPLING_PERIOD;

        // A packet older than the reference belongs to the previous buffer
        if packet_time < self.reference_time {
            if self.nof_buffer_skips == 0 {
                let previous = self.previous_container();
                self.containers[previous].add_data(
                    items.tile.tile_id,
                    0,
                    packet_index * samples,
                    samples,
                    usize::from(items.channel.start_antenna_id),
                    usize::from(items.channel.nof_included_channels).max(1),
                    usize::from(items.channel.nof_included_antennas).max(1),
                    view.payload(),
                    packet_time,
                    cont_channel_id,
                );
                return ProcessResult::Stored;
            }
            return ProcessResult::Skipped;
        }

        // Boundary: a zero-index pivot packet past the end of this buffer
        if packet_index == 0
            && packet_time >= self.reference_time + buffer_span
            && self.num_packets > 2 * self.nof_tiles as u32
            && pivot
        {
            self.current_buffer = if self.nof_buffer_skips != 0 {
                (self.current_buffer + 1) % (self.nof_buffer_skips + 1)
            } else {
                0
            };

            if self.current_buffer == 0 {
                if self.nof_buffer_skips != 0 {
                    if self.containers[self.current_container].nof_packets() > 0 {
                        let current = self.current_container;
                        self.containers[current].persist(self.callback.as_mut());
                    }
                    self.current_container = (self.current_container + 1) % NOF_CONTAINERS;
                } else {
                    self.current_container = (self.current_container + 1) % NOF_CONTAINERS;
                    if self.containers[self.current_container].nof_packets() > 0 {
                        let current = self.current_container;
                        self.containers[current].persist(self.callback.as_mut());
                    }
                }
                self.reference_time += buffer_span;
                self.num_packets = 0;
            }
        }

        // Buffers inside the skip window are dropped whole
        if self.current_buffer != 0 {
            return ProcessResult::Skipped;
        }

        self.num_packets += 1;
        let current = self.current_container;
        self.containers[current].add_data(
            items.tile.tile_id,
            0,
            packet_index * samples,
            samples,
            usize::from(items.channel.start_antenna_id),
            usize::from(items.channel.nof_included_channels).max(1),
            usize::from(items.channel.nof_included_antennas).max(1),
            view.payload(),
            packet_time,
            cont_channel_id,
        );
        ProcessResult::Stored
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }
}

// ---------------------------------------------------------------------------
// Integrated
// ---------------------------------------------------------------------------

/// Consumer for on-FPGA integrated spectra
#[derive(Default)]
pub struct IntegratedChannelConsumer {
    container: Option<ChannelContainer>,
    callback: Option<DataCallback>,
    num_packets: u32,
    dims: Dimensions,
    nof_tiles: usize,
    max_packet_size: usize,
}

impl IntegratedChannelConsumer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Consumer for IntegratedChannelConsumer {
    fn name(&self) -> &'static str {
        "integratedchannel"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.dims = Dimensions {
            nof_channels: config.require_u16(self.name(), "nof_channels")? as usize,
            nof_antennas: config.require_u16(self.name(), "nof_antennas")? as usize,
            nof_pols: config.require_u16(self.name(), "nof_pols")? as usize,
            // integrated data carries a single spectrum per window
            nof_samples: 1,
        };
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;
        self.container = Some(ChannelContainer::new(self.nof_tiles, self.dims));
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: 1024,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        mode_filter(|mode| mode == CaptureMode::ChannelIntegrated)
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());

        let included_antennas = usize::from(items.channel.nof_included_antennas).max(1);
        // The channel extent does not fit the header for integrated data;
        // derive it from the payload size instead
        let included_channels = (items.payload_length.saturating_sub(items.payload_offset)
            as usize)
            / (included_antennas * self.dims.nof_pols * SAMPLE_BYTES);
        if included_channels == 0 {
            return ProcessResult::Skipped;
        }

        let expected =
            (self.dims.nof_antennas * self.dims.nof_pols * self.nof_tiles / included_antennas)
                as u32;
        if self.num_packets == expected {
            let container = self.container.as_mut().expect("consumer not initialised");
            container.persist(self.callback.as_mut());
            self.num_packets = 0;
        }

        self.num_packets += 1;
        let container = self.container.as_mut().expect("consumer not initialised");
        container.add_data(
            items.tile.tile_id,
            usize::from(items.channel.start_channel_id),
            0,
            1,
            usize::from(items.channel.start_antenna_id),
            included_channels,
            included_antennas,
            view.payload(),
            items.packet_time(TIMESTAMP_SCALE),
            0,
        );
        ProcessResult::Stored
    }

    fn on_stream_end(&mut self) {
        if let Some(container) = self.container.as_mut() {
            if container.nof_packets() > 0 {
                container.persist(self.callback.as_mut());
                self.num_packets = 0;
            }
        }
    }

    fn pull_timeout(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChannelPacket;
    use std::sync::Mutex;

    const SYNC_TIME: u64 = 1_600_000_000;

    type Captured = Arc<Mutex<Vec<(Vec<u8>, f64, u32, u32)>>>;

    fn capture_callback(consumer: &mut dyn Consumer) -> Captured {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        consumer.set_callback(Box::new(move |data, timestamp, tile, extra| {
            sink.lock().unwrap().push((data.to_vec(), timestamp, tile, extra));
        }));
        captured
    }

    /// timestamp item value putting the packet at `sample_offset` samples
    /// past the sync time (sample period equals the timestamp unit)
    fn at_samples(sample_offset: u64) -> u64 {
        sample_offset
    }

    /// Counters start past zero so the reference latches on first sight
    const BASE_COUNTER: u32 = 8;

    /// Buffer geometry used by the continuous tests: eight samples per
    /// buffer, two samples per packet, four packets per buffer
    const NOF_SAMPLES: u64 = 8;
    const PACKETS_PER_BUFFER: u32 = 4;

    fn continuous(nof_tiles: u16, skips: u32) -> ContinuousChannelConsumer {
        let mut consumer = ContinuousChannelConsumer::new();
        let json = format!(
            r#"{{"nof_tiles": {nof_tiles}, "nof_channels": 1, "nof_samples": {NOF_SAMPLES},
                 "nof_antennas": 1, "nof_pols": 2, "nof_buffer_skips": {skips},
                 "start_time": -1, "max_packet_size": 9000}}"#
        );
        consumer
            .init(&ConsumerConfig::from_json(&json).unwrap())
            .unwrap();
        consumer
    }

    fn continuous_packet(counter: u32, tile: u16, sample_offset: u64, fill: u8) -> Vec<u8> {
        ChannelPacket {
            mode: 0x5,
            counter,
            tile_id: tile,
            pol_id: 0,
            start_channel_id: 100,
            nof_included_channels: 1,
            start_antenna_id: 0,
            nof_included_antennas: 1,
            sync_time: SYNC_TIME,
            timestamp: at_samples(sample_offset),
        }
        .build(&vec![fill; 2 * 2 * 2]) // 2 samples, 1 antenna, 2 pols
    }

    /// Feed the whole of buffer `buffer` (four pivot packets)
    fn feed_buffer(consumer: &mut ContinuousChannelConsumer, buffer: u32) -> u32 {
        let mut stored = 0;
        for index in 0..PACKETS_PER_BUFFER {
            let counter = BASE_COUNTER + buffer * PACKETS_PER_BUFFER + index;
            let offset = u64::from(buffer) * NOF_SAMPLES + u64::from(index) * 2;
            if consumer.process(&continuous_packet(counter, 0, offset, buffer as u8 + 1))
                == ProcessResult::Stored
            {
                stored += 1;
            }
        }
        stored
    }

    #[test]
    fn test_burst_channel_scatter_and_persist() {
        let mut consumer = BurstChannelConsumer::new();
        consumer
            .init(
                &ConsumerConfig::from_json(
                    r#"{"nof_tiles": 1, "nof_channels": 2, "nof_samples": 4,
                        "nof_antennas": 2, "nof_pols": 2, "max_packet_size": 9000}"#,
                )
                .unwrap(),
            )
            .unwrap();
        let captured = capture_callback(&mut consumer);

        // one packet with both channels, both antennas, 4 samples; four
        // bytes per (channel, sample, antenna) cell covering both pols
        let mut payload = Vec::new();
        for channel in 0..2u8 {
            for sample in 0..4u8 {
                for _antenna in 0..2u8 {
                    payload.extend_from_slice(&[
                        channel | 0x10,
                        sample | 0x20,
                        channel | 0x10,
                        sample | 0x20,
                    ]);
                }
            }
        }
        let packet = ChannelPacket {
            mode: 0x4,
            counter: 0,
            tile_id: 0,
            pol_id: 0,
            start_channel_id: 0,
            nof_included_channels: 2,
            start_antenna_id: 0,
            nof_included_antennas: 2,
            sync_time: SYNC_TIME,
            timestamp: 0,
        }
        .build(&payload);

        assert_eq!(consumer.process(&packet), ProcessResult::Stored);
        consumer.on_stream_end();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (data, timestamp, tile, _) = &captured[0];
        assert_eq!(*tile, 0);
        assert_eq!(*timestamp, SYNC_TIME as f64);
        // destination is [channel][sample][antenna][pol]: first channel
        // block carries the 0x10 marker
        assert_eq!(data.len(), 64);
        assert!(data[..32].iter().step_by(2).all(|&b| b == 0x10));
        assert!(data[32..].iter().step_by(2).all(|&b| b == 0x11));
    }

    #[test]
    fn test_continuous_persist_cadence_without_skips() {
        let mut consumer = continuous(1, 0);
        let captured = capture_callback(&mut consumer);

        // Six buffers: the rotation steps back onto the container holding
        // buffer 0 at the fifth boundary, persisting buffers 0 and 1
        for buffer in 0..6 {
            assert_eq!(feed_buffer(&mut consumer, buffer), PACKETS_PER_BUFFER);
        }

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 2);
        let (data, timestamp, tile, cont_channel) = &captured[0];
        assert_eq!(*timestamp, SYNC_TIME as f64);
        assert_eq!(*tile, 0);
        // the wire channel ID travels in the extra callback argument
        assert_eq!(*cont_channel, 100);
        assert!(data.iter().all(|&b| b == 1));
        assert_eq!(
            captured[1].1,
            SYNC_TIME as f64 + NOF_SAMPLES as f64 * SAMPLING_PERIOD
        );
    }

    #[test]
    fn test_continuous_buffer_skip_cadence() {
        // nof_buffer_skips = 3: after a captured buffer, the next three
        // boundaries only advance the skip counter; every fourth buffer is
        // captured again
        let mut consumer = continuous(1, 3);
        let captured = capture_callback(&mut consumer);

        let mut stored = 0;
        for buffer in 0..12 {
            stored += feed_buffer(&mut consumer, buffer);
        }

        // buffers 0, 4 and 8 are captured; the first two of those have
        // been persisted by the time buffer 11 ends
        assert_eq!(stored, 3 * PACKETS_PER_BUFFER);
        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_continuous_late_packet_previous_container() {
        let mut consumer = continuous(1, 0);

        feed_buffer(&mut consumer, 0);
        // first packet of buffer 1 fires the boundary
        let counter = BASE_COUNTER + PACKETS_PER_BUFFER;
        consumer.process(&continuous_packet(counter, 0, NOF_SAMPLES, 2));

        let current = consumer.current_container;
        let packets_before = consumer.containers[current].nof_packets();
        let previous_before = consumer.containers[consumer.previous_container()].nof_packets();

        // A packet older than the reference time lands in the previous
        // container and leaves the current count untouched
        let late = continuous_packet(BASE_COUNTER + 3, 0, 6, 9);
        assert_eq!(consumer.process(&late), ProcessResult::Stored);

        assert_eq!(consumer.containers[current].nof_packets(), packets_before);
        assert_eq!(
            consumer.containers[consumer.previous_container()].nof_packets(),
            previous_before + 1
        );
    }

    #[test]
    fn test_continuous_counter_wrap() {
        let mut consumer = continuous(1, 0);

        // Reference at the top of the 24-bit range, then wrap through zero
        let top = 0xFF_FFFC;
        for (step, counter) in [top, top + 1, top + 2, top + 3, 0, 1, 2, 3]
            .into_iter()
            .enumerate()
        {
            let offset = step as u64 * 2;
            let result = consumer.process(&continuous_packet(counter, 0, offset, 1));
            assert_eq!(result, ProcessResult::Stored, "packet {step} rejected");
        }

        assert_eq!(consumer.rollover.rollovers(), 1);
    }

    #[test]
    fn test_continuous_start_time_gate() {
        let mut consumer = continuous(1, 0);
        consumer.start_time = SYNC_TIME as f64 + 1.0;

        // ~0.5 s worth of samples is still before the gate
        let early = continuous_packet(BASE_COUNTER, 0, 500_000, 1);
        assert_eq!(consumer.process(&early), ProcessResult::Skipped);

        // ~1.1 s is past it
        let late_enough = continuous_packet(BASE_COUNTER + 1, 0, 1_100_000, 1);
        assert_eq!(consumer.process(&late_enough), ProcessResult::Stored);
    }

    #[test]
    fn test_integrated_persists_on_window_completion() {
        let mut consumer = IntegratedChannelConsumer::new();
        consumer
            .init(
                &ConsumerConfig::from_json(
                    r#"{"nof_tiles": 1, "nof_channels": 2, "nof_antennas": 2,
                        "nof_pols": 2, "max_packet_size": 9000}"#,
                )
                .unwrap(),
            )
            .unwrap();
        let captured = capture_callback(&mut consumer);

        // expected packets per window: antennas * pols * tiles / included
        let packet = |counter: u32, antenna: u16| {
            ChannelPacket {
                mode: 0x6,
                counter,
                tile_id: 0,
                pol_id: 0,
                start_channel_id: 0,
                nof_included_channels: 2,
                start_antenna_id: antenna,
                nof_included_antennas: 1,
                sync_time: SYNC_TIME,
                timestamp: 0,
            }
            // one antenna, two channels, two pols
            .build(&[1, 2, 3, 4, 5, 6, 7, 8])
        };

        for counter in 0..4u32 {
            consumer.process(&packet(counter, (counter % 2) as u16));
        }
        assert_eq!(captured.lock().unwrap().len(), 0);

        // the first packet of the next window flushes the previous one
        consumer.process(&packet(4, 0));
        assert_eq!(captured.lock().unwrap().len(), 1);
    }
}

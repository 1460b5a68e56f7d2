//! Station-beam reassembly
//!
//! Station beam packets carry the summed array beam, one logical channel
//! per packet, with a 32-bit packet counter and a 48-bit timestamp. The
//! consumer assembles them into rotating whole-second buffers and a
//! persister thread hands completed buffers to the registered callback.
//!
//! A buffer becomes ready two rotations after it was filled, which leaves
//! the previous buffer open for late and out-of-order packets. A consumer
//! that cannot keep up is overwritten after a bounded wait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[cfg(not(test))]
use log::{info, warn};
#[cfg(test)]
use std::{println as info, println as warn};

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, DataCallback, PacketFilter, ProcessResult};
use crate::error::DaqResult;
use crate::mem::AlignedBuffer;
use crate::reassembly::{Rollover, NOF_CONTAINERS};
use crate::ring::RingConfig;
use crate::spead::{
    item_id, SpeadView, StationCounter, STATION_SCALE_LEGACY, STATION_SCALE_SCAN,
};
use crate::thread::WorkerThread;

/// Bytes per complex 16-bit sample
const SAMPLE_BYTES: usize = 2;

/// Station beams always carry two polarisations
const NOF_POLS: usize = 2;

/// Producer wait budget before overwriting an unreleased buffer
const OVERWRITE_BUDGET: Duration = Duration::from_millis(1);

/// Poll interval for buffer hand-off
const BUFFER_POLL: Duration = Duration::from_micros(1);

/// Completed-buffer description handed to the capture callback
#[derive(Clone, Copy, Debug, Default)]
pub struct StationMetadata {
    /// Centre frequency from the stream, in Hz
    pub frequency_hz: u64,
    /// Packets assembled into this buffer
    pub nof_packets: u32,
    /// Monotonic buffer number derived from the packet counter
    pub buffer_counter: u64,
    /// Absolute index of the buffer's first sample
    pub start_sample_index: u64,
    /// Samples actually seen on the first captured channel
    pub read_samples: u32,
}

/// Station buffer completion callback
pub type StationCallback = Box<dyn FnMut(&[u8], f64, &StationMetadata) + Send>;

struct StationSlot {
    ref_time: f64,
    /// Packet counter of the buffer's first packet; zero marks an empty slot
    index: u64,
    ready: bool,
    nof_packets: u32,
    read_samples: u32,
    data: AlignedBuffer,
}

impl StationSlot {
    fn reset(&mut self) {
        self.ref_time = f64::MAX;
        self.index = 0;
        self.ready = false;
        self.nof_packets = 0;
        self.read_samples = 0;
        self.data.clear();
    }
}

/// Rotating buffers between the station reassembler and its persister
pub(crate) struct StationBuffers {
    slots: Vec<Mutex<StationSlot>>,
    nof_channels: usize,
    nof_samples: usize,
    transpose_samples: bool,
    producer: std::sync::atomic::AtomicUsize,
    consumer: std::sync::atomic::AtomicUsize,
    overwrites: AtomicU64,
}

impl StationBuffers {
    fn new(nof_channels: usize, nof_samples: usize, transpose_samples: bool) -> Self {
        let slot_bytes = NOF_POLS * nof_channels * nof_samples * SAMPLE_BYTES;
        let slots = (0..NOF_CONTAINERS)
            .map(|_| {
                let data = AlignedBuffer::zeroed(slot_bytes);
                data.lock_memory();
                Mutex::new(StationSlot {
                    ref_time: f64::MAX,
                    index: 0,
                    ready: false,
                    nof_packets: 0,
                    read_samples: 0,
                    data,
                })
            })
            .collect();
        Self {
            slots,
            nof_channels,
            nof_samples,
            transpose_samples,
            producer: std::sync::atomic::AtomicUsize::new(0),
            consumer: std::sync::atomic::AtomicUsize::new(0),
            overwrites: AtomicU64::new(0),
        }
    }

    fn write_data(
        &self,
        samples: usize,
        channel: usize,
        packet_counter: u64,
        payload: &[u8],
        timestamp: f64,
    ) {
        let producer = self.producer.load(Ordering::Acquire);
        let mut state = self.slots[producer].lock().unwrap();

        if state.index == 0 {
            state.index = packet_counter;
        } else if state.index > packet_counter {
            // Late packet: place it in the previous buffer if it fits there
            drop(state);
            let previous = (producer + NOF_CONTAINERS - 1) % NOF_CONTAINERS;
            let mut state = self.slots[previous].lock().unwrap();
            if state.index == 0 || state.index > packet_counter {
                return;
            }
            self.scatter(&mut state, samples, channel, packet_counter, payload, timestamp);
            return;
        } else if packet_counter - state.index >= (self.nof_samples / samples) as u64 {
            // Buffer boundary: the buffer two rotations back is complete
            let current_index = state.index;
            drop(state);

            let lagged = (producer + NOF_CONTAINERS - 2) % NOF_CONTAINERS;
            {
                let mut state = self.slots[lagged].lock().unwrap();
                if state.index != 0 {
                    state.ready = true;
                }
            }

            let next = (producer + 1) % NOF_CONTAINERS;
            self.producer.store(next, Ordering::Release);

            let started = Instant::now();
            loop {
                let mut next_state = self.slots[next].lock().unwrap();
                if next_state.index == 0 {
                    next_state.index = current_index + (self.nof_samples / samples) as u64;
                    break;
                }
                if started.elapsed() >= OVERWRITE_BUDGET {
                    warn!("overwriting station buffer [{next}]");
                    self.overwrites.fetch_add(1, Ordering::Relaxed);
                    next_state.reset();
                    next_state.index = current_index + (self.nof_samples / samples) as u64;
                    break;
                }
                drop(next_state);
                std::thread::sleep(BUFFER_POLL);
            }
            state = self.slots[next].lock().unwrap();
        }

        self.scatter(&mut state, samples, channel, packet_counter, payload, timestamp);
        if state.index > packet_counter {
            state.index = packet_counter;
        }
    }

    fn scatter(
        &self,
        state: &mut MutexGuard<'_, StationSlot>,
        samples: usize,
        channel: usize,
        packet_counter: u64,
        payload: &[u8],
        timestamp: f64,
    ) {
        let sample_offset = (packet_counter.saturating_sub(state.index)) as usize * samples;
        let pol_bytes = NOF_POLS * SAMPLE_BYTES;
        let data = state.data.as_mut_slice();

        if self.nof_channels == 1 {
            let dst = sample_offset * pol_bytes;
            let len = (samples * pol_bytes).min(payload.len());
            if dst + len <= data.len() {
                data[dst..dst + len].copy_from_slice(&payload[..len]);
            }
        } else if self.transpose_samples {
            // Destination is [sample][channel][pol]
            for sample in 0..samples {
                let src = sample * pol_bytes;
                let dst = ((sample_offset + sample) * self.nof_channels + channel) * pol_bytes;
                if src + pol_bytes > payload.len() || dst + pol_bytes > data.len() {
                    break;
                }
                data[dst..dst + pol_bytes].copy_from_slice(&payload[src..src + pol_bytes]);
            }
        } else {
            // One contiguous plane per channel
            let dst = (channel * self.nof_samples + sample_offset) * pol_bytes;
            let len = (samples * pol_bytes).min(payload.len());
            if dst + len <= data.len() {
                data[dst..dst + len].copy_from_slice(&payload[..len]);
            }
        }

        state.nof_packets += 1;
        if channel == 0 {
            state.read_samples += samples as u32;
        }
        if state.ref_time > timestamp {
            state.ref_time = timestamp;
        }
    }

    /// Poll for the next completed buffer; the guard releases it on drop
    fn read_buffer(&self) -> Option<StationRead<'_>> {
        let consumer = self.consumer.load(Ordering::Acquire);
        let state = self.slots[consumer].lock().unwrap();
        if !state.ready {
            drop(state);
            std::thread::sleep(BUFFER_POLL);
            return None;
        }
        Some(StationRead {
            parent: self,
            state,
            slot: consumer,
        })
    }

    /// Mark every populated buffer ready, oldest first
    fn finish(&self) {
        let producer = self.producer.load(Ordering::Acquire);
        for step in 1..=NOF_CONTAINERS {
            let slot = (producer + step) % NOF_CONTAINERS;
            let mut state = self.slots[slot].lock().unwrap();
            if state.index != 0 {
                state.ready = true;
            }
        }
    }

    fn overwrites(&self) -> u64 {
        self.overwrites.load(Ordering::Relaxed)
    }
}

struct StationRead<'a> {
    parent: &'a StationBuffers,
    state: MutexGuard<'a, StationSlot>,
    slot: usize,
}

impl StationRead<'_> {
    fn data(&self) -> &[u8] {
        self.state.data.as_slice()
    }
}

impl Drop for StationRead<'_> {
    fn drop(&mut self) {
        self.state.reset();
        self.parent
            .consumer
            .store((self.slot + 1) % NOF_CONTAINERS, Ordering::Release);
    }
}

/// Consumer for station-beam streams
pub struct StationConsumer {
    buffers: Option<Arc<StationBuffers>>,
    callback: Arc<Mutex<Option<StationCallback>>>,
    persister: Option<JoinHandle<()>>,
    persister_stop: Arc<AtomicBool>,

    counter_rollover: Rollover,
    timestamp_rollover: Rollover,
    timestamp_scale: Option<f64>,
    frequency: Arc<AtomicU64>,
    samples_per_packet: Arc<AtomicU64>,

    start_channel: u16,
    nof_channels: usize,
    nof_samples: usize,
    transpose_samples: bool,
    counter_shift: bool,
    max_packet_size: usize,
}

impl Default for StationConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl StationConsumer {
    pub fn new() -> Self {
        Self {
            buffers: None,
            callback: Arc::new(Mutex::new(None)),
            persister: None,
            persister_stop: Arc::new(AtomicBool::new(false)),
            counter_rollover: Rollover::new(32),
            timestamp_rollover: Rollover::new(48),
            timestamp_scale: None,
            frequency: Arc::new(AtomicU64::new(0)),
            samples_per_packet: Arc::new(AtomicU64::new(0)),
            start_channel: 0,
            nof_channels: 1,
            nof_samples: 0,
            transpose_samples: true,
            counter_shift: false,
            max_packet_size: 9000,
        }
    }

    /// Attach a callback receiving the full buffer metadata
    pub fn set_station_callback(&mut self, callback: StationCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Buffers lost to a lagging persister
    pub fn overwrites(&self) -> u64 {
        self.buffers
            .as_ref()
            .map(|buffers| buffers.overwrites())
            .unwrap_or(0)
    }
}

impl Drop for StationConsumer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl Consumer for StationConsumer {
    fn name(&self) -> &'static str {
        "stationbeam"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.start_channel = config.require_u16(self.name(), "start_channel")?;
        self.nof_channels = config.require_u16(self.name(), "nof_channels")? as usize;
        self.nof_samples = config.require_u32(self.name(), "nof_samples")? as usize;
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;
        self.transpose_samples = config.bool_or("transpose_samples", true);
        // pre-TPM-1.6 firmware divides the counter by eight
        self.counter_shift = config.bool_or("counter_shift", false);

        let buffers = Arc::new(StationBuffers::new(
            self.nof_channels,
            self.nof_samples,
            self.transpose_samples,
        ));
        self.buffers = Some(Arc::clone(&buffers));

        // The persister owns the read side for the consumer's lifetime
        let callback = Arc::clone(&self.callback);
        let stop = Arc::clone(&self.persister_stop);
        let frequency = Arc::clone(&self.frequency);
        let samples_per_packet = Arc::clone(&self.samples_per_packet);
        let nof_samples = self.nof_samples as u64;
        self.persister = Some(WorkerThread::new("daq-station-persist").realtime().spawn(
            move || loop {
                match buffers.read_buffer() {
                    Some(read) => {
                        let samples = samples_per_packet.load(Ordering::Relaxed).max(1);
                        let packets_per_buffer = (nof_samples / samples).max(1);
                        let metadata = StationMetadata {
                            frequency_hz: frequency.load(Ordering::Relaxed),
                            nof_packets: read.state.nof_packets,
                            buffer_counter: read.state.index / packets_per_buffer,
                            start_sample_index: read.state.index * samples,
                            read_samples: read.state.read_samples,
                        };
                        let mut callback = callback.lock().unwrap();
                        match callback.as_mut() {
                            Some(callback) => {
                                callback(read.data(), read.state.ref_time, &metadata)
                            }
                            None => info!("received station beam"),
                        }
                    }
                    None if stop.load(Ordering::Acquire) => break,
                    None => {}
                }
            },
        ));
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: self.nof_samples / 2,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        // Station beam packets have no capture-mode item; the frequency
        // item marks them
        Arc::new(|packet: &[u8]| {
            SpeadView::open(packet)
                .is_some_and(|view| view.item(item_id::FREQUENCY).is_some())
        })
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };

        let mut counter = StationCounter::default();
        let mut payload_length = 0u64;
        let mut sync_time = 0u64;
        let mut timestamp = 0u64;
        let mut payload_offset = 0u64;
        let mut scan_id = None;
        for (position, item) in view.items().enumerate() {
            match item.id {
                item_id::HEAP_COUNTER => counter = StationCounter::from(item.value),
                item_id::PAYLOAD_LENGTH => payload_length = item.value,
                item_id::SYNC_TIME => sync_time = item.value,
                item_id::TIMESTAMP => timestamp = item.value,
                item_id::FREQUENCY => {
                    self.frequency.store(item.value, Ordering::Relaxed);
                }
                item_id::SCAN_ID => scan_id = Some(item.value),
                item_id::PAYLOAD_OFFSET => payload_offset = item.value,
                item_id::BEAM_INFO | item_id::STATION_INFO | item_id::CAPTURE_MODE => {}
                id => log::debug!(
                    "stationbeam: unknown item {id:#06x} ({} of {})",
                    position + 1,
                    view.nof_items()
                ),
            }
        }

        let pivot = counter.logical_channel == 0;

        // Streams with a scan id use a coarser timestamp unit
        let scale = *self
            .timestamp_scale
            .get_or_insert(if scan_id.is_some() {
                STATION_SCALE_SCAN
            } else {
                STATION_SCALE_LEGACY
            });
        let timestamp = self.timestamp_rollover.extend(timestamp, pivot);
        let packet_time = sync_time as f64 + timestamp as f64 * scale;

        let samples = (payload_length.saturating_sub(payload_offset) as usize)
            / (SAMPLE_BYTES * NOF_POLS);
        if samples == 0 {
            return ProcessResult::Skipped;
        }
        self.samples_per_packet
            .store(samples as u64, Ordering::Relaxed);

        let wire_counter = if self.counter_shift {
            counter.counter >> 3
        } else {
            counter.counter
        };
        let packet_counter = self.counter_rollover.extend(wire_counter, pivot);

        // Only the configured channel range is captured
        let channel = counter.logical_channel;
        if channel < self.start_channel
            || usize::from(channel - self.start_channel) >= self.nof_channels
        {
            return ProcessResult::Skipped;
        }

        let buffers = self.buffers.as_ref().expect("consumer not initialised");
        buffers.write_data(
            samples,
            usize::from(channel - self.start_channel),
            packet_counter,
            view.payload(),
            packet_time,
        );
        ProcessResult::Stored
    }

    fn cleanup(&mut self) {
        if let Some(buffers) = self.buffers.as_ref() {
            buffers.finish();
        }
        self.persister_stop.store(true, Ordering::Release);
        if let Some(handle) = self.persister.take() {
            let _ = handle.join();
        }
    }

    fn set_callback(&mut self, mut callback: DataCallback) {
        self.set_station_callback(Box::new(move |data, timestamp, metadata| {
            callback(data, timestamp, metadata.nof_packets, metadata.read_samples)
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StationPacket;

    const SYNC_TIME: u64 = 1_650_000_000;
    const FREQUENCY: u64 = 159_375_000;

    /// Eight samples per buffer, two samples per packet
    fn consumer(nof_channels: u16) -> StationConsumer {
        let mut consumer = StationConsumer::new();
        let json = format!(
            r#"{{"start_channel": 0, "nof_channels": {nof_channels}, "nof_samples": 8,
                 "max_packet_size": 9000}}"#
        );
        consumer
            .init(&ConsumerConfig::from_json(&json).unwrap())
            .unwrap();
        consumer
    }

    fn packet(counter: u64, channel: u16, fill: u8) -> Vec<u8> {
        StationPacket {
            counter,
            logical_channel: channel,
            sync_time: SYNC_TIME,
            timestamp: counter * 2_000,
            frequency_hz: FREQUENCY,
            scan_id: None,
        }
        .build(&vec![fill; 2 * NOF_POLS * SAMPLE_BYTES])
    }

    type Persisted = Arc<Mutex<Vec<(usize, f64, StationMetadata)>>>;

    fn persist_probe(consumer: &mut StationConsumer) -> Persisted {
        let persisted: Persisted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&persisted);
        consumer.set_station_callback(Box::new(move |data, timestamp, metadata| {
            sink.lock().unwrap().push((data.len(), timestamp, *metadata));
        }));
        persisted
    }

    fn wait_for(persisted: &Persisted, count: usize) {
        for _ in 0..500 {
            if persisted.lock().unwrap().len() >= count {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("persister did not deliver {count} buffer(s)");
    }

    #[test]
    fn test_filter_requires_frequency_item() {
        let consumer = consumer(1);
        let filter = consumer.packet_filter();
        assert!(filter(&packet(100, 0, 1)));

        let channel_packet = crate::testing::ChannelPacket {
            mode: 0x5,
            counter: 1,
            tile_id: 0,
            pol_id: 0,
            start_channel_id: 0,
            nof_included_channels: 1,
            start_antenna_id: 0,
            nof_included_antennas: 1,
            sync_time: 0,
            timestamp: 0,
        }
        .build(&[0; 8]);
        assert!(!filter(&channel_packet));
    }

    #[test]
    fn test_buffers_become_ready_two_rotations_later() {
        let mut consumer = consumer(1);
        let persisted = persist_probe(&mut consumer);

        // Buffers start at counter 100; each holds four packets
        for counter in 100..112 {
            assert_eq!(consumer.process(&packet(counter, 0, 1)), ProcessResult::Stored);
        }
        assert!(persisted.lock().unwrap().is_empty());

        // The fourth buffer's first packet readies the first buffer
        consumer.process(&packet(112, 0, 4));
        wait_for(&persisted, 1);

        let entries = persisted.lock().unwrap();
        let (len, timestamp, metadata) = &entries[0];
        assert_eq!(*len, 8 * NOF_POLS * SAMPLE_BYTES);
        assert_eq!(metadata.buffer_counter, 25); // 100 / 4
        assert_eq!(metadata.start_sample_index, 200); // 100 * 2
        assert_eq!(metadata.nof_packets, 4);
        assert_eq!(metadata.read_samples, 8);
        assert_eq!(metadata.frequency_hz, FREQUENCY);
        // reference time of the first packet: counter 100, 2000 units each,
        // legacy 1 ns scale
        assert_eq!(*timestamp, SYNC_TIME as f64 + 100.0 * 2_000.0 * 1.0e-9);

        drop(entries);
        consumer.cleanup();
    }

    #[test]
    fn test_out_of_range_channel_dropped() {
        let mut consumer = consumer(1);
        assert_eq!(
            consumer.process(&packet(100, 3, 1)),
            ProcessResult::Skipped
        );
        consumer.cleanup();
    }

    #[test]
    fn test_multi_channel_transpose() {
        let mut consumer = consumer(2);
        let persisted = persist_probe(&mut consumer);

        // Interleave both channels through three full buffers
        for counter in 100..112 {
            consumer.process(&packet(counter, 0, 0xA0));
            consumer.process(&packet(counter, 1, 0xB0));
        }
        consumer.process(&packet(112, 0, 0xA0));
        wait_for(&persisted, 1);
        consumer.cleanup();

        let entries = persisted.lock().unwrap();
        // [sample][channel][pol] interleave: channel 0 then channel 1
        // within each sample
        assert_eq!(entries[0].0, 8 * 2 * NOF_POLS * SAMPLE_BYTES);
    }

    #[test]
    fn test_counter_rollover_32bit() {
        let mut consumer = consumer(1);

        let top = 0xFFFF_FFFCu64;
        for (step, counter) in [top, top + 1, top + 2, top + 3].into_iter().enumerate() {
            let _ = step;
            consumer.process(&packet(counter, 0, 1));
        }
        // wire counter wraps to zero on the pivot channel
        let wrapped = StationPacket {
            counter: 0,
            logical_channel: 0,
            sync_time: SYNC_TIME,
            timestamp: 1,
            frequency_hz: FREQUENCY,
            scan_id: None,
        }
        .build(&[1; 2 * NOF_POLS * SAMPLE_BYTES]);
        assert_eq!(consumer.process(&wrapped), ProcessResult::Stored);
        assert_eq!(consumer.counter_rollover.rollovers(), 1);
        consumer.cleanup();
    }

    #[test]
    fn test_scan_id_selects_scale() {
        let mut consumer = consumer(1);
        let with_scan = StationPacket {
            counter: 100,
            logical_channel: 0,
            sync_time: SYNC_TIME,
            timestamp: 0,
            frequency_hz: FREQUENCY,
            scan_id: Some(42),
        }
        .build(&[1; 2 * NOF_POLS * SAMPLE_BYTES]);
        consumer.process(&with_scan);
        assert_eq!(consumer.timestamp_scale, Some(STATION_SCALE_SCAN));
        consumer.cleanup();
    }
}

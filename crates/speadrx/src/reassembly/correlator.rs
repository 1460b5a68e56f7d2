//! Correlator input reassembly
//!
//! Feeds channelised packets into the buffer-granular [`DoubleBuffer`]
//! consumed by the cross-correlation stage. The GPU kernel itself is an
//! external collaborator; here its place is taken by a reader thread that
//! hands every completed buffer to the registered callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::info;

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, DataCallback, PacketFilter, ProcessResult};
use crate::double_buffer::DoubleBuffer;
use crate::error::DaqResult;
use crate::reassembly::{Rollover, TileItems};
use crate::ring::RingConfig;
use crate::spead::{CaptureMode, SpeadView, TIMESTAMP_SCALE};

/// Bytes per complex 16-bit sample
const SAMPLE_BYTES: usize = 2;

/// Consumer assembling correlator input buffers
pub struct CorrelatorConsumer {
    double_buffer: Option<Arc<DoubleBuffer>>,
    callback: Arc<Mutex<Option<DataCallback>>>,
    reader: Option<JoinHandle<()>>,
    reader_stop: Arc<AtomicBool>,
    rollover: Rollover,

    nof_antennas: usize,
    nof_channels: usize,
    nof_fine_channels: usize,
    nof_tiles: usize,
    nof_samples: usize,
    nof_pols: usize,
    max_packet_size: usize,
}

impl Default for CorrelatorConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelatorConsumer {
    pub fn new() -> Self {
        Self {
            double_buffer: None,
            callback: Arc::new(Mutex::new(None)),
            reader: None,
            reader_stop: Arc::new(AtomicBool::new(false)),
            rollover: Rollover::new(24),
            nof_antennas: 0,
            nof_channels: 0,
            nof_fine_channels: 0,
            nof_tiles: 0,
            nof_samples: 0,
            nof_pols: 0,
            max_packet_size: 9000,
        }
    }
}

impl Drop for CorrelatorConsumer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl Consumer for CorrelatorConsumer {
    fn name(&self) -> &'static str {
        "correlator"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_antennas = config.require_u16(self.name(), "nof_antennas")? as usize;
        self.nof_channels = config.require_u16(self.name(), "nof_channels")? as usize;
        self.nof_fine_channels = config.require_u32(self.name(), "nof_fine_channels")? as usize;
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.nof_samples = config.require_u32(self.name(), "nof_samples")? as usize;
        self.nof_pols = config.require_u16(self.name(), "nof_pols")? as usize;
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;

        info!(
            "correlator consumer: {} stations, {} channels ({} fine), {} samples",
            self.nof_tiles * self.nof_antennas,
            self.nof_channels,
            self.nof_fine_channels,
            self.nof_samples
        );

        let double_buffer = Arc::new(DoubleBuffer::new(
            self.nof_antennas * self.nof_tiles,
            self.nof_samples,
            self.nof_pols,
            4,
        ));
        self.double_buffer = Some(Arc::clone(&double_buffer));

        // Stand-in for the cross-correlation stage: drain completed
        // buffers into the callback
        let callback = Arc::clone(&self.callback);
        let stop = Arc::clone(&self.reader_stop);
        self.reader = Some(
            crate::thread::WorkerThread::new("daq-correlate")
                .realtime()
                .spawn(move || loop {
                    match double_buffer.read_buffer() {
                        Some(read) => {
                            let mut callback = callback.lock().unwrap();
                            if let Some(callback) = callback.as_mut() {
                                callback(
                                    read.data(),
                                    read.ref_time(),
                                    read.channel().max(0) as u32,
                                    read.read_samples(),
                                );
                            }
                        }
                        None if stop.load(Ordering::Acquire) => break,
                        None => {}
                    }
                }),
        );
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
                .is_some_and(|mode| {
                    matches!(
                        mode,
                        CaptureMode::ChannelBurst | CaptureMode::ChannelContinuous
                    )
                })
        })
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());

        let included_antennas = usize::from(items.channel.nof_included_antennas).max(1);
        let included_channels = usize::from(items.channel.nof_included_channels).max(1);
        let samples = (items.payload_length.saturating_sub(items.payload_offset) as usize)
            / (included_antennas * included_channels * self.nof_pols * SAMPLE_BYTES);
        if samples == 0 {
            return ProcessResult::Skipped;
        }

        let packet_time = items.packet_time(TIMESTAMP_SCALE);
        let pivot = items.tile.pol_id == 0;
        let counter = self.rollover.extend(u64::from(items.counter.counter), pivot);
        let packet_index = (counter.wrapping_sub(self.rollover.reference_counter)
            % (self.nof_samples / samples).max(1) as u64) as usize;

        let antenna = self.nof_antennas * usize::from(items.tile.tile_id)
            + usize::from(items.channel.start_antenna_id);
        let double_buffer = self.double_buffer.as_ref().expect("consumer not initialised");

        if self.nof_channels == 1 {
            double_buffer.write_data_single_channel(
                antenna,
                included_antennas,
                items.channel.start_channel_id,
                packet_index,
                samples,
                view.payload(),
                packet_time,
            );
        } else {
            double_buffer.write_data(
                antenna,
                included_antennas,
                items.channel.start_channel_id,
                packet_index,
                samples,
                view.payload(),
                packet_time,
            );
        }
        ProcessResult::Stored
    }

    fn on_stream_end(&mut self) {
        // A pause ends the current integration window
        if let Some(double_buffer) = self.double_buffer.as_ref() {
            double_buffer.finish_write();
        }
        self.rollover.reset();
    }

    fn cleanup(&mut self) {
        if let Some(double_buffer) = self.double_buffer.as_ref() {
            double_buffer.finish_write();
        }
        self.reader_stop.store(true, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }

    fn set_callback(&mut self, callback: DataCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChannelPacket;
    use std::time::Duration;

    fn consumer() -> CorrelatorConsumer {
        let mut consumer = CorrelatorConsumer::new();
        consumer
            .init(
                &ConsumerConfig::from_json(
                    r#"{"nof_antennas": 2, "nof_channels": 1, "nof_fine_channels": 128,
                        "nof_tiles": 1, "nof_samples": 4, "nof_pols": 2,
                        "max_packet_size": 9000}"#,
                )
                .unwrap(),
            )
            .unwrap();
        consumer
    }

    #[test]
    fn test_buffers_reach_reader_on_pause() {
        let mut consumer = consumer();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        consumer.set_callback(Box::new(move |data, timestamp, channel, samples| {
            sink.lock()
                .unwrap()
                .push((data.to_vec(), timestamp, channel, samples));
        }));

        // Two packets fill one four-sample buffer for both antennas
        for counter in [7u32, 8] {
            let packet = ChannelPacket {
                mode: 0x5,
                counter,
                tile_id: 0,
                pol_id: 0,
                start_channel_id: 3,
                nof_included_channels: 1,
                start_antenna_id: 0,
                nof_included_antennas: 2,
                sync_time: 1_000,
                timestamp: 0,
            }
            // 2 samples × 2 antennas × 2 pols × 2 bytes
            .build(&[5; 16]);
            assert_eq!(consumer.process(&packet), ProcessResult::Stored);
        }

        consumer.on_stream_end();

        // reader thread delivers asynchronously
        for _ in 0..500 {
            if !captured.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        consumer.cleanup();

        let captured = captured.lock().unwrap();
        assert!(!captured.is_empty(), "no buffer reached the reader");
        let (data, timestamp, channel, samples) = &captured[0];
        assert_eq!(*channel, 3);
        assert_eq!(*timestamp, 1_000.0);
        assert_eq!(*samples, 4);
        assert_eq!(data.len(), 2 * 4 * 2 * SAMPLE_BYTES);
        assert!(data.iter().all(|&b| b == 5));
    }
}

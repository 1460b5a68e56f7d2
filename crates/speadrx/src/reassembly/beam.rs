//! Beamformed data reassembly
//!
//! Beamformed streams carry 32-bit complex samples (16-bit real, 16-bit
//! imaginary) per channel and polarisation. Burst captures store one
//! polarisation plane after the other, `[pol][sample][channel]` per tile;
//! integrated captures hold one spectrum per integration window in
//! `[beam][pol][sample][channel]` order.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, DataCallback, PacketFilter, ProcessResult};
use crate::container::TileBuffers;
use crate::error::DaqResult;
use crate::reassembly::TileItems;
use crate::ring::RingConfig;
use crate::spead::{CaptureMode, SpeadView, TIMESTAMP_SCALE};

/// Bytes per beamformed sample value (complex 16-bit)
const SAMPLE_BYTES: usize = 4;

fn mode_filter(accept: fn(CaptureMode) -> bool) -> PacketFilter {
    Arc::new(move |packet: &[u8]| {
        SpeadView::open(packet)
            .and_then(|view| view.capture_mode())
            .is_some_and(accept)
    })
}

// ---------------------------------------------------------------------------
// Burst
// ---------------------------------------------------------------------------

/// Consumer for one-shot beamformed captures
#[derive(Default)]
pub struct BurstBeamConsumer {
    buffers: Option<TileBuffers>,
    callback: Option<DataCallback>,

    nof_tiles: usize,
    nof_channels: usize,
    nof_samples: usize,
    nof_pols: usize,
    max_packet_size: usize,
}

impl BurstBeamConsumer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Consumer for BurstBeamConsumer {
    fn name(&self) -> &'static str {
        "burstbeam"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.nof_channels = config.require_u16(self.name(), "nof_channels")? as usize;
        self.nof_samples = config.require_u32(self.name(), "nof_samples")? as usize;
        self.nof_pols = config.require_u16(self.name(), "nof_pols")? as usize;
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;

        let row_len = self.nof_pols * self.nof_samples * self.nof_channels * SAMPLE_BYTES;
        self.buffers = Some(TileBuffers::new(self.nof_tiles, row_len));
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: self.nof_samples * 16,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        mode_filter(|mode| mode == CaptureMode::BeamBurst)
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());
        let payload = view.payload();

        let included_channels = usize::from(items.beam_channel.nof_included_channels).max(1);
        let start_channel = usize::from(items.beam_channel.start_channel_id);
        let values = (items.payload_length.saturating_sub(items.payload_offset) as usize)
            / SAMPLE_BYTES;
        let samples_in_packet = values / (included_channels * self.nof_pols);
        if samples_in_packet == 0 {
            return ProcessResult::Skipped;
        }
        let start_sample =
            (items.counter.counter as usize * samples_in_packet) % self.nof_samples;

        let buffers = self.buffers.as_mut().expect("consumer not initialised");
        let Some(row) = buffers.row_index(items.tile.tile_id) else {
            return ProcessResult::Skipped;
        };
        let (nof_samples, nof_channels, nof_pols) =
            (self.nof_samples, self.nof_channels, self.nof_pols);
        let row_data = buffers.row_mut(row);

        // Packet order is [sample][channel][pol]; the container keeps one
        // plane per polarisation
        for sample in 0..samples_in_packet {
            for channel in 0..included_channels {
                for pol in 0..nof_pols {
                    let src = ((sample * included_channels + channel) * nof_pols + pol)
                        * SAMPLE_BYTES;
                    let dst = (pol * nof_samples * nof_channels
                        + (start_sample + sample) * nof_channels
                        + (start_channel + channel))
                        * SAMPLE_BYTES;
                    if src + SAMPLE_BYTES > payload.len() || dst + SAMPLE_BYTES > row_data.len()
                    {
                        continue;
                    }
                    row_data[dst..dst + SAMPLE_BYTES]
                        .copy_from_slice(&payload[src..src + SAMPLE_BYTES]);
                }
            }
        }

        buffers.update_timestamp(items.packet_time(TIMESTAMP_SCALE));
        buffers.nof_packets += 1;
        ProcessResult::Stored
    }

    fn on_stream_end(&mut self) {
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        if let Some(callback) = self.callback.as_mut() {
            for (tile, data) in buffers.rows() {
                callback(data, buffers.timestamp, u32::from(tile), 0);
            }
        } else {
            log::warn!("no callback for beam data defined");
        }
        buffers.clear();
    }

    fn pull_timeout(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }
}

// ---------------------------------------------------------------------------
// Integrated
// ---------------------------------------------------------------------------

/// Consumer for on-FPGA integrated beam spectra
#[derive(Default)]
pub struct IntegratedBeamConsumer {
    buffers: Option<TileBuffers>,
    callback: Option<DataCallback>,

    received_packets: u32,
    saved_packet_counter: u32,

    nof_tiles: usize,
    nof_beams: usize,
    nof_channels: usize,
    nof_samples: usize,
    nof_pols: usize,
    max_packet_size: usize,
}

impl IntegratedBeamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn persist(&mut self) {
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        if let Some(callback) = self.callback.as_mut() {
            for (tile, data) in buffers.rows() {
                callback(data, buffers.timestamp, u32::from(tile), 0);
            }
        } else {
            log::warn!("no callback for integrated beam data defined");
        }
        buffers.clear();
    }
}

impl Consumer for IntegratedBeamConsumer {
    fn name(&self) -> &'static str {
        "integratedbeam"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.nof_beams = config.require_u16(self.name(), "nof_beams")? as usize;
        self.nof_channels = config.require_u16(self.name(), "nof_channels")? as usize;
        self.nof_samples = config.require_u32(self.name(), "nof_samples")? as usize;
        self.nof_pols = config.require_u16(self.name(), "nof_pols")? as usize;
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;

        let row_len = self.nof_beams
            * self.nof_pols
            * self.nof_samples
            * self.nof_channels
            * SAMPLE_BYTES;
        self.buffers = Some(TileBuffers::new(self.nof_tiles, row_len));
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: self.nof_samples * 16,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        mode_filter(|mode| mode == CaptureMode::BeamIntegrated)
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());
        let payload = view.payload();

        let counter = items.counter.counter;
        if self.saved_packet_counter == 0 {
            self.saved_packet_counter = counter;
        }

        // Persist once the integration window is fully populated, or when
        // the counter has run a whole window past the saved reference
        let window_packets =
            (self.nof_pols * self.nof_tiles * self.nof_samples * self.nof_beams) as u32;
        if self.received_packets == window_packets
            || counter.wrapping_sub(self.saved_packet_counter) == self.nof_samples as u32
        {
            self.persist();
            self.saved_packet_counter = counter;
            self.received_packets = 0;
        }

        let included_channels = usize::from(items.beam_channel.nof_included_channels).max(1);
        let start_channel = usize::from(items.beam_channel.start_channel_id);
        let beam = usize::from(items.beam_channel.beam_id);
        let sample = counter.wrapping_sub(self.saved_packet_counter) as usize;

        let buffers = self.buffers.as_mut().expect("consumer not initialised");
        let Some(row) = buffers.row_index(items.tile.tile_id) else {
            return ProcessResult::Skipped;
        };
        let (nof_samples, nof_channels, nof_pols) =
            (self.nof_samples, self.nof_channels, self.nof_pols);
        let row_data = buffers.row_mut(row);

        // One spectrum per packet, channels interleaved by polarisation
        let beam_base = beam * nof_pols * nof_samples * nof_channels;
        for channel in 0..included_channels {
            for pol in 0..nof_pols {
                let src = (channel * nof_pols + pol) * SAMPLE_BYTES;
                let dst = (beam_base
                    + pol * nof_samples * nof_channels
                    + sample * nof_channels
                    + start_channel
                    + channel)
                    * SAMPLE_BYTES;
                if src + SAMPLE_BYTES > payload.len() || dst + SAMPLE_BYTES > row_data.len() {
                    continue;
                }
                row_data[dst..dst + SAMPLE_BYTES]
                    .copy_from_slice(&payload[src..src + SAMPLE_BYTES]);
            }
        }

        buffers.update_timestamp(items.packet_time(TIMESTAMP_SCALE));
        buffers.nof_packets += 1;
        self.received_packets += 1;
        ProcessResult::Stored
    }

    fn on_stream_end(&mut self) {
        if self
            .buffers
            .as_ref()
            .is_some_and(|buffers| buffers.nof_packets > 0)
        {
            self.persist();
            self.received_packets = 0;
        }
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::BeamPacket;
    use std::sync::Mutex;

    type Captured = Arc<Mutex<Vec<(Vec<u8>, f64, u32)>>>;

    fn capture_callback(consumer: &mut dyn Consumer) -> Captured {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        consumer.set_callback(Box::new(move |data, timestamp, tile, _| {
            sink.lock().unwrap().push((data.to_vec(), timestamp, tile));
        }));
        captured
    }

    #[test]
    fn test_burst_beam_pol_planes() {
        let mut consumer = BurstBeamConsumer::new();
        consumer
            .init(
                &ConsumerConfig::from_json(
                    r#"{"nof_tiles": 1, "nof_channels": 2, "nof_samples": 2,
                        "nof_pols": 2, "max_packet_size": 9000}"#,
                )
                .unwrap(),
            )
            .unwrap();
        let captured = capture_callback(&mut consumer);

        // one packet with both samples and channels, payload in
        // [sample][channel][pol] order; pol 0 values are odd, pol 1 even
        let mut payload = Vec::new();
        for sample in 0..2u8 {
            for channel in 0..2u8 {
                for pol in 0..2u8 {
                    let value = 0x10 + sample * 4 + channel * 2 + pol;
                    payload.extend_from_slice(&[value; SAMPLE_BYTES]);
                }
            }
        }
        let packet = BeamPacket {
            integrated: false,
            counter: 0,
            tile_id: 0,
            beam_id: 0,
            start_channel_id: 0,
            nof_included_channels: 2,
            sync_time: 77,
            timestamp: 0,
        }
        .build(&payload);

        assert_eq!(consumer.process(&packet), ProcessResult::Stored);
        consumer.on_stream_end();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (data, timestamp, _) = &captured[0];
        assert_eq!(*timestamp, 77.0);

        // pol 0 plane: [sample][channel] of the pol-0 values
        let pol0: Vec<u8> = data[..2 * 2 * SAMPLE_BYTES]
            .iter()
            .step_by(SAMPLE_BYTES)
            .copied()
            .collect();
        assert_eq!(pol0, vec![0x10, 0x12, 0x14, 0x16]);
        let pol1: Vec<u8> = data[2 * 2 * SAMPLE_BYTES..]
            .iter()
            .step_by(SAMPLE_BYTES)
            .copied()
            .collect();
        assert_eq!(pol1, vec![0x11, 0x13, 0x15, 0x17]);
    }

    #[test]
    fn test_integrated_beam_window_persist() {
        let mut consumer = IntegratedBeamConsumer::new();
        consumer
            .init(
                &ConsumerConfig::from_json(
                    r#"{"nof_tiles": 1, "nof_beams": 1, "nof_channels": 2,
                        "nof_samples": 2, "nof_pols": 2, "max_packet_size": 9000}"#,
                )
                .unwrap(),
            )
            .unwrap();
        let captured = capture_callback(&mut consumer);

        let packet = |counter: u32| {
            BeamPacket {
                integrated: true,
                counter,
                tile_id: 0,
                beam_id: 0,
                start_channel_id: 0,
                nof_included_channels: 2,
                sync_time: 5,
                timestamp: 0,
            }
            // two channels, two pols
            .build(&[9; 2 * 2 * SAMPLE_BYTES])
        };

        // window spans counters 10..12; the counter reaching saved + 2
        // flushes the window
        consumer.process(&packet(10));
        consumer.process(&packet(11));
        assert_eq!(captured.lock().unwrap().len(), 0);
        consumer.process(&packet(12));
        assert_eq!(captured.lock().unwrap().len(), 1);
    }
}

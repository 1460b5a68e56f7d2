//! Raw antenna data reassembly
//!
//! Raw streams carry unchannelised ADC samples, either one antenna per
//! packet (burst) or a synchronised group of antennas. Samples land in a
//! `[antenna][sample][pol]` array per tile; a buffer is persisted when the
//! stream pauses.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, DataCallback, PacketFilter, ProcessResult};
use crate::container::TileBuffers;
use crate::error::DaqResult;
use crate::reassembly::TileItems;
use crate::ring::RingConfig;
use crate::spead::{CaptureMode, SpeadView, TIMESTAMP_SCALE};

/// Per-tile capture state beyond the sample array
#[derive(Clone, Copy, Debug)]
struct RowMeta {
    timestamp: f64,
    first_sample_index: u32,
}

impl Default for RowMeta {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            first_sample_index: u32::MAX,
        }
    }
}

/// Consumer for burst and synchronised raw antenna streams
#[derive(Default)]
pub struct RawConsumer {
    buffers: Option<TileBuffers>,
    meta: Vec<RowMeta>,
    callback: Option<DataCallback>,

    nof_antennas: usize,
    samples_per_buffer: usize,
    nof_tiles: usize,
    nof_pols: usize,
    max_packet_size: usize,
}

impl RawConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn persist(&mut self) {
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };

        if let Some(callback) = self.callback.as_mut() {
            for (row, (tile, data)) in buffers.rows().enumerate() {
                let meta = self.meta[row];
                if meta.first_sample_index != u32::MAX {
                    callback(data, meta.timestamp, u32::from(tile), 0);
                }
            }
        } else {
            log::warn!("no callback for raw antenna data defined");
        }

        buffers.clear();
        self.meta.fill(RowMeta::default());
    }
}

impl Consumer for RawConsumer {
    fn name(&self) -> &'static str {
        "rawdata"
    }

    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()> {
        self.nof_antennas = config.require_u16(self.name(), "nof_antennas")? as usize;
        self.samples_per_buffer = config.require_u32(self.name(), "samples_per_buffer")? as usize;
        self.nof_tiles = config.require_u16(self.name(), "nof_tiles")? as usize;
        self.nof_pols = config.require_u16(self.name(), "nof_pols")? as usize;
        self.max_packet_size = config.require_u32(self.name(), "max_packet_size")? as usize;

        let row_len = self.nof_antennas * self.samples_per_buffer * self.nof_pols;
        self.buffers = Some(TileBuffers::new(self.nof_tiles, row_len));
        self.meta = vec![RowMeta::default(); self.nof_tiles];
        Ok(())
    }

    fn ring_config(&self) -> RingConfig {
        RingConfig {
            cell_size: self.max_packet_size,
            nof_cells: 4096 * self.nof_tiles,
        }
    }

    fn packet_filter(&self) -> PacketFilter {
        Arc::new(|packet: &[u8]| {
            SpeadView::open(packet)
                .and_then(|view| view.capture_mode())
                .is_some_and(|mode| {
                    matches!(mode, CaptureMode::RawBurst | CaptureMode::RawSync)
                })
        })
    }

    fn process(&mut self, packet: &[u8]) -> ProcessResult {
        let Some(view) = SpeadView::open(packet) else {
            return ProcessResult::Skipped;
        };
        let items = TileItems::parse(&view, self.name());
        let payload = view.payload();

        let nof_included = usize::from(items.antenna.nof_included_antennas).max(1);
        let samples_in_packet = (items.payload_length.saturating_sub(items.payload_offset)
            as usize)
            / (nof_included * self.nof_pols);
        if samples_in_packet == 0 {
            return ProcessResult::Skipped;
        }

        let packet_time = items.packet_time(TIMESTAMP_SCALE);
        let start_sample =
            (items.counter.counter as usize * samples_in_packet) % self.samples_per_buffer;
        let start_antenna = usize::from(items.antenna.start_antenna_id);

        let buffers = self.buffers.as_mut().expect("consumer not initialised");
        let Some(row) = buffers.row_index(items.tile.tile_id) else {
            return ProcessResult::Skipped;
        };

        let pols = self.nof_pols;
        let row_data = buffers.row_mut(row);
        if nof_included == 1 {
            // Burst stream: one antenna, contiguous run of samples
            let dst = (start_antenna * self.samples_per_buffer + start_sample) * pols;
            let len = (samples_in_packet * pols).min(payload.len());
            if dst + len <= row_data.len() {
                row_data[dst..dst + len].copy_from_slice(&payload[..len]);
            }
        } else {
            // Synchronised stream: antennas interleave within each sample
            for antenna in 0..nof_included {
                let dst_base =
                    ((start_antenna + antenna) * self.samples_per_buffer + start_sample) * pols;
                for sample in 0..samples_in_packet {
                    let src = (sample * nof_included + antenna) * pols;
                    let dst = dst_base + sample * pols;
                    if dst + pols > row_data.len() || src + pols > payload.len() {
                        break;
                    }
                    row_data[dst..dst + pols].copy_from_slice(&payload[src..src + pols]);
                }
            }
        }

        buffers.nof_packets += 1;
        if self.meta[row].first_sample_index > start_sample as u32 {
            self.meta[row] = RowMeta {
                timestamp: packet_time,
                first_sample_index: start_sample as u32,
            };
        }

        ProcessResult::Stored
    }

    fn on_stream_end(&mut self) {
        self.persist();
    }

    fn pull_timeout(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RawPacket;
    use std::sync::Mutex;

    fn configured(antennas: u16, samples: u32, tiles: u16) -> RawConsumer {
        let mut consumer = RawConsumer::new();
        let json = format!(
            r#"{{"nof_antennas": {antennas}, "samples_per_buffer": {samples},
                 "nof_tiles": {tiles}, "nof_pols": 2, "max_packet_size": 9000}}"#
        );
        consumer
            .init(&ConsumerConfig::from_json(&json).unwrap())
            .unwrap();
        consumer
    }

    type Captured = Arc<Mutex<Vec<(Vec<u8>, f64, u32)>>>;

    fn capture_callback(consumer: &mut RawConsumer) -> Captured {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        consumer.set_callback(Box::new(move |data, timestamp, tile, _| {
            sink.lock()
                .unwrap()
                .push((data.to_vec(), timestamp, tile));
        }));
        captured
    }

    #[test]
    fn test_burst_ingest_single_callback() {
        // Full-scale burst capture: 32 antennas, 65536 samples per buffer,
        // one tile, two polarisations
        let mut consumer = configured(32, 65536, 1);
        let captured = capture_callback(&mut consumer);

        let sync_time = 1_600_000_000;
        let samples_per_packet = 256usize;
        let nof_packets = 65536 / samples_per_packet;

        for counter in 0..nof_packets {
            let payload = vec![(counter & 0xFF) as u8; samples_per_packet * 32 * 2];
            let packet = RawPacket {
                sync: true,
                counter: counter as u32,
                tile_id: 0,
                start_antenna_id: 0,
                nof_included_antennas: 32,
                sync_time,
                timestamp: 0,
            }
            .build(&payload);
            assert_eq!(consumer.process(&packet), ProcessResult::Stored);
        }

        consumer.on_stream_end();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (data, timestamp, tile) = &captured[0];
        assert_eq!(data.len(), 32 * 65536 * 2);
        assert_eq!(*timestamp, sync_time as f64);
        assert_eq!(*tile, 0);
        // every cell was written
        assert_eq!(data.iter().filter(|&&b| b == 0).count(), 32 * 256 * 2);
    }

    #[test]
    fn test_burst_single_antenna_layout() {
        let mut consumer = configured(4, 16, 1);
        let captured = capture_callback(&mut consumer);

        // antenna 2, first 4 samples
        let payload = [0xAB; 4 * 2];
        let packet = RawPacket {
            sync: false,
            counter: 0,
            tile_id: 3,
            start_antenna_id: 2,
            nof_included_antennas: 1,
            sync_time: 100,
            timestamp: 0,
        }
        .build(&payload);
        consumer.process(&packet);
        consumer.on_stream_end();

        let captured = captured.lock().unwrap();
        let (data, _, tile) = &captured[0];
        assert_eq!(*tile, 3);
        // antenna 2 occupies samples [2*16*2 .. ) in the row
        let antenna2 = &data[2 * 16 * 2..2 * 16 * 2 + 8];
        assert!(antenna2.iter().all(|&b| b == 0xAB));
        assert!(data[..2 * 16 * 2].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sync_group_interleave() {
        let mut consumer = configured(2, 4, 1);
        let captured = capture_callback(&mut consumer);

        // two antennas, two samples, payload in [sample][antenna][pol] order
        let payload = [
            10, 11, 20, 21, // sample 0: ant0 pols, ant1 pols
            12, 13, 22, 23, // sample 1
        ];
        let packet = RawPacket {
            sync: true,
            counter: 0,
            tile_id: 0,
            start_antenna_id: 0,
            nof_included_antennas: 2,
            sync_time: 0,
            timestamp: 0,
        }
        .build(&payload);
        consumer.process(&packet);
        consumer.on_stream_end();

        let captured = captured.lock().unwrap();
        let (data, _, _) = &captured[0];
        // destination is [antenna][sample][pol]
        assert_eq!(&data[0..4], &[10, 11, 12, 13]); // antenna 0
        assert_eq!(&data[8..12], &[20, 21, 22, 23]); // antenna 1
    }

    #[test]
    fn test_filter_accepts_only_raw_modes() {
        let consumer = configured(2, 4, 1);
        let filter = consumer.packet_filter();

        let raw = RawPacket {
            sync: false,
            counter: 0,
            tile_id: 0,
            start_antenna_id: 0,
            nof_included_antennas: 1,
            sync_time: 0,
            timestamp: 0,
        }
        .build(&[0, 0]);
        assert!(filter(&raw));

        let channel = crate::testing::ChannelPacket {
            mode: 0x4,
            counter: 0,
            tile_id: 0,
            pol_id: 0,
            start_channel_id: 0,
            nof_included_channels: 1,
            start_antenna_id: 0,
            nof_included_antennas: 1,
            sync_time: 0,
            timestamp: 0,
        }
        .build(&[0, 0]);
        assert!(!filter(&channel));
        assert!(!filter(&[0x00, 0x01, 0x02]));
    }
}

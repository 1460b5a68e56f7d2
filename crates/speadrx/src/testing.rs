//! Synthetic SPEAD packet construction
//!
//! Builders for well-formed station packets, used by the test suites and by
//! the capture tool's simulation mode. The emitted bytes follow the exact
//! wire layout the codec expects, so a parse/re-emit cycle is bit-exact.

use byteorder::{BigEndian, ByteOrder};

use crate::spead::{
    item_id, SPEAD_HEAP_ADDR_WIDTH, SPEAD_ITEM_PTR_WIDTH, SPEAD_MAGIC, SPEAD_VERSION,
};

/// Incremental SPEAD packet builder
#[derive(Clone, Debug, Default)]
pub struct PacketBuilder {
    items: Vec<(u16, u64)>,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item word
    pub fn item(mut self, id: u16, value: u64) -> Self {
        self.items.push((id, value & 0xFFFF_FFFF_FFFF));
        self
    }

    /// Set the packet payload
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Emit the packet bytes
    pub fn build(self) -> Vec<u8> {
        let mut bytes = vec![0u8; 8 + self.items.len() * 8 + self.payload.len()];

        let header = (u64::from(SPEAD_MAGIC) << 56)
            | (u64::from(SPEAD_VERSION) << 48)
            | (u64::from(SPEAD_ITEM_PTR_WIDTH) << 40)
            | (u64::from(SPEAD_HEAP_ADDR_WIDTH) << 32)
            | self.items.len() as u64;
        BigEndian::write_u64(&mut bytes[..8], header);

        for (i, (id, value)) in self.items.iter().enumerate() {
            // immediate addressing mode, 15-bit id, 48-bit value
            let word = (1u64 << 63) | (u64::from(*id & 0x7FFF) << 48) | value;
            BigEndian::write_u64(&mut bytes[8 + i * 8..16 + i * 8], word);
        }

        bytes[8 + self.items.len() * 8..].copy_from_slice(&self.payload);
        bytes
    }
}

/// Pack a tile heap counter (24-bit counter, 16-bit index)
pub fn tile_counter(counter: u32, index: u32) -> u64 {
    (u64::from(index & 0xFFFF) << 24) | u64::from(counter & 0xFF_FFFF)
}

/// Pack a station heap counter (32-bit counter, 16-bit logical channel)
pub fn station_counter(counter: u64, logical_channel: u16) -> u64 {
    (u64::from(logical_channel) << 32) | (counter & 0xFFFF_FFFF)
}

/// Pack tile information (item 0x2001)
pub fn tile_info(station_id: u16, tile_id: u16, pol_id: u8) -> u64 {
    (u64::from(tile_id & 0xFF) << 32) | (u64::from(station_id) << 16) | u64::from(pol_id)
}

/// Pack channel/antenna extents (item 0x2002)
pub fn channel_info(
    start_channel_id: u16,
    nof_included_channels: u16,
    start_antenna_id: u16,
    nof_included_antennas: u16,
) -> u64 {
    (u64::from(start_channel_id) << 24)
        | (u64::from(nof_included_channels & 0xFF) << 16)
        | (u64::from(start_antenna_id & 0xFF) << 8)
        | u64::from(nof_included_antennas & 0xFF)
}

/// Pack raw antenna extents (item 0x2000)
pub fn antenna_info(start_antenna_id: u16, nof_included_antennas: u16) -> u64 {
    (u64::from(start_antenna_id & 0xFF) << 8) | u64::from(nof_included_antennas & 0xFF)
}

/// Pack antenna identifiers (item 0x2006)
pub fn antenna_ids(ids: [u8; 4], nof_included_antennas: u8) -> u64 {
    (u64::from(nof_included_antennas) << 32)
        | (u64::from(ids[3]) << 24)
        | (u64::from(ids[2]) << 16)
        | (u64::from(ids[1]) << 8)
        | u64::from(ids[0])
}

/// Pack beam identifiers (item 0x3000)
pub fn beam_info(beam_id: u16, frequency_id: u16) -> u64 {
    (u64::from(beam_id) << 16) | u64::from(frequency_id)
}

/// Pack beam/channel extents (item 0x2005)
pub fn beam_channel_info(beam_id: u16, start_channel_id: u16, nof_included_channels: u16) -> u64 {
    (u64::from(beam_id & 0xFF) << 32)
        | (u64::from(start_channel_id) << 16)
        | u64::from(nof_included_channels)
}

/// Parameters for a synthetic channelised-data packet
#[derive(Clone, Copy, Debug)]
pub struct ChannelPacket {
    pub mode: u64,
    pub counter: u32,
    pub tile_id: u16,
    pub pol_id: u8,
    pub start_channel_id: u16,
    pub nof_included_channels: u16,
    pub start_antenna_id: u16,
    pub nof_included_antennas: u16,
    pub sync_time: u64,
    pub timestamp: u64,
}

impl ChannelPacket {
    /// Build the packet around a 16-bit-sample payload
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        PacketBuilder::new()
            .item(item_id::HEAP_COUNTER, tile_counter(self.counter, 0))
            .item(item_id::PAYLOAD_LENGTH, payload.len() as u64)
            .item(item_id::SYNC_TIME, self.sync_time)
            .item(item_id::TIMESTAMP, self.timestamp)
            .item(
                item_id::CHANNEL_INFO,
                channel_info(
                    self.start_channel_id,
                    self.nof_included_channels,
                    self.start_antenna_id,
                    self.nof_included_antennas,
                ),
            )
            .item(item_id::TILE_INFO, tile_info(0, self.tile_id, self.pol_id))
            .item(item_id::CAPTURE_MODE, self.mode)
            .item(item_id::PAYLOAD_OFFSET, 0)
            .payload(payload)
            .build()
    }
}

/// Parameters for a synthetic raw-data packet
#[derive(Clone, Copy, Debug)]
pub struct RawPacket {
    pub sync: bool,
    pub counter: u32,
    pub tile_id: u16,
    pub start_antenna_id: u16,
    pub nof_included_antennas: u16,
    pub sync_time: u64,
    pub timestamp: u64,
}

impl RawPacket {
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        PacketBuilder::new()
            .item(item_id::HEAP_COUNTER, tile_counter(self.counter, 0))
            .item(item_id::PAYLOAD_LENGTH, payload.len() as u64)
            .item(item_id::SYNC_TIME, self.sync_time)
            .item(item_id::TIMESTAMP, self.timestamp)
            .item(
                item_id::ANTENNA_INFO,
                antenna_info(self.start_antenna_id, self.nof_included_antennas),
            )
            .item(item_id::TILE_INFO, tile_info(0, self.tile_id, 0))
            .item(item_id::CAPTURE_MODE, if self.sync { 0x1 } else { 0x0 })
            .item(item_id::PAYLOAD_OFFSET, 0)
            .payload(payload)
            .build()
    }
}

/// Parameters for a synthetic station-beam packet
#[derive(Clone, Copy, Debug)]
pub struct StationPacket {
    pub counter: u64,
    pub logical_channel: u16,
    pub sync_time: u64,
    pub timestamp: u64,
    pub frequency_hz: u64,
    /// Include the scan-id item, switching the stream to the 1e-8 scale
    pub scan_id: Option<u64>,
}

impl StationPacket {
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut builder = PacketBuilder::new()
            .item(
                item_id::HEAP_COUNTER,
                station_counter(self.counter, self.logical_channel),
            )
            .item(item_id::PAYLOAD_LENGTH, payload.len() as u64)
            .item(item_id::SYNC_TIME, self.sync_time)
            .item(item_id::TIMESTAMP, self.timestamp)
            .item(item_id::FREQUENCY, self.frequency_hz)
            .item(item_id::BEAM_INFO, beam_info(0, self.logical_channel))
            .item(item_id::STATION_INFO, 0)
            .item(item_id::PAYLOAD_OFFSET, 0);
        if let Some(scan_id) = self.scan_id {
            builder = builder.item(item_id::SCAN_ID, scan_id);
        }
        builder.payload(payload).build()
    }
}

/// Parameters for a synthetic antenna-buffer packet
#[derive(Clone, Copy, Debug)]
pub struct AntennaBufferPacket {
    pub counter: u32,
    pub tile_id: u16,
    pub fpga_id: u8,
    pub sync_time: u64,
    pub timestamp: u64,
}

impl AntennaBufferPacket {
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        PacketBuilder::new()
            .item(item_id::HEAP_COUNTER, tile_counter(self.counter, 0))
            .item(item_id::PAYLOAD_LENGTH, payload.len() as u64)
            .item(item_id::SYNC_TIME, self.sync_time)
            .item(item_id::TIMESTAMP, self.timestamp)
            .item(item_id::ANTENNA_IDS, antenna_ids([0, 1, 2, 3], 4))
            .item(item_id::TILE_INFO, tile_info(0, self.tile_id, self.fpga_id))
            .item(item_id::CAPTURE_MODE, 0xC)
            .item(item_id::PAYLOAD_OFFSET, 0)
            .payload(payload)
            .build()
    }
}

/// Parameters for a synthetic beam packet (burst or integrated)
#[derive(Clone, Copy, Debug)]
pub struct BeamPacket {
    pub integrated: bool,
    pub counter: u32,
    pub tile_id: u16,
    pub beam_id: u16,
    pub start_channel_id: u16,
    pub nof_included_channels: u16,
    pub sync_time: u64,
    pub timestamp: u64,
}

impl BeamPacket {
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        PacketBuilder::new()
            .item(item_id::HEAP_COUNTER, tile_counter(self.counter, 0))
            .item(item_id::PAYLOAD_LENGTH, payload.len() as u64)
            .item(item_id::SYNC_TIME, self.sync_time)
            .item(item_id::TIMESTAMP, self.timestamp)
            .item(
                item_id::BEAM_CHANNEL_INFO,
                beam_channel_info(
                    self.beam_id,
                    self.start_channel_id,
                    self.nof_included_channels,
                ),
            )
            .item(item_id::TILE_INFO, tile_info(0, self.tile_id, 0))
            .item(item_id::CAPTURE_MODE, if self.integrated { 0x9 } else { 0x8 })
            .item(item_id::PAYLOAD_OFFSET, 0)
            .payload(payload)
            .build()
    }
}

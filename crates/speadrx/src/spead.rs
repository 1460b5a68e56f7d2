//! SPEAD packet decoding
//!
//! Tile Processing Modules emit SPEAD version 4 packets over UDP. Every
//! packet starts with an 8-byte header word, followed by `nof_items` 8-byte
//! item words and the sample payload. All wire words are big-endian.
//!
//! Decoding is zero-copy: [`SpeadView`] borrows the packet bytes and only
//! reads the words it is asked for. Malformed packets are reported as
//! `None` and never abort the stream; the callers account for them.
//!
//! ```text
//! | magic | version | item width | addr width | reserved  | nof items |
//! |  8 b  |   8 b   |    8 b     |    8 b     |   16 b    |   16 b    |
//! ```
//!
//! Each item word packs a one-bit addressing mode, a 15-bit item id and a
//! 48-bit immediate value.

use byteorder::{BigEndian, ByteOrder};

/// Magic number carried in the first header byte
pub const SPEAD_MAGIC: u8 = 0x53;

/// Protocol version emitted by the station firmware
pub const SPEAD_VERSION: u8 = 4;

/// Item pointer width in bytes
pub const SPEAD_ITEM_PTR_WIDTH: u8 = 8;

/// Heap address width in bytes for the station profile
pub const SPEAD_HEAP_ADDR_WIDTH: u8 = 6;

/// Length of the SPEAD header in bytes
pub const SPEAD_HEADER_LEN: usize = 8;

/// Length of one item word in bytes
pub const SPEAD_ITEM_LEN: usize = 8;

/// Sampling period of the standard TPM streams, in seconds
pub const SAMPLING_PERIOD: f64 = 1.08e-6;

/// Timestamp scale of the standard TPM streams (raw / channelised / beam)
pub const TIMESTAMP_SCALE: f64 = 1.08e-6;

/// Timestamp scale for legacy station-beam streams
pub const STATION_SCALE_LEGACY: f64 = 1.0e-9;

/// Timestamp scale for station-beam streams carrying a scan id
pub const STATION_SCALE_SCAN: f64 = 1.0e-8;

/// ADC sampling rate, used by the antenna-buffer global sample index
pub const ADC_SAMPLE_RATE: f64 = 800.0e6;

/// Well-known item identifiers
pub mod item_id {
    pub const HEAP_COUNTER: u16 = 0x0001;
    pub const PAYLOAD_LENGTH: u16 = 0x0004;
    pub const SYNC_TIME: u16 = 0x1027;
    pub const FREQUENCY: u16 = 0x1011;
    pub const TIMESTAMP: u16 = 0x1600;
    pub const ANTENNA_INFO: u16 = 0x2000;
    pub const TILE_INFO: u16 = 0x2001;
    pub const CHANNEL_INFO: u16 = 0x2002;
    pub const CAPTURE_MODE: u16 = 0x2004;
    pub const BEAM_CHANNEL_INFO: u16 = 0x2005;
    pub const ANTENNA_IDS: u16 = 0x2006;
    pub const BEAM_INFO: u16 = 0x3000;
    pub const STATION_INFO: u16 = 0x3001;
    pub const SCAN_ID: u16 = 0x3010;
    pub const PAYLOAD_OFFSET: u16 = 0x3300;
}

/// One decoded item word
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpeadItem {
    /// 15-bit item identifier
    pub id: u16,
    /// 48-bit immediate value
    pub value: u64,
}

impl SpeadItem {
    fn from_word(word: u64) -> Self {
        Self {
            id: ((word >> 48) & 0x7FFF) as u16,
            value: word & 0xFFFF_FFFF_FFFF,
        }
    }
}

/// Stream family a packet belongs to, as resolved by the capture-mode item
///
/// The filter stage maps every accepted packet to exactly one of these;
/// each reassembler family declares which modes it consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    RawBurst,
    RawSync,
    ChannelBurst,
    ChannelContinuous,
    ChannelIntegrated,
    BeamBurst,
    BeamIntegrated,
    /// Station beam packets carry no mode item; detected by the presence
    /// of the frequency (0x1011) or scan-id (0x3010) items
    StationBeam,
    AntennaBuffer,
}

impl CaptureMode {
    /// Map an on-wire mode value to a stream family
    pub fn from_wire(mode: u64) -> Option<Self> {
        match mode {
            0x0 => Some(Self::RawBurst),
            0x1 => Some(Self::RawSync),
            0x4 => Some(Self::ChannelBurst),
            0x5 | 0x7 => Some(Self::ChannelContinuous),
            0x6 => Some(Self::ChannelIntegrated),
            0x8 => Some(Self::BeamBurst),
            0x9 | 0x11 => Some(Self::BeamIntegrated),
            0xC => Some(Self::AntennaBuffer),
            _ => None,
        }
    }
}

/// Zero-copy view over a validated SPEAD packet
#[derive(Clone, Copy, Debug)]
pub struct SpeadView<'a> {
    bytes: &'a [u8],
    nof_items: usize,
}

impl<'a> SpeadView<'a> {
    /// Validate a packet against the station profile
    ///
    /// Returns `None` unless the magic, version and width fields match the
    /// expected constants and the buffer is long enough to hold all item
    /// words. No payload bytes are touched.
    pub fn open(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < SPEAD_HEADER_LEN {
            return None;
        }

        let header = BigEndian::read_u64(&bytes[..8]);
        let magic = (header >> 56) as u8;
        let version = ((header >> 48) & 0xFF) as u8;
        let item_width = ((header >> 40) & 0xFF) as u8;
        let addr_width = ((header >> 32) & 0xFF) as u8;
        let nof_items = (header & 0xFFFF) as usize;

        if magic != SPEAD_MAGIC
            || version != SPEAD_VERSION
            || item_width != SPEAD_ITEM_PTR_WIDTH
            || addr_width != SPEAD_HEAP_ADDR_WIDTH
        {
            return None;
        }

        if bytes.len() < SPEAD_HEADER_LEN + nof_items * SPEAD_ITEM_LEN {
            return None;
        }

        Some(Self { bytes, nof_items })
    }

    /// Number of item words in the packet
    pub fn nof_items(&self) -> usize {
        self.nof_items
    }

    /// Iterate over all item words in wire order
    pub fn items(&self) -> impl Iterator<Item = SpeadItem> + 'a {
        let bytes: &'a [u8] = self.bytes;
        let words = &bytes[SPEAD_HEADER_LEN..SPEAD_HEADER_LEN + self.nof_items * SPEAD_ITEM_LEN];
        words
            .chunks_exact(SPEAD_ITEM_LEN)
            .map(|c| SpeadItem::from_word(BigEndian::read_u64(c)))
    }

    /// Value of the first item with the given id
    pub fn item(&self, id: u16) -> Option<u64> {
        self.items().find(|item| item.id == id).map(|item| item.value)
    }

    /// Raw item word by wire position (0-based), ignoring its id
    ///
    /// Used only by the legacy capture-mode convention, which stored the
    /// mode in the fifth item word of every packet.
    fn item_at(&self, index: usize) -> Option<u64> {
        if index >= self.nof_items {
            return None;
        }
        let offset = SPEAD_HEADER_LEN + index * SPEAD_ITEM_LEN;
        Some(BigEndian::read_u64(&self.bytes[offset..offset + 8]) & 0xFFFF_FFFF_FFFF)
    }

    /// Packet payload, past the item words and the heap payload offset
    ///
    /// The payload offset (item 0x3300) positions this packet's samples
    /// within its heap; packets without the item start at offset zero.
    pub fn payload(&self) -> &'a [u8] {
        let bytes: &'a [u8] = self.bytes;
        let offset = self.item(item_id::PAYLOAD_OFFSET).unwrap_or(0) as usize;
        let start = SPEAD_HEADER_LEN + self.nof_items * SPEAD_ITEM_LEN + offset;
        let start = start.min(bytes.len());
        &bytes[start..]
    }

    /// Resolve the packet's stream family
    ///
    /// Scans all items for the capture-mode item (0x2004). Packets without
    /// one are station-beam packets when they carry a frequency or scan-id
    /// item; otherwise the legacy fifth-item-word convention applies.
    pub fn capture_mode(&self) -> Option<CaptureMode> {
        for item in self.items() {
            if item.id == item_id::CAPTURE_MODE {
                return CaptureMode::from_wire(item.value);
            }
        }

        if self.item(item_id::FREQUENCY).is_some() || self.item(item_id::SCAN_ID).is_some() {
            return Some(CaptureMode::StationBeam);
        }

        // Legacy firmware: mode lives in the fifth item word
        CaptureMode::from_wire(self.item_at(4)?)
    }
}

// ---------------------------------------------------------------------------
// Bit-field helpers for the station item layouts
// ---------------------------------------------------------------------------

/// Heap counter split used by the tile streams (raw, channel, beam)
///
/// 24-bit packet counter in the low bits, 16-bit packet index above it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileCounter {
    pub counter: u32,
    pub index: u32,
}

impl From<u64> for TileCounter {
    fn from(value: u64) -> Self {
        Self {
            counter: (value & 0xFF_FFFF) as u32,
            index: ((value >> 24) & 0xFFFF) as u32,
        }
    }
}

/// Heap counter split used by station-beam streams
///
/// 32-bit packet counter in the low bits, 16-bit logical channel above it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StationCounter {
    pub counter: u64,
    pub logical_channel: u16,
}

impl From<u64> for StationCounter {
    fn from(value: u64) -> Self {
        Self {
            counter: value & 0xFFFF_FFFF,
            logical_channel: ((value >> 32) & 0xFFFF) as u16,
        }
    }
}

/// Tile information (item 0x2001)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileInfo {
    pub station_id: u16,
    pub tile_id: u16,
    /// Polarisation for tile streams, FPGA id for antenna-buffer streams
    pub pol_id: u8,
}

impl From<u64> for TileInfo {
    fn from(value: u64) -> Self {
        Self {
            station_id: ((value >> 16) & 0xFFFF) as u16,
            tile_id: ((value >> 32) & 0xFF) as u16,
            pol_id: (value & 0xFF) as u8,
        }
    }
}

/// Channel and antenna extents (item 0x2002)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub start_channel_id: u16,
    pub nof_included_channels: u16,
    pub start_antenna_id: u16,
    pub nof_included_antennas: u16,
}

impl From<u64> for ChannelInfo {
    fn from(value: u64) -> Self {
        Self {
            start_channel_id: ((value >> 24) & 0xFFFF) as u16,
            nof_included_channels: ((value >> 16) & 0xFF) as u16,
            start_antenna_id: ((value >> 8) & 0xFF) as u16,
            nof_included_antennas: (value & 0xFF) as u16,
        }
    }
}

/// Antenna extents for raw streams (item 0x2000)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AntennaInfo {
    pub start_antenna_id: u16,
    pub nof_included_antennas: u16,
}

impl From<u64> for AntennaInfo {
    fn from(value: u64) -> Self {
        Self {
            start_antenna_id: ((value >> 8) & 0xFF) as u16,
            nof_included_antennas: (value & 0xFF) as u16,
        }
    }
}

/// Antenna identifiers carried by antenna-buffer packets (item 0x2006)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AntennaIds {
    pub antenna_ids: [u8; 4],
    pub nof_included_antennas: u8,
}

impl From<u64> for AntennaIds {
    fn from(value: u64) -> Self {
        Self {
            antenna_ids: [
                (value & 0xFF) as u8,
                ((value >> 8) & 0xFF) as u8,
                ((value >> 16) & 0xFF) as u8,
                ((value >> 24) & 0xFF) as u8,
            ],
            nof_included_antennas: ((value >> 32) & 0xFF) as u8,
        }
    }
}

/// Beam and channel extents for beamformed streams (item 0x2005)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BeamChannelInfo {
    pub beam_id: u16,
    pub start_channel_id: u16,
    pub nof_included_channels: u16,
}

impl From<u64> for BeamChannelInfo {
    fn from(value: u64) -> Self {
        Self {
            beam_id: ((value >> 32) & 0xFF) as u16,
            start_channel_id: ((value >> 16) & 0xFFFF) as u16,
            nof_included_channels: (value & 0xFFFF) as u16,
        }
    }
}

/// Beam identifiers (item 0x3000)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BeamInfo {
    pub beam_id: u16,
    pub frequency_id: u16,
}

impl From<u64> for BeamInfo {
    fn from(value: u64) -> Self {
        Self {
            beam_id: ((value >> 16) & 0xFFFF) as u16,
            frequency_id: (value & 0xFFFF) as u16,
        }
    }
}

/// Station beam provenance (item 0x3001)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StationInfo {
    pub substation_id: u8,
    pub subarray_id: u8,
    pub station_id: u16,
    pub nof_contributing_antennas: u16,
}

impl From<u64> for StationInfo {
    fn from(value: u64) -> Self {
        Self {
            substation_id: ((value >> 40) & 0xFF) as u8,
            subarray_id: ((value >> 32) & 0xFF) as u8,
            station_id: ((value >> 16) & 0xFFFF) as u16,
            nof_contributing_antennas: (value & 0xFFFF) as u16,
        }
    }
}

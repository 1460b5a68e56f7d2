//! Per-stream reassembly engines
//!
//! One consumer per stream family turns the interleaved packet streams of
//! all tiles back into time-major arrays. The families share the container
//! rotation discipline (four containers per consumer, advanced on buffer
//! boundaries), counter rollover bookkeeping and late-packet routing; what
//! differs is the scatter layout and the boundary trigger, described per
//! family in its module.

pub mod antenna;
pub mod beam;
pub mod channel;
pub mod correlator;
pub mod raw;
pub mod station;

#[cfg(not(test))]
use log::debug;
#[cfg(test)]
use std::println as debug;

use crate::spead::{
    item_id, AntennaIds, AntennaInfo, BeamChannelInfo, BeamInfo, ChannelInfo, SpeadView,
    TileCounter, TileInfo,
};

/// Containers kept per reassembler to absorb boundary and late packets
pub const NOF_CONTAINERS: usize = 4;

/// Items common to the tile-oriented streams (raw, channel, beam, antenna)
///
/// Every field keeps its wire default when the item is absent; unknown
/// items are logged at debug level and skipped, never fatal.
#[derive(Clone, Copy, Debug, Default)]
pub struct TileItems {
    pub counter: TileCounter,
    pub payload_length: u64,
    pub sync_time: u64,
    pub timestamp: u64,
    pub antenna: AntennaInfo,
    pub antenna_ids: AntennaIds,
    pub channel: ChannelInfo,
    pub beam: BeamInfo,
    pub beam_channel: BeamChannelInfo,
    pub tile: TileInfo,
    pub payload_offset: u64,
}

impl TileItems {
    pub fn parse(view: &SpeadView<'_>, family: &str) -> Self {
        let mut items = Self::default();
        for (position, item) in view.items().enumerate() {
            match item.id {
                item_id::HEAP_COUNTER => items.counter = TileCounter::from(item.value),
                item_id::PAYLOAD_LENGTH => items.payload_length = item.value,
                item_id::SYNC_TIME => items.sync_time = item.value,
                item_id::TIMESTAMP => items.timestamp = item.value,
                item_id::ANTENNA_INFO => items.antenna = AntennaInfo::from(item.value),
                item_id::ANTENNA_IDS => items.antenna_ids = AntennaIds::from(item.value),
                item_id::CHANNEL_INFO => items.channel = ChannelInfo::from(item.value),
                item_id::BEAM_INFO => items.beam = BeamInfo::from(item.value),
                item_id::BEAM_CHANNEL_INFO => {
                    items.beam_channel = BeamChannelInfo::from(item.value)
                }
                item_id::TILE_INFO => items.tile = TileInfo::from(item.value),
                item_id::PAYLOAD_OFFSET => items.payload_offset = item.value,
                item_id::CAPTURE_MODE | item_id::FREQUENCY => {}
                id => debug!(
                    "{family}: unknown item {id:#06x} ({} of {})",
                    position + 1,
                    view.nof_items()
                ),
            }
        }
        items
    }

    /// Packet arrival time in UNIX seconds for the given timestamp scale
    pub fn packet_time(&self, scale: f64) -> f64 {
        self.sync_time as f64 + self.timestamp as f64 * scale
    }
}

/// Shared 24-bit rollover bookkeeping for the tile packet counter
///
/// The pivot stream (tile 0, polarisation 0) drives the epoch: a zero
/// counter on the pivot, after a non-zero counter has been seen, starts a
/// new epoch. Zero counters on other streams are assumed to belong to the
/// epoch the pivot is about to start.
#[derive(Clone, Copy, Debug, Default)]
pub struct Rollover {
    pub reference_counter: u64,
    rollover_counter: u64,
    width: u32,
}

impl Rollover {
    pub fn new(width: u32) -> Self {
        Self {
            reference_counter: 0,
            rollover_counter: 0,
            width,
        }
    }

    /// Extend a wire counter into the monotonic counter domain
    pub fn extend(&mut self, counter: u64, pivot: bool) -> u64 {
        if self.reference_counter == 0 {
            self.reference_counter = counter;
            return counter;
        }

        if counter == 0 && pivot {
            self.rollover_counter += 1;
            counter + (self.rollover_counter << self.width)
        } else if counter == 0 {
            counter + ((self.rollover_counter + 1) << self.width)
        } else {
            counter + (self.rollover_counter << self.width)
        }
    }

    pub fn rollovers(&self) -> u64 {
        self.rollover_counter
    }

    pub fn reset(&mut self) {
        self.reference_counter = 0;
        self.rollover_counter = 0;
    }
}

//! Shared container pieces for the reassembler family
//!
//! Every stream family assembles packets into a fixed-size container per
//! buffer period. The pieces they share live here: the insertion-ordered
//! tile map and the per-tile aligned sample store with its reference
//! timestamp and packet count.

#[cfg(not(test))]
use log::warn;
#[cfg(test)]
use std::println as warn;

use crate::mem::AlignedBuffer;

/// Insertion-ordered assignment of tile IDs to container rows
///
/// The first tile seen is assigned row 0, the next row 1, and so on up to
/// the configured tile count. Tiles beyond the cap are reported and
/// rejected.
#[derive(Clone, Debug)]
pub struct TileMap {
    tiles: Vec<u16>,
    cap: usize,
}

impl TileMap {
    pub fn new(cap: usize) -> Self {
        Self {
            tiles: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Row index for `tile`, assigning the next free row on first sight
    pub fn index_of(&mut self, tile: u16) -> Option<usize> {
        if let Some(index) = self.get(tile) {
            return Some(index);
        }
        if self.tiles.len() == self.cap {
            warn!(
                "cannot process tile {}, consumer configured for {} tiles",
                tile, self.cap
            );
            return None;
        }
        self.tiles.push(tile);
        Some(self.tiles.len() - 1)
    }

    /// Row index for `tile` without assigning
    pub fn get(&self, tile: u16) -> Option<usize> {
        self.tiles.iter().position(|&t| t == tile)
    }

    /// Tile ID stored at `row`
    pub fn tile_at(&self, row: usize) -> u16 {
        self.tiles[row]
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }
}

/// Per-tile aligned sample store with container bookkeeping
///
/// Holds one aligned, memory-locked buffer per tile row plus the shared
/// reference timestamp (earliest packet time seen this cycle) and packet
/// count. The family-specific scatter logic addresses the rows directly.
pub struct TileBuffers {
    buffers: Vec<AlignedBuffer>,
    tile_map: TileMap,
    row_len: usize,
    /// Earliest packet time seen in the current cycle, +inf when empty
    pub timestamp: f64,
    /// Packets added since the last clear
    pub nof_packets: u32,
}

impl TileBuffers {
    /// Allocate `nof_tiles` rows of `row_len` bytes each
    pub fn new(nof_tiles: usize, row_len: usize) -> Self {
        let buffers = (0..nof_tiles)
            .map(|_| {
                let buffer = AlignedBuffer::zeroed(row_len);
                buffer.lock_memory();
                buffer
            })
            .collect();
        Self {
            buffers,
            tile_map: TileMap::new(nof_tiles),
            row_len,
            timestamp: f64::INFINITY,
            nof_packets: 0,
        }
    }

    /// Row index assigned to `tile`, allocating one on first sight
    pub fn row_index(&mut self, tile: u16) -> Option<usize> {
        self.tile_map.index_of(tile)
    }

    /// Mutable view of row `row`
    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        &mut self.buffers[row].as_mut_slice()[..self.row_len]
    }

    /// Mutable view of the row assigned to `tile`
    pub fn row_for_tile(&mut self, tile: u16) -> Option<&mut [u8]> {
        let row = self.tile_map.index_of(tile)?;
        Some(&mut self.buffers[row].as_mut_slice()[..self.row_len])
    }

    /// Fold a packet time into the container reference time
    pub fn update_timestamp(&mut self, timestamp: f64) {
        if self.timestamp > timestamp {
            self.timestamp = timestamp;
        }
    }

    /// Iterate `(tile_id, samples)` over the populated rows
    pub fn rows(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.buffers
            .iter()
            .enumerate()
            .take(self.tile_map.len())
            .map(|(row, buffer)| (self.tile_map.tile_at(row), &buffer.as_slice()[..self.row_len]))
    }

    /// All rows regardless of population, in row order
    pub fn all_rows(&self) -> impl Iterator<Item = &[u8]> {
        self.buffers
            .iter()
            .map(|buffer| &buffer.as_slice()[..self.row_len])
    }

    pub fn nof_tiles(&self) -> usize {
        self.buffers.len()
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Zero the samples and reset the bookkeeping to a fresh container
    pub fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.tile_map.clear();
        self.timestamp = f64::INFINITY;
        self.nof_packets = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_map_insertion_order() {
        let mut map = TileMap::new(3);
        assert_eq!(map.index_of(7), Some(0));
        assert_eq!(map.index_of(3), Some(1));
        assert_eq!(map.index_of(7), Some(0));
        assert_eq!(map.index_of(11), Some(2));
        assert_eq!(map.len(), 3);
        assert_eq!(map.tile_at(1), 3);
    }

    #[test]
    fn test_tile_map_cap() {
        let mut map = TileMap::new(1);
        assert_eq!(map.index_of(1), Some(0));
        assert_eq!(map.index_of(2), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_buffers_clear_is_pristine() {
        let mut buffers = TileBuffers::new(2, 64);
        buffers.row_for_tile(5).unwrap()[0] = 0xFF;
        buffers.update_timestamp(123.0);
        buffers.nof_packets = 9;

        buffers.clear();

        assert!(buffers.all_rows().all(|row| row.iter().all(|&b| b == 0)));
        assert_eq!(buffers.timestamp, f64::INFINITY);
        assert_eq!(buffers.nof_packets, 0);
        // a cleared container assigns rows afresh
        assert_eq!(buffers.row_for_tile(9).map(|r| r.len()), Some(64));
    }

    #[test]
    fn test_rows_follow_tile_map() {
        let mut buffers = TileBuffers::new(2, 16);
        buffers.row_for_tile(4).unwrap()[0] = 0xAA;
        buffers.row_for_tile(2).unwrap()[0] = 0xBB;

        let rows: Vec<(u16, u8)> = buffers.rows().map(|(tile, data)| (tile, data[0])).collect();
        assert_eq!(rows, vec![(4, 0xAA), (2, 0xBB)]);
    }
}

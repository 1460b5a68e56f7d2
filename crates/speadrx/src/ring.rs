//! Packet hand-off ring between ingress and consumers
//!
//! One ring sits between the ingress worker(s) and each consumer thread.
//! The producer copies a packet into the next free cell and must never
//! block: when every cell is full the packet is dropped and counted. The
//! consumer borrows the current cell zero-copy and releases it when done.
//!
//! A cell is full exactly when its size field is non-zero; the size store
//! is the serialisation point between the two sides. Cells carry their own
//! spin locks so that multiple ingress workers can act as producers on the
//! same ring; the reader side never takes a mutex.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[cfg(not(test))]
use log::warn;
#[cfg(test)]
use std::println as warn;

use crate::mem::{align_up, next_power_of_two, AlignedBuffer, CACHE_ALIGNMENT};

/// Spin iterations before a contended lock parks the thread
const SPIN_LIMIT: u32 = 1024;

/// Parking interval once spinning has been exhausted
const PARK_INTERVAL: Duration = Duration::from_micros(500);

/// Sleep while the ring is empty during a pull
const EMPTY_POLL: Duration = Duration::from_micros(100);

/// Ring sizing options
#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    /// Payload capacity of one cell; rounded up to a cache line
    pub cell_size: usize,
    /// Number of cells; rounded up to a power of two
    pub nof_cells: usize,
}

#[repr(align(64))]
struct CellState {
    lock: AtomicBool,
    size: AtomicUsize,
}

/// Fixed-cell hand-off ring
pub struct SpscRing {
    cell_size: usize,
    nof_cells: usize,
    mask: usize,
    states: Box<[CellState]>,
    data: AlignedBuffer,
    producer: AtomicUsize,
    producer_lock: AtomicBool,
    consumer: AtomicUsize,
    full_cells: AtomicUsize,
    lost: AtomicU64,
    occupancy_warned: AtomicBool,
}

// Cell ownership is handed over through the per-cell size field (release on
// publish, acquire on read); raw data accesses never overlap between sides.
unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

impl SpscRing {
    /// Allocate a ring; cell memory is pinned when the host allows it
    pub fn new(config: RingConfig) -> Self {
        let cell_size = align_up(config.cell_size.max(1), CACHE_ALIGNMENT);
        let nof_cells = next_power_of_two(config.nof_cells);

        let data = AlignedBuffer::zeroed(cell_size * nof_cells);
        data.lock_memory();

        let states = (0..nof_cells)
            .map(|_| CellState {
                lock: AtomicBool::new(false),
                size: AtomicUsize::new(0),
            })
            .collect();

        Self {
            cell_size,
            nof_cells,
            mask: nof_cells - 1,
            states,
            data,
            producer: AtomicUsize::new(0),
            producer_lock: AtomicBool::new(false),
            consumer: AtomicUsize::new(0),
            full_cells: AtomicUsize::new(0),
            lost: AtomicU64::new(0),
            occupancy_warned: AtomicBool::new(false),
        }
    }

    /// Copy `data` into the next free cell
    ///
    /// Returns `false`, without blocking, when the ring is saturated or the
    /// payload exceeds the cell capacity; both cases count as lost packets.
    pub fn push(&self, data: &[u8]) -> bool {
        // The size field doubles as the occupancy flag, so an empty payload
        // cannot be represented
        if data.is_empty() || data.len() > self.cell_size {
            self.lost.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let cell = loop {
            if self.full_cells.load(Ordering::Acquire) == self.nof_cells {
                self.lost.fetch_add(1, Ordering::Relaxed);
                return false;
            }

            // Snapshot the producer index: another producer may advance the
            // shared index while we hold a cell lock.
            let cell = self.producer.load(Ordering::Acquire);
            spin_lock(&self.states[cell].lock);

            // A slow consumer may leave the snapshotted cell still full; skip
            // past it rather than overwrite.
            if self.states[cell].size.load(Ordering::Acquire) > 0 {
                spin_unlock(&self.states[cell].lock);
                self.advance_producer(cell);
            } else {
                break cell;
            }
        };

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.cell_ptr(cell),
                data.len(),
            );
        }

        self.states[cell].size.store(data.len(), Ordering::Release);
        let occupied = self.full_cells.fetch_add(1, Ordering::AcqRel) + 1;
        self.advance_producer(cell);
        spin_unlock(&self.states[cell].lock);

        self.check_occupancy(occupied);
        true
    }

    /// Borrow the next full cell, waiting up to `timeout`
    ///
    /// The returned guard dereferences to the packet bytes; dropping it
    /// releases the cell and advances the consumer.
    pub fn pull_timeout(&self, timeout: Duration) -> Option<CellGuard<'_>> {
        let start = Instant::now();
        loop {
            let cell = self.consumer.load(Ordering::Acquire);
            spin_lock(&self.states[cell].lock);

            let size = self.states[cell].size.load(Ordering::Acquire);
            if size > 0 {
                return Some(CellGuard {
                    ring: self,
                    cell,
                    size,
                });
            }
            spin_unlock(&self.states[cell].lock);

            if start.elapsed() > timeout {
                return None;
            }

            // With multiple producers a gap can open between occupied cells;
            // step over it instead of sleeping.
            if self.full_cells.load(Ordering::Acquire) == 0 {
                std::thread::sleep(EMPTY_POLL);
            } else {
                self.consumer
                    .store((cell + 1) & self.mask, Ordering::Release);
            }
        }
    }

    /// Number of currently occupied cells
    pub fn full_cells(&self) -> usize {
        self.full_cells.load(Ordering::Acquire)
    }

    /// Total cell count
    pub fn capacity(&self) -> usize {
        self.nof_cells
    }

    /// Cell payload capacity in bytes
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Packets dropped because the ring was saturated
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    fn cell_ptr(&self, cell: usize) -> *mut u8 {
        unsafe { self.data.as_ptr().add(cell * self.cell_size) }
    }

    fn advance_producer(&self, seen: usize) {
        spin_lock(&self.producer_lock);
        // Another producer may already have advanced past the index we saw
        if self.producer.load(Ordering::Acquire) == seen {
            self.producer.store((seen + 1) & self.mask, Ordering::Release);
        }
        spin_unlock(&self.producer_lock);
    }

    fn check_occupancy(&self, occupied: usize) {
        let high = occupied * 4 >= self.nof_cells * 3;
        if high && !self.occupancy_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "ring buffer occupancy high: {}/{} cells",
                occupied, self.nof_cells
            );
        } else if !high && occupied * 2 < self.nof_cells {
            self.occupancy_warned.store(false, Ordering::Relaxed);
        }
    }
}

/// Borrowed view of one full cell
///
/// Dropping the guard zeroes the size field, unlocks the cell and advances
/// the consumer index.
pub struct CellGuard<'a> {
    ring: &'a SpscRing,
    cell: usize,
    size: usize,
}

impl std::ops::Deref for CellGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ring.cell_ptr(self.cell), self.size) }
    }
}

impl Drop for CellGuard<'_> {
    fn drop(&mut self) {
        let states = &self.ring.states[self.cell];
        states.size.store(0, Ordering::Release);
        spin_unlock(&states.lock);
        self.ring
            .consumer
            .store((self.cell + 1) & self.ring.mask, Ordering::Release);
        self.ring.full_cells.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Acquire a spin lock with bounded exponential back-off
///
/// Spins with increasing pause counts up to the cap, then transitions to a
/// short parking sleep so sibling hyper-threads are not starved.
fn spin_lock(lock: &AtomicBool) {
    let mut spins = 1u32;
    while lock
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        if spins <= SPIN_LIMIT {
            for _ in 0..spins {
                std::hint::spin_loop();
            }
            spins *= 2;
        } else {
            std::thread::sleep(PARK_INTERVAL);
        }
    }
}

fn spin_unlock(lock: &AtomicBool) {
    lock.store(false, Ordering::Release);
}

//! Buffer-granular hand-off to downstream compute
//!
//! A reassembler writes packet payloads into the current slot of this
//! N-slot ring; the compute side (correlator, persister) takes complete
//! buffers off the other end. Writes within one buffer never conflict, so
//! the slot mutex is only taken for read/overwrite arbitration.
//!
//! The producer runs one slot ahead of the `ready` flag: a slot is marked
//! ready only when the producer moves past its successor, leaving one
//! buffer of slack for late packets. A consumer that falls behind gets
//! overwritten after a bounded wait, with a warning; ingress is never
//! stalled by slow compute.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[cfg(not(test))]
use log::warn;
#[cfg(test)]
use std::println as warn;

use crate::mem::{next_power_of_two, AlignedBuffer};
use crate::spead::SAMPLING_PERIOD;

/// Bytes per sample element (8-bit real + 8-bit imaginary)
const SAMPLE_BYTES: usize = 2;

/// Producer wait budget before overwriting an unreleased slot
const OVERWRITE_BUDGET: Duration = Duration::from_millis(1);

/// Poll interval while waiting for a slot
const SLOT_POLL: Duration = Duration::from_micros(1);

/// Per-slot bookkeeping; `channel == -1` / `index == -1` mark an empty slot
struct SlotState {
    ref_time: f64,
    index: i64,
    channel: i32,
    ready: bool,
    read_samples: u32,
    nof_packets: u32,
    data: AlignedBuffer,
}

impl SlotState {
    fn reset(&mut self) {
        self.ref_time = f64::MAX;
        self.index = -1;
        self.channel = -1;
        self.ready = false;
        self.read_samples = 0;
        self.nof_packets = 0;
        self.data.clear();
    }

    fn occupied(&self) -> bool {
        self.channel != -1
    }
}

/// N-slot rotating buffer between a reassembler and its compute stage
pub struct DoubleBuffer {
    slots: Vec<Mutex<SlotState>>,
    nof_antennas: usize,
    nof_samples: usize,
    nof_pols: usize,
    producer: AtomicUsize,
    consumer: AtomicUsize,
    overwrites: AtomicU64,
}

impl DoubleBuffer {
    /// Allocate `nof_buffers` slots (rounded to a power of two) of
    /// `nof_samples × nof_antennas × nof_pols` complex samples each
    pub fn new(nof_antennas: usize, nof_samples: usize, nof_pols: usize, nof_buffers: usize) -> Self {
        let nof_buffers = next_power_of_two(nof_buffers);
        let slot_bytes = nof_samples * nof_antennas * nof_pols * SAMPLE_BYTES;

        let slots = (0..nof_buffers)
            .map(|_| {
                let data = AlignedBuffer::zeroed(slot_bytes);
                data.lock_memory();
                Mutex::new(SlotState {
                    ref_time: f64::MAX,
                    index: -1,
                    channel: -1,
                    ready: false,
                    read_samples: 0,
                    nof_packets: 0,
                    data,
                })
            })
            .collect();

        Self {
            slots,
            nof_antennas,
            nof_samples,
            nof_pols,
            producer: AtomicUsize::new(0),
            consumer: AtomicUsize::new(0),
            overwrites: AtomicU64::new(0),
        }
    }

    pub fn nof_buffers(&self) -> usize {
        self.slots.len()
    }

    /// Buffers forcibly overwritten because the consumer lagged
    pub fn overwrites(&self) -> u64 {
        self.overwrites.load(Ordering::Relaxed)
    }

    /// Write a packet of channelised data, one channel per buffer
    ///
    /// Buffer boundaries are channel changes: a packet with a new channel
    /// finalises the slot before the current one and claims the next slot.
    /// Packets for an already-passed channel land in the previous slot.
    pub fn write_data(
        &self,
        start_antenna: usize,
        nof_included_antennas: usize,
        channel: u16,
        start_sample_index: usize,
        samples: usize,
        data: &[u8],
        timestamp: f64,
    ) {
        let producer = self.producer.load(Ordering::Acquire);
        let channel = i32::from(channel);

        let state = self.slots[producer].lock().unwrap();
        if state.occupied() && state.channel > channel {
            // Late packet from the channel before this one
            drop(state);
            let previous = self.previous_slot(producer);
            let mut state = self.slots[previous].lock().unwrap();
            self.copy_data(
                &mut state,
                start_antenna,
                nof_included_antennas,
                start_sample_index as u64 * samples as u64,
                samples,
                data,
                timestamp,
            );
            return;
        }

        let mut state = state;
        if !state.occupied() {
            state.channel = channel;
        } else if state.channel != channel {
            drop(state);
            self.rotate(producer, |state| {
                state.channel = channel;
                state.read_samples = 0;
            });
            let producer = self.producer.load(Ordering::Acquire);
            state = self.slots[producer].lock().unwrap();
        }

        self.copy_data(
            &mut state,
            start_antenna,
            nof_included_antennas,
            start_sample_index as u64 * samples as u64,
            samples,
            data,
            timestamp,
        );
    }

    /// Write a packet while a single channel is captured continuously
    ///
    /// Boundaries are detected by time: a zero packet index whose timestamp
    /// is past the end of the current buffer window rotates the slots.
    pub fn write_data_single_channel(
        &self,
        start_antenna: usize,
        nof_included_antennas: usize,
        channel: u16,
        packet_index: usize,
        samples: usize,
        data: &[u8],
        timestamp: f64,
    ) {
        let producer = self.producer.load(Ordering::Acquire);
        let channel = i32::from(channel);

        let state = self.slots[producer].lock().unwrap();
        if state.occupied() && state.ref_time > timestamp {
            // Belongs to the window before the current one
            drop(state);
            let previous = self.previous_slot(producer);
            let mut state = self.slots[previous].lock().unwrap();
            self.copy_data(
                &mut state,
                start_antenna,
                nof_included_antennas,
                packet_index as u64 * samples as u64,
                samples,
                data,
                timestamp,
            );
            return;
        }

        let mut state = state;
        if !state.occupied() {
            state.channel = channel;
            state.index = packet_index as i64;
        } else if packet_index == 0
            && timestamp >= state.ref_time + (self.nof_samples - 1) as f64 * SAMPLING_PERIOD
        {
            drop(state);
            self.rotate(producer, |state| {
                state.channel = channel;
                state.index = packet_index as i64;
                state.ready = false;
                state.ref_time = f64::MAX;
                state.read_samples = 0;
                state.nof_packets = 0;
            });
            let producer = self.producer.load(Ordering::Acquire);
            state = self.slots[producer].lock().unwrap();
        }

        self.copy_data(
            &mut state,
            start_antenna,
            nof_included_antennas,
            packet_index as u64 * samples as u64,
            samples,
            data,
            timestamp,
        );
    }

    /// Finalise pending buffers when the input stream pauses
    pub fn finish_write(&self) {
        let producer = self.producer.load(Ordering::Acquire);

        let previous = self.previous_slot(producer);
        {
            let mut state = self.slots[previous].lock().unwrap();
            if state.occupied() {
                state.ready = true;
            }
        }

        let mut state = self.slots[producer].lock().unwrap();
        if state.occupied() {
            state.ready = true;
            drop(state);
            self.producer
                .store((producer + 1) % self.slots.len(), Ordering::Release);
        }
    }

    /// Non-blocking poll for the next complete buffer
    ///
    /// Returns `None` (after a short sleep) while the next slot is not
    /// ready. Dropping the returned guard releases the buffer back to the
    /// producer pool and advances the consumer.
    pub fn read_buffer(&self) -> Option<ReadBuffer<'_>> {
        let consumer = self.consumer.load(Ordering::Acquire);
        let state = self.slots[consumer].lock().unwrap();
        if !state.ready {
            drop(state);
            std::thread::sleep(SLOT_POLL);
            return None;
        }
        Some(ReadBuffer {
            parent: self,
            state,
            slot: consumer,
        })
    }

    /// Reset every slot to empty
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.lock().unwrap().reset();
        }
    }

    fn previous_slot(&self, slot: usize) -> usize {
        (slot + self.slots.len() - 1) % self.slots.len()
    }

    /// Finalise the slot before `producer`, move to the next slot and claim
    /// it once free (or overwrite it after the wait budget)
    fn rotate(&self, producer: usize, claim: impl FnOnce(&mut SlotState)) {
        let before = self.previous_slot(producer);
        {
            let mut state = self.slots[before].lock().unwrap();
            if state.occupied() {
                state.ready = true;
            }
        }

        let next = (producer + 1) % self.slots.len();
        self.producer.store(next, Ordering::Release);

        let started = Instant::now();
        loop {
            let mut state = self.slots[next].lock().unwrap();
            if !state.occupied() {
                claim(&mut state);
                return;
            }
            if started.elapsed() >= OVERWRITE_BUDGET {
                warn!("overwriting buffer [{next}]");
                self.overwrites.fetch_add(1, Ordering::Relaxed);
                state.reset();
                claim(&mut state);
                return;
            }
            drop(state);
            std::thread::sleep(SLOT_POLL);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_data(
        &self,
        state: &mut SlotState,
        start_antenna: usize,
        nof_included_antennas: usize,
        start_sample_index: u64,
        samples: usize,
        data: &[u8],
        timestamp: f64,
    ) {
        // Destination layout is sample-major: [sample][antenna][pol]
        let pol_bytes = self.nof_pols * SAMPLE_BYTES;
        let src_stride = nof_included_antennas * pol_bytes;
        let dst_stride = self.nof_antennas * pol_bytes;
        let dst_base = start_sample_index as usize * dst_stride + start_antenna * pol_bytes;

        let dst = state.data.as_mut_slice();
        for sample in 0..samples {
            let src_offset = sample * src_stride;
            let dst_offset = dst_base + sample * dst_stride;
            if dst_offset + src_stride > dst.len() || src_offset + src_stride > data.len() {
                break;
            }
            dst[dst_offset..dst_offset + src_stride]
                .copy_from_slice(&data[src_offset..src_offset + src_stride]);
        }

        if start_antenna == 0 {
            state.read_samples += samples as u32;
        }
        state.nof_packets += 1;
        if state.ref_time > timestamp {
            state.ref_time = timestamp;
        }
    }
}

/// A complete buffer held by the consumer
///
/// Holding the guard keeps the slot mutex, so a producer that needs to
/// overwrite this slot waits until the guard is dropped. Dropping the
/// guard clears the slot and advances the consumer.
pub struct ReadBuffer<'a> {
    parent: &'a DoubleBuffer,
    state: MutexGuard<'a, SlotState>,
    slot: usize,
}

impl ReadBuffer<'_> {
    pub fn data(&self) -> &[u8] {
        self.state.data.as_slice()
    }

    pub fn ref_time(&self) -> f64 {
        self.state.ref_time
    }

    pub fn channel(&self) -> i32 {
        self.state.channel
    }

    pub fn nof_packets(&self) -> u32 {
        self.state.nof_packets
    }

    pub fn read_samples(&self) -> u32 {
        self.state.read_samples
    }
}

impl Drop for ReadBuffer<'_> {
    fn drop(&mut self) {
        self.state.reset();
        self.parent
            .consumer
            .store((self.slot + 1) % self.parent.slots.len(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(value: u8, samples: usize, antennas: usize, pols: usize) -> Vec<u8> {
        vec![value; samples * antennas * pols * SAMPLE_BYTES]
    }

    #[test]
    fn test_rounds_buffers_to_power_of_two() {
        let buffer = DoubleBuffer::new(2, 8, 2, 3);
        assert_eq!(buffer.nof_buffers(), 4);
    }

    #[test]
    fn test_channel_change_readies_lagged_slot() {
        let buffer = DoubleBuffer::new(2, 4, 2, 4);

        // Channels 10, 11, 12: slot holding channel 10 becomes ready when
        // channel 12 arrives (one-slot lag)
        buffer.write_data(0, 2, 10, 0, 4, &sample_block(1, 4, 2, 2), 100.0);
        assert!(buffer.read_buffer().is_none());

        buffer.write_data(0, 2, 11, 0, 4, &sample_block(2, 4, 2, 2), 101.0);
        assert!(buffer.read_buffer().is_none());

        buffer.write_data(0, 2, 12, 0, 4, &sample_block(3, 4, 2, 2), 102.0);
        let read = buffer.read_buffer().expect("channel 10 buffer ready");
        assert_eq!(read.channel(), 10);
        assert_eq!(read.ref_time(), 100.0);
        assert!(read.data().iter().all(|&b| b == 1));
    }

    #[test]
    fn test_finish_write_flushes_current() {
        let buffer = DoubleBuffer::new(2, 4, 2, 4);
        buffer.write_data(0, 2, 7, 0, 4, &sample_block(9, 4, 2, 2), 50.0);
        buffer.finish_write();

        let read = buffer.read_buffer().expect("flushed buffer");
        assert_eq!(read.channel(), 7);
        assert_eq!(read.nof_packets(), 1);
    }

    #[test]
    fn test_release_recycles_slot() {
        let buffer = DoubleBuffer::new(1, 2, 2, 4);
        buffer.write_data(0, 1, 0, 0, 2, &sample_block(5, 2, 1, 2), 1.0);
        buffer.finish_write();

        let read = buffer.read_buffer().unwrap();
        assert_eq!(read.read_samples(), 2);
        drop(read);

        // consumer moved on; slot zero is writable again
        assert!(buffer.read_buffer().is_none());
    }

    #[test]
    fn test_single_channel_boundary_rotation() {
        let samples_per_packet = 2;
        let nof_samples = 4;
        let buffer = DoubleBuffer::new(1, nof_samples, 2, 4);
        let block = sample_block(1, samples_per_packet, 1, 2);

        let t0 = 1000.0;
        buffer.write_data_single_channel(0, 1, 3, 0, samples_per_packet, &block, t0);
        buffer.write_data_single_channel(0, 1, 3, 1, samples_per_packet, &block, t0 + SAMPLING_PERIOD);

        // Next window: index back to 0, time past the buffer span
        let t1 = t0 + nof_samples as f64 * SAMPLING_PERIOD;
        buffer.write_data_single_channel(0, 1, 3, 0, samples_per_packet, &block, t1);
        let t2 = t1 + nof_samples as f64 * SAMPLING_PERIOD;
        buffer.write_data_single_channel(0, 1, 3, 0, samples_per_packet, &block, t2);

        // Window 0 is two rotations behind the producer and thus ready
        let read = buffer.read_buffer().expect("first window ready");
        assert_eq!(read.ref_time(), t0);
        assert_eq!(read.nof_packets(), 2);
    }

    #[test]
    fn test_overwrite_under_slow_consumer() {
        // Depth 4 with six buffers written while the consumer never reads:
        // exactly two slots are forcibly overwritten
        let buffer = DoubleBuffer::new(1, 2, 2, 4);
        let block = sample_block(1, 1, 1, 2);

        let window_time = |window: usize| 1000.0 + window as f64 * 2.0 * SAMPLING_PERIOD;
        for window in 0..6 {
            buffer.write_data_single_channel(0, 1, 0, 0, 1, &block, window_time(window));
        }

        assert_eq!(buffer.overwrites(), 2);

        // The consumer, once unblocked, observes exactly the four most
        // recent windows
        buffer.finish_write();
        let mut times = Vec::new();
        for _ in 0..buffer.nof_buffers() {
            if let Some(read) = buffer.read_buffer() {
                times.push(read.ref_time());
            }
        }
        times.sort_by(f64::total_cmp);
        assert_eq!(
            times,
            vec![window_time(2), window_time(3), window_time(4), window_time(5)]
        );
    }
}

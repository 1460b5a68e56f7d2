//! Consumer capability set and per-consumer runtime
//!
//! Each stream family implements [`Consumer`] once. A running consumer is a
//! thread that pulls packets from its own hand-off ring, reassembles them
//! and pushes completed buffers to a caller-supplied callback. The runtime
//! here owns the thread, the ring and the stop flag; the family code only
//! sees packets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

use crate::config::ConsumerConfig;
use crate::error::DaqResult;
use crate::ring::{RingConfig, SpscRing};
use crate::thread::WorkerThread;

/// Buffer-completion callback
///
/// Receives the assembled samples, the buffer reference time (UNIX seconds)
/// and two stream-specific identifiers (typically tile ID and a per-family
/// extra such as the continuous-channel ID).
pub type DataCallback = Box<dyn FnMut(&[u8], f64, u32, u32) + Send>;

/// Periodic per-consumer statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsumerStats {
    /// Occupied ring cells at sampling time
    pub ring_occupancy: usize,
    /// Total ring cells
    pub ring_capacity: usize,
    /// Packets dropped because the ring was saturated
    pub lost_packets: u64,
}

/// Callback receiving [`ConsumerStats`] every five seconds
pub type DiagnosticCallback = Box<dyn FnMut(&ConsumerStats) + Send>;

/// Ingress-side packet filter, shared with the capture threads
pub type PacketFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Outcome of handing one packet to a consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Samples were scattered into a container
    Stored,
    /// The packet was acknowledged but intentionally not stored
    /// (pre-start-time, skipped buffer, out-of-range channel)
    Skipped,
}

/// One stream family's reassembly logic
///
/// Implementations are driven from a single thread; only
/// [`packet_filter`](Consumer::packet_filter) must hand out state that the
/// ingress workers can evaluate concurrently.
pub trait Consumer: Send {
    /// Factory name this consumer is registered under
    fn name(&self) -> &'static str;

    /// Apply a configuration document; called exactly once before start
    fn init(&mut self, config: &ConsumerConfig) -> DaqResult<()>;

    /// Sizing for the hand-off ring, derived from the configuration
    fn ring_config(&self) -> RingConfig;

    /// Build the ingress-side packet filter for this stream family
    fn packet_filter(&self) -> PacketFilter;

    /// Reassemble one packet
    fn process(&mut self, packet: &[u8]) -> ProcessResult;

    /// Invoked when the input stream pauses after at least one packet
    fn on_stream_end(&mut self) {}

    /// Invoked once after the consumer thread exits
    fn cleanup(&mut self) {}

    /// Ring pull timeout; families tune this between 50 ms and 1 s
    fn pull_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Attach the buffer-completion callback
    fn set_callback(&mut self, callback: DataCallback);
}

/// Diagnostic reporting cadence
const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(5);

/// A consumer bound to its ring and thread
pub struct RunningConsumer {
    ring: Arc<SpscRing>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    diagnostic: Option<JoinHandle<()>>,
}

impl RunningConsumer {
    /// Spawn the consumer thread
    ///
    /// The ring must be registered with the ingress by the caller; the
    /// runtime only drives the pull side.
    pub fn spawn(
        mut consumer: Box<dyn Consumer>,
        ring: Arc<SpscRing>,
        diagnostic_callback: Option<DiagnosticCallback>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let ring = Arc::clone(&ring);
            let stop = Arc::clone(&stop);
            WorkerThread::new(&format!("daq-{}", consumer.name()))
                .realtime()
                .spawn(move || consumer_loop(consumer.as_mut(), &ring, &stop))
        };

        let diagnostic = diagnostic_callback.map(|mut callback| {
            let ring = Arc::clone(&ring);
            let stop = Arc::clone(&stop);
            WorkerThread::new("daq-diagnostic").spawn(move || {
                'report: loop {
                    // Sleep in steps so a stop request is honoured promptly
                    let step = DIAGNOSTIC_INTERVAL / 50;
                    for _ in 0..50 {
                        if stop.load(Ordering::Acquire) {
                            break 'report;
                        }
                        std::thread::sleep(step);
                    }
                    callback(&ConsumerStats {
                        ring_occupancy: ring.full_cells(),
                        ring_capacity: ring.capacity(),
                        lost_packets: ring.lost(),
                    });
                }
            })
        });

        Self {
            ring,
            stop,
            handle: Some(handle),
            diagnostic,
        }
    }

    /// The hand-off ring shared with the ingress
    pub fn ring(&self) -> &Arc<SpscRing> {
        &self.ring
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.diagnostic.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RunningConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pull/process loop shared by every consumer thread
fn consumer_loop(consumer: &mut dyn Consumer, ring: &SpscRing, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let mut started_processing = false;

        // Process packets until the ring times out
        while !stop.load(Ordering::Acquire) {
            match ring.pull_timeout(consumer.pull_timeout()) {
                Some(cell) => {
                    consumer.process(&cell);
                    started_processing = true;
                }
                None if started_processing => break,
                None => {}
            }
        }

        // The pause marks the end of a burst stream
        if !stop.load(Ordering::Acquire) {
            debug!("{}: stream paused", consumer.name());
            consumer.on_stream_end();
        }
    }

    consumer.cleanup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Probe {
        processed: Vec<Vec<u8>>,
        stream_ends: u32,
        cleaned: bool,
    }

    struct TestConsumer {
        probe: Arc<Mutex<Probe>>,
    }

    impl Consumer for TestConsumer {
        fn name(&self) -> &'static str {
            "test"
        }

        fn init(&mut self, _config: &ConsumerConfig) -> DaqResult<()> {
            Ok(())
        }

        fn ring_config(&self) -> RingConfig {
            RingConfig {
                cell_size: 256,
                nof_cells: 16,
            }
        }

        fn packet_filter(&self) -> PacketFilter {
            Arc::new(|_| true)
        }

        fn process(&mut self, packet: &[u8]) -> ProcessResult {
            self.probe.lock().unwrap().processed.push(packet.to_vec());
            ProcessResult::Stored
        }

        fn on_stream_end(&mut self) {
            self.probe.lock().unwrap().stream_ends += 1;
        }

        fn cleanup(&mut self) {
            self.probe.lock().unwrap().cleaned = true;
        }

        fn pull_timeout(&self) -> Duration {
            Duration::from_millis(20)
        }

        fn set_callback(&mut self, _callback: DataCallback) {}
    }

    #[test]
    fn test_runner_processes_and_detects_stream_end() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let consumer = Box::new(TestConsumer {
            probe: Arc::clone(&probe),
        });

        let ring = Arc::new(SpscRing::new(consumer.ring_config()));
        let mut running = RunningConsumer::spawn(consumer, Arc::clone(&ring), None);

        assert!(ring.push(&[1, 2]));
        assert!(ring.push(&[3, 4]));

        // Wait past the pull timeout so the stream-end fires
        std::thread::sleep(Duration::from_millis(120));
        running.stop();

        let probe = probe.lock().unwrap();
        assert_eq!(probe.processed, vec![vec![1, 2], vec![3, 4]]);
        assert!(probe.stream_ends >= 1);
        assert!(probe.cleaned);
    }
}

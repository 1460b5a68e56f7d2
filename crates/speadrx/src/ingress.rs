//! Line-rate UDP packet ingress
//!
//! One ingress instance captures every frame arriving on a NIC, keeps the
//! ones addressed to the configured IP and port allowlist, and offers each
//! surviving UDP payload to the registered consumers. Consumers that accept
//! a payload get it copied into their hand-off ring; a full ring drops the
//! packet and counts it.
//!
//! On Linux the capture path is a kernel-bypass PACKET_MMAP (TPACKET_V3)
//! ring per worker thread, with CPU fanout across workers. All other
//! targets fall back to plain blocking UDP sockets, which works but does
//! not meet the line-rate budget.

pub mod frame;
#[cfg(target_os = "linux")]
mod pmmap;
mod udp;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use log::{info, warn};

use crate::consumer::PacketFilter;
use crate::error::{DaqError, DaqResult};
use crate::ring::SpscRing;
use crate::thread::WorkerThread;

pub use frame::Datagram;

/// Destination ports the receiver will track at most
pub const MAX_PORTS: usize = 16;

/// Consumers one ingress instance will fan out to at most
pub const MAX_CONSUMERS: usize = 6;

/// Socket poll timeout; bounds the stop latency of every worker
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Diagnostic reporting interval
const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(5);

/// Capture backend selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IngressBackend {
    /// PACKET_MMAP ring on Linux, error elsewhere
    #[default]
    KernelBypass,
    /// Portable blocking UDP sockets
    UdpSocket,
}

/// Receiver rate statistics over one reporting interval
#[derive(Clone, Copy, Debug, Default)]
pub struct IngressStats {
    /// Frames dispatched to at least one consumer
    pub frames: u64,
    /// Dispatch rate over the interval
    pub frames_per_second: f64,
    /// Payload throughput over the interval
    pub gigabits_per_second: f64,
    /// Packets dropped on saturated consumer rings during the interval
    pub lost_packets: u64,
}

/// Callback receiving [`IngressStats`] every five seconds
pub type IngressDiagnosticCallback = Box<dyn FnMut(&IngressStats) + Send>;

/// Receiver parameters
#[derive(Clone, Debug)]
pub struct IngressConfig {
    /// NIC to bind to, e.g. `eth2`
    pub interface: String,
    /// Destination IP carried by the streams
    pub ip: Ipv4Addr,
    /// Capture frame size in bytes (jumbo frames need 9000+)
    pub frame_size: u32,
    /// Frames per kernel ring block
    pub frames_per_block: u32,
    /// Number of kernel ring blocks
    pub nof_blocks: u32,
    /// Worker thread count; workers are pinned to distinct CPUs
    pub nof_threads: u32,
    pub backend: IngressBackend,
    /// Emit a `{frames, fps, Gb/s, lost}` line every five seconds
    pub diagnostics: bool,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            ip: Ipv4Addr::UNSPECIFIED,
            frame_size: 9000,
            frames_per_block: 32,
            nof_blocks: 64,
            nof_threads: 1,
            backend: IngressBackend::default(),
            diagnostics: false,
        }
    }
}

/// A source of captured UDP datagrams
///
/// The kernel hands over frames in blocks; a worker acquires the next
/// block, walks its datagrams and returns the block to the kernel. The
/// UDP fallback emulates the same shape with a bounded receive batch.
pub(crate) trait PacketSource: Send {
    /// Wait up to `timeout` for a block of frames
    fn next_block(&mut self, timeout: Duration) -> bool;

    /// Visit every UDP datagram in the current block
    fn walk(&mut self, sink: &mut dyn FnMut(Datagram<'_>));

    /// Return the current block to the kernel
    fn release_block(&mut self);

    /// Configure CPU fanout across the sibling sockets
    fn set_fanout(&mut self, group: u16) -> DaqResult<()>;

    /// Track allowlist growth (the UDP fallback binds one socket per port)
    fn update_ports(&mut self, ports: &[u16]);
}

struct ConsumerSlot {
    id: usize,
    ring: Arc<SpscRing>,
    filter: PacketFilter,
}

impl Clone for ConsumerSlot {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            ring: Arc::clone(&self.ring),
            filter: Arc::clone(&self.filter),
        }
    }
}

#[derive(Default)]
struct IngressShared {
    ports: Mutex<ArrayVec<u16, MAX_PORTS>>,
    consumers: Mutex<Vec<ConsumerSlot>>,
    next_consumer_id: AtomicU64,
    /// Bumped on every port/consumer change so workers refresh their caches
    generation: AtomicU64,
    stop: AtomicBool,
    frames: AtomicU64,
    bytes: AtomicU64,
    lost: AtomicU64,
}

/// Handle to a registered consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerId(u64);

/// The per-process packet receiver
pub struct PacketIngress {
    config: IngressConfig,
    shared: Arc<IngressShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PacketIngress {
    /// Create the capture sockets and start the worker threads
    ///
    /// Socket, bind and ring-mapping failures are fatal and reported here;
    /// nothing is spawned in that case.
    pub fn start(config: IngressConfig) -> DaqResult<Self> {
        Self::start_with_diagnostics(config, None)
    }

    /// Like [`start`](Self::start), with a callback receiving the rate
    /// statistics every five seconds
    ///
    /// The statistics thread runs when either a callback is given or
    /// `config.diagnostics` asks for the log line.
    pub fn start_with_diagnostics(
        config: IngressConfig,
        diagnostic_callback: Option<IngressDiagnosticCallback>,
    ) -> DaqResult<Self> {
        let shared = Arc::new(IngressShared::default());
        let fanout_group = std::process::id() as u16;

        let mut sources: Vec<Box<dyn PacketSource>> = Vec::new();
        for _ in 0..config.nof_threads.max(1) {
            sources.push(open_source(&config)?);
        }
        if config.nof_threads > 1 {
            for source in &mut sources {
                source.set_fanout(fanout_group)?;
            }
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut workers = Vec::new();
        for (index, source) in sources.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let ip = u32::from(config.ip);
            workers.push(
                WorkerThread::new(&format!("daq-ingress-{index}"))
                    .pin_to(index % cpus)
                    .realtime()
                    .spawn(move || worker_loop(source, shared, ip)),
            );
        }

        if config.diagnostics || diagnostic_callback.is_some() {
            let shared = Arc::clone(&shared);
            let log_line = config.diagnostics;
            workers.push(WorkerThread::new("daq-ingress-stats").spawn(move || {
                diagnostic_loop(&shared, diagnostic_callback, log_line);
            }));
        }

        info!(
            "receiver started on {} ({}) with {} thread(s)",
            config.interface,
            config.ip,
            config.nof_threads.max(1)
        );

        Ok(Self {
            config,
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Add a destination port to the allowlist
    ///
    /// Ports are never removed for the lifetime of the receiver; adding a
    /// port twice is a no-op.
    pub fn add_port(&self, port: u16) -> DaqResult<()> {
        let mut ports = self.shared.ports.lock().unwrap();
        if ports.contains(&port) {
            return Ok(());
        }
        ports
            .try_push(port)
            .map_err(|_| DaqError::TooManyPorts(MAX_PORTS))?;
        drop(ports);
        self.shared.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Register a consumer ring and its packet filter
    pub fn register_consumer(
        &self,
        ring: Arc<SpscRing>,
        filter: PacketFilter,
    ) -> DaqResult<ConsumerId> {
        let mut consumers = self.shared.consumers.lock().unwrap();
        if consumers.len() >= MAX_CONSUMERS {
            warn!("maximum number of consumers reached");
            return Err(DaqError::TooManyConsumers(MAX_CONSUMERS));
        }
        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::Relaxed) as usize;
        consumers.push(ConsumerSlot { id, ring, filter });
        drop(consumers);
        self.shared.generation.fetch_add(1, Ordering::Release);
        Ok(ConsumerId(id as u64))
    }

    /// Detach a consumer; its ring receives no further packets
    pub fn unregister_consumer(&self, id: ConsumerId) -> DaqResult<()> {
        let mut consumers = self.shared.consumers.lock().unwrap();
        let before = consumers.len();
        consumers.retain(|slot| slot.id as u64 != id.0);
        let removed = consumers.len() != before;
        drop(consumers);
        if removed {
            self.shared.generation.fetch_add(1, Ordering::Release);
            Ok(())
        } else {
            Err(DaqError::Failure(format!(
                "failed to unregister consumer {}",
                id.0
            )))
        }
    }

    /// Packets dropped on saturated consumer rings
    pub fn lost_packets(&self) -> u64 {
        self.shared.lost.load(Ordering::Relaxed)
    }

    /// Receiver parameters
    pub fn config(&self) -> &IngressConfig {
        &self.config
    }

    /// Signal every worker and wait for the capture to wind down
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("receiver stopped");
    }
}

impl Drop for PacketIngress {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_source(config: &IngressConfig) -> DaqResult<Box<dyn PacketSource>> {
    match config.backend {
        IngressBackend::KernelBypass => {
            #[cfg(target_os = "linux")]
            {
                Ok(Box::new(pmmap::PmmapSource::open(config)?))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(DaqError::Socket(
                    "kernel-bypass capture requires Linux; use the UDP backend".to_string(),
                ))
            }
        }
        IngressBackend::UdpSocket => Ok(Box::new(udp::UdpSource::open(config)?)),
    }
}

/// Per-worker capture loop
fn worker_loop(mut source: Box<dyn PacketSource>, shared: Arc<IngressShared>, ip: u32) {
    let mut cached_generation = u64::MAX;
    let mut ports: ArrayVec<u16, MAX_PORTS> = ArrayVec::new();
    let mut consumers: Vec<ConsumerSlot> = Vec::new();

    while !shared.stop.load(Ordering::Acquire) {
        let generation = shared.generation.load(Ordering::Acquire);
        if generation != cached_generation {
            cached_generation = generation;
            ports = shared.ports.lock().unwrap().clone();
            consumers = shared.consumers.lock().unwrap().clone();
            source.update_ports(&ports);
        }

        if !source.next_block(POLL_TIMEOUT) {
            continue;
        }

        if consumers.is_empty() {
            source.release_block();
            continue;
        }

        let mut frames = 0u64;
        let mut bytes = 0u64;
        let mut lost = 0u64;
        source.walk(&mut |datagram| {
            if datagram.dst_ip != ip || !ports.contains(&datagram.dst_port) {
                return;
            }

            let mut processed = false;
            for slot in &consumers {
                if (slot.filter)(datagram.payload) {
                    if !slot.ring.push(datagram.payload) {
                        lost += 1;
                    }
                    processed = true;
                }
            }

            if processed {
                frames += 1;
                bytes += datagram.payload.len() as u64;
            }
        });
        source.release_block();

        shared.frames.fetch_add(frames, Ordering::Relaxed);
        shared.bytes.fetch_add(bytes, Ordering::Relaxed);
        shared.lost.fetch_add(lost, Ordering::Relaxed);
    }
}

/// Rate reporting at a fixed cadence, detached from the capture path
fn diagnostic_loop(
    shared: &IngressShared,
    mut callback: Option<IngressDiagnosticCallback>,
    log_line: bool,
) {
    while !shared.stop.load(Ordering::Acquire) {
        let start = Instant::now();
        // Sleep in steps so a stop request is honoured promptly
        let step = DIAGNOSTIC_INTERVAL / 50;
        for _ in 0..50 {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(step);
        }
        let elapsed = start.elapsed().as_secs_f64();

        let frames = shared.frames.swap(0, Ordering::Relaxed);
        let bytes = shared.bytes.swap(0, Ordering::Relaxed);
        let lost = shared.lost.swap(0, Ordering::Relaxed);

        let stats = IngressStats {
            frames,
            frames_per_second: frames as f64 / elapsed,
            gigabits_per_second: bytes as f64 * 8.0 * 1e-9 / elapsed,
            lost_packets: lost,
        };
        if let Some(callback) = callback.as_mut() {
            callback(&stats);
        }
        if log_line {
            info!(
                "processed frames: {}, frames per second: {:.2}k, data rate: {:.2}Gb/s, {} lost packets",
                stats.frames,
                stats.frames_per_second * 1e-3,
                stats.gigabits_per_second,
                stats.lost_packets
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingConfig;
    use std::net::UdpSocket;

    fn udp_config(ip: Ipv4Addr) -> IngressConfig {
        IngressConfig {
            interface: "lo".to_string(),
            ip,
            backend: IngressBackend::UdpSocket,
            nof_threads: 1,
            ..IngressConfig::default()
        }
    }

    #[test]
    fn test_port_allowlist_limits() {
        let ingress = PacketIngress::start(udp_config(Ipv4Addr::LOCALHOST)).unwrap();
        for port in 0..MAX_PORTS as u16 {
            ingress.add_port(40000 + port).unwrap();
        }
        // duplicates are fine
        ingress.add_port(40000).unwrap();
        // a seventeenth port is not
        assert!(matches!(
            ingress.add_port(50000),
            Err(DaqError::TooManyPorts(_))
        ));
        ingress.stop();
    }

    #[test]
    fn test_consumer_limit_and_unregister() {
        let ingress = PacketIngress::start(udp_config(Ipv4Addr::LOCALHOST)).unwrap();
        let ring_config = RingConfig {
            cell_size: 128,
            nof_cells: 8,
        };

        let mut ids = Vec::new();
        for _ in 0..MAX_CONSUMERS {
            let ring = Arc::new(SpscRing::new(ring_config));
            ids.push(
                ingress
                    .register_consumer(ring, Arc::new(|_| true))
                    .unwrap(),
            );
        }
        let ring = Arc::new(SpscRing::new(ring_config));
        assert!(matches!(
            ingress.register_consumer(ring, Arc::new(|_| true)),
            Err(DaqError::TooManyConsumers(_))
        ));

        ingress.unregister_consumer(ids[0]).unwrap();
        assert!(ingress.unregister_consumer(ids[0]).is_err());
        ingress.stop();
    }

    #[test]
    fn test_diagnostic_callback_thread_stops_promptly() {
        let delivered = Arc::new(AtomicU64::new(0));
        let callback = {
            let delivered = Arc::clone(&delivered);
            Box::new(move |stats: &IngressStats| {
                delivered.fetch_add(1 + stats.frames, Ordering::Relaxed);
            })
        };

        let ingress = PacketIngress::start_with_diagnostics(
            udp_config(Ipv4Addr::LOCALHOST),
            Some(callback),
        )
        .unwrap();

        // stopping must not wait out the full reporting interval
        let started = Instant::now();
        ingress.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_udp_backend_end_to_end() {
        let ingress = PacketIngress::start(udp_config(Ipv4Addr::LOCALHOST)).unwrap();

        // bind to an ephemeral port first so the test does not collide
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        ingress.add_port(port).unwrap();

        let ring = Arc::new(SpscRing::new(RingConfig {
            cell_size: 256,
            nof_cells: 32,
        }));
        // accept only payloads starting with the marker byte
        ingress
            .register_consumer(Arc::clone(&ring), Arc::new(|p: &[u8]| p.first() == Some(&0x53)))
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = format!("127.0.0.1:{port}");
        // worker may still be installing the socket for the new port
        for _ in 0..50 {
            sender.send_to(&[0x53, 1, 2, 3], &target).unwrap();
            sender.send_to(&[0x00, 9, 9, 9], &target).unwrap();
            if ring.full_cells() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let cell = ring
            .pull_timeout(Duration::from_millis(500))
            .expect("accepted packet");
        assert_eq!(&cell[..4], &[0x53, 1, 2, 3]);
        drop(cell);

        ingress.stop();
    }
}

//! Portable blocking-UDP capture fallback
//!
//! Binds one ordinary UDP socket per allowlisted port and sweeps them in a
//! non-blocking batch. This keeps the worker loop, filters and rings
//! identical to the kernel-bypass path at a fraction of its throughput;
//! it is the path used on non-Linux hosts, in tests and in simulation.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{DaqError, DaqResult};
use crate::ingress::{Datagram, IngressConfig, PacketSource};

/// Upper bound on datagrams drained per block
const BATCH: usize = 128;

/// Pause between sweeps while no socket has data
const SWEEP_PAUSE: Duration = Duration::from_millis(1);

pub(crate) struct UdpSource {
    ip: Ipv4Addr,
    max_frame: usize,
    sockets: Vec<(u16, UdpSocket)>,
    scratch: Vec<u8>,
    /// Filled datagram lengths and ports for the current block
    block: Vec<(u16, usize)>,
}

impl UdpSource {
    pub fn open(config: &IngressConfig) -> DaqResult<Self> {
        Ok(Self {
            ip: config.ip,
            max_frame: config.frame_size.max(128) as usize,
            sockets: Vec::new(),
            scratch: Vec::new(),
            block: Vec::new(),
        })
    }

    fn bind_port(&mut self, port: u16) -> DaqResult<()> {
        let socket = UdpSocket::bind(SocketAddrV4::new(self.ip, port)).map_err(|err| {
            DaqError::Socket(format!("could not bind UDP socket on port {port}: {err}"))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|err| DaqError::Socket(format!("could not configure socket: {err}")))?;
        self.sockets.push((port, socket));
        Ok(())
    }
}

impl PacketSource for UdpSource {
    fn next_block(&mut self, timeout: Duration) -> bool {
        self.block.clear();
        self.scratch.clear();

        if self.sockets.is_empty() {
            std::thread::sleep(timeout.min(SWEEP_PAUSE * 20));
            return false;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let mut drained_any = false;
            for (port, socket) in &self.sockets {
                while self.block.len() < BATCH {
                    let offset = self.scratch.len();
                    self.scratch.resize(offset + self.max_frame, 0);
                    match socket.recv(&mut self.scratch[offset..]) {
                        Ok(len) => {
                            self.scratch.truncate(offset + len);
                            self.block.push((*port, len));
                            drained_any = true;
                        }
                        Err(_) => {
                            self.scratch.truncate(offset);
                            break;
                        }
                    }
                }
            }

            if !self.block.is_empty() {
                return true;
            }
            if !drained_any && Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(SWEEP_PAUSE);
        }
    }

    fn walk(&mut self, sink: &mut dyn FnMut(Datagram<'_>)) {
        let mut offset = 0;
        for &(port, len) in &self.block {
            sink(Datagram {
                dst_ip: u32::from(self.ip),
                dst_port: port,
                payload: &self.scratch[offset..offset + len],
            });
            offset += len;
        }
    }

    fn release_block(&mut self) {
        self.block.clear();
        self.scratch.clear();
    }

    fn set_fanout(&mut self, _group: u16) -> DaqResult<()> {
        // Plain UDP sockets share delivery through the kernel socket layer
        Ok(())
    }

    fn update_ports(&mut self, ports: &[u16]) {
        for &port in ports {
            if self.sockets.iter().any(|(bound, _)| *bound == port) {
                continue;
            }
            if let Err(err) = self.bind_port(port) {
                warn!("{err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IngressConfig {
        IngressConfig {
            ip: Ipv4Addr::LOCALHOST,
            ..IngressConfig::default()
        }
    }

    #[test]
    fn test_no_ports_times_out() {
        let mut source = UdpSource::open(&config()).unwrap();
        assert!(!source.next_block(Duration::from_millis(5)));
    }

    #[test]
    fn test_receive_and_walk() {
        let mut source = UdpSource::open(&config()).unwrap();

        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        source.update_ports(&[port]);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&[1, 2, 3], format!("127.0.0.1:{port}"))
            .unwrap();

        assert!(source.next_block(Duration::from_millis(500)));
        let mut seen = Vec::new();
        source.walk(&mut |datagram| {
            assert_eq!(datagram.dst_port, port);
            assert_eq!(datagram.dst_ip, u32::from(Ipv4Addr::LOCALHOST));
            seen.push(datagram.payload.to_vec());
        });
        source.release_block();

        assert_eq!(seen, vec![vec![1, 2, 3]]);
    }
}

//! PACKET_MMAP (TPACKET_V3) capture ring
//!
//! Each ingress worker owns one raw packet socket with a kernel-mapped
//! block ring. The kernel fills a block with frames and flips its status
//! word; the worker walks the frames in place and hands the block back.
//! No frame bytes are copied on this path.
//!
//! Kernel tuning that helps at line rate (applied outside this process):
//! `ethtool -G <if> rx 4096`, flow control off, irqbalance off.

use std::io;
use std::time::Duration;

use log::warn;

use crate::error::{DaqError, DaqResult};
use crate::ingress::frame::parse_frame;
use crate::ingress::{Datagram, IngressConfig, PacketSource};

/// TPACKET frames must be aligned to this many bytes
const FRAME_ALIGNMENT: u32 = 256;

/// Kernel block retire timeout in milliseconds
const BLOCK_RETIRE_TOV_MS: u32 = 60;

pub(crate) struct PmmapSource {
    socket: i32,
    map: *mut u8,
    map_len: usize,
    block_size: usize,
    nof_blocks: usize,
    current_block: usize,
}

// The mapping and socket are owned exclusively by one worker thread.
unsafe impl Send for PmmapSource {}

impl PmmapSource {
    /// Create the socket, configure the ring and map it
    pub fn open(config: &IngressConfig) -> DaqResult<Self> {
        let frame_size = config.frame_size.div_ceil(FRAME_ALIGNMENT) * FRAME_ALIGNMENT;
        let block_size = page_align(frame_size as usize * config.frames_per_block as usize);
        let nof_blocks = config.nof_blocks.max(1) as usize;
        let frames_per_block = block_size / frame_size as usize;

        unsafe {
            let socket = libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_IP as u16).to_be() as i32,
            );
            if socket < 0 {
                return Err(DaqError::Socket(format!(
                    "could not create packet socket [requires root]: {}",
                    io::Error::last_os_error()
                )));
            }

            // Ask for a large socket buffer; refusal is not fatal
            let rcvbuf: libc::c_int = 512 * 1024 * 1024;
            if libc::setsockopt(
                socket,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) != 0
            {
                warn!("could not grow packet socket receive buffer");
            }

            let version: libc::c_int = libc::tpacket_versions::TPACKET_V3 as libc::c_int;
            if libc::setsockopt(
                socket,
                libc::SOL_PACKET,
                libc::PACKET_VERSION,
                &version as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) != 0
            {
                libc::close(socket);
                return Err(DaqError::Socket(format!(
                    "could not select TPACKET_V3: {}",
                    io::Error::last_os_error()
                )));
            }

            let if_index = interface_index(&config.interface)?;

            let mut req: libc::tpacket_req3 = std::mem::zeroed();
            req.tp_frame_size = frame_size;
            req.tp_block_size = block_size as libc::c_uint;
            req.tp_block_nr = nof_blocks as libc::c_uint;
            req.tp_frame_nr = (frames_per_block * nof_blocks) as libc::c_uint;
            req.tp_retire_blk_tov = BLOCK_RETIRE_TOV_MS;
            if libc::setsockopt(
                socket,
                libc::SOL_PACKET,
                libc::PACKET_RX_RING,
                &req as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::tpacket_req3>() as libc::socklen_t,
            ) != 0
            {
                libc::close(socket);
                return Err(DaqError::Socket(format!(
                    "could not configure capture ring: {}",
                    io::Error::last_os_error()
                )));
            }

            let map_len = block_size * nof_blocks;
            let mut map = libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED | libc::MAP_NORESERVE,
                socket,
                0,
            );
            if map == libc::MAP_FAILED {
                warn!("could not lock capture ring memory, mapping unlocked");
                map = libc::mmap(
                    std::ptr::null_mut(),
                    map_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_NORESERVE,
                    socket,
                    0,
                );
            }
            if map == libc::MAP_FAILED {
                libc::close(socket);
                return Err(DaqError::Mmap(format!(
                    "could not map kernel capture ring: {}",
                    io::Error::last_os_error()
                )));
            }

            let mut address: libc::sockaddr_ll = std::mem::zeroed();
            address.sll_family = libc::AF_PACKET as libc::c_ushort;
            address.sll_protocol = (libc::ETH_P_IP as u16).to_be();
            address.sll_ifindex = if_index;
            if libc::bind(
                socket,
                &address as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            ) != 0
            {
                libc::munmap(map, map_len);
                libc::close(socket);
                return Err(DaqError::Socket(format!(
                    "could not bind to interface {}: {}",
                    config.interface,
                    io::Error::last_os_error()
                )));
            }

            Ok(Self {
                socket,
                map: map as *mut u8,
                map_len,
                block_size,
                nof_blocks,
                current_block: 0,
            })
        }
    }

    fn block_descriptor(&self) -> *mut libc::tpacket_block_desc {
        unsafe { self.map.add(self.current_block * self.block_size) as *mut libc::tpacket_block_desc }
    }

    fn block_ready(&self) -> bool {
        unsafe {
            let pbd = self.block_descriptor();
            let status = std::ptr::read_volatile(&(*pbd).hdr.bh1.block_status);
            status & libc::TP_STATUS_USER != 0
        }
    }
}

impl PacketSource for PmmapSource {
    fn next_block(&mut self, timeout: Duration) -> bool {
        if self.block_ready() {
            return true;
        }

        let mut pfd = libc::pollfd {
            fd: self.socket,
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        };
        unsafe {
            libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int);
        }
        self.block_ready()
    }

    fn walk(&mut self, sink: &mut dyn FnMut(Datagram<'_>)) {
        unsafe {
            let pbd = self.block_descriptor();
            let nof_packets = (*pbd).hdr.bh1.num_pkts;
            let mut offset = (*pbd).hdr.bh1.offset_to_first_pkt as usize;

            for _ in 0..nof_packets {
                let header = (pbd as *const u8).add(offset) as *const libc::tpacket3_hdr;
                let mac = (*header).tp_mac as usize;
                let snaplen = (*header).tp_snaplen as usize;
                let frame =
                    std::slice::from_raw_parts((header as *const u8).add(mac), snaplen);

                if let Some(datagram) = parse_frame(frame) {
                    sink(datagram);
                }

                let next = (*header).tp_next_offset as usize;
                if next == 0 {
                    break;
                }
                offset += next;
            }
        }
    }

    fn release_block(&mut self) {
        unsafe {
            let pbd = self.block_descriptor();
            std::ptr::write_volatile(
                std::ptr::addr_of_mut!((*pbd).hdr.bh1.block_status),
                libc::TP_STATUS_KERNEL,
            );
        }
        self.current_block = (self.current_block + 1) % self.nof_blocks;
    }

    fn set_fanout(&mut self, group: u16) -> DaqResult<()> {
        // Distribute by arrival CPU so each worker keeps its own flows
        let argument: libc::c_int =
            (group as libc::c_int) | ((libc::PACKET_FANOUT_CPU as libc::c_int) << 16);
        let result = unsafe {
            libc::setsockopt(
                self.socket,
                libc::SOL_PACKET,
                libc::PACKET_FANOUT,
                &argument as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if result != 0 {
            return Err(DaqError::Socket(format!(
                "could not configure packet fanout: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn update_ports(&mut self, _ports: &[u16]) {
        // Port filtering happens on the parsed headers; nothing to rebuild
    }
}

impl Drop for PmmapSource {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
            libc::close(self.socket);
        }
    }
}

fn interface_index(interface: &str) -> DaqResult<i32> {
    let name = std::ffi::CString::new(interface)
        .map_err(|_| DaqError::Socket("interface name contains a NUL byte".to_string()))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(DaqError::Socket(format!(
            "could not get index of interface {interface}: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(index as i32)
}

fn page_align(len: usize) -> usize {
    let page = crate::mem::page_size();
    len.div_ceil(page) * page
}

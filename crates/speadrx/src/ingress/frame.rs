//! In-place Ethernet / IPv4 / UDP header walk
//!
//! The capture ring hands over raw Ethernet frames; this module resolves
//! the UDP payload without copying. Anything that is not a well-formed
//! IPv4/UDP frame is rejected with `None`.

use byteorder::{BigEndian, ByteOrder};

const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_PROTOCOL_UDP: u8 = 17;
const UDP_HEADER_LEN: usize = 8;

/// A located UDP datagram inside a captured frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datagram<'a> {
    /// Destination IPv4 address in host order
    pub dst_ip: u32,
    /// Destination UDP port in host order
    pub dst_port: u16,
    /// UDP payload bytes
    pub payload: &'a [u8],
}

/// Walk the headers of one Ethernet frame
///
/// Returns the destination address information and the UDP payload, or
/// `None` for frames of any other shape. The UDP length field bounds the
/// payload; frames whose length field overruns the capture are rejected.
pub fn parse_frame(frame: &[u8]) -> Option<Datagram<'_>> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    if BigEndian::read_u16(&frame[12..14]) != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = &frame[ETH_HEADER_LEN..];
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ip_header_len = usize::from(ip[0] & 0x0F) * 4;
    if ip_header_len < 20 || ip.len() < ip_header_len + UDP_HEADER_LEN {
        return None;
    }
    if ip[9] != IP_PROTOCOL_UDP {
        return None;
    }
    let dst_ip = BigEndian::read_u32(&ip[16..20]);

    let udp = &ip[ip_header_len..];
    let dst_port = BigEndian::read_u16(&udp[2..4]);
    let udp_len = usize::from(BigEndian::read_u16(&udp[4..6]));
    if udp_len < UDP_HEADER_LEN || udp.len() < udp_len {
        return None;
    }

    Some(Datagram {
        dst_ip,
        dst_port,
        payload: &udp[UDP_HEADER_LEN..udp_len],
    })
}

#[cfg(test)]
pub(crate) fn build_frame(dst_ip: u32, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; ETH_HEADER_LEN + 20 + udp_len];

    BigEndian::write_u16(&mut frame[12..14], ETHERTYPE_IPV4);

    let ip = &mut frame[ETH_HEADER_LEN..];
    ip[0] = 0x45; // version 4, header length 20
    BigEndian::write_u16(&mut ip[2..4], (20 + udp_len) as u16);
    ip[8] = 64; // ttl
    ip[9] = IP_PROTOCOL_UDP;
    BigEndian::write_u32(&mut ip[16..20], dst_ip);

    let udp = &mut ip[20..];
    BigEndian::write_u16(&mut udp[0..2], 4660);
    BigEndian::write_u16(&mut udp[2..4], dst_port);
    BigEndian::write_u16(&mut udp[4..6], udp_len as u16);
    udp[UDP_HEADER_LEN..udp_len].copy_from_slice(payload);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_frame() {
        let frame = build_frame(0x0A000A28, 4660, &[0xAA, 0xBB, 0xCC]);
        let datagram = parse_frame(&frame).expect("valid frame");
        assert_eq!(datagram.dst_ip, 0x0A000A28);
        assert_eq!(datagram.dst_port, 4660);
        assert_eq!(datagram.payload, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_reject_non_ipv4() {
        let mut frame = build_frame(1, 2, &[0]);
        frame[12] = 0x86; // IPv6 ethertype
        frame[13] = 0xDD;
        assert!(parse_frame(&frame).is_none());
    }

    #[test]
    fn test_reject_non_udp() {
        let mut frame = build_frame(1, 2, &[0]);
        frame[ETH_HEADER_LEN + 9] = 6; // TCP
        assert!(parse_frame(&frame).is_none());
    }

    #[test]
    fn test_reject_truncated() {
        let frame = build_frame(1, 2, &[1, 2, 3, 4]);
        assert!(parse_frame(&frame[..frame.len() - 6]).is_none());
        assert!(parse_frame(&[]).is_none());
    }

    #[test]
    fn test_udp_length_bounds_payload() {
        // trailing capture padding past the UDP length is not part of the
        // payload
        let mut frame = build_frame(1, 2, &[5, 6]);
        frame.extend_from_slice(&[0xFF; 16]);
        let datagram = parse_frame(&frame).unwrap();
        assert_eq!(datagram.payload, &[5, 6]);
    }
}

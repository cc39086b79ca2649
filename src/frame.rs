//! Packet-in frame parsing
//!
//! Parses the raw Ethernet frame delivered by a packet-in just far enough
//! for L2 learning, ARP trust observation and reactive match construction.
//! IPv4/TCP/UDP/ICMP go through `etherparse`; ARP is decoded by hand since
//! etherparse stops at the Ethernet header for it.

use std::net::Ipv4Addr;

use etherparse::SlicedPacket;

use crate::proto::eth_type;

/// Hardware address as carried in the Ethernet header
pub type MacAddr = [u8; 6];

/// Render a MAC in the usual colon-separated form
pub fn format_mac(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Transport header of an IPv4 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp {
        src_port: u16,
        dst_port: u16,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Icmp {
        icmp_type: u8,
        icmp_code: u8,
    },
    Other(u8),
}

/// Payload of a parsed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBody {
    /// Link discovery, dropped silently with no side effects
    Lldp,
    Arp {
        opcode: u16,
        sender_ip: Ipv4Addr,
    },
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: u8,
        transport: Transport,
    },
    /// Anything else still participates in L2 learning
    Other {
        eth_type: u16,
    },
}

/// A packet-in frame parsed for the controller's purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub body: FrameBody,
}

/// Parse a raw Ethernet frame. Returns `None` when the frame is too short
/// or its IP layer is malformed; callers log and drop those.
pub fn parse_frame(data: &[u8]) -> Option<ParsedFrame> {
    if data.len() < 14 {
        return None;
    }
    let mut dst_mac = [0u8; 6];
    let mut src_mac = [0u8; 6];
    dst_mac.copy_from_slice(&data[0..6]);
    src_mac.copy_from_slice(&data[6..12]);
    let ethertype = u16::from_be_bytes([data[12], data[13]]);

    let body = match ethertype {
        eth_type::LLDP => FrameBody::Lldp,
        eth_type::ARP => parse_arp(&data[14..])?,
        eth_type::IPV4 => parse_ipv4(data)?,
        other => FrameBody::Other { eth_type: other },
    };

    Some(ParsedFrame {
        src_mac,
        dst_mac,
        body,
    })
}

/// Decode the fixed 28-byte Ethernet/IPv4 ARP body
fn parse_arp(body: &[u8]) -> Option<FrameBody> {
    if body.len() < 28 {
        return None;
    }
    let opcode = u16::from_be_bytes([body[6], body[7]]);
    // sha occupies bytes 8..14, the sender protocol address follows
    let sender_ip = Ipv4Addr::new(body[14], body[15], body[16], body[17]);
    Some(FrameBody::Arp { opcode, sender_ip })
}

fn parse_ipv4(data: &[u8]) -> Option<FrameBody> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;

    let (src, dst, proto) = match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                header.source_addr(),
                header.destination_addr(),
                header.protocol().0,
            )
        }
        _ => return None,
    };

    let transport = match &sliced.transport {
        Some(etherparse::TransportSlice::Tcp(tcp)) => Transport::Tcp {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
        },
        Some(etherparse::TransportSlice::Udp(udp)) => Transport::Udp {
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
        },
        Some(etherparse::TransportSlice::Icmpv4(icmp)) => {
            let bytes = icmp.slice();
            let (icmp_type, icmp_code) = if bytes.len() >= 2 {
                (bytes[0], bytes[1])
            } else {
                (0, 0)
            };
            Transport::Icmp {
                icmp_type,
                icmp_code,
            }
        }
        _ => Transport::Other(proto),
    };

    Some(FrameBody::Ipv4 {
        src,
        dst,
        proto,
        transport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: MacAddr = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    const MAC_B: MacAddr = [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];

    fn tcp_frame(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        syn: bool,
    ) -> Vec<u8> {
        let mut builder =
            etherparse::PacketBuilder::ethernet2(MAC_A, MAC_B)
                .ipv4(src, dst, 64)
                .tcp(src_port, dst_port, 1000, 8192);
        if syn {
            builder = builder.syn();
        }
        let mut out = Vec::new();
        builder.write(&mut out, &[]).unwrap();
        out
    }

    fn arp_frame(sender_ip: [u8; 4], opcode: u16) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAC_B);
        frame.extend_from_slice(&MAC_A);
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&1u16.to_be_bytes()); // htype ethernet
        frame.extend_from_slice(&0x0800u16.to_be_bytes()); // ptype ipv4
        frame.push(6);
        frame.push(4);
        frame.extend_from_slice(&opcode.to_be_bytes());
        frame.extend_from_slice(&MAC_A); // sha
        frame.extend_from_slice(&sender_ip); // spa
        frame.extend_from_slice(&MAC_B); // tha
        frame.extend_from_slice(&[0, 0, 0, 0]); // tpa
        frame
    }

    #[test]
    fn test_parse_tcp() {
        let data = tcp_frame([10, 0, 0, 5], [10, 0, 0, 1], 4000, 80, true);
        let frame = parse_frame(&data).unwrap();

        assert_eq!(frame.src_mac, MAC_A);
        assert_eq!(frame.dst_mac, MAC_B);
        match frame.body {
            FrameBody::Ipv4 {
                src,
                dst,
                proto,
                transport: Transport::Tcp { src_port, dst_port },
            } => {
                assert_eq!(src, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(dst, Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(proto, 6);
                assert_eq!(src_port, 4000);
                assert_eq!(dst_port, 80);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_parse_arp_reply() {
        let data = arp_frame([10, 0, 0, 5], 2);
        let frame = parse_frame(&data).unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Arp {
                opcode: 2,
                sender_ip: Ipv4Addr::new(10, 0, 0, 5),
            }
        );
    }

    #[test]
    fn test_parse_lldp() {
        let mut data = Vec::new();
        data.extend_from_slice(&MAC_B);
        data.extend_from_slice(&MAC_A);
        data.extend_from_slice(&0x88ccu16.to_be_bytes());
        data.extend_from_slice(&[0u8; 20]);

        let frame = parse_frame(&data).unwrap();
        assert_eq!(frame.body, FrameBody::Lldp);
    }

    #[test]
    fn test_parse_runt_frame() {
        assert!(parse_frame(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_parse_unknown_ethertype() {
        let mut data = Vec::new();
        data.extend_from_slice(&MAC_B);
        data.extend_from_slice(&MAC_A);
        data.extend_from_slice(&0x86ddu16.to_be_bytes()); // IPv6, not handled
        data.extend_from_slice(&[0u8; 40]);

        let frame = parse_frame(&data).unwrap();
        assert_eq!(frame.body, FrameBody::Other { eth_type: 0x86dd });
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&MAC_A), "00:11:22:33:44:55");
    }
}

//! OpenFlow 1.3 protocol subset
//!
//! Typed messages for the exact slice of the protocol this controller
//! exercises: handshake, packet-in, flow-mod, packet-out and flow statistics.
//! The wire codec lives in `wire`.

pub mod wire;

use std::net::Ipv4Addr;

pub use wire::WireError;

/// Protocol version negotiated with every switch
pub const OFP_VERSION: u8 = 0x04;

/// Reserved port numbers
pub mod port_no {
    /// Send to controller
    pub const CONTROLLER: u32 = 0xffff_fffd;
    /// Flood to all ports except ingress
    pub const FLOOD: u32 = 0xffff_fffb;
    /// Wildcard port for stats requests
    pub const ANY: u32 = 0xffff_ffff;
}

/// Wildcard group for stats requests
pub const OFPG_ANY: u32 = 0xffff_ffff;
/// Packet-in carried the full frame, nothing buffered on the switch
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;
/// Do not buffer on output-to-controller actions
pub const OFPCML_NO_BUFFER: u16 = 0xffff;
/// All tables wildcard
pub const OFPTT_ALL: u8 = 0xff;

/// Message type codes (ofp_type)
pub mod msg_type {
    pub const HELLO: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const ECHO_REQUEST: u8 = 2;
    pub const ECHO_REPLY: u8 = 3;
    pub const FEATURES_REQUEST: u8 = 5;
    pub const FEATURES_REPLY: u8 = 6;
    pub const PACKET_IN: u8 = 10;
    pub const PACKET_OUT: u8 = 13;
    pub const FLOW_MOD: u8 = 14;
    pub const MULTIPART_REQUEST: u8 = 18;
    pub const MULTIPART_REPLY: u8 = 19;
}

/// Ethertype constants used in match fields
pub mod eth_type {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const LLDP: u16 = 0x88cc;
}

/// Typed OXM match. Absent fields are wildcards on the wire; reads for
/// feature extraction fall back to the documented schema defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMatch {
    pub in_port: Option<u32>,
    pub eth_type: Option<u16>,
    pub ip_proto: Option<u8>,
    pub ipv4_src: Option<Ipv4Addr>,
    pub ipv4_dst: Option<Ipv4Addr>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub udp_src: Option<u16>,
    pub udp_dst: Option<u16>,
    pub icmpv4_type: Option<u8>,
    pub icmpv4_code: Option<u8>,
    /// TCP flags extension OXM, reported by some switches in stats replies
    pub tcp_flags: Option<u16>,
}

impl FlowMatch {
    /// Source IPv4 with schema default
    pub fn ipv4_src_or_default(&self) -> Ipv4Addr {
        self.ipv4_src.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// Destination IPv4 with schema default
    pub fn ipv4_dst_or_default(&self) -> Ipv4Addr {
        self.ipv4_dst.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// Transport source port (TCP or UDP, 0 if neither matched)
    pub fn tp_src(&self) -> u16 {
        self.tcp_src.or(self.udp_src).unwrap_or(0)
    }

    /// Transport destination port (TCP or UDP, 0 if neither matched)
    pub fn tp_dst(&self) -> u16 {
        self.tcp_dst.or(self.udp_dst).unwrap_or(0)
    }

    /// ICMP code, -1 when the entry is not an ICMP match
    pub fn icmp_code_or_default(&self) -> i16 {
        self.icmpv4_code.map(i16::from).unwrap_or(-1)
    }

    /// ICMP type, -1 when the entry is not an ICMP match
    pub fn icmp_type_or_default(&self) -> i16 {
        self.icmpv4_type.map(i16::from).unwrap_or(-1)
    }
}

/// A single flow action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Output to a port (physical or reserved)
    Output(u32),
}

/// One entry of a flow statistics reply
#[derive(Debug, Clone, Default)]
pub struct FlowStatEntry {
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub flags: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub match_fields: FlowMatch,
}

impl FlowStatEntry {
    /// Switch-reported flow age in seconds
    pub fn duration_secs_f64(&self) -> f64 {
        self.duration_sec as f64 + self.duration_nsec as f64 / 1e9
    }
}

/// Decoded switch-to-controller message
#[derive(Debug, Clone)]
pub enum OfEvent {
    Hello,
    EchoRequest(Vec<u8>),
    FeaturesReply { datapath_id: u64 },
    PacketIn { buffer_id: u32, in_port: u32, frame: Vec<u8> },
    FlowStatsReply { entries: Vec<FlowStatEntry> },
    /// Valid message this controller does not act on
    Other { msg_type: u8 },
}

/// Controller-to-switch message
#[derive(Debug, Clone)]
pub enum OfCommand {
    Hello,
    /// Mirrors the request's xid and payload, as the protocol requires
    EchoReply { xid: u32, payload: Vec<u8> },
    FeaturesRequest,
    FlowMod {
        cookie: u64,
        priority: u16,
        idle_timeout: u16,
        hard_timeout: u16,
        /// Buffer to apply the new rule to, if the switch buffered the packet
        buffer_id: Option<u32>,
        match_fields: FlowMatch,
        actions: Vec<Action>,
    },
    PacketOut {
        buffer_id: u32,
        in_port: u32,
        actions: Vec<Action>,
        /// Raw frame, only sent when `buffer_id` is `OFP_NO_BUFFER`
        data: Vec<u8>,
    },
    FlowStatsRequest,
}

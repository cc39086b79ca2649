//! OpenFlow 1.3 wire codec
//!
//! Hand-rolled big-endian encode/decode for the message subset in
//! `proto::OfEvent` / `proto::OfCommand`. Match fields use the OXM TLV
//! format; unknown OXMs in replies are skipped rather than rejected.
//!
//! Switch-side encoders (`encode_packet_in`, `encode_features_reply`,
//! `encode_flow_stats_reply`, ...) are kept here as well so integration
//! tests can act as a switch over a real socket.

use std::net::Ipv4Addr;

use thiserror::Error;

use super::{
    msg_type, port_no, Action, FlowMatch, FlowStatEntry, OfCommand, OfEvent, OFPCML_NO_BUFFER,
    OFPG_ANY, OFPTT_ALL, OFP_NO_BUFFER, OFP_VERSION,
};

/// Fixed message header size
pub const HEADER_LEN: usize = 8;

/// OXM class for OpenFlow basic match fields
const OXM_CLASS_BASIC: u16 = 0x8000;

// OXM field codes (OFPXMT_OFB_*)
const OXM_IN_PORT: u8 = 0;
const OXM_ETH_TYPE: u8 = 5;
const OXM_IP_PROTO: u8 = 10;
const OXM_IPV4_SRC: u8 = 11;
const OXM_IPV4_DST: u8 = 12;
const OXM_TCP_SRC: u8 = 13;
const OXM_TCP_DST: u8 = 14;
const OXM_UDP_SRC: u8 = 15;
const OXM_UDP_DST: u8 = 16;
const OXM_ICMPV4_TYPE: u8 = 19;
const OXM_ICMPV4_CODE: u8 = 20;
const OXM_TCP_FLAGS: u8 = 42;

/// Codec failures. A decode error tears down the offending connection only.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated message: need {need} bytes at offset {at}, have {have}")]
    Truncated { at: usize, need: usize, have: usize },
    #[error("unsupported protocol version {0:#04x}")]
    BadVersion(u8),
    #[error("header length field {0} shorter than the fixed header")]
    BadLength(u16),
    #[error("malformed OXM match structure")]
    BadMatch,
}

/// Parsed message header
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

/// Parse the 8-byte header. Version is not checked here: HELLO may
/// legitimately carry a different version during negotiation.
pub fn parse_header(buf: &[u8; HEADER_LEN]) -> Result<Header, WireError> {
    let length = u16::from_be_bytes([buf[2], buf[3]]);
    if (length as usize) < HEADER_LEN {
        return Err(WireError::BadLength(length));
    }
    Ok(Header {
        version: buf[0],
        msg_type: buf[1],
        length,
        xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
    })
}

fn need(buf: &[u8], at: usize, n: usize) -> Result<(), WireError> {
    if buf.len() < at + n {
        Err(WireError::Truncated {
            at,
            need: n,
            have: buf.len().saturating_sub(at),
        })
    } else {
        Ok(())
    }
}

fn be_u16(buf: &[u8], at: usize) -> Result<u16, WireError> {
    need(buf, at, 2)?;
    Ok(u16::from_be_bytes([buf[at], buf[at + 1]]))
}

fn be_u32(buf: &[u8], at: usize) -> Result<u32, WireError> {
    need(buf, at, 4)?;
    Ok(u32::from_be_bytes([
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
    ]))
}

fn be_u64(buf: &[u8], at: usize) -> Result<u64, WireError> {
    need(buf, at, 8)?;
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    Ok(u64::from_be_bytes(b))
}

fn byte(buf: &[u8], at: usize) -> Result<u8, WireError> {
    need(buf, at, 1)?;
    Ok(buf[at])
}

/// Decode a message body given its header type
pub fn decode(header_type: u8, body: &[u8]) -> Result<OfEvent, WireError> {
    match header_type {
        msg_type::HELLO => Ok(OfEvent::Hello),
        msg_type::ECHO_REQUEST => Ok(OfEvent::EchoRequest(body.to_vec())),
        msg_type::FEATURES_REPLY => Ok(OfEvent::FeaturesReply {
            datapath_id: be_u64(body, 0)?,
        }),
        msg_type::PACKET_IN => decode_packet_in(body),
        msg_type::MULTIPART_REPLY => decode_multipart_reply(body),
        other => Ok(OfEvent::Other { msg_type: other }),
    }
}

fn decode_packet_in(body: &[u8]) -> Result<OfEvent, WireError> {
    let buffer_id = be_u32(body, 0)?;
    // total_len(2) reason(1) table_id(1) cookie(8) then the match
    need(body, 0, 16)?;
    let (m, consumed) = decode_match(&body[16..])?;
    let frame_at = 16 + consumed + 2; // 2 bytes pad between match and data
    need(body, 0, frame_at)?;
    Ok(OfEvent::PacketIn {
        buffer_id,
        in_port: m.in_port.unwrap_or(0),
        frame: body[frame_at..].to_vec(),
    })
}

fn decode_multipart_reply(body: &[u8]) -> Result<OfEvent, WireError> {
    const MP_FLOW: u16 = 1;
    let mp_type = be_u16(body, 0)?;
    if mp_type != MP_FLOW {
        return Ok(OfEvent::Other {
            msg_type: msg_type::MULTIPART_REPLY,
        });
    }
    // flags(2) pad(4), entries start at 8
    let mut entries = Vec::new();
    let mut off = 8usize;
    while off < body.len() {
        let entry_len = be_u16(body, off)? as usize;
        if entry_len < 48 {
            return Err(WireError::BadMatch);
        }
        need(body, off, entry_len)?;
        let (match_fields, _) = decode_match(&body[off + 48..off + entry_len])?;
        entries.push(FlowStatEntry {
            table_id: byte(body, off + 2)?,
            duration_sec: be_u32(body, off + 4)?,
            duration_nsec: be_u32(body, off + 8)?,
            priority: be_u16(body, off + 12)?,
            idle_timeout: be_u16(body, off + 14)?,
            hard_timeout: be_u16(body, off + 16)?,
            flags: be_u16(body, off + 18)?,
            cookie: be_u64(body, off + 24)?,
            packet_count: be_u64(body, off + 32)?,
            byte_count: be_u64(body, off + 40)?,
            match_fields,
        });
        off += entry_len;
    }
    Ok(OfEvent::FlowStatsReply { entries })
}

/// Decode an ofp_match. Returns the match and the padded byte count it
/// occupies in the buffer.
pub fn decode_match(buf: &[u8]) -> Result<(FlowMatch, usize), WireError> {
    let mtype = be_u16(buf, 0)?;
    let length = be_u16(buf, 2)? as usize;
    if mtype != 1 || length < 4 {
        return Err(WireError::BadMatch);
    }
    need(buf, 0, length)?;

    let mut m = FlowMatch::default();
    let mut off = 4usize;
    while off + 4 <= length {
        let class = be_u16(buf, off)?;
        let field_mask = byte(buf, off + 2)?;
        let flen = byte(buf, off + 3)? as usize;
        need(buf, off + 4, flen)?;
        let value = &buf[off + 4..off + 4 + flen];
        let field = field_mask >> 1;
        let has_mask = field_mask & 1 != 0;

        if class == OXM_CLASS_BASIC && !has_mask {
            match (field, flen) {
                (OXM_IN_PORT, 4) => {
                    m.in_port = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
                }
                (OXM_ETH_TYPE, 2) => m.eth_type = Some(u16::from_be_bytes([value[0], value[1]])),
                (OXM_IP_PROTO, 1) => m.ip_proto = Some(value[0]),
                (OXM_IPV4_SRC, 4) => {
                    m.ipv4_src = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
                }
                (OXM_IPV4_DST, 4) => {
                    m.ipv4_dst = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
                }
                (OXM_TCP_SRC, 2) => m.tcp_src = Some(u16::from_be_bytes([value[0], value[1]])),
                (OXM_TCP_DST, 2) => m.tcp_dst = Some(u16::from_be_bytes([value[0], value[1]])),
                (OXM_UDP_SRC, 2) => m.udp_src = Some(u16::from_be_bytes([value[0], value[1]])),
                (OXM_UDP_DST, 2) => m.udp_dst = Some(u16::from_be_bytes([value[0], value[1]])),
                (OXM_ICMPV4_TYPE, 1) => m.icmpv4_type = Some(value[0]),
                (OXM_ICMPV4_CODE, 1) => m.icmpv4_code = Some(value[0]),
                (OXM_TCP_FLAGS, 2) => m.tcp_flags = Some(u16::from_be_bytes([value[0], value[1]])),
                _ => {} // unknown basic field, skip
            }
        }
        off += 4 + flen;
    }

    let padded = (length + 7) & !7;
    need(buf, 0, padded)?;
    Ok((m, padded))
}

fn push_oxm(buf: &mut Vec<u8>, field: u8, value: &[u8]) {
    buf.extend_from_slice(&OXM_CLASS_BASIC.to_be_bytes());
    buf.push(field << 1);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
}

/// Encode an ofp_match with its trailing pad
pub fn encode_match(m: &FlowMatch, out: &mut Vec<u8>) {
    let mut oxms = Vec::new();
    if let Some(p) = m.in_port {
        push_oxm(&mut oxms, OXM_IN_PORT, &p.to_be_bytes());
    }
    if let Some(t) = m.eth_type {
        push_oxm(&mut oxms, OXM_ETH_TYPE, &t.to_be_bytes());
    }
    if let Some(p) = m.ip_proto {
        push_oxm(&mut oxms, OXM_IP_PROTO, &[p]);
    }
    if let Some(ip) = m.ipv4_src {
        push_oxm(&mut oxms, OXM_IPV4_SRC, &ip.octets());
    }
    if let Some(ip) = m.ipv4_dst {
        push_oxm(&mut oxms, OXM_IPV4_DST, &ip.octets());
    }
    if let Some(p) = m.tcp_src {
        push_oxm(&mut oxms, OXM_TCP_SRC, &p.to_be_bytes());
    }
    if let Some(p) = m.tcp_dst {
        push_oxm(&mut oxms, OXM_TCP_DST, &p.to_be_bytes());
    }
    if let Some(p) = m.udp_src {
        push_oxm(&mut oxms, OXM_UDP_SRC, &p.to_be_bytes());
    }
    if let Some(p) = m.udp_dst {
        push_oxm(&mut oxms, OXM_UDP_DST, &p.to_be_bytes());
    }
    if let Some(t) = m.icmpv4_type {
        push_oxm(&mut oxms, OXM_ICMPV4_TYPE, &[t]);
    }
    if let Some(c) = m.icmpv4_code {
        push_oxm(&mut oxms, OXM_ICMPV4_CODE, &[c]);
    }
    if let Some(f) = m.tcp_flags {
        push_oxm(&mut oxms, OXM_TCP_FLAGS, &f.to_be_bytes());
    }

    let length = 4 + oxms.len();
    out.extend_from_slice(&1u16.to_be_bytes()); // OFPMT_OXM
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.extend_from_slice(&oxms);
    let padded = (length + 7) & !7;
    out.resize(out.len() + (padded - length), 0);
}

fn encode_actions(actions: &[Action], out: &mut Vec<u8>) {
    for action in actions {
        match action {
            Action::Output(port) => {
                let max_len = if *port == port_no::CONTROLLER {
                    OFPCML_NO_BUFFER
                } else {
                    0
                };
                out.extend_from_slice(&0u16.to_be_bytes()); // OFPAT_OUTPUT
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out.extend_from_slice(&max_len.to_be_bytes());
                out.extend_from_slice(&[0u8; 6]);
            }
        }
    }
}

fn finish(msg_ty: u8, xid: u32, body: Vec<u8>) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + body.len());
    msg.push(OFP_VERSION);
    msg.push(msg_ty);
    msg.extend_from_slice(&((HEADER_LEN + body.len()) as u16).to_be_bytes());
    msg.extend_from_slice(&xid.to_be_bytes());
    msg.extend_from_slice(&body);
    msg
}

/// Encode a controller-to-switch command. `xid` is the connection's own
/// sequence; echo replies override it with the mirrored request xid.
pub fn encode(cmd: &OfCommand, xid: u32) -> Vec<u8> {
    match cmd {
        OfCommand::Hello => finish(msg_type::HELLO, xid, Vec::new()),
        OfCommand::EchoReply { xid: request_xid, payload } => {
            finish(msg_type::ECHO_REPLY, *request_xid, payload.clone())
        }
        OfCommand::FeaturesRequest => finish(msg_type::FEATURES_REQUEST, xid, Vec::new()),
        OfCommand::FlowMod {
            cookie,
            priority,
            idle_timeout,
            hard_timeout,
            buffer_id,
            match_fields,
            actions,
        } => {
            let mut body = Vec::with_capacity(64);
            body.extend_from_slice(&cookie.to_be_bytes());
            body.extend_from_slice(&0u64.to_be_bytes()); // cookie_mask
            body.push(0); // table_id
            body.push(0); // OFPFC_ADD
            body.extend_from_slice(&idle_timeout.to_be_bytes());
            body.extend_from_slice(&hard_timeout.to_be_bytes());
            body.extend_from_slice(&priority.to_be_bytes());
            body.extend_from_slice(&buffer_id.unwrap_or(OFP_NO_BUFFER).to_be_bytes());
            body.extend_from_slice(&port_no::ANY.to_be_bytes()); // out_port
            body.extend_from_slice(&OFPG_ANY.to_be_bytes()); // out_group
            body.extend_from_slice(&0u16.to_be_bytes()); // flags
            body.extend_from_slice(&[0u8; 2]);
            encode_match(match_fields, &mut body);
            // Single apply-actions instruction, present even when the action
            // list is empty (an empty list is the drop rule).
            let mut action_bytes = Vec::new();
            encode_actions(actions, &mut action_bytes);
            body.extend_from_slice(&4u16.to_be_bytes()); // OFPIT_APPLY_ACTIONS
            body.extend_from_slice(&((8 + action_bytes.len()) as u16).to_be_bytes());
            body.extend_from_slice(&[0u8; 4]);
            body.extend_from_slice(&action_bytes);
            finish(msg_type::FLOW_MOD, xid, body)
        }
        OfCommand::PacketOut {
            buffer_id,
            in_port,
            actions,
            data,
        } => {
            let mut action_bytes = Vec::new();
            encode_actions(actions, &mut action_bytes);
            let mut body = Vec::with_capacity(24 + action_bytes.len() + data.len());
            body.extend_from_slice(&buffer_id.to_be_bytes());
            body.extend_from_slice(&in_port.to_be_bytes());
            body.extend_from_slice(&(action_bytes.len() as u16).to_be_bytes());
            body.extend_from_slice(&[0u8; 6]);
            body.extend_from_slice(&action_bytes);
            if *buffer_id == OFP_NO_BUFFER {
                body.extend_from_slice(data);
            }
            finish(msg_type::PACKET_OUT, xid, body)
        }
        OfCommand::FlowStatsRequest => {
            const MP_FLOW: u16 = 1;
            let mut body = Vec::with_capacity(48);
            body.extend_from_slice(&MP_FLOW.to_be_bytes());
            body.extend_from_slice(&0u16.to_be_bytes()); // flags
            body.extend_from_slice(&[0u8; 4]);
            body.push(OFPTT_ALL);
            body.extend_from_slice(&[0u8; 3]);
            body.extend_from_slice(&port_no::ANY.to_be_bytes());
            body.extend_from_slice(&OFPG_ANY.to_be_bytes());
            body.extend_from_slice(&[0u8; 4]);
            body.extend_from_slice(&0u64.to_be_bytes()); // cookie
            body.extend_from_slice(&0u64.to_be_bytes()); // cookie_mask
            encode_match(&FlowMatch::default(), &mut body);
            finish(msg_type::MULTIPART_REQUEST, xid, body)
        }
    }
}

// =============================================================================
// Switch-side encoders (integration tests / switch simulators)
// =============================================================================

/// Encode a HELLO as a switch would send it
pub fn encode_hello(xid: u32) -> Vec<u8> {
    finish(msg_type::HELLO, xid, Vec::new())
}

/// Encode an ECHO_REQUEST as a switch would send it
pub fn encode_echo_request(payload: &[u8], xid: u32) -> Vec<u8> {
    finish(msg_type::ECHO_REQUEST, xid, payload.to_vec())
}

/// Encode a FEATURES_REPLY announcing `datapath_id`
pub fn encode_features_reply(datapath_id: u64, xid: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(24);
    body.extend_from_slice(&datapath_id.to_be_bytes());
    body.extend_from_slice(&256u32.to_be_bytes()); // n_buffers
    body.push(254); // n_tables
    body.push(0); // auxiliary_id
    body.extend_from_slice(&[0u8; 2]);
    body.extend_from_slice(&0u32.to_be_bytes()); // capabilities
    body.extend_from_slice(&0u32.to_be_bytes()); // reserved
    finish(msg_type::FEATURES_REPLY, xid, body)
}

/// Encode a PACKET_IN delivering `frame` from `in_port`
pub fn encode_packet_in(buffer_id: u32, in_port: u32, frame: &[u8], xid: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(32 + frame.len());
    body.extend_from_slice(&buffer_id.to_be_bytes());
    body.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    body.push(0); // OFPR_NO_MATCH
    body.push(0); // table_id
    body.extend_from_slice(&0u64.to_be_bytes()); // cookie
    let m = FlowMatch {
        in_port: Some(in_port),
        ..Default::default()
    };
    encode_match(&m, &mut body);
    body.extend_from_slice(&[0u8; 2]);
    body.extend_from_slice(frame);
    finish(msg_type::PACKET_IN, xid, body)
}

/// Encode a flow statistics MULTIPART_REPLY
pub fn encode_flow_stats_reply(entries: &[FlowStatEntry], xid: u32) -> Vec<u8> {
    const MP_FLOW: u16 = 1;
    let mut body = Vec::new();
    body.extend_from_slice(&MP_FLOW.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes()); // flags
    body.extend_from_slice(&[0u8; 4]);
    for entry in entries {
        let mut match_bytes = Vec::new();
        encode_match(&entry.match_fields, &mut match_bytes);
        let entry_len = 48 + match_bytes.len();
        body.extend_from_slice(&(entry_len as u16).to_be_bytes());
        body.push(entry.table_id);
        body.push(0);
        body.extend_from_slice(&entry.duration_sec.to_be_bytes());
        body.extend_from_slice(&entry.duration_nsec.to_be_bytes());
        body.extend_from_slice(&entry.priority.to_be_bytes());
        body.extend_from_slice(&entry.idle_timeout.to_be_bytes());
        body.extend_from_slice(&entry.hard_timeout.to_be_bytes());
        body.extend_from_slice(&entry.flags.to_be_bytes());
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&entry.cookie.to_be_bytes());
        body.extend_from_slice(&entry.packet_count.to_be_bytes());
        body.extend_from_slice(&entry.byte_count.to_be_bytes());
        body.extend_from_slice(&match_bytes);
    }
    finish(msg_type::MULTIPART_REPLY, xid, body)
}

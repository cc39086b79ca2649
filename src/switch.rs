//! Per-switch state and the packet-in pipeline
//!
//! Each connected switch gets a `SwitchHandle` for outbound commands and a
//! `SwitchContext` owned by its connection task. `handle_packet_in` is the
//! reactive forwarding pipeline: L2 learning, ARP trust observation,
//! mitigation and rule installation, in that order.

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::frame::{format_mac, parse_frame, FrameBody, Transport};
use crate::mitigation::{decide, MitigationState, Verdict};
use crate::proto::{eth_type, port_no, Action, FlowMatch, OfCommand, OFP_NO_BUFFER};
use crate::rules::{FlowRuleManager, REACTIVE_PRIORITY};
use crate::tables::{ArpTrustTable, MacTable};

/// Cheap clonable handle for sending commands to a switch's writer task
#[derive(Debug, Clone)]
pub struct SwitchHandle {
    pub dpid: u64,
    cmd_tx: mpsc::Sender<OfCommand>,
}

impl SwitchHandle {
    pub fn new(dpid: u64, cmd_tx: mpsc::Sender<OfCommand>) -> Self {
        Self { dpid, cmd_tx }
    }

    /// Whether both handles feed the same connection's writer task
    pub fn same_channel(&self, other: &SwitchHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    /// Queue a command for the switch. Fire-and-forget: a full queue or a
    /// closed connection drops the command with a warning.
    pub fn send(&self, cmd: OfCommand) {
        if let Err(e) = self.cmd_tx.try_send(cmd) {
            warn!(dpid = self.dpid, "dropping command for switch: {e}");
        }
    }
}

/// Learning state owned by one switch's connection task
#[derive(Debug, Default)]
pub struct SwitchContext {
    pub mac_table: MacTable,
    pub arp_trust: ArpTrustTable,
}

impl SwitchContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Timeouts applied to reactive forwarding rules
#[derive(Debug, Clone, Copy)]
pub struct ForwardTimeouts {
    pub idle_secs: u16,
    pub hard_secs: u16,
}

/// Process one packet-in.
///
/// LLDP is dropped before anything else touches state. The source MAC is
/// always learned; the output port is the learned port for the destination
/// or flood. Reactive rules are installed only for IPv4 on a known output
/// port, and only after the mitigation check passes.
pub fn handle_packet_in(
    sw: &SwitchHandle,
    ctx: &mut SwitchContext,
    rules: &FlowRuleManager,
    mitigation: &MitigationState,
    timeouts: ForwardTimeouts,
    buffer_id: u32,
    in_port: u32,
    frame_data: &[u8],
) {
    let frame = match parse_frame(frame_data) {
        Some(frame) => frame,
        None => {
            warn!(dpid = sw.dpid, in_port, len = frame_data.len(), "unparseable frame");
            return;
        }
    };

    if frame.body == FrameBody::Lldp {
        trace!(dpid = sw.dpid, in_port, "ignoring lldp");
        return;
    }

    ctx.mac_table.learn(frame.src_mac, in_port);

    let out_port = match ctx.mac_table.lookup(&frame.dst_mac) {
        Some(port) => port,
        None => port_no::FLOOD,
    };

    if let FrameBody::Arp { sender_ip, .. } = frame.body {
        if ctx.arp_trust.observe(in_port, sender_ip) {
            debug!(
                dpid = sw.dpid,
                in_port,
                ip = %sender_ip,
                mac = %format_mac(&frame.src_mac),
                "arp sender trusted on port"
            );
        }
    }

    // Reactive rule installation for IPv4 once the destination port is known
    if out_port != port_no::FLOOD {
        if let FrameBody::Ipv4 {
            src,
            dst,
            proto,
            transport,
        } = frame.body
        {
            let verdict = decide(
                mitigation.is_enabled(),
                src,
                &ctx.arp_trust.trusted_on(in_port),
            );
            if verdict == Verdict::Block {
                info!(dpid = sw.dpid, in_port, src = %src, "untrusted source, blocking port");
                rules.block_port(sw, in_port);
                return;
            }

            let mut m = FlowMatch {
                eth_type: Some(eth_type::IPV4),
                ipv4_src: Some(src),
                ipv4_dst: Some(dst),
                ip_proto: Some(proto),
                ..Default::default()
            };
            match transport {
                Transport::Tcp { src_port, dst_port } => {
                    m.tcp_src = Some(src_port);
                    m.tcp_dst = Some(dst_port);
                }
                Transport::Udp { src_port, dst_port } => {
                    m.udp_src = Some(src_port);
                    m.udp_dst = Some(dst_port);
                }
                Transport::Icmp {
                    icmp_type,
                    icmp_code,
                } => {
                    m.icmpv4_type = Some(icmp_type);
                    m.icmpv4_code = Some(icmp_code);
                }
                Transport::Other(_) => {}
            }

            if buffer_id != OFP_NO_BUFFER {
                // Switch buffered the packet: the flow-mod both installs the
                // rule and releases the buffer, no packet-out needed.
                rules.install_forward(
                    sw,
                    REACTIVE_PRIORITY,
                    m,
                    out_port,
                    timeouts.idle_secs,
                    timeouts.hard_secs,
                    Some(buffer_id),
                );
                return;
            }
            rules.install_forward(
                sw,
                REACTIVE_PRIORITY,
                m,
                out_port,
                timeouts.idle_secs,
                timeouts.hard_secs,
                None,
            );
        }
    }

    sw.send(OfCommand::PacketOut {
        buffer_id,
        in_port,
        actions: vec![Action::Output(out_port)],
        data: frame_data.to_vec(),
    });
}

//! End-to-end controller scenarios against a scripted switch
//!
//! Each test binds the controller on an ephemeral port and drives it over a
//! real socket using the switch-side encoders from the wire codec.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use flowsentry::config::Config;
use flowsentry::controller::Controller;
use flowsentry::proto::wire::{
    self, decode_match, encode_features_reply, encode_flow_stats_reply, encode_hello,
    encode_packet_in, parse_header, HEADER_LEN,
};
use flowsentry::proto::{msg_type, FlowMatch, FlowStatEntry, OFP_NO_BUFFER};

const MAC_A: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
const MAC_B: [u8; 6] = [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
const DPID: u64 = 0x00_00_00_00_00_00_00_01;

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.output.dataset_path = dir.path().join("dataset.csv");
    // keep the poller out of the scripted exchanges
    config.stats.poll_interval_secs = 3600;
    config
}

struct ScriptedSwitch {
    stream: TcpStream,
}

impl ScriptedSwitch {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self { stream }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn read_message(&mut self) -> (wire::Header, Vec<u8>) {
        let mut header_buf = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header_buf).await.unwrap();
        let header = parse_header(&header_buf).unwrap();
        let mut body = vec![0u8; header.length as usize - HEADER_LEN];
        self.stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    /// Read messages until one of the wanted type arrives
    async fn expect_full(&mut self, wanted: u8) -> (wire::Header, Vec<u8>) {
        for _ in 0..8 {
            let (header, body) = self.read_message().await;
            if header.msg_type == wanted {
                return (header, body);
            }
        }
        panic!("message type {wanted} never arrived");
    }

    async fn expect(&mut self, wanted: u8) -> Vec<u8> {
        self.expect_full(wanted).await.1
    }

    /// No further message should arrive within the window
    async fn expect_silence(&mut self) {
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(200), self.stream.read(&mut buf));
        match read.await {
            Err(_) => {}                       // timed out, good
            Ok(Ok(0)) => {}                    // clean close, also fine
            Ok(other) => panic!("unexpected traffic: {other:?}"),
        }
    }

    /// Hello exchange, features reply and the table-miss install
    async fn handshake(&mut self) {
        self.send(&encode_hello(1)).await;
        self.expect(msg_type::FEATURES_REQUEST).await;
        self.send(&encode_features_reply(DPID, 2)).await;

        let body = self.expect(msg_type::FLOW_MOD).await;
        let mod_ = FlowModView::parse(&body);
        assert_eq!(mod_.priority, 0);
        assert_eq!(mod_.match_fields, FlowMatch::default());
    }
}

/// The flow-mod fields the scenarios assert on
struct FlowModView {
    idle_timeout: u16,
    hard_timeout: u16,
    priority: u16,
    buffer_id: u32,
    match_fields: FlowMatch,
}

impl FlowModView {
    fn parse(body: &[u8]) -> Self {
        let (match_fields, _) = decode_match(&body[40..]).unwrap();
        Self {
            idle_timeout: u16::from_be_bytes([body[18], body[19]]),
            hard_timeout: u16::from_be_bytes([body[20], body[21]]),
            priority: u16::from_be_bytes([body[22], body[23]]),
            buffer_id: u32::from_be_bytes(body[24..28].try_into().unwrap()),
            match_fields,
        }
    }
}

fn tcp_frame(src_mac: [u8; 6], dst_mac: [u8; 6], src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ethernet2(src_mac, dst_mac)
        .ipv4(src, dst, 64)
        .tcp(4000, 80, 1000, 8192)
        .syn();
    let mut out = Vec::new();
    builder.write(&mut out, &[]).unwrap();
    out
}

fn arp_frame(src_mac: [u8; 6], sender_ip: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&0x0806u16.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.push(6);
    frame.push(4);
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&sender_ip);
    frame.extend_from_slice(&[0u8; 6]);
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame
}

async fn with_controller<F, Fut>(config: Config, scenario: F)
where
    F: FnOnce(std::net::SocketAddr) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let controller = Controller::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::select! {
        result = controller.serve(listener) => panic!("serve ended early: {result:?}"),
        _ = scenario(addr) => {}
    }
    controller.shutdown().await;
}

#[tokio::test]
async fn reactive_rule_installed_for_learned_destination() {
    let dir = tempfile::tempdir().unwrap();
    with_controller(test_config(&dir), |addr| async move {
        let mut sw = ScriptedSwitch::connect(addr).await;
        sw.handshake().await;

        // B talks first so its port is learned; the flooded packet-out comes back
        let frame_b = tcp_frame(MAC_B, MAC_A, [10, 0, 0, 1], [10, 0, 0, 5]);
        sw.send(&encode_packet_in(OFP_NO_BUFFER, 7, &frame_b, 3)).await;
        sw.expect(msg_type::PACKET_OUT).await;

        // A to B now has a known output port
        let frame_a = tcp_frame(MAC_A, MAC_B, [10, 0, 0, 5], [10, 0, 0, 1]);
        sw.send(&encode_packet_in(OFP_NO_BUFFER, 2, &frame_a, 4)).await;

        let mod_ = FlowModView::parse(&sw.expect(msg_type::FLOW_MOD).await);
        assert_eq!(mod_.priority, 1);
        assert_eq!(mod_.idle_timeout, 20);
        assert_eq!(mod_.hard_timeout, 100);
        assert_eq!(mod_.buffer_id, OFP_NO_BUFFER);
        assert_eq!(mod_.match_fields.ipv4_src, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(mod_.match_fields.ipv4_dst, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(mod_.match_fields.tcp_src, Some(4000));
        assert_eq!(mod_.match_fields.tcp_dst, Some(80));
        assert_eq!(mod_.match_fields.tcp_flags, None);

        sw.expect(msg_type::PACKET_OUT).await;
    })
    .await;
}

#[tokio::test]
async fn untrusted_source_blocks_port_when_mitigation_on() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.mitigation.enabled = true;

    with_controller(config, |addr| async move {
        let mut sw = ScriptedSwitch::connect(addr).await;
        sw.handshake().await;

        let frame_b = tcp_frame(MAC_B, MAC_A, [10, 0, 0, 1], [10, 0, 0, 5]);
        sw.send(&encode_packet_in(OFP_NO_BUFFER, 7, &frame_b, 3)).await;
        sw.expect(msg_type::PACKET_OUT).await;

        // A never ARPed on port 2: the ingress port gets a drop rule
        let frame_a = tcp_frame(MAC_A, MAC_B, [10, 0, 0, 5], [10, 0, 0, 1]);
        sw.send(&encode_packet_in(OFP_NO_BUFFER, 2, &frame_a, 4)).await;

        let mod_ = FlowModView::parse(&sw.expect(msg_type::FLOW_MOD).await);
        assert_eq!(mod_.priority, 100);
        assert_eq!(mod_.hard_timeout, 120);
        assert_eq!(mod_.match_fields.in_port, Some(2));

        // no forwarding rule and no packet-out follow the block
        sw.expect_silence().await;
    })
    .await;
}

#[tokio::test]
async fn arped_source_forwards_despite_mitigation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.mitigation.enabled = true;

    with_controller(config, |addr| async move {
        let mut sw = ScriptedSwitch::connect(addr).await;
        sw.handshake().await;

        let frame_b = tcp_frame(MAC_B, MAC_A, [10, 0, 0, 1], [10, 0, 0, 5]);
        sw.send(&encode_packet_in(OFP_NO_BUFFER, 7, &frame_b, 3)).await;
        sw.expect(msg_type::PACKET_OUT).await;

        // A announces itself on port 2 first
        sw.send(&encode_packet_in(OFP_NO_BUFFER, 2, &arp_frame(MAC_A, [10, 0, 0, 5]), 4))
            .await;
        sw.expect(msg_type::PACKET_OUT).await;

        let frame_a = tcp_frame(MAC_A, MAC_B, [10, 0, 0, 5], [10, 0, 0, 1]);
        sw.send(&encode_packet_in(OFP_NO_BUFFER, 2, &frame_a, 5)).await;

        let mod_ = FlowModView::parse(&sw.expect(msg_type::FLOW_MOD).await);
        assert_eq!(mod_.priority, 1);
    })
    .await;
}

#[tokio::test]
async fn stats_reply_lands_in_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let dataset = config.output.dataset_path.clone();

    with_controller(config, |addr| async move {
        let mut sw = ScriptedSwitch::connect(addr).await;
        sw.handshake().await;

        let reactive = FlowStatEntry {
            priority: 1,
            duration_sec: 12,
            idle_timeout: 20,
            hard_timeout: 100,
            packet_count: 25,
            byte_count: 2600,
            match_fields: FlowMatch {
                eth_type: Some(0x0800),
                ip_proto: Some(6),
                ipv4_src: Some(Ipv4Addr::new(10, 0, 0, 5)),
                ipv4_dst: Some(Ipv4Addr::new(10, 0, 0, 1)),
                tcp_src: Some(4000),
                tcp_dst: Some(80),
                ..Default::default()
            },
            ..Default::default()
        };
        let table_miss = FlowStatEntry {
            priority: 0,
            packet_count: 999,
            byte_count: 99_999,
            ..Default::default()
        };

        sw.send(&encode_flow_stats_reply(&[reactive, table_miss], 9)).await;

        // give the writer a moment to flush
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(data) = std::fs::read_to_string(&dataset) {
                if data.lines().count() >= 2 {
                    break;
                }
            }
        }

        let data = std::fs::read_to_string(&dataset).unwrap();
        let lines: Vec<_> = data.lines().collect();
        assert_eq!(lines.len(), 2, "header plus exactly one reactive flow");
        assert!(lines[0].starts_with("timestamp,"));
        assert!(lines[1].contains("10.0.0.5-4000-10.0.0.1-80-6"));
        assert!(lines[1].ends_with("BENIGN"));
    })
    .await;
}

#[tokio::test]
async fn echo_requests_are_answered() {
    let dir = tempfile::tempdir().unwrap();
    with_controller(test_config(&dir), |addr| async move {
        let mut sw = ScriptedSwitch::connect(addr).await;
        sw.handshake().await;

        sw.send(&wire::encode_echo_request(b"ping", 77)).await;
        let (header, body) = sw.expect_full(msg_type::ECHO_REPLY).await;
        assert_eq!(header.xid, 77, "reply must mirror the request xid");
        assert_eq!(body, b"ping");
    })
    .await;
}

#[tokio::test]
async fn reconnecting_datapath_survives_old_connection_close() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::new(test_config(&dir)).unwrap();
    let shared = controller.shared();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scenario = async {
        let mut first = ScriptedSwitch::connect(addr).await;
        first.handshake().await;

        // the same datapath comes back over a new connection
        let mut second = ScriptedSwitch::connect(addr).await;
        second.handshake().await;

        // the stale connection closing must not evict the live registration
        drop(first);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(shared.registry.read().contains_key(&DPID));

        // and the live connection is still serviced
        second.send(&wire::encode_echo_request(b"up", 5)).await;
        second.expect(msg_type::ECHO_REPLY).await;
    };

    tokio::select! {
        result = controller.serve(listener) => panic!("serve ended early: {result:?}"),
        _ = scenario => {}
    }
    controller.shutdown().await;
}

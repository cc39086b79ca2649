//! Flow feature schema and derivation
//!
//! One `FeatureRecord` is emitted per flow per poll. The column set mirrors
//! common flow-based intrusion-detection datasets (CICIDS-style). Struct
//! field order is the CSV column order; downstream consumers bind by name or
//! position, so it must not be reordered.
//!
//! Several columns cannot be derived from a single aggregated flow-stats
//! entry and are emitted as zero-valued placeholders rather than omitted:
//! all backward-direction statistics, per-second rate columns, active/idle
//! burst timing, initial window bytes, header-length accounting,
//! bulk-transfer metrics and segment sizes. Consumers must treat those as
//! unpopulated, not as measurements.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::proto::FlowStatEntry;

use super::aggregator::{FlowKey, Sample};

/// One CSV row of per-flow features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    // Identity
    pub timestamp: f64,
    pub datapath_id: u64,
    pub flow_id: String,
    pub ip_src: Ipv4Addr,
    pub tp_src: u16,
    pub ip_dst: Ipv4Addr,
    pub tp_dst: u16,
    pub ip_proto: u8,
    pub icmp_code: i16,
    pub icmp_type: i16,

    // Raw entry fields
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub flags: u16,
    pub packet_count: u64,
    pub byte_count: u64,

    // Rate placeholders
    pub packet_count_per_second: f64,
    pub packet_count_per_nsecond: f64,
    pub byte_count_per_second: f64,
    pub byte_count_per_nsecond: f64,

    // Direction totals; forward comes from the observed cumulative
    // counters, backward is a placeholder
    pub total_fwd_packets: u64,
    pub total_bwd_packets: u64,
    pub total_length_fwd_packets: u64,
    pub total_length_bwd_packets: u64,

    // Per-direction packet length statistics (placeholders)
    pub fwd_packet_length_max: f64,
    pub fwd_packet_length_min: f64,
    pub fwd_packet_length_mean: f64,
    pub fwd_packet_length_std: f64,
    pub bwd_packet_length_max: f64,
    pub bwd_packet_length_min: f64,
    pub bwd_packet_length_mean: f64,
    pub bwd_packet_length_std: f64,

    // Length statistics over the cumulative byte-count series
    pub max_packet_length: f64,
    pub min_packet_length: f64,
    pub packet_length_mean: f64,
    pub packet_length_std: f64,
    pub packet_length_variance: f64,

    // Placeholders: header accounting is not observable from flow counters
    pub fwd_header_length: u16,
    pub bwd_header_length: u16,
    pub min_seg_size_fwd: u16,
    pub act_data_pkt_fwd: u64,

    // Inter-arrival statistics over poll timestamps
    pub flow_iat_mean: f64,
    pub flow_iat_max: f64,
    pub flow_iat_min: f64,
    pub flow_iat_std: f64,
    pub fwd_iat_total: f64,
    pub fwd_iat_max: f64,
    pub fwd_iat_min: f64,
    pub fwd_iat_mean: f64,
    pub fwd_iat_std: f64,
    pub bwd_iat_total: f64,
    pub bwd_iat_max: f64,
    pub bwd_iat_min: f64,
    pub bwd_iat_mean: f64,
    pub bwd_iat_std: f64,

    // TCP flag columns, masked from the match-reported flag bits
    pub fwd_psh_flags: u16,
    pub bwd_psh_flags: u16,
    pub fwd_urg_flags: u16,
    pub bwd_urg_flags: u16,
    pub fin_flag_count: u16,
    pub syn_flag_count: u16,
    pub rst_flag_count: u16,
    pub psh_flag_count: u16,
    pub ack_flag_count: u16,
    pub urg_flag_count: u16,
    pub ece_flag_count: u16,

    pub down_up_ratio: f64,
    pub avg_packet_size: f64,

    // Placeholders: TCP handshake and burst timing
    pub init_win_bytes_fwd: u64,
    pub init_win_bytes_bwd: u64,
    pub active_max: f64,
    pub active_min: f64,
    pub active_mean: f64,
    pub active_std: f64,
    pub idle_max: f64,
    pub idle_min: f64,
    pub idle_mean: f64,
    pub idle_std: f64,

    // Placeholders: bulk transfer
    pub fwd_avg_bytes_bulk: f64,
    pub fwd_avg_packets_bulk: f64,
    pub bwd_avg_bulk_rate: f64,
    pub bwd_avg_packets_bulk: f64,
    pub fwd_avg_bulk_rate: f64,
    pub bwd_avg_bytes_bulk: f64,
    pub avg_fwd_segment_size: f64,
    pub avg_bwd_segment_size: f64,
    pub cwe_flag_count: u16,

    // Subflow totals track the direction totals
    pub subflow_fwd_packets: u64,
    pub subflow_bwd_packets: u64,
    pub subflow_fwd_bytes: u64,
    pub subflow_bwd_bytes: u64,

    pub label: String,
}

/// Derive one record from a flow's accumulated sample series and the
/// current stats entry.
pub fn derive_record(
    poll_ts: f64,
    datapath_id: u64,
    key: &FlowKey,
    entry: &FlowStatEntry,
    samples: &[Sample],
    label: &str,
) -> FeatureRecord {
    let byte_counts: Vec<f64> = samples.iter().map(|s| s.bytes as f64).collect();
    let timestamps: Vec<f64> = samples.iter().map(|s| s.ts).collect();
    let iats: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();

    let total_fwd_packets = entry.packet_count;
    let total_bwd_packets = 0u64;
    let total_length_fwd = entry.byte_count;

    let tcp_flags = entry.match_fields.tcp_flags.unwrap_or(0);

    FeatureRecord {
        timestamp: poll_ts,
        datapath_id,
        flow_id: key.to_string(),
        ip_src: key.ip_src,
        tp_src: key.tp_src,
        ip_dst: key.ip_dst,
        tp_dst: key.tp_dst,
        ip_proto: key.ip_proto,
        icmp_code: entry.match_fields.icmp_code_or_default(),
        icmp_type: entry.match_fields.icmp_type_or_default(),

        duration_sec: entry.duration_sec,
        duration_nsec: entry.duration_nsec,
        idle_timeout: entry.idle_timeout,
        hard_timeout: entry.hard_timeout,
        flags: entry.flags,
        packet_count: entry.packet_count,
        byte_count: entry.byte_count,

        packet_count_per_second: 0.0,
        packet_count_per_nsecond: 0.0,
        byte_count_per_second: 0.0,
        byte_count_per_nsecond: 0.0,

        total_fwd_packets,
        total_bwd_packets,
        total_length_fwd_packets: total_length_fwd,
        total_length_bwd_packets: 0,

        fwd_packet_length_max: 0.0,
        fwd_packet_length_min: 0.0,
        fwd_packet_length_mean: 0.0,
        fwd_packet_length_std: 0.0,
        bwd_packet_length_max: 0.0,
        bwd_packet_length_min: 0.0,
        bwd_packet_length_mean: 0.0,
        bwd_packet_length_std: 0.0,

        max_packet_length: max_of(&byte_counts),
        min_packet_length: min_of(&byte_counts),
        packet_length_mean: mean(&byte_counts),
        packet_length_std: std_dev(&byte_counts),
        packet_length_variance: variance(&byte_counts),

        fwd_header_length: 0,
        bwd_header_length: 0,
        min_seg_size_fwd: 0,
        act_data_pkt_fwd: 0,

        flow_iat_mean: mean(&iats),
        flow_iat_max: max_of(&iats),
        flow_iat_min: min_of(&iats),
        flow_iat_std: std_dev(&iats),
        fwd_iat_total: iats.iter().sum(),
        fwd_iat_max: max_of(&iats),
        fwd_iat_min: min_of(&iats),
        fwd_iat_mean: mean(&iats),
        fwd_iat_std: std_dev(&iats),
        bwd_iat_total: 0.0,
        bwd_iat_max: 0.0,
        bwd_iat_min: 0.0,
        bwd_iat_mean: 0.0,
        bwd_iat_std: 0.0,

        fwd_psh_flags: tcp_flags & 0x08,
        bwd_psh_flags: 0,
        fwd_urg_flags: tcp_flags & 0x20,
        bwd_urg_flags: 0,
        fin_flag_count: tcp_flags & 0x01,
        syn_flag_count: tcp_flags & 0x02,
        rst_flag_count: tcp_flags & 0x04,
        psh_flag_count: tcp_flags & 0x08,
        ack_flag_count: tcp_flags & 0x10,
        urg_flag_count: tcp_flags & 0x20,
        ece_flag_count: tcp_flags & 0x40,

        down_up_ratio: ratio(total_fwd_packets as f64, total_bwd_packets as f64),
        avg_packet_size: mean(&byte_counts),

        init_win_bytes_fwd: 0,
        init_win_bytes_bwd: 0,
        active_max: 0.0,
        active_min: 0.0,
        active_mean: 0.0,
        active_std: 0.0,
        idle_max: 0.0,
        idle_min: 0.0,
        idle_mean: 0.0,
        idle_std: 0.0,

        fwd_avg_bytes_bulk: 0.0,
        fwd_avg_packets_bulk: 0.0,
        bwd_avg_bulk_rate: 0.0,
        bwd_avg_packets_bulk: 0.0,
        fwd_avg_bulk_rate: 0.0,
        bwd_avg_bytes_bulk: 0.0,
        avg_fwd_segment_size: 0.0,
        avg_bwd_segment_size: 0.0,
        cwe_flag_count: 0,

        subflow_fwd_packets: total_fwd_packets,
        subflow_bwd_packets: total_bwd_packets,
        subflow_fwd_bytes: total_length_fwd,
        subflow_bwd_bytes: 0,

        label: label.to_string(),
    }
}

/// Mean of a sample collection, 0 when empty
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance, 0 when empty
fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

/// Population standard deviation, 0 when empty
fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

fn max_of(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
        .unwrap_or(0.0)
}

fn min_of(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
        .unwrap_or(0.0)
}

/// Numerator/denominator with the 0-denominator-means-0 convention
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

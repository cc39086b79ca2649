//! Per-flow counter series and feature derivation driver
//!
//! Keyed by (datapath, 5-tuple). The 5-tuple is directional, exactly as the
//! switch reports it: the two directions of one conversation are two keys.
//! Each key holds a bounded window of cumulative counter samples; the window
//! plus the retirement sweep keep memory bounded over unbounded flow
//! lifetimes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::proto::{FlowMatch, FlowStatEntry};
use crate::rules::REACTIVE_PRIORITY;

use super::features::{derive_record, FeatureRecord};

/// Directional flow identity as reported by the switch's match fields
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip_src: Ipv4Addr,
    pub tp_src: u16,
    pub ip_dst: Ipv4Addr,
    pub tp_dst: u16,
    pub ip_proto: u8,
}

impl FlowKey {
    pub fn from_match(m: &FlowMatch) -> Self {
        Self {
            ip_src: m.ipv4_src_or_default(),
            tp_src: m.tp_src(),
            ip_dst: m.ipv4_dst_or_default(),
            tp_dst: m.tp_dst(),
            ip_proto: m.ip_proto.unwrap_or(0),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.ip_src, self.tp_src, self.ip_dst, self.tp_dst, self.ip_proto
        )
    }
}

/// One poll's cumulative counters for a flow
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Switch-reported flow age in seconds at poll time
    pub ts: f64,
    /// Cumulative packets over the flow entry's life
    pub packets: u64,
    /// Cumulative bytes over the flow entry's life
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct FlowSeries {
    samples: VecDeque<Sample>,
    /// Consecutive polls this key was absent from
    missed: u32,
}

/// Accumulates counter series per flow and derives feature records
#[derive(Debug)]
pub struct FlowAggregator {
    flows: Mutex<HashMap<(u64, FlowKey), FlowSeries>>,
    sample_window: usize,
    retire_cycles: u32,
    label: String,
}

impl FlowAggregator {
    pub fn new(sample_window: usize, retire_cycles: u32, label: String) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            sample_window: sample_window.max(2),
            retire_cycles,
            label,
        }
    }

    /// Process one stats reply for a switch; returns a feature record per
    /// reactive flow entry, in deterministic order.
    pub fn handle_reply(
        &self,
        dpid: u64,
        entries: Vec<FlowStatEntry>,
        poll_time: DateTime<Utc>,
    ) -> Vec<FeatureRecord> {
        let poll_ts = poll_time.timestamp_micros() as f64 / 1e6;

        // Only reactive rules feed feature computation; the table-miss and
        // block rules carry no flow identity.
        let mut entries: Vec<FlowStatEntry> = entries
            .into_iter()
            .filter(|e| e.priority == REACTIVE_PRIORITY)
            .collect();
        entries.sort_by_key(|e| {
            (
                e.match_fields.eth_type.unwrap_or(0),
                e.match_fields.ipv4_src_or_default(),
                e.match_fields.ipv4_dst_or_default(),
                e.match_fields.ip_proto.unwrap_or(0),
            )
        });

        let mut flows = self.flows.lock();
        let mut seen: HashSet<FlowKey> = HashSet::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());

        for entry in &entries {
            let key = FlowKey::from_match(&entry.match_fields);
            seen.insert(key.clone());

            let series = flows.entry((dpid, key.clone())).or_default();

            // Cumulative counters never decrease within one flow entry; a
            // regression means the switch replaced the entry, so the series
            // starts a fresh generation.
            if let Some(last) = series.samples.back() {
                if entry.packet_count < last.packets || entry.byte_count < last.bytes {
                    debug!(dpid, flow = %key, "counter regression, resetting series");
                    series.samples.clear();
                }
            }

            series.samples.push_back(Sample {
                ts: entry.duration_secs_f64(),
                packets: entry.packet_count,
                bytes: entry.byte_count,
            });
            while series.samples.len() > self.sample_window {
                series.samples.pop_front();
            }
            series.missed = 0;

            let samples = series.samples.make_contiguous();
            records.push(derive_record(poll_ts, dpid, &key, entry, samples, &self.label));
        }

        // Retirement sweep: keys of this switch absent from the reply age
        // out after retire_cycles consecutive misses.
        let retire_cycles = self.retire_cycles;
        flows.retain(|(d, key), series| {
            if *d != dpid || seen.contains(key) {
                return true;
            }
            series.missed += 1;
            series.missed <= retire_cycles
        });

        records
    }

    /// Drop every series belonging to a disconnected switch
    pub fn clear_switch(&self, dpid: u64) {
        self.flows.lock().retain(|(d, _), _| *d != dpid);
    }

    /// Number of tracked flow series (all switches)
    pub fn tracked_flows(&self) -> usize {
        self.flows.lock().len()
    }
}

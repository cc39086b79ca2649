//! Per-switch learning tables
//!
//! Both tables are owned by the switch's connection task; nothing else
//! mutates them. They are dropped wholesale when the switch disconnects,
//! so a reconnect starts from empty state.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use crate::frame::MacAddr;

/// MAC address to ingress port learning table
#[derive(Debug, Default)]
pub struct MacTable {
    map: HashMap<MacAddr, u32>,
}

impl MacTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn or overwrite the port for a source MAC
    pub fn learn(&mut self, mac: MacAddr, port: u32) {
        self.map.insert(mac, port);
    }

    /// Port a MAC was last seen on, if any
    pub fn lookup(&self, mac: &MacAddr) -> Option<u32> {
        self.map.get(mac).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Source IPs observed in ARP traffic, per ingress port
///
/// Acts as the trust oracle for mitigation: an IPv4 source that never ARPed
/// on its ingress port is treated as spoofed. Append-only while the switch
/// stays connected.
#[derive(Debug, Default)]
pub struct ArpTrustTable {
    map: HashMap<u32, HashSet<Ipv4Addr>>,
}

impl ArpTrustTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ARP sender IP on a port. Returns true when newly seen.
    pub fn observe(&mut self, port: u32, ip: Ipv4Addr) -> bool {
        self.map.entry(port).or_default().insert(ip)
    }

    /// Whether an IP has ARPed on this port
    pub fn is_trusted(&self, port: u32, ip: &Ipv4Addr) -> bool {
        self.map.get(&port).map(|s| s.contains(ip)).unwrap_or(false)
    }

    /// Trust set for a port; empty set when the port was never seen
    pub fn trusted_on(&self, port: u32) -> HashSet<Ipv4Addr> {
        self.map.get(&port).cloned().unwrap_or_default()
    }
}

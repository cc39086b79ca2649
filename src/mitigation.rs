//! Mitigation decision engine
//!
//! A pure decision function plus the process-wide enable flag. The flag is
//! read on every packet-in by every switch task and written only through the
//! administrative operations here, so it is an atomic rather than a plain
//! shared bool.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Outcome of a mitigation decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block,
}

/// Block iff mitigation is enabled and the source never ARPed on the
/// ingress port. All inputs are explicit; there is no hidden state.
pub fn decide(enabled: bool, src_ip: Ipv4Addr, trusted: &HashSet<Ipv4Addr>) -> Verdict {
    if enabled && !trusted.contains(&src_ip) {
        Verdict::Block
    } else {
        Verdict::Allow
    }
}

/// Process-wide mitigation toggle
#[derive(Debug)]
pub struct MitigationState {
    enabled: AtomicBool,
}

impl MitigationState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Administrative toggle. Enabling when already enabled (and the
    /// converse) is a no-op, never an error.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            info!(enabled, "mitigation toggled");
        }
    }
}

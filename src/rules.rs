//! Flow rule construction and installation
//!
//! Owns the process-wide rule id sequence and the local record of blocked
//! ports. Installs are fire-and-forget: correctness of "at most one active
//! block rule per port" comes from the local record, not from querying the
//! switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::proto::{port_no, Action, FlowMatch, OfCommand};
use crate::switch::SwitchHandle;

/// Table-miss rule priority (matches everything, lowest priority)
pub const TABLE_MISS_PRIORITY: u16 = 0;
/// Reactive forwarding rule priority
pub const REACTIVE_PRIORITY: u16 = 1;
/// Port block rule priority, above anything reactive
pub const BLOCK_PRIORITY: u16 = 100;

/// Monotonic rule id source, unique for the controller's lifetime.
/// The id is carried as the flow-mod cookie for correlation.
#[derive(Debug)]
pub struct RuleIdGen {
    next: AtomicU64,
}

impl RuleIdGen {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RuleIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds and installs forwarding and blocking rules
#[derive(Debug)]
pub struct FlowRuleManager {
    ids: RuleIdGen,
    block_hard_timeout_secs: u16,
    /// (dpid, port) -> expiry of the installed block rule
    blocked: Mutex<HashMap<(u64, u32), Instant>>,
}

impl FlowRuleManager {
    pub fn new(block_hard_timeout_secs: u16) -> Self {
        Self {
            ids: RuleIdGen::new(),
            block_hard_timeout_secs,
            blocked: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_rule_id(&self) -> u64 {
        self.ids.next()
    }

    /// Install the lowest-priority rule that punts unmatched traffic to the
    /// controller. Sent once per switch, on activation.
    pub fn install_table_miss(&self, sw: &SwitchHandle) {
        let cookie = self.next_rule_id();
        sw.send(OfCommand::FlowMod {
            cookie,
            priority: TABLE_MISS_PRIORITY,
            idle_timeout: 0,
            hard_timeout: 0,
            buffer_id: None,
            match_fields: FlowMatch::default(),
            actions: vec![Action::Output(port_no::CONTROLLER)],
        });
        debug!(dpid = sw.dpid, cookie, "installed table-miss rule");
    }

    /// Install or refresh a reactive forwarding rule
    #[allow(clippy::too_many_arguments)]
    pub fn install_forward(
        &self,
        sw: &SwitchHandle,
        priority: u16,
        match_fields: FlowMatch,
        out_port: u32,
        idle_timeout: u16,
        hard_timeout: u16,
        buffer_id: Option<u32>,
    ) {
        let cookie = self.next_rule_id();
        sw.send(OfCommand::FlowMod {
            cookie,
            priority,
            idle_timeout,
            hard_timeout,
            buffer_id,
            match_fields,
            actions: vec![Action::Output(out_port)],
        });
        debug!(dpid = sw.dpid, cookie, out_port, "installed forwarding rule");
    }

    /// Install a drop-everything rule for an ingress port.
    ///
    /// Idempotent: a request for a port whose block rule has not yet expired
    /// is a no-op, so concurrent detections cannot stack drop rules.
    /// Returns true when a rule was actually sent.
    pub fn block_port(&self, sw: &SwitchHandle, port: u32) -> bool {
        let now = Instant::now();
        {
            let mut blocked = self.blocked.lock();
            if let Some(expiry) = blocked.get(&(sw.dpid, port)) {
                if *expiry > now {
                    debug!(dpid = sw.dpid, port, "port already blocked");
                    return false;
                }
            }
            blocked.insert(
                (sw.dpid, port),
                now + Duration::from_secs(self.block_hard_timeout_secs as u64),
            );
        }

        let cookie = self.next_rule_id();
        sw.send(OfCommand::FlowMod {
            cookie,
            priority: BLOCK_PRIORITY,
            idle_timeout: 0,
            hard_timeout: self.block_hard_timeout_secs,
            buffer_id: None,
            match_fields: FlowMatch {
                in_port: Some(port),
                ..Default::default()
            },
            actions: Vec::new(), // empty action list drops
        });
        info!(dpid = sw.dpid, port, cookie, "blocked ingress port");
        true
    }

    /// Whether a block rule for the port is still active by our record
    pub fn is_port_blocked(&self, dpid: u64, port: u32) -> bool {
        self.blocked
            .lock()
            .get(&(dpid, port))
            .map(|expiry| *expiry > Instant::now())
            .unwrap_or(false)
    }

    /// Drop block records for a disconnected switch
    pub fn clear_switch(&self, dpid: u64) {
        self.blocked.lock().retain(|(d, _), _| *d != dpid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(dpid: u64) -> (SwitchHandle, mpsc::Receiver<OfCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (SwitchHandle::new(dpid, tx), rx)
    }

    #[test]
    fn test_rule_ids_strictly_increase() {
        let gen = RuleIdGen::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_block_port_idempotent() {
        let rules = FlowRuleManager::new(120);
        let (sw, mut rx) = handle(0x1);

        assert!(rules.block_port(&sw, 3));
        assert!(!rules.block_port(&sw, 3)); // still active, no-op
        assert!(rules.is_port_blocked(0x1, 3));

        // Exactly one flow-mod went out, with an empty action list
        match rx.try_recv().unwrap() {
            OfCommand::FlowMod {
                priority,
                hard_timeout,
                match_fields,
                actions,
                ..
            } => {
                assert_eq!(priority, BLOCK_PRIORITY);
                assert_eq!(hard_timeout, 120);
                assert_eq!(match_fields.in_port, Some(3));
                assert!(actions.is_empty());
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_block_is_per_switch_port() {
        let rules = FlowRuleManager::new(120);
        let (sw1, _rx1) = handle(0x1);
        let (sw2, _rx2) = handle(0x2);

        assert!(rules.block_port(&sw1, 3));
        assert!(rules.block_port(&sw2, 3)); // same port, other switch
        assert!(rules.is_port_blocked(0x1, 3));
        assert!(rules.is_port_blocked(0x2, 3));
        assert!(!rules.is_port_blocked(0x1, 4));
    }

    #[test]
    fn test_clear_switch_forgets_blocks() {
        let rules = FlowRuleManager::new(120);
        let (sw, mut rx) = handle(0x1);

        assert!(rules.block_port(&sw, 3));
        rules.clear_switch(0x1);
        assert!(!rules.is_port_blocked(0x1, 3));

        // Reconnection may block the port again
        assert!(rules.block_port(&sw, 3));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_table_miss_shape() {
        let rules = FlowRuleManager::new(120);
        let (sw, mut rx) = handle(0x1);

        rules.install_table_miss(&sw);
        match rx.try_recv().unwrap() {
            OfCommand::FlowMod {
                priority,
                idle_timeout,
                hard_timeout,
                match_fields,
                actions,
                ..
            } => {
                assert_eq!(priority, TABLE_MISS_PRIORITY);
                assert_eq!(idle_timeout, 0);
                assert_eq!(hard_timeout, 0);
                assert_eq!(match_fields, FlowMatch::default());
                assert_eq!(actions, vec![Action::Output(port_no::CONTROLLER)]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}

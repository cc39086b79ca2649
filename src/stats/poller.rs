//! Periodic flow statistics polling
//!
//! One task walks the registry of active switches on a fixed interval and
//! sends each a flow-stats request. Replies come back on the per-switch
//! connection tasks and are fed to the aggregator there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::proto::OfCommand;
use crate::switch::SwitchHandle;

/// Registry of active switches, shared with the controller accept loop
pub type SwitchRegistry = Arc<RwLock<HashMap<u64, SwitchHandle>>>;

/// Spawn the stats polling task. Stops when the shutdown channel fires.
pub fn spawn_poller(
    registry: SwitchRegistry,
    poll_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = poll_interval.as_secs(), "stats poller started");
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let switches: Vec<SwitchHandle> =
                        registry.read().values().cloned().collect();
                    debug!(switches = switches.len(), "requesting flow stats");
                    for sw in &switches {
                        sw.send(OfCommand::FlowStatsRequest);
                    }
                }
                _ = shutdown.recv() => {
                    info!("stats poller stopping");
                    break;
                }
            }
        }
    })
}

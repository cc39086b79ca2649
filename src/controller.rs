//! OpenFlow channel and controller lifecycle
//!
//! One task accepts switch connections; each connection gets its own task
//! running the handshake and event loop, plus a writer task that owns the
//! socket's write half and the xid sequence. Global state (rule manager,
//! mitigation flag, aggregator, switch registry) is shared through
//! `ControllerShared`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::mitigation::MitigationState;
use crate::proto::wire::{self, HEADER_LEN};
use crate::proto::{msg_type, OfCommand, OfEvent};
use crate::rules::FlowRuleManager;
use crate::stats::poller::SwitchRegistry;
use crate::stats::{spawn_poller, spawn_writer, FeatureRecord, FlowAggregator};
use crate::switch::{handle_packet_in, ForwardTimeouts, SwitchContext, SwitchHandle};

/// State shared by every connection task and the poller
pub struct ControllerShared {
    pub config: Config,
    pub registry: SwitchRegistry,
    pub rules: FlowRuleManager,
    pub mitigation: MitigationState,
    pub aggregator: FlowAggregator,
    pub feature_tx: mpsc::Sender<FeatureRecord>,
}

/// The controller daemon
pub struct Controller {
    shared: Arc<ControllerShared>,
    poller_shutdown: broadcast::Sender<()>,
    switch_shutdown: broadcast::Sender<()>,
    writer_handle: JoinHandle<()>,
}

impl Controller {
    /// Build the controller and open the dataset for appending
    pub fn new(config: Config) -> Result<Self> {
        let (feature_tx, writer_handle) =
            spawn_writer(&config.output.dataset_path, config.output.record_queue)?;

        let shared = Arc::new(ControllerShared {
            registry: Arc::new(RwLock::new(HashMap::new())),
            rules: FlowRuleManager::new(config.mitigation.block_hard_timeout_secs),
            mitigation: MitigationState::new(config.mitigation.enabled),
            aggregator: FlowAggregator::new(
                config.stats.sample_window,
                config.stats.retire_cycles,
                config.output.label.clone(),
            ),
            feature_tx,
            config,
        });

        let (poller_shutdown, _) = broadcast::channel(1);
        let (switch_shutdown, _) = broadcast::channel(1);

        Ok(Self {
            shared,
            poller_shutdown,
            switch_shutdown,
            writer_handle,
        })
    }

    pub fn shared(&self) -> Arc<ControllerShared> {
        Arc::clone(&self.shared)
    }

    /// Administrative mitigation toggle
    pub fn set_mitigation(&self, enabled: bool) {
        self.shared.mitigation.set_enabled(enabled);
    }

    /// Bind the configured address and accept switch connections until
    /// shutdown
    pub async fn run(&self) -> Result<()> {
        let addr = &self.shared.config.controller.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind OpenFlow channel on {addr}"))?;
        self.serve(listener).await
    }

    /// Accept switch connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr().context("listener address")?, "controller listening");

        let poller = spawn_poller(
            Arc::clone(&self.shared.registry),
            Duration::from_secs(self.shared.config.stats.poll_interval_secs),
            self.poller_shutdown.subscribe(),
        );

        let mut shutdown = self.switch_shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        // transient resource errors (EMFILE and friends) must
                        // not take the whole channel down
                        Err(e) => {
                            warn!("accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    debug!(%peer, "switch connected");
                    let shared = Arc::clone(&self.shared);
                    let shutdown = self.switch_shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = run_connection(shared, stream, peer, shutdown).await {
                            warn!(%peer, "switch connection ended: {e:#}");
                        }
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        poller.await.ok();
        Ok(())
    }

    /// Stop polling first so no stats request races a closing connection,
    /// then tear down the switch connections.
    pub async fn shutdown(self) {
        info!("controller shutting down");
        let _ = self.poller_shutdown.send(());
        let _ = self.switch_shutdown.send(());

        // Writer drains once every feature sender is gone
        drop(self.shared);
        self.writer_handle.await.ok();
    }
}

/// Run one switch connection to completion
async fn run_connection(
    shared: Arc<ControllerShared>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<OfCommand>(shared.config.controller.command_queue);
    let writer_task = tokio::spawn(async move {
        let mut xid: u32 = 1;
        while let Some(cmd) = cmd_rx.recv().await {
            let bytes = wire::encode(&cmd, xid);
            xid = xid.wrapping_add(1);
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("switch write failed: {e}");
                break;
            }
        }
    });

    let mut sw = SwitchHandle::new(0, cmd_tx.clone());
    let mut ctx = SwitchContext::new();
    let mut registered = false;
    let timeouts = ForwardTimeouts {
        idle_secs: shared.config.controller.idle_timeout_secs,
        hard_secs: shared.config.controller.hard_timeout_secs,
    };

    sw.send(OfCommand::Hello);

    let result = loop {
        let mut header_buf = [0u8; HEADER_LEN];
        tokio::select! {
            read = reader.read_exact(&mut header_buf) => {
                if read.is_err() {
                    break Ok(()); // peer closed
                }
            }
            _ = shutdown.recv() => break Ok(()),
        }

        let header = match wire::parse_header(&header_buf) {
            Ok(h) => h,
            Err(e) => break Err(e.into()),
        };
        let mut body = vec![0u8; header.length as usize - HEADER_LEN];
        if reader.read_exact(&mut body).await.is_err() {
            break Ok(());
        }

        let event = match wire::decode(header.msg_type, &body) {
            Ok(event) => event,
            Err(e) => break Err(e.into()),
        };

        match event {
            OfEvent::Hello => {
                sw.send(OfCommand::FeaturesRequest);
            }
            OfEvent::EchoRequest(payload) => {
                sw.send(OfCommand::EchoReply {
                    xid: header.xid,
                    payload,
                });
            }
            OfEvent::FeaturesReply { datapath_id } => {
                sw.dpid = datapath_id;
                let replaced = shared
                    .registry
                    .write()
                    .insert(datapath_id, sw.clone())
                    .is_some();
                if replaced {
                    warn!(dpid = datapath_id, "datapath re-registered, dropping old handle");
                }
                registered = true;
                shared.rules.install_table_miss(&sw);
                info!(dpid = datapath_id, %peer, "switch active");
            }
            OfEvent::PacketIn {
                buffer_id,
                in_port,
                frame,
            } => {
                if !registered {
                    debug!(%peer, "packet-in before features reply, ignored");
                    continue;
                }
                handle_packet_in(
                    &sw,
                    &mut ctx,
                    &shared.rules,
                    &shared.mitigation,
                    timeouts,
                    buffer_id,
                    in_port,
                    &frame,
                );
            }
            OfEvent::FlowStatsReply { entries } => {
                if !registered {
                    continue;
                }
                let records = shared.aggregator.handle_reply(sw.dpid, entries, Utc::now());
                trace!(dpid = sw.dpid, records = records.len(), "stats processed");
                for record in records {
                    if let Err(e) = shared.feature_tx.try_send(record) {
                        error!(dpid = sw.dpid, "feature record dropped: {e}");
                    }
                }
            }
            OfEvent::Other { msg_type: t } => {
                trace!(dpid = sw.dpid, msg_type = t, "ignoring message");
                if t == msg_type::ERROR {
                    debug!(dpid = sw.dpid, "switch reported an error");
                }
            }
        }
    };

    if registered {
        // The datapath may have re-registered over a newer connection; only
        // the connection the registry still points at may tear down state.
        let still_current = {
            let mut registry = shared.registry.write();
            match registry.get(&sw.dpid) {
                Some(current) if current.same_channel(&sw) => {
                    registry.remove(&sw.dpid);
                    true
                }
                _ => false,
            }
        };
        if still_current {
            shared.rules.clear_switch(sw.dpid);
            shared.aggregator.clear_switch(sw.dpid);
            info!(dpid = sw.dpid, %peer, "switch disconnected");
        } else {
            debug!(dpid = sw.dpid, %peer, "superseded connection closed, state kept");
        }
    }
    drop(cmd_tx);
    drop(sw);
    writer_task.await.ok();
    result
}

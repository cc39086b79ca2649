//! flowsentry - reactive OpenFlow controller with flow feature collection
//!
//! A learning-switch controller for OpenFlow 1.3 datapaths that doubles as
//! a traffic dataset collector. Every switch gets reactive forwarding rules
//! installed from packet-ins; flow counters are polled on an interval and
//! turned into per-flow feature rows for offline DDoS model training. An
//! ARP-based trust table drives optional spoofed-source mitigation that
//! blocks the offending ingress port.

pub mod classify;
pub mod config;
pub mod controller;
pub mod frame;
pub mod mitigation;
pub mod proto;
pub mod rules;
pub mod stats;
pub mod switch;
pub mod tables;

pub use config::Config;
pub use controller::Controller;
pub use mitigation::Verdict;
pub use stats::{FeatureRecord, FlowAggregator, FlowKey};
pub use switch::SwitchHandle;

//! Flow statistics pipeline
//!
//! The poller asks every active switch for flow counters on a fixed
//! interval; replies land in the aggregator, which maintains a bounded
//! per-flow sample series and derives one feature record per flow per
//! poll; records are appended to the CSV dataset by a single writer task.

pub mod aggregator;
pub mod features;
pub mod poller;
pub mod writer;

pub use aggregator::{FlowAggregator, FlowKey, Sample};
pub use features::FeatureRecord;
pub use poller::spawn_poller;
pub use writer::spawn_writer;

//! CSV dataset writer task
//!
//! A single task owns the output file; aggregation sends it records over a
//! bounded channel. The header row is written only when the file is new or
//! empty, so restarts append to an existing dataset without corrupting it.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::features::FeatureRecord;

/// Open the dataset for appending and spawn the writer task.
///
/// Returns the record sender and the task handle. The task exits when every
/// sender is dropped.
pub fn spawn_writer(
    path: &Path,
    queue_depth: usize,
) -> Result<(mpsc::Sender<FeatureRecord>, JoinHandle<()>)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open dataset file: {}", path.display()))?;

    let write_header = file
        .metadata()
        .map(|m| m.len() == 0)
        .unwrap_or(true);

    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);

    info!(path = %path.display(), append = !write_header, "dataset writer ready");

    let (tx, mut rx) = mpsc::channel::<FeatureRecord>(queue_depth);
    let handle = tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(record) = rx.recv().await {
            // A failed row is logged and dropped; collection keeps going.
            if let Err(e) = writer.serialize(&record).and_then(|_| writer.flush().map_err(Into::into)) {
                error!(flow = %record.flow_id, "failed to write feature record: {e}");
                continue;
            }
            written += 1;
        }
        debug!(written, "dataset writer stopped");
    });

    Ok((tx, handle))
}

//! Traffic classification over collected feature records
//!
//! The `Classifier` trait is the seam for plugging in a trained model; the
//! built-in `ThresholdClassifier` flags flows by packet rate and exists so
//! collected datasets can be sanity-checked without a model.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::stats::FeatureRecord;

/// Binary flow classifier: true means the flow looks like attack traffic
pub trait Classifier {
    fn predict(&self, rows: &[FeatureRecord]) -> Vec<bool>;
}

/// Flags flows whose packet rate exceeds a fixed threshold
#[derive(Debug, Clone, Copy)]
pub struct ThresholdClassifier {
    /// Packets per second above which a flow is flagged
    pub packets_per_sec: f64,
}

impl ThresholdClassifier {
    pub fn new(packets_per_sec: f64) -> Self {
        Self { packets_per_sec }
    }

    fn rate(record: &FeatureRecord) -> f64 {
        let duration = record.duration_sec as f64 + record.duration_nsec as f64 / 1e9;
        if duration > 0.0 {
            record.packet_count as f64 / duration
        } else {
            0.0
        }
    }
}

impl Classifier for ThresholdClassifier {
    fn predict(&self, rows: &[FeatureRecord]) -> Vec<bool> {
        rows.iter()
            .map(|r| Self::rate(r) > self.packets_per_sec)
            .collect()
    }
}

/// Classification summary for a dataset file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifySummary {
    pub total: usize,
    pub flagged: usize,
}

/// Run a classifier over a collected CSV dataset
pub fn classify_file<C: Classifier>(path: &Path, classifier: &C) -> Result<ClassifySummary> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open dataset file: {}", path.display()))?;

    let mut rows = Vec::new();
    for record in reader.deserialize::<FeatureRecord>() {
        rows.push(record.context("Malformed dataset row")?);
    }

    let verdicts = classifier.predict(&rows);
    let flagged = verdicts.iter().filter(|v| **v).count();
    info!(total = rows.len(), flagged, path = %path.display(), "dataset classified");

    Ok(ClassifySummary {
        total: rows.len(),
        flagged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::FlowStatEntry;
    use crate::stats::aggregator::FlowKey;
    use crate::stats::features::derive_record;
    use std::net::Ipv4Addr;

    fn record(packets: u64, duration_sec: u32) -> FeatureRecord {
        let key = FlowKey {
            ip_src: Ipv4Addr::new(10, 0, 0, 5),
            tp_src: 4000,
            ip_dst: Ipv4Addr::new(10, 0, 0, 1),
            tp_dst: 80,
            ip_proto: 6,
        };
        let entry = FlowStatEntry {
            priority: 1,
            duration_sec,
            packet_count: packets,
            byte_count: packets * 100,
            ..Default::default()
        };
        derive_record(1.0, 0x1, &key, &entry, &[], "BENIGN")
    }

    #[test]
    fn test_threshold_splits_rates() {
        let classifier = ThresholdClassifier::new(100.0);
        let rows = vec![
            record(50, 10),    // 5 pps
            record(10_000, 10), // 1000 pps
        ];
        assert_eq!(classifier.predict(&rows), vec![false, true]);
    }

    #[test]
    fn test_zero_duration_never_flagged() {
        let classifier = ThresholdClassifier::new(0.0);
        let rows = vec![record(10_000, 0)];
        assert_eq!(classifier.predict(&rows), vec![false]);
    }

    #[test]
    fn test_classify_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");

        let mut writer = csv::Writer::from_path(&path).unwrap();
        writer.serialize(record(50, 10)).unwrap();
        writer.serialize(record(10_000, 10)).unwrap();
        writer.flush().unwrap();

        let summary = classify_file(&path, &ThresholdClassifier::new(100.0)).unwrap();
        assert_eq!(
            summary,
            ClassifySummary {
                total: 2,
                flagged: 1
            }
        );
    }
}

//! Failed-partition tracking.
//!
//! Every partition-local failure is counted, emitted as metrics, logged and
//! optionally written to a dead-letter report for later inspection.
//!
//! # Components
//!
//! - [`DeadLetterQueue`] - buffers failure records and writes them as NDJSON
//! - [`FailureTracker`] - per-run tracker feeding metrics and the queue

mod queue;
mod types;

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

use crate::emit;
use crate::error::PartitionError;
use crate::metrics::events::{PartitionFailed, PartitionProcessed, PartitionStatus};

pub use queue::DeadLetterQueue;
pub use types::{FailureStats, PartitionFailure};

/// Tracks the partition failures of one run.
#[derive(Default)]
pub struct FailureTracker {
    failures: Vec<PartitionFailure>,
    stats: FailureStats,
    dlq: Option<Arc<DeadLetterQueue>>,
}

impl FailureTracker {
    pub fn new(dlq: Option<Arc<DeadLetterQueue>>) -> Self {
        Self {
            failures: Vec::new(),
            stats: FailureStats::default(),
            dlq,
        }
    }

    /// Record a failed partition and emit its metrics.
    pub async fn record(&mut self, source_name: &str, err: &PartitionError) -> &PartitionFailure {
        let stage = err.stage();
        let detail = err.detail();
        let error = if detail.is_empty() {
            err.to_string()
        } else {
            format!("{err}: {detail}")
        };

        emit!(PartitionProcessed {
            status: PartitionStatus::Failed,
        });
        emit!(PartitionFailed { stage });
        self.stats.increment(stage);

        let failure = PartitionFailure {
            source_name: source_name.to_string(),
            stage,
            error,
            timestamp: Utc::now(),
        };
        if let Some(dlq) = &self.dlq {
            dlq.record(failure.clone()).await;
        }

        let index = self.failures.len();
        self.failures.push(failure);
        &self.failures[index]
    }

    /// Write the report, logging any error.
    pub async fn finalize(&self) {
        if let Some(dlq) = &self.dlq
            && let Err(e) = dlq.flush().await
        {
            error!("Failed to write failure report: {}", e);
        }
        if self.has_failures() {
            info!(
                "{} partitions failed (scan={}, transform={}, object_write={}, schema_wait={}, discovery={}, query={}, load={})",
                self.stats.total(),
                self.stats.scan,
                self.stats.transform,
                self.stats.object_write,
                self.stats.schema_wait,
                self.stats.discovery,
                self.stats.query,
                self.stats.load
            );
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn count(&self) -> usize {
        self.failures.len()
    }

    pub fn stats(&self) -> &FailureStats {
        &self.stats
    }

    pub fn into_failures(self) -> Vec<PartitionFailure> {
        self.failures
    }
}

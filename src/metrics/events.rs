//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a run. Events
//! implement the `InternalEvent` trait which records the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Stage of the per-partition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Transform,
    ObjectWrite,
    SchemaWait,
    Discovery,
    Query,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Transform => "transform",
            Stage::ObjectWrite => "object_write",
            Stage::SchemaWait => "schema_wait",
            Stage::Discovery => "discovery",
            Stage::Query => "query",
            Stage::Load => "load",
        }
    }
}

/// Final status of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Success,
    Failed,
    /// Not attempted because the run was shut down.
    Skipped,
}

impl PartitionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PartitionStatus::Success => "success",
            PartitionStatus::Failed => "failed",
            PartitionStatus::Skipped => "skipped",
        }
    }
}

/// Event emitted when a partition finishes, whatever the outcome.
pub struct PartitionProcessed {
    pub status: PartitionStatus,
}

impl InternalEvent for PartitionProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Partition processed");
        counter!("avalanche_partitions_processed_total", "status" => self.status.as_str())
            .increment(1);
    }
}

/// Event emitted when a partition fails.
pub struct PartitionFailed {
    pub stage: Stage,
}

impl InternalEvent for PartitionFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Partition failed");
        counter!("avalanche_partition_failures_total", "stage" => self.stage.as_str())
            .increment(1);
    }
}

/// Event emitted when items are read from the key-value source.
pub struct RowsExtracted {
    pub count: u64,
}

impl InternalEvent for RowsExtracted {
    fn emit(self) {
        trace!(count = self.count, "Rows extracted");
        counter!("avalanche_rows_extracted_total").increment(self.count);
    }
}

/// Event emitted when rows are inserted into the relational sink.
pub struct RowsLoaded {
    pub count: u64,
}

impl InternalEvent for RowsLoaded {
    fn emit(self) {
        trace!(count = self.count, "Rows loaded");
        counter!("avalanche_rows_loaded_total").increment(self.count);
    }
}

/// Event emitted when an encoded table is written to object storage.
pub struct BytesWritten {
    pub bytes: u64,
}

impl InternalEvent for BytesWritten {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes written");
        counter!("avalanche_bytes_written_total").increment(self.bytes);
    }
}

/// Event emitted when a stage completes for a partition.
pub struct StageCompleted {
    pub stage: Stage,
    pub duration: Duration,
}

impl InternalEvent for StageCompleted {
    fn emit(self) {
        trace!(
            stage = self.stage.as_str(),
            duration_ms = self.duration.as_millis(),
            "Stage completed"
        );
        histogram!("avalanche_stage_duration_seconds", "stage" => self.stage.as_str())
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted with the number of partitions still to visit.
pub struct PartitionsRemaining {
    pub count: usize,
}

impl InternalEvent for PartitionsRemaining {
    fn emit(self) {
        trace!(count = self.count, "Partitions remaining");
        gauge!("avalanche_partitions_remaining").set(self.count as f64);
    }
}

// ============================================================================
// Poll loop events
// ============================================================================

/// What a poll loop is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    Discovery,
    Query,
    Schema,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollKind::Discovery => "discovery",
            PollKind::Query => "query",
            PollKind::Schema => "schema",
        }
    }
}

/// Event emitted on every status check of an external job.
pub struct PollAttempt {
    pub kind: PollKind,
}

impl InternalEvent for PollAttempt {
    fn emit(self) {
        trace!(kind = self.kind.as_str(), "Poll attempt");
        counter!("avalanche_poll_attempts_total", "kind" => self.kind.as_str()).increment(1);
    }
}

/// Event emitted when a poll loop observes its terminal state.
pub struct PollWaitDuration {
    pub kind: PollKind,
    pub duration: Duration,
}

impl InternalEvent for PollWaitDuration {
    fn emit(self) {
        trace!(
            kind = self.kind.as_str(),
            duration_ms = self.duration.as_millis(),
            "Poll wait finished"
        );
        histogram!("avalanche_poll_wait_seconds", "kind" => self.kind.as_str())
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Head,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Head => "head",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "avalanche_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "avalanche_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

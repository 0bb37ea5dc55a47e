//! Dead-letter report writer.
//!
//! Failed partitions are buffered for the run and written once, as NDJSON,
//! when the run ends. Each run writes its own timestamped object.

use bytes::Bytes;
use chrono::Utc;
use snafu::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::storage::{StorageProvider, StorageProviderRef};

use super::types::PartitionFailure;

/// Buffers failure records and writes them to object storage.
pub struct DeadLetterQueue {
    storage: StorageProviderRef,
    filename: String,
    buffer: Mutex<Vec<PartitionFailure>>,
}

impl DeadLetterQueue {
    /// Create the queue from configuration.
    ///
    /// Returns `None` if no report path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let filename = format!("failures-{timestamp}.ndjson");
        info!("Failure report enabled: {}/{}", dlq_path, filename);

        Ok(Some(Self::new(storage.into(), filename)))
    }

    pub fn new(storage: StorageProviderRef, filename: String) -> Self {
        Self {
            storage,
            filename,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub async fn record(&self, failure: PartitionFailure) {
        debug!(
            "Recording failure of {} at stage {}",
            failure.source_name,
            failure.stage.as_str()
        );
        self.buffer.lock().await.push(failure);
    }

    /// Write every buffered record. Nothing is written when no partition failed.
    pub async fn flush(&self) -> Result<usize, DlqError> {
        let records = std::mem::take(&mut *self.buffer.lock().await);
        if records.is_empty() {
            return Ok(0);
        }

        let mut ndjson = String::new();
        for record in &records {
            ndjson.push_str(&serde_json::to_string(record).context(DlqSerializeSnafu)?);
            ndjson.push('\n');
        }

        self.storage
            .put(&self.filename, Bytes::from(ndjson))
            .await
            .context(DlqWriteSnafu)?;

        info!(
            "Wrote {} failed partitions to {}",
            records.len(),
            self.storage.url_for(&self.filename)
        );
        Ok(records.len())
    }
}

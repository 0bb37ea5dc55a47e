//! Error types for avalanche using snafu.
//!
//! Errors are grouped per concern. Every stage of the per-partition pipeline
//! has its own enum, and [`PartitionError`] tags a stage error with the stage
//! that raised it. Only [`PipelineError`] ever reaches the process boundary.

use snafu::prelude::*;

use crate::config::FieldKind;
use crate::metrics::events::Stage;

// ============ Storage Errors ============

/// Errors that can occur during object storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing, validation and
/// partition resolution. All of them abort the run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No source identifiers were configured.
    #[snafu(display("At least one source must be configured"))]
    EmptySources,

    /// A source identifier is empty or whitespace.
    #[snafu(display("Source at position {index} is empty"))]
    BlankSource { index: usize },

    /// A source identifier holds characters that cannot appear in derived names.
    #[snafu(display(
        "Source '{name}' may only contain ASCII letters, digits, '_', '-' and '.'"
    ))]
    InvalidSource { name: String },

    /// The same source identifier is listed twice.
    #[snafu(display("Source '{name}' is listed more than once"))]
    DuplicateSource { name: String },

    /// A naming template cannot produce distinct names per source.
    #[snafu(display("Naming template '{template}' for {setting} must contain {{source}}"))]
    MissingPlaceholder {
        setting: &'static str,
        template: String,
    },

    /// Two sources render to the same derived name.
    #[snafu(display("Sources '{first}' and '{second}' both derive the {setting} name '{name}'"))]
    NameCollision {
        setting: &'static str,
        name: String,
        first: String,
        second: String,
    },

    /// Storage root is empty.
    #[snafu(display("Storage path cannot be empty"))]
    EmptyStoragePath,

    /// Storage root is not a URL any backend accepts.
    #[snafu(display("Invalid storage path"))]
    StorageUrl { source: StorageError },

    /// Schema has no fields.
    #[snafu(display("Schema must have at least one field"))]
    EmptySchema,

    /// A setting required by the enabled stages is missing.
    #[snafu(display("Setting '{setting}' is required when the {stage} stage is enabled"))]
    MissingSetting {
        setting: &'static str,
        stage: &'static str,
    },

    /// A retry budget was configured as zero.
    #[snafu(display("Setting '{setting}' must be greater than zero"))]
    ZeroBudget { setting: &'static str },

    /// A setting is outside the range the services accept.
    #[snafu(display("Setting '{setting}' {message}"))]
    OutOfRange {
        setting: &'static str,
        message: String,
    },

    /// An enabled stage has no service to talk to.
    #[snafu(display("The {stage} stage is enabled but no {service} was provided"))]
    MissingCollaborator {
        stage: &'static str,
        service: &'static str,
    },

    /// Stage toggles describe a pipeline with a gap in it.
    #[snafu(display("Invalid stage selection: {message}"))]
    InvalidStages { message: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Source Errors ============

/// Errors raised while scanning a key-value table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The credentials used for the scan are no longer valid. Fatal for the run.
    #[snafu(display("Credentials expired while scanning {table}: {message}"))]
    CredentialsExpired { table: String, message: String },

    /// Any other read failure. Local to the partition.
    #[snafu(display("Source {table} unavailable: {message}"))]
    SourceUnavailable { table: String, message: String },
}

impl SourceError {
    /// Returns true if no retry can succeed for the rest of the run.
    pub fn is_credentials_expired(&self) -> bool {
        matches!(self, SourceError::CredentialsExpired { .. })
    }
}

// ============ Transform Errors ============

/// Errors raised while flattening tagged items into rows.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// A present field carries a wire type that cannot be coerced.
    #[snafu(display(
        "Field '{field}' in item {item} is tagged {found}, which cannot be read as {expected}"
    ))]
    SchemaMismatch {
        field: String,
        item: usize,
        expected: FieldKind,
        found: &'static str,
    },

    /// A row did not match the declared column set.
    #[snafu(display("Row has {actual} values but the table declares {expected} columns"))]
    RowWidth { expected: usize, actual: usize },
}

// ============ Sink Errors ============

/// Errors raised by the object sink writer and the relational loader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Writing the encoded table to object storage failed.
    #[snafu(display("Failed to write object {key}"))]
    ObjectWrite { key: String, source: StorageError },

    /// Encoding the table failed.
    #[snafu(display("Failed to encode table: {message}"))]
    Encode { message: String },

    /// Encoded table text could not be parsed back.
    #[snafu(display("Failed to decode table: {message}"))]
    Decode { message: String },

    /// A table or column name cannot be used as a SQL identifier.
    #[snafu(display("Invalid SQL identifier: {identifier:?}"))]
    InvalidIdentifier { identifier: String },

    /// A statement against the relational sink failed.
    #[snafu(display("Write to table {table} failed: {message}"))]
    SinkWrite { table: String, message: String },
}

// ============ Discovery Errors ============

/// Errors raised by the catalog discovery controller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DiscoveryError {
    /// The job could not be started because it does not exist.
    #[snafu(display("Discovery job {job} not found; its creation must have failed"))]
    DiscoveryJobMissing { job: String },

    /// The job did not reach the ready state within the retry budget.
    #[snafu(display("Discovery job {job} not ready after {attempts} status checks"))]
    DiscoveryTimeout { job: String, attempts: u32 },

    /// At least one schema never appeared within the retry budget.
    #[snafu(display("Schemas not available after {attempts} checks: {missing:?}"))]
    SchemasUnavailable { missing: Vec<String>, attempts: u32 },

    /// The job finished but reported a failed run.
    #[snafu(display("Discovery job {job} failed: {reason}"))]
    DiscoveryFailed { job: String, reason: String },

    /// The discovery service rejected or failed a call.
    #[snafu(display("Discovery service error during {operation}: {message}"))]
    DiscoveryService {
        operation: &'static str,
        message: String,
    },

    /// The credentials used for the catalog are no longer valid. Fatal for the run.
    #[snafu(display("Credentials expired during {operation}: {message}"))]
    CatalogCredentialsExpired {
        operation: &'static str,
        message: String,
    },
}

// ============ Query Errors ============

/// Errors raised by the query executor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueryError {
    /// The query ended failed or cancelled. The reason is the service's text.
    #[snafu(display("Query {execution_id} {state}: {reason}"))]
    QueryFailed {
        execution_id: String,
        state: &'static str,
        reason: String,
    },

    /// The query did not reach a terminal state within the retry budget.
    #[snafu(display("Query {execution_id} still running after {attempts} status checks"))]
    QueryTimeout { execution_id: String, attempts: u32 },

    /// The query service rejected or failed a call.
    #[snafu(display("Query service error during {operation}: {message}"))]
    QueryService {
        operation: &'static str,
        message: String,
    },

    /// The credentials used for queries are no longer valid. Fatal for the run.
    #[snafu(display("Credentials expired during {operation}: {message}"))]
    QueryCredentialsExpired {
        operation: &'static str,
        message: String,
    },

    /// The service accepted a query without assigning an execution id.
    #[snafu(display("Query service returned no execution id"))]
    MissingExecutionId,

    /// The result rows do not line up with the result metadata.
    #[snafu(display("Malformed query result"))]
    QueryResultShape { source: TransformError },
}

// ============ Partition Errors ============

/// A failure of one partition, tagged with the stage that raised it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PartitionError {
    #[snafu(display("Scan failed"))]
    Scan { source: SourceError },

    #[snafu(display("Transform failed"))]
    Transform { source: TransformError },

    #[snafu(display("Object write failed"))]
    ObjectSink { source: SinkError },

    #[snafu(display("Schema wait failed"))]
    SchemaWait { source: DiscoveryError },

    #[snafu(display("Discovery failed"))]
    Discovery { source: DiscoveryError },

    #[snafu(display("Query failed"))]
    Query { source: QueryError },

    #[snafu(display("Load failed"))]
    Load { source: SinkError },
}

impl PartitionError {
    /// The pipeline stage this failure belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            PartitionError::Scan { .. } => Stage::Scan,
            PartitionError::Transform { .. } => Stage::Transform,
            PartitionError::ObjectSink { .. } => Stage::ObjectWrite,
            PartitionError::SchemaWait { .. } => Stage::SchemaWait,
            PartitionError::Discovery { .. } => Stage::Discovery,
            PartitionError::Query { .. } => Stage::Query,
            PartitionError::Load { .. } => Stage::Load,
        }
    }

    /// Returns true if this failure must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        match self {
            PartitionError::Scan { source } => source.is_credentials_expired(),
            PartitionError::SchemaWait { source } | PartitionError::Discovery { source } => {
                matches!(source, DiscoveryError::CatalogCredentialsExpired { .. })
            }
            PartitionError::Query { source } => {
                matches!(source, QueryError::QueryCredentialsExpired { .. })
            }
            PartitionError::Transform { .. }
            | PartitionError::ObjectSink { .. }
            | PartitionError::Load { .. } => false,
        }
    }

    /// The chain of underlying causes, joined into one line for logs and reports.
    pub fn detail(&self) -> String {
        let mut causes = Vec::new();
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            causes.push(err.to_string());
            current = err.source();
        }
        causes.join(": ")
    }
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur while writing the failed-partition report.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize a failure record.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Pipeline Error (top-level) ============

/// Errors that abort the whole run. Partition-local failures never become one
/// of these; they are recorded and the run moves on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Credentials expired mid-run; no later partition can succeed.
    #[snafu(display("Run aborted while processing partition {partition}"))]
    ExpiredCredentials {
        partition: String,
        source: PartitionError,
    },

    /// Storage error while setting up the run.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// A collaborator could not be reached during bootstrap.
    #[snafu(display("Failed to connect to {service}: {message}"))]
    Connect {
        service: &'static str,
        message: String,
    },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// DLQ error.
    #[snafu(display("DLQ error"))]
    Dlq { source: DlqError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_expired_credentials_are_fatal() {
        let expired = PartitionError::Scan {
            source: SourceError::CredentialsExpired {
                table: "users".to_string(),
                message: "ExpiredTokenException".to_string(),
            },
        };
        assert!(expired.is_fatal());
        assert_eq!(expired.stage(), Stage::Scan);

        let unavailable = PartitionError::Scan {
            source: SourceError::SourceUnavailable {
                table: "users".to_string(),
                message: "throttled".to_string(),
            },
        };
        assert!(!unavailable.is_fatal());

        let timeout = PartitionError::Discovery {
            source: DiscoveryError::DiscoveryTimeout {
                job: "crawler_users_DEV".to_string(),
                attempts: 5,
            },
        };
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.stage(), Stage::Discovery);
    }

    #[test]
    fn test_expired_catalog_and_query_credentials_are_fatal() {
        let schema_wait = PartitionError::SchemaWait {
            source: DiscoveryError::CatalogCredentialsExpired {
                operation: "get_database",
                message: "ExpiredTokenException".to_string(),
            },
        };
        assert!(schema_wait.is_fatal());

        let discovery = PartitionError::Discovery {
            source: DiscoveryError::CatalogCredentialsExpired {
                operation: "start_crawler",
                message: "UnrecognizedClientException".to_string(),
            },
        };
        assert!(discovery.is_fatal());

        let query = PartitionError::Query {
            source: QueryError::QueryCredentialsExpired {
                operation: "start_query_execution",
                message: "ExpiredTokenException".to_string(),
            },
        };
        assert!(query.is_fatal());

        let throttled = PartitionError::Query {
            source: QueryError::QueryService {
                operation: "start_query_execution",
                message: "ThrottlingException".to_string(),
            },
        };
        assert!(!throttled.is_fatal());
    }

    #[test]
    fn test_query_failed_keeps_reason_verbatim() {
        let err = PartitionError::Query {
            source: QueryError::QueryFailed {
                execution_id: "abc".to_string(),
                state: "failed",
                reason: "SYNTAX_ERROR: line 1:8".to_string(),
            },
        };
        assert!(err.detail().contains("SYNTAX_ERROR: line 1:8"));
    }
}

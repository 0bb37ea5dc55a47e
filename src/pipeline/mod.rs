//! Pipeline orchestration.
//!
//! Partitions are visited one at a time, in the order their sources are
//! configured. Each partition runs the enabled stages strictly in sequence:
//!
//! ```text
//! scan -> transform -> object write -> [force rebuild] -> discovery
//!      -> [schema wait] -> query -> load
//! ```
//!
//! A stage error ends its partition only: it is logged with the partition
//! and stage, recorded, and the run moves on. Expired credentials end the
//! whole run, since no later partition can succeed without them.

mod collaborators;
mod signal;

use snafu::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, StageConfig};
use crate::discovery::{DiscoveryController, DiscoveryJobSpec};
use crate::emit;
use crate::error::{
    ConfigError, ConfigSnafu, DiscoveryError, DiscoverySnafu, DlqSnafu, ExpiredCredentialsSnafu,
    LoadSnafu, MissingCollaboratorSnafu, ObjectSinkSnafu, PartitionError, PipelineError,
    QuerySnafu, ScanSnafu, SchemaWaitSnafu, StorageUrlSnafu, TransformSnafu,
};
use crate::failures::{DeadLetterQueue, FailureTracker, PartitionFailure};
use crate::metrics::events::{
    PartitionProcessed, PartitionStatus, PartitionsRemaining, Stage, StageCompleted,
};
use crate::partition::{PartitionDescriptor, PartitionResolver};
use crate::polling::RetryPolicy;
use crate::query::QueryExecutor;
use crate::sink::{ObjectSinkWriter, RelationalLoader};
use crate::source::Scanner;
use crate::storage::BackendConfig;
use crate::transform::RowTransformer;

pub use collaborators::Collaborators;
pub use signal::{shutdown_signal, shutdown_token};

/// What one partition produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOutcome {
    pub source_name: String,
    /// Items read from the source, when extraction ran.
    pub rows_extracted: Option<usize>,
    /// Size of the written object, when extraction ran.
    pub bytes_written: Option<usize>,
    /// Rows returned by the query, when it ran.
    pub rows_queried: Option<usize>,
    /// Rows inserted into the sink, when loading ran.
    pub rows_loaded: Option<u64>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub completed: Vec<PartitionOutcome>,
    pub failed: Vec<PartitionFailure>,
    /// Partitions never started because of a shutdown request.
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn rows_loaded(&self) -> u64 {
        self.completed.iter().filter_map(|p| p.rows_loaded).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// The stage runners one run uses, built once from configuration.
struct Stages {
    scanner: Option<Scanner>,
    transformer: RowTransformer,
    writer: Option<ObjectSinkWriter>,
    discovery: Option<DiscoveryController>,
    query: Option<QueryExecutor>,
    loader: Option<RelationalLoader>,
}

/// Drives every partition through the enabled stages.
pub struct Pipeline {
    config: Config,
    partitions: Vec<PartitionDescriptor>,
    stages: Stages,
    dlq: Option<Arc<DeadLetterQueue>>,
    shutdown: CancellationToken,
}

fn required<T>(
    value: Option<T>,
    stage: &'static str,
    service: &'static str,
) -> Result<T, ConfigError> {
    value.context(MissingCollaboratorSnafu { stage, service })
}

impl Pipeline {
    /// Resolve partitions and build the stage runners.
    ///
    /// Fails when configuration is invalid or an enabled stage has no
    /// service to talk to.
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        config.validate().context(ConfigSnafu)?;
        let partitions = resolve_partitions(&config).context(ConfigSnafu)?;
        let stages = build_stages(&config, collaborators).context(ConfigSnafu)?;

        Ok(Self {
            config,
            partitions,
            stages,
            dlq: None,
            shutdown,
        })
    }

    /// Record failed partitions to `dlq` as well as to the log.
    pub fn with_dlq(mut self, dlq: Option<Arc<DeadLetterQueue>>) -> Self {
        self.dlq = dlq;
        self
    }

    pub fn partitions(&self) -> &[PartitionDescriptor] {
        &self.partitions
    }

    /// Process every partition.
    ///
    /// Partition-local failures are recorded in the report. Only a fatal
    /// failure returns an error, after the failure report is written.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let stages = self.config.stages;
        info!(
            "Starting run over {} partitions (extract={}, discovery={}, query={}, load={})",
            self.partitions.len(),
            stages.extract,
            stages.discovery,
            stages.query,
            stages.load
        );

        let start = Instant::now();
        let mut failures = FailureTracker::new(self.dlq.clone());
        let mut report = RunReport::default();

        for (index, partition) in self.partitions.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                let remaining = &self.partitions[index..];
                warn!(
                    "Shutdown requested, skipping {} remaining partitions",
                    remaining.len()
                );
                for skipped in remaining {
                    emit!(PartitionProcessed {
                        status: PartitionStatus::Skipped,
                    });
                    report.skipped.push(skipped.source_name.clone());
                }
                break;
            }

            emit!(PartitionsRemaining {
                count: self.partitions.len() - index,
            });
            let source = partition.source_name.as_str();
            info!(
                source,
                "Processing partition {}/{}",
                index + 1,
                self.partitions.len()
            );

            match self.process(partition).await {
                Ok(outcome) => {
                    emit!(PartitionProcessed {
                        status: PartitionStatus::Success,
                    });
                    info!(source, "Partition complete");
                    report.completed.push(outcome);
                }
                Err(err) if err.is_fatal() => {
                    error!(
                        source,
                        stage = err.stage().as_str(),
                        "Aborting run: {}: {}",
                        err,
                        err.detail()
                    );
                    failures.record(source, &err).await;
                    failures.finalize().await;
                    return Err(err).context(ExpiredCredentialsSnafu { partition: source });
                }
                Err(err) => {
                    error!(
                        source,
                        stage = err.stage().as_str(),
                        "Partition failed: {}: {}",
                        err,
                        err.detail()
                    );
                    failures.record(source, &err).await;
                }
            }
        }
        emit!(PartitionsRemaining { count: 0 });

        failures.finalize().await;
        report.failed = failures.into_failures();

        info!(
            "Run finished in {:?}: {} completed, {} failed, {} skipped, {} rows loaded",
            start.elapsed(),
            report.completed.len(),
            report.failed.len(),
            report.skipped.len(),
            report.rows_loaded()
        );
        Ok(report)
    }

    /// Run the enabled stages for one partition, stopping at the first error.
    async fn process(
        &self,
        partition: &PartitionDescriptor,
    ) -> Result<PartitionOutcome, PartitionError> {
        let mut outcome = PartitionOutcome {
            source_name: partition.source_name.clone(),
            ..PartitionOutcome::default()
        };

        if let (Some(scanner), Some(writer)) = (&self.stages.scanner, &self.stages.writer) {
            let items = timed(Stage::Scan, scanner.scan(&partition.source_name))
                .await
                .context(ScanSnafu)?;

            let transform_start = Instant::now();
            let rows = self.stages.transformer.flatten(&items).context(TransformSnafu)?;
            emit!(StageCompleted {
                stage: Stage::Transform,
                duration: transform_start.elapsed(),
            });

            let bytes = timed(Stage::ObjectWrite, writer.write(&rows, &partition.object_key))
                .await
                .context(ObjectSinkSnafu)?;
            outcome.rows_extracted = Some(items.len());
            outcome.bytes_written = Some(bytes);
        }

        if self.config.stages.discovery
            && let Some(discovery) = &self.stages.discovery
        {
            timed(Stage::Discovery, self.discover(discovery, partition))
                .await
                .context(DiscoverySnafu)?;
        }

        let Some(query) = &self.stages.query else {
            return Ok(outcome);
        };

        if self.config.stages.waits_for_schema()
            && let Some(discovery) = &self.stages.discovery
        {
            let wait = &self.config.discovery.schema_wait;
            let policy = RetryPolicy::new(wait.retries, Duration::from_secs(wait.delay_secs));
            timed(
                Stage::SchemaWait,
                discovery.wait_for_schemas_available(
                    std::slice::from_ref(&partition.schema_name),
                    policy,
                ),
            )
            .await
            .context(SchemaWaitSnafu)?;
        }

        let query_text = self.config.query.render(&partition.discovered_table);
        let result_location = self.config.query.result_location.as_deref().unwrap_or_default();
        let rows = timed(
            Stage::Query,
            query.run(&query_text, &partition.schema_name, result_location),
        )
        .await
        .context(QuerySnafu)?;
        outcome.rows_queried = Some(rows.len());

        if let Some(loader) = &self.stages.loader {
            let loaded = timed(Stage::Load, loader.load(&rows, &partition.sink_table_name))
                .await
                .context(LoadSnafu)?;
            outcome.rows_loaded = Some(loaded);
        }

        Ok(outcome)
    }

    async fn discover(
        &self,
        discovery: &DiscoveryController,
        partition: &PartitionDescriptor,
    ) -> Result<(), DiscoveryError> {
        if self.config.discovery.force_rebuild {
            discovery
                .force_rebuild(&partition.schema_name, &partition.discovered_table)
                .await?;
        }

        let job = DiscoveryJobSpec {
            name: partition.discovery_job_name.clone(),
            role: self.config.discovery.role.clone().unwrap_or_default(),
            schema_name: partition.schema_name.clone(),
            target: partition.crawl_target.clone(),
        };
        discovery.ensure_and_run(&job).await
    }
}

/// Await a stage, recording its duration when it succeeds.
async fn timed<T, E>(stage: Stage, work: impl Future<Output = Result<T, E>>) -> Result<T, E> {
    let start = Instant::now();
    let result = work.await;
    if result.is_ok() {
        emit!(StageCompleted {
            stage,
            duration: start.elapsed(),
        });
    }
    result
}

/// The partitions a configuration describes, in source order.
///
/// Crawl targets are built from the canonical form of the storage root, so
/// any spelling the storage layer accepts yields a location the catalog
/// accepts.
pub fn resolve_partitions(config: &Config) -> Result<Vec<PartitionDescriptor>, ConfigError> {
    let storage_root = BackendConfig::parse_url(&config.storage.path)
        .context(StorageUrlSnafu)?
        .root_url();
    PartitionResolver {
        naming: &config.naming,
        environment: &config.environment,
        storage_root: &storage_root,
        format: config.storage.format,
    }
    .resolve(&config.sources)
}

fn build_stages(config: &Config, collaborators: Collaborators) -> Result<Stages, ConfigError> {
    let StageConfig {
        extract,
        discovery,
        query,
        load,
    } = config.stages;
    let Collaborators {
        source,
        storage,
        catalog,
        query: query_service,
        sink,
    } = collaborators;

    let (scanner, writer) = if extract {
        let source = required(source, "extract", "key-value source")?;
        let storage = required(storage, "extract", "object store")?;
        (
            Some(Scanner::new(source, config.extract.retry_policy())),
            Some(ObjectSinkWriter::new(storage, config.storage.format)),
        )
    } else {
        (None, None)
    };

    let discovery = if discovery || config.stages.waits_for_schema() {
        let catalog = required(catalog, "discovery", "catalog service")?;
        Some(DiscoveryController::new(
            catalog,
            config.discovery.retry_policy(),
        ))
    } else {
        None
    };

    let query = if query {
        let service = required(query_service, "query", "query service")?;
        Some(QueryExecutor::new(service, config.query.retry_policy()))
    } else {
        None
    };

    let loader = if load {
        Some(RelationalLoader::new(required(sink, "load", "relational sink")?))
    } else {
        None
    };

    Ok(Stages {
        scanner,
        transformer: RowTransformer::new(config.schema.fields.clone()),
        writer,
        discovery,
        query,
        loader,
    })
}

/// Connect to the configured services and process every partition, stopping
/// between partitions on SIGINT or SIGTERM.
pub async fn run_pipeline(config: Config) -> Result<RunReport, PipelineError> {
    // Configuration errors surface before any service is contacted.
    config.validate().context(ConfigSnafu)?;
    resolve_partitions(&config).context(ConfigSnafu)?;

    let dlq = DeadLetterQueue::from_config(&config.error_handling)
        .await
        .context(DlqSnafu)?
        .map(Arc::new);
    let collaborators = Collaborators::connect(&config).await?;

    Pipeline::new(config, collaborators, shutdown_token())?
        .with_dlq(dlq)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use crate::testing::{InMemoryCatalog, InMemoryQueryService, InMemorySource, RecordingSink};

    fn config(stages: StageConfig) -> Config {
        let mut config = Config::from_yaml(
            r#"
sources: [users, orders]
storage:
  path: "memory://"
schema:
  fields:
    - name: id
discovery:
  role: crawler-role
query:
  result_location: "s3://results/"
sink:
  connection: "host=localhost"
"#,
        )
        .unwrap();
        config.stages = stages;
        config
    }

    #[test]
    fn test_missing_collaborator_rejected() {
        let collaborators =
            Collaborators::default().with_source(Arc::new(InMemorySource::new()));

        let err = Pipeline::new(
            config(StageConfig::ingest()),
            collaborators,
            CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            PipelineError::Config {
                source: ConfigError::MissingCollaborator { stage: "extract", .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_bad_sources_rejected_before_connecting() {
        let mut config = config(StageConfig::default());
        config.sources = vec!["users".to_string(), "users".to_string()];
        config.sink.connection = Some("host=unreachable.invalid connect_timeout=1".to_string());

        let err = run_pipeline(config).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config {
                source: ConfigError::DuplicateSource { .. }
            }
        ));
    }

    #[test]
    fn test_partitions_follow_source_order() {
        let collaborators = Collaborators::default()
            .with_query(Arc::new(InMemoryQueryService::new()))
            .with_catalog(Arc::new(InMemoryCatalog::new()))
            .with_sink(Arc::new(RecordingSink::new()));

        let pipeline = Pipeline::new(
            config(StageConfig::etl()),
            collaborators,
            CancellationToken::new(),
        )
        .unwrap();
        let names: Vec<_> = pipeline
            .partitions()
            .iter()
            .map(|p| p.source_name.as_str())
            .collect();
        assert_eq!(names, ["users", "orders"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_every_partition() {
        let source = Arc::new(InMemorySource::new());
        let collaborators = Collaborators::default()
            .with_source(source.clone())
            .with_storage(Arc::new(StorageProvider::in_memory()))
            .with_catalog(Arc::new(InMemoryCatalog::new()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = Pipeline::new(config(StageConfig::ingest()), collaborators, shutdown)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.skipped, vec!["users", "orders"]);
        assert!(!report.is_success());
        assert_eq!(source.page_requests("users"), 0);
    }

    #[test]
    fn test_report_sums_loaded_rows() {
        let report = RunReport {
            completed: vec![
                PartitionOutcome {
                    rows_loaded: Some(3),
                    ..PartitionOutcome::default()
                },
                PartitionOutcome::default(),
                PartitionOutcome {
                    rows_loaded: Some(4),
                    ..PartitionOutcome::default()
                },
            ],
            ..RunReport::default()
        };
        assert_eq!(report.rows_loaded(), 7);
        assert!(report.is_success());
    }
}

//! avalanche: batch pipeline from key-value tables to a relational sink.
//!
//! Reads every configured source table, stages it in object storage, lets a
//! catalog discovery job infer its schema, queries it, and loads the result
//! into PostgreSQL. Partition failures are logged and reported; only expired
//! credentials or invalid configuration end the process with an error.

use avalanche::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use avalanche::pipeline::{resolve_partitions, run_pipeline};
use avalanche::{Config, metrics};
use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Key-value tables to relational sink batch pipeline.
#[derive(Parser, Debug)]
#[command(name = "avalanche")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration and print derived names.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("avalanche starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if args.dry_run {
        return dry_run(&config);
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let report = run_pipeline(config).await?;

    if report.is_success() {
        info!("Run completed successfully");
    } else {
        warn!(
            "Run completed with {} failed and {} skipped partitions",
            report.failed.len(),
            report.skipped.len()
        );
        for failure in &report.failed {
            warn!(
                "  - {} failed at {}: {}",
                failure.source_name,
                failure.stage.as_str(),
                failure.error
            );
        }
    }
    info!("  Partitions completed: {}", report.completed.len());
    info!("  Rows loaded: {}", report.rows_loaded());

    Ok(())
}

fn dry_run(config: &Config) -> Result<(), PipelineError> {
    info!("Dry run mode - validating configuration");
    let partitions = resolve_partitions(config).context(ConfigSnafu)?;

    let stages = config.stages;
    info!(
        "Stages: extract={}, discovery={}, query={}, load={}",
        stages.extract, stages.discovery, stages.query, stages.load
    );
    info!("Storage: {}", config.storage.path);
    info!("Schema fields: {}", config.schema.fields.len());
    for field in &config.schema.fields {
        info!("  - {}: {}", field.name, field.kind);
    }
    for partition in &partitions {
        info!("Partition {}:", partition.source_name);
        info!("  schema: {}", partition.schema_name);
        info!("  discovery job: {}", partition.discovery_job_name);
        info!("  object: {}", partition.object_key);
        info!("  crawl target: {}", partition.crawl_target);
        info!(
            "  query: {}",
            config.query.render(&partition.discovered_table)
        );
        info!("  sink table: {}", partition.sink_table_name);
    }
    info!("Configuration is valid");
    Ok(())
}

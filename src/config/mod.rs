//! Configuration parsing and validation.
//!
//! Loads the run configuration from a YAML file after environment variable
//! interpolation. One file describes every pipeline shape: the stage toggles
//! pick which of extract, discovery, query and load run for each partition.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub use vars::{interpolate, interpolate_with};

use crate::error::{
    ConfigError, EmptySchemaSnafu, EmptyStoragePathSnafu, EnvInterpolationSnafu,
    InvalidStagesSnafu, MissingSettingSnafu, OutOfRangeSnafu, ReadFileSnafu, YamlParseSnafu,
    ZeroBudgetSnafu,
};
use crate::polling::RetryPolicy;

/// Main configuration structure for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Environment tag folded into derived names (default: "DEV").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Key-value tables to process, one partition each, in this order.
    pub sources: Vec<String>,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub aws: AwsConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub stages: StageConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Error handling configuration (optional).
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

fn default_environment() -> String {
    "DEV".to_string()
}

/// Templates for the names each stage uses.
///
/// `{source}` expands to the source identifier and `{env}` to the
/// environment tag. Every template must contain `{source}` so that distinct
/// sources never share a derived name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    #[serde(default = "default_schema_template")]
    pub schema: String,
    #[serde(default = "default_discovery_job_template")]
    pub discovery_job: String,
    #[serde(default = "default_sink_table_template")]
    pub sink_table: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            schema: default_schema_template(),
            discovery_job: default_discovery_job_template(),
            sink_table: default_sink_table_template(),
        }
    }
}

fn default_schema_template() -> String {
    "glue_database_{source}_{env}".to_string()
}

fn default_discovery_job_template() -> String {
    "crawler_{source}_{env}".to_string()
}

fn default_sink_table_template() -> String {
    "summary_table_{source}".to_string()
}

/// AWS client settings shared by the DynamoDB, Glue and Athena adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Region override (falls back to the SDK's provider chain).
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override, for local emulators.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Object storage root that receives one folder per partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Examples: "s3://bucket/exports", "/tmp/exports"
    pub path: String,
    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default)]
    pub format: FileFormat,
}

/// Encoding used for the objects the discovery job crawls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    /// One JSON object per line.
    Json,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
        }
    }
}

/// The declared fields extracted from every source item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub fields: Vec<FieldConfig>,
}

/// Configuration for a single declared field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
}

/// Scalar kind a declared field is read as.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    String,
    Number,
    Boolean,
    /// Any wire type, rendered as JSON text.
    Json,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Json => "json",
        };
        f.write_str(name)
    }
}

/// Retry budget for transient scan failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Total scan attempts per partition (default: 3).
    #[serde(default = "default_scan_attempts")]
    pub max_attempts: u32,
    /// Delay between scan attempts in seconds (default: 5).
    #[serde(default = "default_scan_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_scan_attempts(),
            retry_delay_secs: default_scan_retry_delay_secs(),
        }
    }
}

impl ExtractConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.retry_delay_secs))
    }
}

fn default_scan_attempts() -> u32 {
    3
}

fn default_scan_retry_delay_secs() -> u64 {
    5
}

/// Discovery job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Role the discovery job runs as (required when discovery is enabled).
    #[serde(default)]
    pub role: Option<String>,
    /// Interval between job status checks (default: 30).
    #[serde(default = "default_discovery_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Status checks before giving up (default: 40).
    #[serde(default = "default_discovery_max_attempts")]
    pub max_attempts: u32,
    /// Delete the previously inferred table before each run.
    #[serde(default)]
    pub force_rebuild: bool,
    /// Budget for waiting on schemas when no discovery job runs.
    #[serde(default)]
    pub schema_wait: SchemaWaitConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            role: None,
            poll_interval_secs: default_discovery_poll_interval_secs(),
            max_attempts: default_discovery_max_attempts(),
            force_rebuild: false,
            schema_wait: SchemaWaitConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.poll_interval_secs),
        )
    }
}

fn default_discovery_poll_interval_secs() -> u64 {
    30
}

fn default_discovery_max_attempts() -> u32 {
    40
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaWaitConfig {
    #[serde(default = "default_schema_wait_retries")]
    pub retries: u32,
    #[serde(default = "default_schema_wait_delay_secs")]
    pub delay_secs: u64,
}

impl Default for SchemaWaitConfig {
    fn default() -> Self {
        Self {
            retries: default_schema_wait_retries(),
            delay_secs: default_schema_wait_delay_secs(),
        }
    }
}

fn default_schema_wait_retries() -> u32 {
    10
}

fn default_schema_wait_delay_secs() -> u64 {
    30
}

/// Query settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Query text; `{table}` expands to the table discovery inferred.
    #[serde(default = "default_query_template")]
    pub template: String,
    /// Where the query service writes result files (required when querying).
    #[serde(default)]
    pub result_location: Option<String>,
    /// Interval between status checks (default: 2).
    #[serde(default = "default_query_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Status checks before giving up (default: 300).
    #[serde(default = "default_query_max_attempts")]
    pub max_attempts: u32,
    /// Rows requested per result page (default: 1000).
    #[serde(default = "default_query_page_size")]
    pub page_size: i32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            template: default_query_template(),
            result_location: None,
            poll_interval_secs: default_query_poll_interval_secs(),
            max_attempts: default_query_max_attempts(),
            page_size: default_query_page_size(),
        }
    }
}

impl QueryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.poll_interval_secs),
        )
    }

    /// Render the query text for a table. The name is double-quoted so
    /// names starting with a digit or holding punctuation stay valid.
    pub fn render(&self, table: &str) -> String {
        let quoted = format!("\"{}\"", table.replace('"', "\"\""));
        self.template.replace("{table}", &quoted)
    }
}

fn default_query_template() -> String {
    "SELECT * FROM {table}".to_string()
}

fn default_query_poll_interval_secs() -> u64 {
    2
}

fn default_query_max_attempts() -> u32 {
    300
}

/// Largest result page the query service accepts.
const MAX_QUERY_PAGE_SIZE: i32 = 1000;

fn default_query_page_size() -> i32 {
    1000
}

/// Relational sink settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    /// libpq-style connection string or URI (required when loading).
    #[serde(default)]
    pub connection: Option<String>,
}

/// Which stages run for each partition.
///
/// The two classic shapes are presets of these flags:
/// - ingest: `extract` + `discovery`
/// - etl: `query` + `load` (waits for each schema to exist first)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    #[serde(default = "enabled")]
    pub extract: bool,
    #[serde(default = "enabled")]
    pub discovery: bool,
    #[serde(default = "enabled")]
    pub query: bool,
    #[serde(default = "enabled")]
    pub load: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            extract: true,
            discovery: true,
            query: true,
            load: true,
        }
    }
}

impl StageConfig {
    pub fn ingest() -> Self {
        Self {
            extract: true,
            discovery: true,
            query: false,
            load: false,
        }
    }

    pub fn etl() -> Self {
        Self {
            extract: false,
            discovery: false,
            query: true,
            load: true,
        }
    }

    /// Returns true if the query stage must first wait for its schema.
    pub fn waits_for_schema(&self) -> bool {
        self.query && !self.discovery
    }
}

fn enabled() -> bool {
    true
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Error handling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Where to write the failed-partition report (optional).
    #[serde(default)]
    pub dlq_path: Option<String>,
    /// Storage options for the report location.
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, interpolating the environment first.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = interpolate(content).map_err(|errors| {
            EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build()
        })?;

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate settings that span sections. Source identifiers and naming
    /// templates are checked when partitions are resolved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stages = &self.stages;
        ensure!(
            stages.extract || stages.discovery || stages.query || stages.load,
            InvalidStagesSnafu {
                message: "no stage is enabled"
            }
        );
        ensure!(
            !stages.load || stages.query,
            InvalidStagesSnafu {
                message: "load needs the query stage to produce rows"
            }
        );

        if stages.extract || stages.discovery {
            ensure!(!self.storage.path.trim().is_empty(), EmptyStoragePathSnafu);
        }
        if stages.extract {
            ensure!(!self.schema.fields.is_empty(), EmptySchemaSnafu);
            ensure!(
                self.extract.max_attempts > 0,
                ZeroBudgetSnafu {
                    setting: "extract.max_attempts"
                }
            );
        }
        if stages.discovery {
            ensure!(
                self.discovery.role.as_deref().is_some_and(|r| !r.is_empty()),
                MissingSettingSnafu {
                    setting: "discovery.role",
                    stage: "discovery"
                }
            );
            ensure!(
                self.discovery.max_attempts > 0,
                ZeroBudgetSnafu {
                    setting: "discovery.max_attempts"
                }
            );
        }
        if stages.waits_for_schema() {
            ensure!(
                self.discovery.schema_wait.retries > 0,
                ZeroBudgetSnafu {
                    setting: "discovery.schema_wait.retries"
                }
            );
        }
        if stages.query {
            ensure!(
                self.query
                    .result_location
                    .as_deref()
                    .is_some_and(|l| !l.is_empty()),
                MissingSettingSnafu {
                    setting: "query.result_location",
                    stage: "query"
                }
            );
            ensure!(
                self.query.max_attempts > 0,
                ZeroBudgetSnafu {
                    setting: "query.max_attempts"
                }
            );
            ensure!(
                (1..=MAX_QUERY_PAGE_SIZE).contains(&self.query.page_size),
                OutOfRangeSnafu {
                    setting: "query.page_size",
                    message: format!(
                        "must be between 1 and {MAX_QUERY_PAGE_SIZE}, got {}",
                        self.query.page_size
                    ),
                }
            );
            ensure!(
                self.query.poll_interval_secs < self.discovery.poll_interval_secs,
                OutOfRangeSnafu {
                    setting: "query.poll_interval_secs",
                    message: format!(
                        "must be shorter than discovery.poll_interval_secs ({}s), got {}s",
                        self.discovery.poll_interval_secs, self.query.poll_interval_secs
                    ),
                }
            );
        }
        if stages.load {
            ensure!(
                self.sink.connection.as_deref().is_some_and(|c| !c.is_empty()),
                MissingSettingSnafu {
                    setting: "sink.connection",
                    stage: "load"
                }
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
environment: PROD
sources: [users, orders]
storage:
  path: "s3://exports-bucket/dynamo"
  format: json
schema:
  fields:
    - name: id
    - name: amount
      type: number
    - name: active
      type: boolean
discovery:
  role: "arn:aws:iam::123456789012:role/crawler"
  force_rebuild: true
query:
  result_location: "s3://exports-bucket/athena/"
sink:
  connection: "host=localhost user=etl dbname=reports"
"#;

    #[test]
    fn test_full_config_parsing() {
        let config: Config = serde_yaml::from_str(FULL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.environment, "PROD");
        assert_eq!(config.sources, vec!["users", "orders"]);
        assert_eq!(config.storage.format, FileFormat::Json);
        assert_eq!(config.schema.fields[0].kind, FieldKind::String);
        assert_eq!(config.schema.fields[1].kind, FieldKind::Number);
        assert!(config.discovery.force_rebuild);
        assert_eq!(config.stages, StageConfig::default());
        assert_eq!(config.query.render("users"), r#"SELECT * FROM "users""#);
    }

    #[test]
    fn test_default_naming_templates() {
        let config: Config = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(config.naming.schema, "glue_database_{source}_{env}");
        assert_eq!(config.naming.discovery_job, "crawler_{source}_{env}");
        assert_eq!(config.naming.sink_table, "summary_table_{source}");
        assert_eq!(config.extract.max_attempts, 3);
        assert_eq!(config.discovery.max_attempts, 40);
        assert!(config.query.poll_interval_secs < config.discovery.poll_interval_secs);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_load_without_query_rejected() {
        let mut config: Config = serde_yaml::from_str(FULL).unwrap();
        config.stages.query = false;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStages { .. }));
    }

    #[test]
    fn test_discovery_requires_role() {
        let mut config: Config = serde_yaml::from_str(FULL).unwrap();
        config.discovery.role = None;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingSetting {
                setting: "discovery.role",
                ..
            }
        ));
    }

    #[test]
    fn test_ingest_preset_needs_no_sink() {
        let mut config: Config = serde_yaml::from_str(FULL).unwrap();
        config.stages = StageConfig::ingest();
        config.sink.connection = None;
        config.query.result_location = None;
        config.validate().unwrap();
    }

    #[test]
    fn test_etl_preset_waits_for_schema() {
        let stages = StageConfig::etl();
        assert!(stages.waits_for_schema());
        assert!(!StageConfig::default().waits_for_schema());
    }

    #[test]
    fn test_render_quotes_table_name() {
        let config: Config = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(
            config.query.render("2024_events"),
            r#"SELECT * FROM "2024_events""#
        );
        assert_eq!(
            config.query.render(r#"odd"name"#),
            r#"SELECT * FROM "odd""name""#
        );
    }

    #[test]
    fn test_page_size_must_fit_service_limit() {
        let mut config: Config = serde_yaml::from_str(FULL).unwrap();
        for page_size in [0, -5, 1001] {
            config.query.page_size = page_size;
            let err = config.validate().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::OutOfRange {
                    setting: "query.page_size",
                    ..
                }
            ));
        }
        config.query.page_size = 1000;
        config.validate().unwrap();
    }

    #[test]
    fn test_query_poll_must_be_faster_than_discovery_poll() {
        let mut config: Config = serde_yaml::from_str(FULL).unwrap();
        config.query.poll_interval_secs = config.discovery.poll_interval_secs;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                setting: "query.poll_interval_secs",
                ..
            }
        ));

        config.stages = StageConfig::etl();
        assert!(config.validate().is_err());

        config.stages = StageConfig::ingest();
        config.validate().unwrap();

        config.stages = StageConfig::etl();
        config.query.poll_interval_secs = 5;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config: Config = serde_yaml::from_str(FULL).unwrap();
        config.query.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroBudget { .. }));
    }
}

//! Integration tests for avalanche configuration and partition resolution.

use avalanche::config::{Config, FieldKind, FileFormat, StageConfig};
use avalanche::error::ConfigError;
use avalanche::pipeline::resolve_partitions;

mod config_tests {
    use super::*;

    #[test]
    fn test_config_yaml_parsing() {
        let yaml = r#"
environment: PROD
sources: [users, orders]
naming:
  sink_table: "reporting_{source}_{env}"
aws:
  region: eu-west-1
storage:
  path: "s3://exports-bucket/dynamo"
  storage_options:
    AWS_REGION: eu-west-1
schema:
  fields:
    - name: id
      type: string
    - name: total
      type: number
    - name: paid
      type: boolean
    - name: lines
      type: json
discovery:
  role: "arn:aws:iam::123456789012:role/crawler"
  poll_interval_secs: 15
query:
  template: "SELECT id, total FROM {table} WHERE paid"
  result_location: "s3://exports-bucket/athena/"
  page_size: 500
sink:
  connection: "postgresql://etl@localhost/reports"
"#;
        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.environment, "PROD");
        assert_eq!(config.aws.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.storage.format, FileFormat::Csv);
        assert_eq!(config.schema.fields.len(), 4);
        assert_eq!(config.schema.fields[3].kind, FieldKind::Json);
        assert_eq!(config.discovery.retry_policy().delay.as_secs(), 15);
        assert_eq!(config.query.page_size, 500);
        assert_eq!(
            config.query.render("orders"),
            r#"SELECT id, total FROM "orders" WHERE paid"#
        );
    }

    #[test]
    fn test_config_defaults() {
        let yaml = r#"
sources: [users]
storage:
  path: "/tmp/exports"
schema:
  fields:
    - name: id
discovery:
  role: crawler
query:
  result_location: "s3://results/"
sink:
  connection: "host=localhost"
"#;
        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.environment, "DEV");
        assert_eq!(config.stages, StageConfig::default());
        assert_eq!(config.extract.retry_policy().max_attempts, 3);
        assert_eq!(config.discovery.schema_wait.retries, 10);
        assert_eq!(config.query.template, "SELECT * FROM {table}");
        assert!(config.error_handling.dlq_path.is_none());
    }

    #[test]
    fn test_etl_config_needs_no_schema_or_role() {
        let yaml = r#"
sources: [users]
storage:
  path: "s3://exports-bucket/dynamo"
stages:
  extract: false
  discovery: false
query:
  result_location: "s3://results/"
sink:
  connection: "host=localhost"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.stages, StageConfig::etl());
        assert!(config.schema.fields.is_empty());
    }

    #[test]
    fn test_env_interpolation() {
        // SAFETY: test-only env var with a unique name
        unsafe {
            std::env::set_var("AVALANCHE_TEST_EXPORT_BUCKET", "exports-from-env");
        }
        let yaml = r#"
sources: [users]
storage:
  path: "s3://${AVALANCHE_TEST_EXPORT_BUCKET}/dynamo"
schema:
  fields:
    - name: id
discovery:
  role: "${AVALANCHE_TEST_CRAWLER_ROLE:-default-crawler}"
stages:
  query: false
  load: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.storage.path, "s3://exports-from-env/dynamo");
        assert_eq!(config.discovery.role.as_deref(), Some("default-crawler"));
    }

    #[test]
    fn test_missing_env_var_reported() {
        let yaml = r#"
sources: [users]
storage:
  path: "s3://${AVALANCHE_TEST_UNSET_BUCKET}/dynamo"
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::EnvInterpolation { .. }));
    }

    #[test]
    fn test_no_stage_enabled_rejected() {
        let yaml = r#"
sources: [users]
storage:
  path: "/tmp/exports"
stages:
  extract: false
  discovery: false
  query: false
  load: false
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStages { .. }));
    }
}

mod partition_tests {
    use super::*;

    fn config(sources: &str) -> Config {
        let yaml = format!(
            r#"
environment: QA
sources: {sources}
storage:
  path: "s3://exports-bucket/dynamo/"
  format: json
schema:
  fields:
    - name: id
stages:
  query: false
  load: false
discovery:
  role: crawler
"#
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_partitions_use_configured_format_and_environment() {
        let partitions = resolve_partitions(&config("[users, orders]")).unwrap();

        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[1].object_key, "orders/orders.json");
        assert_eq!(partitions[1].schema_name, "glue_database_orders_QA");
        assert_eq!(partitions[1].discovery_job_name, "crawler_orders_QA");
        assert_eq!(
            partitions[1].crawl_target,
            "s3://exports-bucket/dynamo/orders/"
        );
    }

    #[test]
    fn test_duplicate_sources_rejected() {
        let err = resolve_partitions(&config("[users, orders, users]")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSource { ref name } if name == "users"));
    }

    #[test]
    fn test_sources_folding_to_one_catalog_schema_rejected() {
        let err = resolve_partitions(&config("[Users, users]")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NameCollision {
                setting: "schema",
                ..
            }
        ));
    }

    #[test]
    fn test_crawl_target_uses_canonical_storage_root() {
        let mut config = config("[users]");
        config.storage.path = "s3a://exports-bucket/dynamo".to_string();
        let partitions = resolve_partitions(&config).unwrap();
        assert_eq!(partitions[0].crawl_target, "s3://exports-bucket/dynamo/users/");

        config.storage.path = "https://s3.eu-west-1.amazonaws.com/exports-bucket/dynamo/".to_string();
        let partitions = resolve_partitions(&config).unwrap();
        assert_eq!(partitions[0].crawl_target, "s3://exports-bucket/dynamo/users/");
    }

    #[test]
    fn test_unparseable_storage_root_rejected() {
        let mut config = config("[users]");
        config.storage.path = "gs://exports-bucket/dynamo".to_string();
        let err = resolve_partitions(&config).unwrap_err();
        assert!(matches!(err, ConfigError::StorageUrl { .. }));
    }

    #[test]
    fn test_template_without_source_rejected() {
        let mut config = config("[a, b]");
        config.naming.discovery_job = "crawler_{env}".to_string();
        let err = resolve_partitions(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingPlaceholder {
                setting: "naming.discovery_job",
                ..
            }
        ));
    }
}

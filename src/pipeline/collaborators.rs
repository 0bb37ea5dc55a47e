//! External services a run talks to, built from configuration.

use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

use crate::aws::load_sdk_config;
use crate::config::Config;
use crate::discovery::{CatalogService, GlueCatalog};
use crate::error::{ConnectSnafu, PipelineError, PipelineStorageSnafu};
use crate::query::{AthenaQueryService, QueryService};
use crate::sink::{PostgresSink, RelationalSink};
use crate::source::{DynamoDbSource, KeyValueSource};
use crate::storage::{StorageProvider, StorageProviderRef};

/// The services behind each stage. A service is only needed when a stage
/// using it is enabled.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub source: Option<Arc<dyn KeyValueSource>>,
    pub storage: Option<StorageProviderRef>,
    pub catalog: Option<Arc<dyn CatalogService>>,
    pub query: Option<Arc<dyn QueryService>>,
    pub sink: Option<Arc<dyn RelationalSink>>,
}

impl Collaborators {
    /// Connect to the production services the enabled stages need:
    /// DynamoDB, object storage, Glue, Athena and PostgreSQL.
    pub async fn connect(config: &Config) -> Result<Self, PipelineError> {
        let stages = config.stages;
        let mut collaborators = Self::default();

        if stages.extract || stages.discovery || stages.query {
            let sdk_config = load_sdk_config(&config.aws).await;
            debug!("Loaded AWS configuration for region {:?}", sdk_config.region());

            if stages.extract {
                collaborators.source = Some(Arc::new(DynamoDbSource::new(&sdk_config)));
            }
            if stages.discovery || stages.waits_for_schema() {
                collaborators.catalog = Some(Arc::new(GlueCatalog::new(&sdk_config)));
            }
            if stages.query {
                collaborators.query = Some(Arc::new(AthenaQueryService::new(
                    &sdk_config,
                    config.query.page_size,
                )));
            }
        }

        if stages.extract {
            let storage = StorageProvider::for_url_with_options(
                &config.storage.path,
                config.storage.storage_options.clone(),
            )
            .await
            .context(PipelineStorageSnafu)?;
            collaborators.storage = Some(Arc::new(storage));
        }

        if stages.load {
            let connection = config.sink.connection.as_deref().unwrap_or_default();
            let sink = PostgresSink::connect(connection).await.map_err(|e| {
                ConnectSnafu {
                    service: "postgres",
                    message: e.to_string(),
                }
                .build()
            })?;
            info!("Connected to relational sink");
            collaborators.sink = Some(Arc::new(sink));
        }

        Ok(collaborators)
    }

    pub fn with_source(mut self, source: Arc<dyn KeyValueSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_storage(mut self, storage: StorageProviderRef) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogService>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_query(mut self, query: Arc<dyn QueryService>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RelationalSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

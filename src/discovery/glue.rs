//! AWS Glue catalog adapter: crawlers, databases and tables.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_glue::Client;
use aws_sdk_glue::types::{
    CrawlerState, CrawlerTargets, DeleteBehavior, LastCrawlStatus, S3Target, SchemaChangePolicy,
    UpdateBehavior,
};

use crate::aws::{ProvideErrorMetadata, ServiceFailure};
use crate::error::DiscoveryError;

use super::{
    CatalogService, CreateOutcome, DeleteOutcome, DiscoveryJobSpec, JobState, StartOutcome,
};

/// Discovery jobs as Glue crawlers over S3 targets.
#[derive(Debug, Clone)]
pub struct GlueCatalog {
    client: Client,
}

impl GlueCatalog {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

fn service_error<E>(operation: &'static str, err: &E) -> DiscoveryError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let failure = ServiceFailure::describe(err);
    if failure.is_credentials_expired() {
        DiscoveryError::CatalogCredentialsExpired {
            operation,
            message: failure.message,
        }
    } else {
        DiscoveryError::DiscoveryService {
            operation,
            message: failure.message,
        }
    }
}

#[async_trait]
impl CatalogService for GlueCatalog {
    async fn create_job(&self, job: &DiscoveryJobSpec) -> Result<CreateOutcome, DiscoveryError> {
        let targets = CrawlerTargets::builder()
            .s3_targets(S3Target::builder().path(&job.target).build())
            .build();
        let policy = SchemaChangePolicy::builder()
            .update_behavior(UpdateBehavior::UpdateInDatabase)
            .delete_behavior(DeleteBehavior::DeprecateInDatabase)
            .build();

        let result = self
            .client
            .create_crawler()
            .name(&job.name)
            .role(&job.role)
            .database_name(&job.schema_name)
            .targets(targets)
            .schema_change_policy(policy)
            .send()
            .await;

        match result {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_already_exists_exception()) =>
            {
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(err) => Err(service_error("create_crawler", &err)),
        }
    }

    async fn start_job(&self, name: &str) -> Result<StartOutcome, DiscoveryError> {
        match self.client.start_crawler().name(name).send().await {
            Ok(_) => Ok(StartOutcome::Started),
            Err(err) => match err.as_service_error() {
                Some(e) if e.is_crawler_running_exception() => Ok(StartOutcome::AlreadyRunning),
                Some(e) if e.is_entity_not_found_exception() => Ok(StartOutcome::NotFound),
                _ => Err(service_error("start_crawler", &err)),
            },
        }
    }

    async fn job_state(&self, name: &str) -> Result<JobState, DiscoveryError> {
        let output = match self.client.get_crawler().name(name).send().await {
            Ok(output) => output,
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_entity_not_found_exception()) =>
            {
                return Err(DiscoveryError::DiscoveryJobMissing {
                    job: name.to_string(),
                });
            }
            Err(err) => return Err(service_error("get_crawler", &err)),
        };

        let Some(crawler) = output.crawler() else {
            return Err(DiscoveryError::DiscoveryJobMissing {
                job: name.to_string(),
            });
        };

        let state = match crawler.state() {
            Some(CrawlerState::Running) => JobState::Running,
            Some(CrawlerState::Stopping) => JobState::Stopping,
            Some(CrawlerState::Ready) | None => {
                let last_crawl = crawler.last_crawl();
                match last_crawl.and_then(|c| c.status()) {
                    Some(LastCrawlStatus::Failed) => JobState::Failed {
                        reason: last_crawl
                            .and_then(|c| c.error_message())
                            .unwrap_or("crawl failed")
                            .to_string(),
                    },
                    Some(LastCrawlStatus::Cancelled) => JobState::Failed {
                        reason: "crawl cancelled".to_string(),
                    },
                    _ => JobState::Ready,
                }
            }
            Some(other) => {
                return Err(DiscoveryError::DiscoveryService {
                    operation: "get_crawler",
                    message: format!("unexpected crawler state {}", other.as_str()),
                });
            }
        };
        Ok(state)
    }

    async fn delete_table(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<DeleteOutcome, DiscoveryError> {
        let result = self
            .client
            .delete_table()
            .database_name(schema)
            .name(table)
            .send()
            .await;

        match result {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_entity_not_found_exception()) =>
            {
                Ok(DeleteOutcome::NotFound)
            }
            Err(err) => Err(service_error("delete_table", &err)),
        }
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool, DiscoveryError> {
        match self.client.get_database().name(schema).send().await {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_entity_not_found_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(service_error("get_database", &err)),
        }
    }
}

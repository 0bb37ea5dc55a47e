//! Catalog discovery.
//!
//! A discovery job crawls a partition's object folder and registers the
//! inferred table under the partition's schema. The controller drives the job
//! idempotently: an existing job is reused and a running job is waited on.
//! Every wait is bounded by a [`RetryPolicy`].

mod glue;

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::metrics::events::PollKind;
use crate::polling::{PollError, RetryPolicy, poll_until};

pub use glue::GlueCatalog;

/// What a discovery job crawls and where it registers the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryJobSpec {
    pub name: String,
    /// Identity the job runs as.
    pub role: String,
    pub schema_name: String,
    /// Absolute object-store location to crawl.
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    NotFound,
}

/// Observed state of a discovery job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Idle, with its last run successful (or no run yet).
    Ready,
    Running,
    Stopping,
    /// Idle, with its last run failed.
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// The catalog service hosting discovery jobs and inferred schemas.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn create_job(&self, job: &DiscoveryJobSpec) -> Result<CreateOutcome, DiscoveryError>;

    async fn start_job(&self, name: &str) -> Result<StartOutcome, DiscoveryError>;

    async fn job_state(&self, name: &str) -> Result<JobState, DiscoveryError>;

    /// Delete an inferred table definition.
    async fn delete_table(&self, schema: &str, table: &str)
    -> Result<DeleteOutcome, DiscoveryError>;

    async fn schema_exists(&self, schema: &str) -> Result<bool, DiscoveryError>;
}

/// Drives discovery jobs and schema waits against a [`CatalogService`].
#[derive(Clone)]
pub struct DiscoveryController {
    catalog: Arc<dyn CatalogService>,
    poll: RetryPolicy,
}

impl DiscoveryController {
    /// `poll` bounds the wait for a started job to become ready.
    pub fn new(catalog: Arc<dyn CatalogService>, poll: RetryPolicy) -> Self {
        Self { catalog, poll }
    }

    /// Create the job if absent, start it unless it is already running, and
    /// wait until it is ready.
    pub async fn ensure_and_run(&self, job: &DiscoveryJobSpec) -> Result<(), DiscoveryError> {
        match self.catalog.create_job(job).await? {
            CreateOutcome::Created => info!("Created discovery job {}", job.name),
            CreateOutcome::AlreadyExists => info!("Discovery job {} already exists", job.name),
        }

        match self.catalog.start_job(&job.name).await? {
            StartOutcome::Started => info!("Started discovery job {}", job.name),
            StartOutcome::AlreadyRunning => {
                warn!("Discovery job {} is already running", job.name)
            }
            StartOutcome::NotFound => {
                return Err(DiscoveryError::DiscoveryJobMissing {
                    job: job.name.clone(),
                });
            }
        }

        let outcome = poll_until(self.poll, PollKind::Discovery, &job.name, |_| async move {
            let state = self.catalog.job_state(&job.name).await?;
            Ok::<_, DiscoveryError>(match state {
                JobState::Ready => Poll::Ready(Ok(())),
                JobState::Failed { reason } => Poll::Ready(Err(reason)),
                JobState::Running | JobState::Stopping => Poll::Pending,
            })
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!("Discovery job {} is ready", job.name);
                Ok(())
            }
            Ok(Err(reason)) => Err(DiscoveryError::DiscoveryFailed {
                job: job.name.clone(),
                reason,
            }),
            Err(PollError::Exhausted { attempts }) => Err(DiscoveryError::DiscoveryTimeout {
                job: job.name.clone(),
                attempts,
            }),
            Err(PollError::Check(err)) => Err(err),
        }
    }

    /// Delete the previously inferred table so the next run infers the
    /// schema from scratch. A missing table is not an error.
    pub async fn force_rebuild(&self, schema: &str, table: &str) -> Result<(), DiscoveryError> {
        match self.catalog.delete_table(schema, table).await? {
            DeleteOutcome::Deleted => info!("Deleted table {}.{} for rebuild", schema, table),
            DeleteOutcome::NotFound => debug!("No table {}.{} to delete", schema, table),
        }
        Ok(())
    }

    /// Wait until every schema in `names` exists in the same pass.
    ///
    /// Each pass checks all names; any missing one sleeps `policy.delay`
    /// before the next full pass.
    pub async fn wait_for_schemas_available(
        &self,
        names: &[String],
        policy: RetryPolicy,
    ) -> Result<(), DiscoveryError> {
        let last_missing = Mutex::new(Vec::new());
        let missing_slot = &last_missing;
        let target = names.join(",");

        let outcome = poll_until(policy, PollKind::Schema, &target, |_| async move {
            let mut missing = Vec::new();
            for name in names {
                if !self.catalog.schema_exists(name).await? {
                    missing.push(name.clone());
                }
            }

            if missing.is_empty() {
                return Ok::<_, DiscoveryError>(Poll::Ready(()));
            }
            debug!("Schemas not yet available: {:?}", missing);
            *missing_slot.lock().unwrap_or_else(PoisonError::into_inner) = missing;
            Ok(Poll::Pending)
        })
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(PollError::Exhausted { attempts }) => Err(DiscoveryError::SchemasUnavailable {
                missing: last_missing
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner),
                attempts,
            }),
            Err(PollError::Check(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CatalogCall, InMemoryCatalog};
    use std::time::Duration;

    fn job() -> DiscoveryJobSpec {
        DiscoveryJobSpec {
            name: "crawler_users_DEV".to_string(),
            role: "crawler-role".to_string(),
            schema_name: "glue_database_users_DEV".to_string(),
            target: "s3://bucket/exports/users".to_string(),
        }
    }

    fn controller(catalog: Arc<InMemoryCatalog>, attempts: u32) -> DiscoveryController {
        DiscoveryController::new(catalog, RetryPolicy::new(attempts, Duration::from_secs(30)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_and_run_creates_starts_and_waits() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_run_polls(2);

        controller(catalog.clone(), 5)
            .ensure_and_run(&job())
            .await
            .unwrap();

        let calls = catalog.calls();
        assert_eq!(calls[0], CatalogCall::Create("crawler_users_DEV".to_string()));
        assert_eq!(calls[1], CatalogCall::Start("crawler_users_DEV".to_string()));
        assert_eq!(catalog.state_checks("crawler_users_DEV"), 3);
        assert!(catalog.schema_registered("glue_database_users_DEV"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_and_run_twice_is_idempotent() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let controller = controller(catalog.clone(), 5);

        controller.ensure_and_run(&job()).await.unwrap();
        controller.ensure_and_run(&job()).await.unwrap();

        assert_eq!(catalog.jobs_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_running_job_is_awaited() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_running_job(&job(), 1);

        controller(catalog.clone(), 5)
            .ensure_and_run(&job())
            .await
            .unwrap();
        assert_eq!(catalog.state_checks("crawler_users_DEV"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_job_on_start_is_hard_error() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.drop_jobs_on_create();

        let err = controller(catalog, 5)
            .ensure_and_run(&job())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::DiscoveryJobMissing { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_job_times_out() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_run_polls(u32::MAX);

        let started = tokio::time::Instant::now();
        let err = controller(catalog.clone(), 4)
            .ensure_and_run(&job())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DiscoveryError::DiscoveryTimeout { attempts: 4, .. }
        ));
        assert_eq!(catalog.state_checks("crawler_users_DEV"), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_crawl_reports_reason() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.fail_runs("Access denied to s3://bucket/exports/users");

        let err = controller(catalog, 5)
            .ensure_and_run(&job())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::DiscoveryFailed { ref reason, .. } if reason.starts_with("Access denied")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_rebuild_tolerates_missing_table() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let controller = controller(catalog.clone(), 5);

        controller
            .force_rebuild("glue_database_users_DEV", "users")
            .await
            .unwrap();

        catalog.add_table("glue_database_users_DEV", "users");
        controller
            .force_rebuild("glue_database_users_DEV", "users")
            .await
            .unwrap();
        assert!(!catalog.has_table("glue_database_users_DEV", "users"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schemas_wait_needs_all_present_in_one_pass() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_schema("schema_a");
        catalog.schema_appears_on_check("schema_b", 3);
        let controller = controller(catalog.clone(), 1);
        let delay = Duration::from_secs(10);
        let names = vec!["schema_a".to_string(), "schema_b".to_string()];

        let started = tokio::time::Instant::now();
        controller
            .wait_for_schemas_available(&names, RetryPolicy::new(3, delay))
            .await
            .unwrap();

        assert_eq!(started.elapsed(), delay * 2);
        assert_eq!(catalog.schema_checks("schema_a"), 3);
        assert_eq!(catalog.schema_checks("schema_b"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schemas_wait_fails_before_third_pass() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_schema("schema_a");
        catalog.schema_appears_on_check("schema_b", 3);
        let names = vec!["schema_a".to_string(), "schema_b".to_string()];

        let err = controller(catalog.clone(), 1)
            .wait_for_schemas_available(&names, RetryPolicy::new(2, Duration::from_secs(10)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DiscoveryError::SchemasUnavailable { ref missing, attempts: 2 } if missing == &["schema_b".to_string()]
        ));
    }
}

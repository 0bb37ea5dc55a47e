//! Query execution against a discovered schema.
//!
//! A query is submitted, polled on a fixed interval until it reaches a
//! terminal state, and only then are its result pages fetched. Column names
//! come from the result metadata of the first page.

mod athena;

use async_trait::async_trait;
use snafu::prelude::*;
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{QueryError, QueryResultShapeSnafu};
use crate::metrics::events::PollKind;
use crate::polling::{PollError, RetryPolicy, poll_until};
use crate::table::{Cell, TabularRowSet};

pub use athena::AthenaQueryService;

/// Status of a submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Queued,
    Running,
    Succeeded,
    Failed { reason: String },
    Cancelled { reason: String },
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultPage {
    /// Column names from the result metadata.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// An asynchronous query engine.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Submit a query and return its execution id.
    async fn submit(
        &self,
        query: &str,
        schema: &str,
        result_location: &str,
    ) -> Result<String, QueryError>;

    async fn status(&self, execution_id: &str) -> Result<QueryStatus, QueryError>;

    /// Fetch one page of a succeeded query's results.
    async fn results_page(
        &self,
        execution_id: &str,
        next_token: Option<String>,
    ) -> Result<ResultPage, QueryError>;
}

/// Runs queries to completion on a [`QueryService`].
#[derive(Clone)]
pub struct QueryExecutor {
    service: Arc<dyn QueryService>,
    poll: RetryPolicy,
}

impl QueryExecutor {
    pub fn new(service: Arc<dyn QueryService>, poll: RetryPolicy) -> Self {
        Self { service, poll }
    }

    /// Submit `query` against `schema`, wait for it, and return every result
    /// row. A failed or cancelled query is reported with the service's reason
    /// and never retried here.
    pub async fn run(
        &self,
        query: &str,
        schema: &str,
        result_location: &str,
    ) -> Result<TabularRowSet, QueryError> {
        let start = Instant::now();
        let execution_id = self.service.submit(query, schema, result_location).await?;
        info!("Submitted query {} against {}", execution_id, schema);

        self.wait(&execution_id).await?;
        let rows = self.fetch_results(&execution_id).await?;

        info!(
            "Query {} returned {} rows in {:?}",
            execution_id,
            rows.len(),
            start.elapsed()
        );
        Ok(rows)
    }

    async fn wait(&self, execution_id: &str) -> Result<(), QueryError> {
        let outcome = poll_until(self.poll, PollKind::Query, execution_id, |_| async move {
            let status = self.service.status(execution_id).await?;
            let (state, reason) = match status {
                QueryStatus::Queued | QueryStatus::Running => return Ok(Poll::Pending),
                QueryStatus::Succeeded => return Ok(Poll::Ready(Ok(()))),
                QueryStatus::Failed { reason } => ("failed", reason),
                QueryStatus::Cancelled { reason } => ("cancelled", reason),
            };
            Ok::<_, QueryError>(Poll::Ready(Err(QueryError::QueryFailed {
                execution_id: execution_id.to_string(),
                state,
                reason,
            })))
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(PollError::Exhausted { attempts }) => Err(QueryError::QueryTimeout {
                execution_id: execution_id.to_string(),
                attempts,
            }),
            Err(PollError::Check(err)) => Err(err),
        }
    }

    async fn fetch_results(&self, execution_id: &str) -> Result<TabularRowSet, QueryError> {
        let first = self.service.results_page(execution_id, None).await?;
        let mut rows = TabularRowSet::new(first.columns);
        let mut pages = 1usize;
        let mut page_rows = first.rows;
        let mut next_token = first.next_token;

        loop {
            for values in page_rows {
                rows.push(values).context(QueryResultShapeSnafu)?;
            }
            let Some(token) = next_token.take() else {
                break;
            };
            let page = self.service.results_page(execution_id, Some(token)).await?;
            pages += 1;
            page_rows = page.rows;
            next_token = page.next_token;
        }

        debug!("Fetched {} result pages for {}", pages, execution_id);
        Ok(rows)
    }
}

//! Amazon Athena query adapter.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_athena::Client;
use aws_sdk_athena::types::{QueryExecutionContext, QueryExecutionState, ResultConfiguration};

use crate::aws::{ProvideErrorMetadata, ServiceFailure};
use crate::error::QueryError;
use crate::table::Cell;

use super::{QueryService, QueryStatus, ResultPage};

/// Runs queries through Athena, reading results page by page.
#[derive(Debug, Clone)]
pub struct AthenaQueryService {
    client: Client,
    page_size: i32,
}

impl AthenaQueryService {
    pub fn new(sdk_config: &SdkConfig, page_size: i32) -> Self {
        Self {
            client: Client::new(sdk_config),
            page_size,
        }
    }
}

fn service_error<E>(operation: &'static str, err: &E) -> QueryError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let failure = ServiceFailure::describe(err);
    if failure.is_credentials_expired() {
        QueryError::QueryCredentialsExpired {
            operation,
            message: failure.message,
        }
    } else {
        QueryError::QueryService {
            operation,
            message: failure.message,
        }
    }
}

#[async_trait]
impl QueryService for AthenaQueryService {
    async fn submit(
        &self,
        query: &str,
        schema: &str,
        result_location: &str,
    ) -> Result<String, QueryError> {
        let output = self
            .client
            .start_query_execution()
            .query_string(query)
            .query_execution_context(QueryExecutionContext::builder().database(schema).build())
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location(result_location)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| service_error("start_query_execution", &err))?;

        output
            .query_execution_id()
            .map(str::to_string)
            .ok_or(QueryError::MissingExecutionId)
    }

    async fn status(&self, execution_id: &str) -> Result<QueryStatus, QueryError> {
        let output = self
            .client
            .get_query_execution()
            .query_execution_id(execution_id)
            .send()
            .await
            .map_err(|err| service_error("get_query_execution", &err))?;

        let status = output.query_execution().and_then(|q| q.status());
        let reason = || {
            status
                .and_then(|s| s.state_change_reason())
                .unwrap_or_default()
                .to_string()
        };

        Ok(match status.and_then(|s| s.state()) {
            Some(QueryExecutionState::Succeeded) => QueryStatus::Succeeded,
            Some(QueryExecutionState::Failed) => QueryStatus::Failed { reason: reason() },
            Some(QueryExecutionState::Cancelled) => QueryStatus::Cancelled { reason: reason() },
            Some(QueryExecutionState::Running) => QueryStatus::Running,
            _ => QueryStatus::Queued,
        })
    }

    async fn results_page(
        &self,
        execution_id: &str,
        next_token: Option<String>,
    ) -> Result<ResultPage, QueryError> {
        let first_page = next_token.is_none();
        let output = self
            .client
            .get_query_results()
            .query_execution_id(execution_id)
            .set_next_token(next_token)
            .max_results(self.page_size)
            .send()
            .await
            .map_err(|err| service_error("get_query_results", &err))?;

        let result_set = output.result_set();
        let columns: Vec<String> = result_set
            .and_then(|r| r.result_set_metadata())
            .map(|m| m.column_info().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut rows: Vec<Vec<Cell>> = result_set
            .map(|r| r.rows())
            .unwrap_or_default()
            .iter()
            .map(|row| {
                row.data()
                    .iter()
                    .map(|datum| datum.var_char_value().map(str::to_string))
                    .collect()
            })
            .collect();

        // Athena echoes the column names as the first row of the first page.
        if first_page && is_header_row(rows.first(), &columns) {
            rows.remove(0);
        }

        Ok(ResultPage {
            columns,
            rows,
            next_token: output.next_token().map(str::to_string),
        })
    }
}

fn is_header_row(row: Option<&Vec<Cell>>, columns: &[String]) -> bool {
    row.is_some_and(|row| {
        row.len() == columns.len()
            && row
                .iter()
                .zip(columns)
                .all(|(value, column)| value.as_deref() == Some(column.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_row_detection() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let header = vec![Some("id".to_string()), Some("name".to_string())];
        let data = vec![Some("1".to_string()), Some("name".to_string())];

        assert!(is_header_row(Some(&header), &columns));
        assert!(!is_header_row(Some(&data), &columns));
        assert!(!is_header_row(None, &columns));
        assert!(!is_header_row(Some(&vec![Some("id".to_string())]), &columns));
    }
}

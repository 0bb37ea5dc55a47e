//! PostgreSQL relational sink.

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

use crate::error::SinkError;

use super::relational::{RelationalSink, Statement};

/// Executes statements over a single `tokio-postgres` connection.
pub struct PostgresSink {
    client: Client,
}

impl PostgresSink {
    /// Connect with a libpq-style connection string or URI.
    pub async fn connect(connection: &str) -> Result<Self, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::connect(connection, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Connected to PostgreSQL");
        Ok(Self { client })
    }
}

#[async_trait]
impl RelationalSink for PostgresSink {
    async fn execute(&self, statement: &Statement) -> Result<u64, SinkError> {
        let params: Vec<&(dyn ToSql + Sync)> = statement
            .params
            .iter()
            .map(|value| value as &(dyn ToSql + Sync))
            .collect();

        self.client
            .execute(statement.sql.as_str(), &params)
            .await
            .map_err(|e| SinkError::SinkWrite {
                table: statement.table.clone(),
                message: format_pg_error(&e),
            })
    }
}

fn format_pg_error(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db_error) => format!(
            "{} (sqlstate={})",
            db_error.message(),
            db_error.code().code()
        ),
        None => error.to_string(),
    }
}

//! Relational loader.
//!
//! Creates the target table when absent, with one text column per declared
//! column, then inserts rows one statement at a time in row-set order.
//! Values are always bound as parameters; only identifiers are spliced into
//! the statement text, and only after quoting.

use async_trait::async_trait;
use pg_escape::quote_identifier;
use snafu::prelude::*;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::emit;
use crate::error::{InvalidIdentifierSnafu, SinkError, SinkWriteSnafu};
use crate::metrics::events::RowsLoaded;
use crate::table::{Cell, TabularRowSet};

/// A parameterized statement. `$1..$n` in `sql` bind to `params` in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Table the statement targets, for error reporting.
    pub table: String,
    pub sql: String,
    pub params: Vec<Cell>,
}

/// A relational database that executes statements.
#[async_trait]
pub trait RelationalSink: Send + Sync {
    /// Execute one statement, returning the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64, SinkError>;
}

/// Loads tables into a [`RelationalSink`].
#[derive(Clone)]
pub struct RelationalLoader {
    sink: Arc<dyn RelationalSink>,
}

impl RelationalLoader {
    pub fn new(sink: Arc<dyn RelationalSink>) -> Self {
        Self { sink }
    }

    /// Create `table` if needed and insert every row. The first failing
    /// insert aborts the remaining rows.
    pub async fn load(&self, rows: &TabularRowSet, table: &str) -> Result<u64, SinkError> {
        let start = Instant::now();
        let create = create_table_statement(table, rows.columns())?;
        self.sink.execute(&create).await?;
        debug!("Ensured table {} with {} columns", table, rows.columns().len());

        let insert_sql = insert_sql(table, rows.columns())?;
        let mut loaded = 0u64;
        for (index, row) in rows.rows().enumerate() {
            let statement = Statement {
                table: table.to_string(),
                sql: insert_sql.clone(),
                params: row.values().to_vec(),
            };
            self.sink.execute(&statement).await.map_err(|err| match err {
                SinkError::SinkWrite { table, message } => SinkError::SinkWrite {
                    table,
                    message: format!("insert of row {index} failed: {message}"),
                },
                other => other,
            })?;
            loaded += 1;
        }

        info!(
            "Loaded {} rows into {} in {:?}",
            loaded,
            table,
            start.elapsed()
        );
        emit!(RowsLoaded { count: loaded });
        Ok(loaded)
    }
}

/// `CREATE TABLE IF NOT EXISTS` with every column typed `TEXT`.
pub fn create_table_statement(table: &str, columns: &[String]) -> Result<Statement, SinkError> {
    ensure!(
        !columns.is_empty(),
        SinkWriteSnafu {
            table,
            message: "row set declares no columns",
        }
    );

    let column_defs = columns
        .iter()
        .map(|column| Ok(format!("{} TEXT", identifier(column)?)))
        .collect::<Result<Vec<_>, SinkError>>()?
        .join(", ");

    Ok(Statement {
        table: table.to_string(),
        sql: format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            identifier(table)?,
            column_defs
        ),
        params: Vec::new(),
    })
}

fn insert_sql(table: &str, columns: &[String]) -> Result<String, SinkError> {
    let column_list = columns
        .iter()
        .map(|column| identifier(column))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let mut sql = format!("INSERT INTO {} ({}) VALUES (", identifier(table)?, column_list);
    for position in 1..=columns.len() {
        if position > 1 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "${position}");
    }
    sql.push(')');
    Ok(sql)
}

fn identifier(name: &str) -> Result<String, SinkError> {
    ensure!(
        !name.trim().is_empty() && !name.contains('\0'),
        InvalidIdentifierSnafu { identifier: name }
    );
    Ok(quote_identifier(name).to_string())
}

//! Tabular row sets passed between stages.
//!
//! A [`TabularRowSet`] owns an ordered column list and rows stored
//! positionally against it, so every row carries exactly the declared columns.
//! Missing values are `None`, never omitted.

use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::error::{RowWidthSnafu, TransformError};

/// One scalar cell. `None` is a null.
pub type Cell = Option<String>;

/// Ordered columns plus rows that all match them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabularRowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Cell],
}

impl TabularRowSet {
    /// An empty row set with the given columns.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row given positionally in column order.
    pub fn push(&mut self, values: Vec<Cell>) -> Result<(), TransformError> {
        ensure!(
            values.len() == self.columns.len(),
            RowWidthSnafu {
                expected: self.columns.len(),
                actual: values.len(),
            }
        );
        self.rows.push(values);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> impl ExactSizeIterator<Item = Row<'_>> {
        self.rows.iter().map(|values| Row {
            columns: &self.columns,
            values,
        })
    }
}

impl<'a> Row<'a> {
    /// Value of `column`, or `None` when the column is unknown or null.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values[index].as_deref()
    }

    /// Values in column order.
    pub fn values(&self) -> &'a [Cell] {
        self.values
    }

    /// `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, Option<&'a str>)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(Option::as_deref))
    }

    /// JSON object with keys in column order and `null` for missing values.
    pub fn to_json(&self) -> Map<String, Value> {
        self.iter()
            .map(|(column, value)| {
                let value = value.map_or(Value::Null, |v| Value::String(v.to_string()));
                (column.to_string(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TabularRowSet {
        TabularRowSet::new(vec!["id".to_string(), "name".to_string()])
    }

    #[test]
    fn test_push_rejects_wrong_width() {
        let mut rows = table();
        let err = rows.push(vec![Some("1".to_string())]).unwrap_err();
        assert!(matches!(
            err,
            TransformError::RowWidth {
                expected: 2,
                actual: 1
            }
        ));
        assert!(rows.is_empty());
    }

    #[test]
    fn test_row_json_keeps_column_order() {
        let mut rows = TabularRowSet::new(vec!["z".to_string(), "a".to_string()]);
        rows.push(vec![Some("last".to_string()), None]).unwrap();

        let json = serde_json::to_string(&rows.row(0).unwrap().to_json()).unwrap();
        assert_eq!(json, r#"{"z":"last","a":null}"#);
    }
}

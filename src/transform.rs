//! Row transformer: tagged source items to a uniform table.
//!
//! Only the declared fields are extracted, in declared order. A missing field
//! is a null cell. A present field is coerced to its declared kind when a safe
//! coercion exists and rejected with `SchemaMismatch` otherwise.

use snafu::prelude::*;

use crate::config::{FieldConfig, FieldKind};
use crate::error::{SchemaMismatchSnafu, TransformError};
use crate::source::{RawItem, TaggedValue};
use crate::table::{Cell, TabularRowSet};

/// Flattens raw items against a declared field list.
#[derive(Debug, Clone)]
pub struct RowTransformer {
    fields: Vec<FieldConfig>,
}

impl RowTransformer {
    pub fn new(fields: Vec<FieldConfig>) -> Self {
        Self { fields }
    }

    /// Column names in declared order.
    pub fn columns(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn flatten(&self, items: &[RawItem]) -> Result<TabularRowSet, TransformError> {
        let mut rows = TabularRowSet::new(self.columns());
        for (index, item) in items.iter().enumerate() {
            let values = self
                .fields
                .iter()
                .map(|field| match item.get(&field.name) {
                    Some(value) => coerce(value, field, index),
                    None => Ok(None),
                })
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(values)?;
        }
        Ok(rows)
    }
}

fn coerce(value: &TaggedValue, field: &FieldConfig, item: usize) -> Result<Cell, TransformError> {
    if let TaggedValue::Null(_) = value {
        return Ok(None);
    }

    let cell = match (field.kind, value) {
        (FieldKind::Json, value) => Some(value.to_json().to_string()),

        (FieldKind::String, TaggedValue::String(s) | TaggedValue::Number(s)) => Some(s.clone()),
        (FieldKind::String, TaggedValue::Bool(b)) => Some(b.to_string()),
        (
            FieldKind::String,
            value @ (TaggedValue::StringSet(_)
            | TaggedValue::NumberSet(_)
            | TaggedValue::List(_)
            | TaggedValue::Map(_)),
        ) => Some(value.to_json().to_string()),

        (FieldKind::Number, TaggedValue::Number(n)) => Some(n.clone()),
        (FieldKind::Number, TaggedValue::String(s)) if is_number(s) => Some(s.trim().to_string()),

        (FieldKind::Boolean, TaggedValue::Bool(b)) => Some(b.to_string()),
        (FieldKind::Boolean, TaggedValue::String(s)) => match s.trim().to_ascii_lowercase().as_str()
        {
            "true" => Some("true".to_string()),
            "false" => Some("false".to_string()),
            _ => return mismatch(value, field, item),
        },

        _ => return mismatch(value, field, item),
    };
    Ok(cell)
}

fn is_number(s: &str) -> bool {
    s.trim().parse::<f64>().is_ok_and(f64::is_finite)
}

fn mismatch(value: &TaggedValue, field: &FieldConfig, item: usize) -> Result<Cell, TransformError> {
    SchemaMismatchSnafu {
        field: field.name.clone(),
        item,
        expected: field.kind,
        found: value.tag(),
    }
    .fail()
}

/// Re-tag a flattened table as string items, the shape a source scan yields.
pub fn to_raw_items(rows: &TabularRowSet) -> Vec<RawItem> {
    rows.rows()
        .map(|row| {
            row.iter()
                .filter_map(|(column, value)| {
                    value.map(|v| (column.to_string(), TaggedValue::String(v.to_string())))
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    fn field(name: &str, kind: FieldKind) -> FieldConfig {
        FieldConfig {
            name: name.to_string(),
            kind,
        }
    }

    fn s(value: &str) -> TaggedValue {
        TaggedValue::String(value.to_string())
    }

    fn item(entries: &[(&str, TaggedValue)]) -> RawItem {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<HashMap<_, _>>()
    }

    fn transformer() -> RowTransformer {
        RowTransformer::new(vec![
            field("id", FieldKind::String),
            field("amount", FieldKind::Number),
            field("active", FieldKind::Boolean),
        ])
    }

    #[test]
    fn test_missing_field_becomes_null() {
        let items = vec![item(&[("id", s("1"))])];
        let rows = transformer().flatten(&items).unwrap();

        let row = rows.row(0).unwrap();
        assert_eq!(row.values(), &[Some("1".to_string()), None, None]);
    }

    #[test]
    fn test_columns_follow_declared_order() {
        let items = vec![item(&[
            ("active", TaggedValue::Bool(true)),
            ("id", s("9")),
            ("extra", s("ignored")),
        ])];
        let rows = transformer().flatten(&items).unwrap();
        assert_eq!(rows.columns(), &["id", "amount", "active"]);
        assert_eq!(rows.row(0).unwrap().get("active"), Some("true"));
    }

    #[test]
    fn test_safe_coercions() {
        let items = vec![item(&[
            ("id", TaggedValue::Number("17".to_string())),
            ("amount", s(" 12.50 ")),
            ("active", s("FALSE")),
        ])];
        let rows = transformer().flatten(&items).unwrap();
        let row = rows.row(0).unwrap();
        assert_eq!(row.get("id"), Some("17"));
        assert_eq!(row.get("amount"), Some("12.50"));
        assert_eq!(row.get("active"), Some("false"));
    }

    #[test]
    fn test_null_tag_is_null_for_every_kind() {
        let items = vec![item(&[
            ("id", TaggedValue::Null(true)),
            ("amount", TaggedValue::Null(true)),
        ])];
        let rows = transformer().flatten(&items).unwrap();
        assert_eq!(rows.row(0).unwrap().values(), &[None, None, None]);
    }

    #[test]
    fn test_schema_mismatch_names_field_and_tag() {
        let items = vec![
            item(&[("id", s("1"))]),
            item(&[("amount", TaggedValue::Bool(true))]),
        ];
        let err = transformer().flatten(&items).unwrap_err();
        assert!(matches!(
            err,
            TransformError::SchemaMismatch {
                ref field,
                item: 1,
                expected: FieldKind::Number,
                found: "BOOL",
            } if field == "amount"
        ));
    }

    #[test]
    fn test_non_numeric_string_rejected_for_number() {
        let items = vec![item(&[("amount", s("twelve"))])];
        assert!(transformer().flatten(&items).is_err());
    }

    #[test]
    fn test_complex_values_render_as_json() {
        let transformer = RowTransformer::new(vec![
            field("profile", FieldKind::String),
            field("blob", FieldKind::Json),
        ]);
        let profile = TaggedValue::Map(BTreeMap::from([
            ("age".to_string(), TaggedValue::Number("30".to_string())),
            ("name".to_string(), s("Ada")),
        ]));
        let items = vec![item(&[
            ("profile", profile),
            ("blob", TaggedValue::Binary("AAE=".to_string())),
        ])];

        let rows = transformer.flatten(&items).unwrap();
        let row = rows.row(0).unwrap();
        assert_eq!(row.get("profile"), Some(r#"{"age":30,"name":"Ada"}"#));
        assert_eq!(row.get("blob"), Some(r#""AAE=""#));
    }

    #[test]
    fn test_flatten_is_idempotent_on_columns() {
        let items = vec![
            item(&[("id", s("1")), ("amount", TaggedValue::Number("3".to_string()))]),
            item(&[("active", TaggedValue::Bool(false))]),
        ];
        let transformer = transformer();
        let first = transformer.flatten(&items).unwrap();
        let second = transformer.flatten(&to_raw_items(&first)).unwrap();

        assert_eq!(first.columns(), second.columns());
        assert_eq!(first, second);
    }
}

//! Object sink writer.
//!
//! Encodes a table as delimited text with a header row, or as one JSON
//! object per line, and writes it whole under a partition key. Writes replace
//! any previous object at the key, so a retried write is safe.

use bytes::Bytes;
use snafu::prelude::*;
use tracing::debug;

use crate::config::FileFormat;
use crate::emit;
use crate::error::{DecodeSnafu, EncodeSnafu, ObjectWriteSnafu, SinkError};
use crate::metrics::events::BytesWritten;
use crate::storage::StorageProviderRef;
use crate::table::TabularRowSet;

/// Writes encoded tables to object storage.
#[derive(Debug, Clone)]
pub struct ObjectSinkWriter {
    storage: StorageProviderRef,
    format: FileFormat,
}

impl ObjectSinkWriter {
    pub fn new(storage: StorageProviderRef, format: FileFormat) -> Self {
        Self { storage, format }
    }

    /// Encode `rows` and write them at `key`. Returns the object size.
    pub async fn write(&self, rows: &TabularRowSet, key: &str) -> Result<usize, SinkError> {
        let bytes = match self.format {
            FileFormat::Csv => encode_csv(rows),
            FileFormat::Json => encode_json(rows)?,
        };
        let size = bytes.len();

        self.storage
            .put(key, bytes)
            .await
            .context(ObjectWriteSnafu { key })?;

        debug!(
            "Wrote {} rows ({} bytes) to {}",
            rows.len(),
            size,
            self.storage.url_for(key)
        );
        emit!(BytesWritten { bytes: size as u64 });
        Ok(size)
    }
}

/// Delimited text with a header row. Values holding the delimiter, quotes or
/// line breaks are quoted. A null is an empty field and an empty string is a
/// quoted empty field (`""`), so the two stay distinct.
pub fn encode_csv(rows: &TabularRowSet) -> Bytes {
    let mut buffer = Vec::new();
    push_line(&mut buffer, rows.columns().iter().map(|c| Some(c.as_str())));
    for row in rows.rows() {
        push_line(&mut buffer, row.values().iter().map(|v| v.as_deref()));
    }
    Bytes::from(buffer)
}

fn push_line<'a>(buffer: &mut Vec<u8>, fields: impl Iterator<Item = Option<&'a str>>) {
    for (index, field) in fields.enumerate() {
        if index > 0 {
            buffer.push(b',');
        }
        match field {
            None => {}
            Some(value) if value.is_empty() || value.contains([',', '"', '\n', '\r']) => {
                buffer.push(b'"');
                buffer.extend_from_slice(value.replace('"', "\"\"").as_bytes());
                buffer.push(b'"');
            }
            Some(value) => buffer.extend_from_slice(value.as_bytes()),
        }
    }
    buffer.push(b'\n');
}

/// One JSON object per row, keys in column order, nulls kept.
pub fn encode_json(rows: &TabularRowSet) -> Result<Bytes, SinkError> {
    let mut buffer = Vec::new();
    for row in rows.rows() {
        serde_json::to_writer(&mut buffer, &row.to_json()).map_err(|e| {
            EncodeSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        buffer.push(b'\n');
    }
    Ok(Bytes::from(buffer))
}

/// Parse text produced by [`encode_csv`]. Unquoted empty fields read back as
/// nulls, quoted empty fields as empty strings. In a one-column table a null
/// row is a blank line, which also reads back as a null row.
pub fn decode_csv(bytes: &[u8]) -> Result<TabularRowSet, SinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);

    let columns: Vec<String> = reader
        .headers()
        .map_err(decode_error)?
        .iter()
        .map(str::to_string)
        .collect();
    let width = columns.len();
    let mut rows = TabularRowSet::new(columns);

    let mut record = csv::StringRecord::new();
    loop {
        let start = reader.position().byte() as usize;
        let more = reader.read_record(&mut record).map_err(decode_error)?;
        let end = if more {
            reader.position().byte() as usize
        } else {
            bytes.len()
        };
        // The reader skips blank lines; they are part of this record's span.
        let (blank_lines, raw) = split_blank_lines(bytes, start, end);
        for _ in 0..blank_lines {
            push_row(&mut rows, vec![None; width])?;
        }
        if !more {
            break;
        }

        let quoted_empty = quoted_empty_fields(raw);
        let values = record
            .iter()
            .enumerate()
            .map(|(index, field)| {
                if !field.is_empty() {
                    Some(field.to_string())
                } else if quoted_empty.get(index).copied().unwrap_or(false) {
                    Some(String::new())
                } else {
                    None
                }
            })
            .collect();
        push_row(&mut rows, values)?;
    }
    Ok(rows)
}

fn push_row(rows: &mut TabularRowSet, values: Vec<Option<String>>) -> Result<(), SinkError> {
    rows.push(values).map_err(|e| {
        DecodeSnafu {
            message: e.to_string(),
        }
        .build()
    })
}

/// Count the blank lines leading a record's span and return the rest. The
/// `\n` of a `\r\n` ending the previous record is not a blank line.
fn split_blank_lines(bytes: &[u8], start: usize, end: usize) -> (usize, &[u8]) {
    let raw = bytes.get(start..end).unwrap_or_default();
    let skipped = raw
        .iter()
        .take_while(|b| matches!(b, b'\n' | b'\r'))
        .count();
    let (blank, rest) = raw.split_at(skipped);

    let mut lines = 0;
    let mut previous = start.checked_sub(1).and_then(|i| bytes.get(i)).copied();
    for &byte in blank {
        if byte == b'\r' || previous != Some(b'\r') {
            lines += 1;
        }
        previous = Some(byte);
    }
    (lines, rest)
}

/// For each field of one raw record, whether it was written as `""`.
fn quoted_empty_fields(raw: &[u8]) -> Vec<bool> {
    let mut flags = Vec::new();
    let mut in_quotes = false;
    let mut field_start = 0;
    for (index, &byte) in raw.iter().enumerate() {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b',' | b'\n' | b'\r' if !in_quotes => {
                flags.push(&raw[field_start..index] == b"\"\"");
                if byte != b',' {
                    return flags;
                }
                field_start = index + 1;
            }
            _ => {}
        }
    }
    flags.push(&raw[field_start..] == b"\"\"");
    flags
}

fn decode_error(err: csv::Error) -> SinkError {
    DecodeSnafu {
        message: err.to_string(),
    }
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn rows() -> TabularRowSet {
        let mut rows = TabularRowSet::new(vec!["id".to_string(), "note".to_string()]);
        rows.push(vec![Some("1".to_string()), Some("plain".to_string())])
            .unwrap();
        rows.push(vec![
            Some("2".to_string()),
            Some("a, b and \"c\"\nnext line".to_string()),
        ])
        .unwrap();
        rows.push(vec![Some("3".to_string()), None]).unwrap();
        rows
    }

    #[test]
    fn test_csv_quotes_embedded_delimiters() {
        let text = String::from_utf8(encode_csv(&rows()).to_vec()).unwrap();
        assert!(text.starts_with("id,note\n1,plain\n"));
        assert!(text.contains("2,\"a, b and \"\"c\"\"\nnext line\"\n"));
        assert!(text.ends_with("3,\n"));
    }

    #[test]
    fn test_csv_decodes_to_same_table() {
        let original = rows();
        let decoded = decode_csv(&encode_csv(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_string_and_null_stay_distinct() {
        let mut rows = TabularRowSet::new(vec!["a".to_string(), "b".to_string()]);
        rows.push(vec![Some(String::new()), None]).unwrap();
        rows.push(vec![None, Some(String::new())]).unwrap();

        let encoded = encode_csv(&rows);
        assert_eq!(encoded.as_ref(), b"a,b\n\"\",\n,\"\"\n");
        assert_eq!(decode_csv(&encoded).unwrap(), rows);
    }

    #[test]
    fn test_single_column_nulls_survive() {
        let mut rows = TabularRowSet::new(vec!["note".to_string()]);
        rows.push(vec![None]).unwrap();
        rows.push(vec![Some(String::new())]).unwrap();
        rows.push(vec![Some("x".to_string())]).unwrap();
        rows.push(vec![None]).unwrap();

        let encoded = encode_csv(&rows);
        assert_eq!(encoded.as_ref(), b"note\n\n\"\"\nx\n\n");
        assert_eq!(decode_csv(&encoded).unwrap(), rows);
    }

    #[test]
    fn test_crlf_text_decodes_without_extra_rows() {
        let decoded = decode_csv(b"id,note\r\n1,\"\"\r\n2,\r\n").unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.row(0).unwrap().get("note"), Some(""));
        assert_eq!(decoded.row(1).unwrap().get("note"), None);
    }

    #[test]
    fn test_json_lines_keep_nulls() {
        let text = String::from_utf8(encode_json(&rows()).unwrap().to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], r#"{"id":"3","note":null}"#);
    }

    #[tokio::test]
    async fn test_write_overwrites_previous_object() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(
            StorageProvider::for_url_with_options(temp_dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap(),
        );
        let writer = ObjectSinkWriter::new(storage.clone(), FileFormat::Csv);

        writer.write(&rows(), "users/users.csv").await.unwrap();
        let mut smaller = TabularRowSet::new(vec!["id".to_string()]);
        smaller.push(vec![Some("9".to_string())]).unwrap();
        writer.write(&smaller, "users/users.csv").await.unwrap();

        let stored = storage.get("users/users.csv").await.unwrap();
        assert_eq!(stored.as_ref(), b"id\n9\n");
    }
}

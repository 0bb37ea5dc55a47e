//! Key-value source scanning.
//!
//! A partition's source table is read in full before anything downstream
//! runs. The [`KeyValueSource`] trait exposes one page of a scan at a time;
//! [`Scanner`] follows continuation keys until the table is exhausted and
//! retries transient failures from the beginning.

mod dynamodb;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::emit;
use crate::error::SourceError;
use crate::metrics::events::RowsExtracted;
use crate::polling::{RetryPolicy, retry_transient};

pub use dynamodb::DynamoDbSource;

/// A value wrapped in a one-entry map naming its wire type, e.g. `{"S": "x"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaggedValue {
    #[serde(rename = "S")]
    String(String),
    /// Numbers travel as text to keep their precision.
    #[serde(rename = "N")]
    Number(String),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null(bool),
    /// Binary payload, base64 encoded.
    #[serde(rename = "B")]
    Binary(String),
    #[serde(rename = "SS")]
    StringSet(Vec<String>),
    #[serde(rename = "NS")]
    NumberSet(Vec<String>),
    #[serde(rename = "BS")]
    BinarySet(Vec<String>),
    #[serde(rename = "L")]
    List(Vec<TaggedValue>),
    #[serde(rename = "M")]
    Map(BTreeMap<String, TaggedValue>),
}

impl TaggedValue {
    /// The wire tag, as it appears in the source's JSON form.
    pub fn tag(&self) -> &'static str {
        match self {
            TaggedValue::String(_) => "S",
            TaggedValue::Number(_) => "N",
            TaggedValue::Bool(_) => "BOOL",
            TaggedValue::Null(_) => "NULL",
            TaggedValue::Binary(_) => "B",
            TaggedValue::StringSet(_) => "SS",
            TaggedValue::NumberSet(_) => "NS",
            TaggedValue::BinarySet(_) => "BS",
            TaggedValue::List(_) => "L",
            TaggedValue::Map(_) => "M",
        }
    }

    /// Binary payload from raw bytes.
    pub fn binary(bytes: &[u8]) -> Self {
        TaggedValue::Binary(STANDARD.encode(bytes))
    }

    /// Plain JSON with every tag stripped. Numbers that do not fit a JSON
    /// number stay strings.
    pub fn to_json(&self) -> Value {
        match self {
            TaggedValue::String(s) | TaggedValue::Binary(s) => Value::String(s.clone()),
            TaggedValue::Number(n) => number_to_json(n),
            TaggedValue::Bool(b) => Value::Bool(*b),
            TaggedValue::Null(_) => Value::Null,
            TaggedValue::StringSet(values) | TaggedValue::BinarySet(values) => {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            }
            TaggedValue::NumberSet(values) => {
                Value::Array(values.iter().map(|n| number_to_json(n)).collect())
            }
            TaggedValue::List(values) => Value::Array(values.iter().map(Self::to_json).collect()),
            TaggedValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn number_to_json(n: &str) -> Value {
    serde_json::from_str::<serde_json::Number>(n)
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(n.to_string()))
}

/// One item as read from the source: field name to tagged value.
pub type RawItem = HashMap<String, TaggedValue>;

/// One page of a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<RawItem>,
    /// Continuation key; `None` when the scan is complete.
    pub next: Option<RawItem>,
}

/// A paginated, read-only key-value table store.
#[async_trait]
pub trait KeyValueSource: Send + Sync {
    /// Read one page of `table`, starting after `start` when given.
    async fn scan_page(&self, table: &str, start: Option<RawItem>)
    -> Result<ScanPage, SourceError>;
}

/// Reads whole tables from a [`KeyValueSource`].
#[derive(Clone)]
pub struct Scanner {
    source: Arc<dyn KeyValueSource>,
    retry: RetryPolicy,
}

impl Scanner {
    pub fn new(source: Arc<dyn KeyValueSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    /// Read every item of `table`.
    ///
    /// `SourceUnavailable` restarts the scan from the first page until the
    /// retry budget is spent. `CredentialsExpired` is returned at once.
    pub async fn scan(&self, table: &str) -> Result<Vec<RawItem>, SourceError> {
        let start = Instant::now();
        let items = retry_transient(
            self.retry,
            table,
            |_| self.scan_all_pages(table),
            |err: &SourceError| !err.is_credentials_expired(),
        )
        .await?;

        info!(
            "Scanned {} items from {} in {:?}",
            items.len(),
            table,
            start.elapsed()
        );
        emit!(RowsExtracted {
            count: items.len() as u64,
        });
        Ok(items)
    }

    async fn scan_all_pages(&self, table: &str) -> Result<Vec<RawItem>, SourceError> {
        let mut items = Vec::new();
        let mut start = None;
        let mut pages = 0usize;

        loop {
            let page = self.source.scan_page(table, start.take()).await?;
            pages += 1;
            items.extend(page.items);
            match page.next {
                Some(key) => start = Some(key),
                None => break,
            }
        }

        debug!("Read {} pages from {}", pages, table);
        Ok(items)
    }
}

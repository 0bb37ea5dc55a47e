//! DynamoDB scan adapter.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;

use crate::aws::ServiceFailure;
use crate::error::SourceError;

use super::{KeyValueSource, RawItem, ScanPage, TaggedValue};

/// Reads tables with the DynamoDB `Scan` API.
#[derive(Debug, Clone)]
pub struct DynamoDbSource {
    client: Client,
}

impl DynamoDbSource {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl KeyValueSource for DynamoDbSource {
    async fn scan_page(
        &self,
        table: &str,
        start: Option<RawItem>,
    ) -> Result<ScanPage, SourceError> {
        let start = start.map(|key| {
            key.into_iter()
                .map(|(name, value)| (name, to_attribute(value)))
                .collect::<HashMap<_, _>>()
        });

        let output = self
            .client
            .scan()
            .table_name(table)
            .set_exclusive_start_key(start)
            .send()
            .await
            .map_err(|err| {
                let failure = ServiceFailure::describe(&err);
                if failure.is_credentials_expired() {
                    SourceError::CredentialsExpired {
                        table: table.to_string(),
                        message: failure.message,
                    }
                } else {
                    SourceError::SourceUnavailable {
                        table: table.to_string(),
                        message: failure.message,
                    }
                }
            })?;

        let items = output.items().iter().map(from_item).collect();
        let next = output
            .last_evaluated_key()
            .filter(|key| !key.is_empty())
            .map(from_item);

        Ok(ScanPage { items, next })
    }
}

fn from_item(item: &HashMap<String, AttributeValue>) -> RawItem {
    item.iter()
        .map(|(name, value)| (name.clone(), from_attribute(value)))
        .collect()
}

fn from_attribute(value: &AttributeValue) -> TaggedValue {
    match value {
        AttributeValue::S(s) => TaggedValue::String(s.clone()),
        AttributeValue::N(n) => TaggedValue::Number(n.clone()),
        AttributeValue::Bool(b) => TaggedValue::Bool(*b),
        AttributeValue::Null(b) => TaggedValue::Null(*b),
        AttributeValue::B(blob) => TaggedValue::binary(blob.as_ref()),
        AttributeValue::Ss(values) => TaggedValue::StringSet(values.clone()),
        AttributeValue::Ns(values) => TaggedValue::NumberSet(values.clone()),
        AttributeValue::Bs(blobs) => {
            TaggedValue::BinarySet(blobs.iter().map(|b| STANDARD.encode(b.as_ref())).collect())
        }
        AttributeValue::L(values) => TaggedValue::List(values.iter().map(from_attribute).collect()),
        AttributeValue::M(entries) => TaggedValue::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), from_attribute(v)))
                .collect(),
        ),
        _ => TaggedValue::Null(true),
    }
}

fn to_attribute(value: TaggedValue) -> AttributeValue {
    match value {
        TaggedValue::String(s) => AttributeValue::S(s),
        TaggedValue::Number(n) => AttributeValue::N(n),
        TaggedValue::Bool(b) => AttributeValue::Bool(b),
        TaggedValue::Null(b) => AttributeValue::Null(b),
        TaggedValue::Binary(b) => AttributeValue::B(decode_blob(b)),
        TaggedValue::StringSet(values) => AttributeValue::Ss(values),
        TaggedValue::NumberSet(values) => AttributeValue::Ns(values),
        TaggedValue::BinarySet(values) => {
            AttributeValue::Bs(values.into_iter().map(decode_blob).collect())
        }
        TaggedValue::List(values) => {
            AttributeValue::L(values.into_iter().map(to_attribute).collect())
        }
        TaggedValue::Map(entries) => AttributeValue::M(
            entries
                .into_iter()
                .map(|(k, v)| (k, to_attribute(v)))
                .collect(),
        ),
    }
}

fn decode_blob(encoded: String) -> Blob {
    match STANDARD.decode(&encoded) {
        Ok(bytes) => Blob::new(bytes),
        Err(_) => Blob::new(encoded.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_key_survives_conversion() {
        let key = HashMap::from([
            ("pk".to_string(), AttributeValue::S("user#1".to_string())),
            ("sk".to_string(), AttributeValue::N("42".to_string())),
            ("raw".to_string(), AttributeValue::B(Blob::new(vec![0u8, 159, 146]))),
        ]);

        let raw = from_item(&key);
        assert_eq!(raw["raw"].tag(), "B");

        let back: HashMap<_, _> = raw.into_iter().map(|(k, v)| (k, to_attribute(v))).collect();
        assert_eq!(back, key);
    }

    #[test]
    fn test_nested_attributes() {
        let value = AttributeValue::M(HashMap::from([(
            "tags".to_string(),
            AttributeValue::L(vec![AttributeValue::S("a".to_string()), AttributeValue::Null(true)]),
        )]));
        assert_eq!(from_attribute(&value).to_json().to_string(), r#"{"tags":["a",null]}"#);
    }
}

//! Shared AWS SDK setup for the DynamoDB, Glue and Athena adapters.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::fmt;
use tracing::debug;

use crate::config::AwsConfig;

/// Error metadata shared by every AWS SDK crate.
pub use aws_sdk_dynamodb::error::ProvideErrorMetadata;

const MAX_MESSAGE_LEN: usize = 512;

/// Error codes meaning the session's credentials can no longer sign requests.
const EXPIRED_CREDENTIAL_CODES: &[&str] = &[
    "ExpiredTokenException",
    "ExpiredToken",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
];

/// Load the SDK configuration, applying region and endpoint overrides.
pub async fn load_sdk_config(config: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.endpoint {
        debug!("Using AWS endpoint override {}", endpoint);
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

/// Code and message of a failed SDK call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub code: Option<String>,
    pub message: String,
}

impl ServiceFailure {
    /// Describe any SDK error. Service errors keep their code and message;
    /// transport failures fall back to their debug rendering.
    pub fn describe<E>(err: &E) -> Self
    where
        E: ProvideErrorMetadata + fmt::Debug,
    {
        let code = err.code().map(str::to_string);
        let message = match (err.code(), err.message()) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code.to_string(),
            (None, Some(message)) => message.to_string(),
            (None, None) => truncated(&format!("{err:?}")),
        };
        Self { code, message }
    }

    pub fn is_credentials_expired(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| EXPIRED_CREDENTIAL_CODES.contains(&code))
    }
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn truncated(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

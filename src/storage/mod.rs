//! Object storage abstraction.
//!
//! Wraps `object_store` behind a provider rooted at a URL prefix. Partition
//! objects are addressed by keys relative to that root, and the provider can
//! render the absolute location a discovery job should crawl.

mod local;
mod s3;

use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::{Captures, Regex};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

pub use local::LocalConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider rooted at a bucket/prefix or a local directory.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    /// Scheme-qualified root, e.g. `s3://bucket/prefix` or `file:///tmp/out`.
    pub(crate) root_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.root_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
    Memory,
}

/// URL patterns, tried in order.
static URL_PATTERNS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    let patterns = [
        (
            Backend::S3,
            r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+?))?/?$",
        ),
        (
            Backend::S3,
            r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+?))?/?$",
        ),
        (
            Backend::S3,
            r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+?))?/?$",
        ),
        (Backend::Memory, r"^memory://$"),
        (Backend::Local, r"^file://(?P<path>.*)$"),
        (Backend::Local, r"^(?P<path>/.*)$"),
    ];
    patterns
        .into_iter()
        .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("valid URL pattern")))
        .collect()
});

/// Backend configuration parsed from a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    /// Process-local store, lost on exit.
    Memory,
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, pattern) in URL_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(url) {
                return Ok(match backend {
                    Backend::S3 => Self::parse_s3(&caps),
                    Backend::Local => Self::parse_local(&caps),
                    Backend::Memory => BackendConfig::Memory,
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(caps: &Captures) -> Self {
        let bucket = caps["bucket"].to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|endpoint| {
                let protocol = caps.name("protocol").map_or("https", |p| p.as_str());
                let port = caps.name("port").map_or("443", |p| p.as_str());
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = caps.name("key").map(|m| Path::from(m.as_str()));

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        })
    }

    fn parse_local(caps: &Captures) -> Self {
        let path = caps["path"].trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        BackendConfig::Local(LocalConfig { path })
    }

    /// Scheme-qualified root in canonical form: `s3://bucket/prefix`,
    /// `file:///path` or `memory://`, whatever spelling the URL used.
    pub fn root_url(&self) -> String {
        match self {
            BackendConfig::S3(s3) => s3.root_url(),
            BackendConfig::Local(local) => format!("file://{}", local.path),
            BackendConfig::Memory => "memory://".to_string(),
        }
    }

    fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(_) | BackendConfig::Memory => None,
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory => Ok(Self::in_memory()),
        }
    }

    /// A provider backed by process memory.
    pub fn in_memory() -> Self {
        Self {
            root_url: BackendConfig::Memory.root_url(),
            config: BackendConfig::Memory,
            object_store: Arc::new(InMemory::new()),
        }
    }

    /// Write `bytes` at `path`, replacing any existing object.
    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = Path::from(path);
        let qualified = self.qualify_path(&path);
        let size = bytes.len();
        let start = Instant::now();
        let result = self
            .object_store
            .put(&qualified, PutPayload::from(bytes))
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: RequestStatus::from_result(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        debug!("Wrote {} bytes to {}", size, self.url_for(path.as_ref()));
        Ok(())
    }

    /// Read the whole object at `path`.
    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let path = Path::from(path);
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: RequestStatus::from_result(&result),
            duration: start.elapsed(),
        });

        result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Check whether an object exists at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let path = Path::from(path);
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(&path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Head,
            status: RequestStatus::from_result(&result),
            duration: start.elapsed(),
        });

        match result {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Absolute, scheme-qualified location of a relative path.
    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.root_url.clone()
        } else if self.root_url.ends_with('/') {
            format!("{}{}", self.root_url, path)
        } else {
            format!("{}/{}", self.root_url, path)
        }
    }

    /// Scheme-qualified root of this provider.
    pub fn root_url(&self) -> &str {
        &self.root_url
    }
}

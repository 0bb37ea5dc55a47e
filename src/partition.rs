//! Partition descriptor resolution.
//!
//! Every configured source becomes one partition. All names a partition
//! uses downstream (schema, discovery job, object key, sink table) are derived
//! here from the source identifier, so the rest of the pipeline never builds
//! names itself.

use snafu::prelude::*;
use std::collections::{HashMap, HashSet};

use crate::config::{FileFormat, NamingConfig};
use crate::error::{
    BlankSourceSnafu, ConfigError, DuplicateSourceSnafu, EmptySourcesSnafu, InvalidSourceSnafu,
    MissingPlaceholderSnafu, NameCollisionSnafu,
};

const SOURCE_PLACEHOLDER: &str = "{source}";
const ENV_PLACEHOLDER: &str = "{env}";

/// The names one partition uses across all stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Key-value table the partition is read from.
    pub source_name: String,
    /// Catalog schema the discovery job registers into.
    pub schema_name: String,
    pub discovery_job_name: String,
    /// Object key, relative to the storage root.
    pub object_key: String,
    /// Absolute location the discovery job crawls: the object's folder.
    pub crawl_target: String,
    /// Table name discovery infers from the object folder.
    pub discovered_table: String,
    pub sink_table_name: String,
}

/// Derives [`PartitionDescriptor`]s from source identifiers.
#[derive(Debug, Clone)]
pub struct PartitionResolver<'a> {
    pub naming: &'a NamingConfig,
    pub environment: &'a str,
    pub storage_root: &'a str,
    pub format: FileFormat,
}

impl PartitionResolver<'_> {
    /// One descriptor per source, in the order given.
    pub fn resolve(&self, sources: &[String]) -> Result<Vec<PartitionDescriptor>, ConfigError> {
        ensure!(!sources.is_empty(), EmptySourcesSnafu);
        self.check_templates()?;

        let mut seen = HashSet::new();
        for (index, source) in sources.iter().enumerate() {
            ensure!(!source.trim().is_empty(), BlankSourceSnafu { index });
            ensure!(is_valid_source(source), InvalidSourceSnafu { name: source });
            ensure!(
                seen.insert(source.as_str()),
                DuplicateSourceSnafu { name: source }
            );
        }

        let partitions: Vec<_> = sources.iter().map(|s| self.describe(s)).collect();
        // The catalog stores schema names lowercased.
        check_distinct(&partitions, "schema", |p| p.schema_name.to_ascii_lowercase())?;
        check_distinct(&partitions, "discovery job", |p| p.discovery_job_name.clone())?;
        check_distinct(&partitions, "sink table", |p| p.sink_table_name.clone())?;
        Ok(partitions)
    }

    fn check_templates(&self) -> Result<(), ConfigError> {
        for (setting, template) in [
            ("naming.schema", &self.naming.schema),
            ("naming.discovery_job", &self.naming.discovery_job),
            ("naming.sink_table", &self.naming.sink_table),
        ] {
            ensure!(
                template.contains(SOURCE_PLACEHOLDER),
                MissingPlaceholderSnafu { setting, template }
            );
        }
        Ok(())
    }

    fn describe(&self, source: &str) -> PartitionDescriptor {
        let root = self.storage_root.trim_end_matches('/');
        let separator = if root.ends_with(':') { "//" } else { "/" };
        PartitionDescriptor {
            source_name: source.to_string(),
            schema_name: self.render(&self.naming.schema, source),
            discovery_job_name: self.render(&self.naming.discovery_job, source),
            object_key: format!("{source}/{source}.{}", self.format.extension()),
            crawl_target: format!("{root}{separator}{source}/"),
            discovered_table: catalog_table_name(source),
            sink_table_name: self.render(&self.naming.sink_table, source),
        }
    }

    fn render(&self, template: &str, source: &str) -> String {
        template
            .replace(ENV_PLACEHOLDER, self.environment)
            .replace(SOURCE_PLACEHOLDER, source)
    }
}

fn is_valid_source(source: &str) -> bool {
    source
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// The catalog lowercases folder names and maps other punctuation to `_`.
fn catalog_table_name(folder: &str) -> String {
    folder
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject two partitions sharing a name, compared by `key`.
fn check_distinct(
    partitions: &[PartitionDescriptor],
    setting: &'static str,
    key: impl Fn(&PartitionDescriptor) -> String,
) -> Result<(), ConfigError> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    for partition in partitions {
        let name = key(partition);
        if let Some(first) = owners.get(&name) {
            return NameCollisionSnafu {
                setting,
                name,
                first: *first,
                second: &partition.source_name,
            }
            .fail();
        }
        owners.insert(name, &partition.source_name);
    }
    Ok(())
}

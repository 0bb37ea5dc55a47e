//! Failure record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::events::Stage;

/// One failed partition, as written to the dead-letter report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionFailure {
    /// Source table of the failed partition.
    pub source_name: String,
    pub stage: Stage,
    /// Error with its chain of causes.
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Failure counts per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub scan: usize,
    pub transform: usize,
    pub object_write: usize,
    pub schema_wait: usize,
    pub discovery: usize,
    pub query: usize,
    pub load: usize,
}

impl FailureStats {
    pub fn increment(&mut self, stage: Stage) {
        match stage {
            Stage::Scan => self.scan += 1,
            Stage::Transform => self.transform += 1,
            Stage::ObjectWrite => self.object_write += 1,
            Stage::SchemaWait => self.schema_wait += 1,
            Stage::Discovery => self.discovery += 1,
            Stage::Query => self.query += 1,
            Stage::Load => self.load += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.scan
            + self.transform
            + self.object_write
            + self.schema_wait
            + self.discovery
            + self.query
            + self.load
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_stats_increment() {
        let mut stats = FailureStats::default();
        stats.increment(Stage::Scan);
        stats.increment(Stage::Scan);
        stats.increment(Stage::Query);

        assert_eq!(stats.scan, 2);
        assert_eq!(stats.query, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_failure_deserialization() {
        let json = r#"{"source_name":"users","stage":"schema_wait","error":"Schemas not available after 10 checks: [\"glue_database_users_DEV\"]","timestamp":"2025-01-26T10:30:00Z"}"#;
        let failure: PartitionFailure = serde_json::from_str(json).unwrap();

        assert_eq!(failure.source_name, "users");
        assert_eq!(failure.stage, Stage::SchemaWait);
        assert!(failure.error.contains("glue_database_users_DEV"));
    }
}

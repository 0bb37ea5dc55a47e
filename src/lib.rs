//! avalanche: a batch pipeline from key-value tables to a relational sink.
//!
//! Each configured source table is one partition. A partition is scanned in
//! full, flattened into a table, written to object storage, registered in a
//! catalog by a discovery job, queried, and the query result is loaded into
//! a relational database. Which stages run is a configuration choice.
//!
//! # Example
//!
//! ```ignore
//! use avalanche::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.yaml")?;
//!     let report = run_pipeline(config).await?;
//!     println!("Loaded {} rows", report.rows_loaded());
//!     Ok(())
//! }
//! ```

pub mod aws;
pub mod config;
pub mod discovery;
pub mod error;
pub mod failures;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod polling;
pub mod query;
pub mod sink;
pub mod source;
pub mod storage;
pub mod table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transform;

// Re-export main types
pub use config::Config;
pub use partition::{PartitionDescriptor, PartitionResolver};
pub use pipeline::{Collaborators, Pipeline, RunReport, run_pipeline};
pub use storage::{StorageProvider, StorageProviderRef};
pub use table::TabularRowSet;

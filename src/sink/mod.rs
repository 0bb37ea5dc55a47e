//! Sinks a partition's table is written to.
//!
//! - `object`: encoded table objects the discovery job crawls
//! - `relational`: create-if-absent plus per-row parameterized inserts
//! - `postgres`: the relational sink backed by `tokio-postgres`

pub mod object;
pub mod postgres;
pub mod relational;

pub use object::{ObjectSinkWriter, decode_csv, encode_csv, encode_json};
pub use postgres::PostgresSink;
pub use relational::{RelationalLoader, RelationalSink, Statement};

// ABOUTME: Library root for analytics-replicator
// ABOUTME: Incrementally replicates operational PostgreSQL tables into an analytics database

pub mod config;
pub mod error;
pub mod postgres;
pub mod registry;
pub mod sync;
pub mod utils;
pub mod value;

pub use config::ReplicatorConfig;
pub use error::{DbError, ReplicationError, RowFailure};
pub use registry::Registry;
pub use sync::{ReplicationDriver, RunReport, RunStatus};

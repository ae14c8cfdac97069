// ABOUTME: Incremental replication engine: schema initializer, watermark, extractor, loader, driver
// ABOUTME: Database access goes through the session traits so the engine runs against any backend

pub mod daemon;
pub mod driver;
pub mod extractor;
pub mod loader;
pub mod report;
pub mod schema;
pub mod traits;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use daemon::{DaemonStats, ReplicationDaemon};
pub use driver::{ReplicationDriver, RunPhase};
pub use extractor::{select_query, DeltaExtractor, DeltaStream};
pub use loader::{insert_query, LoadOutcome, LoadSummary, Loader};
pub use report::{RunReport, RunStatus, TableReport};
pub use schema::{ensure_database, ensure_schema, ensure_tables, SchemaReport};
pub use traits::{
    Connector, DatabaseCatalog, DeltaSource, RawRowStream, RowSink, SchemaTarget, WatermarkTable,
};
pub use watermark::{advance_target, sentinel, WatermarkStore, METADATA_TABLE};

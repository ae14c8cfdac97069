// ABOUTME: PostgreSQL connection handling for source, destination and admin databases
// ABOUTME: Exposes timeout-bounded sessions and the connector used by the replication driver

pub mod connection;

pub use connection::{connect, connect_with_retry, PgConnector, PgSession};

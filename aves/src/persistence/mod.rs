/// PostgreSQL-backed job store, event leases and aggregate locks.
pub mod postgres;

pub use postgres::{migrate, PostgresAggregateLocker, PostgresJobStore, PostgresLeaseStore, SCHEMA};

//! property-sync - Synchronizes a property-management API into a local store
//!
//! The crate pulls owners, properties, units, tenants and leases page by
//! page through a resilient HTTP client, maps them into canonical rows and
//! upserts them into SQLite. Runs are scheduled on a fixed interval, guarded
//! by a lease lock, isolated per entity and audited; failed entities land in
//! a persistent dead letter queue.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod otel;
pub mod server;
pub mod sync;

// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CourseBridge shared infrastructure
//!
//! Database pool construction, embedded migrations, and the key-value store
//! used for short-lived working state (rate-limit windows, compensation
//! cache, workflow state).

pub mod db;
pub mod kv;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use kv::{connect_store, InMemoryStore, KeyValueStore, RedisStore, StoreError, StoreResult};

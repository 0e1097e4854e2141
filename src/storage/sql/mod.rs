//! Durable SQLite store.
//!
//! Provides the same contract as the in-memory store, persisted across
//! restarts, with schema setup from the embedded migrations.

mod store;

pub use store::*;

//! Cache store for sessdex
//!
//! SQLite storage with:
//! - Forward-only schema migrations tracked in `store_meta`
//! - A single writer connection behind a mutex
//! - A separate read connection (WAL) for interactive aggregate queries

pub mod repo;
pub mod schema;

pub use repo::{CacheStore, WriteKind, WriteOutcome};

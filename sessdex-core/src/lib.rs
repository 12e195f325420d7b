//! # sessdex-core
//!
//! Core library for sessdex - an incremental index over AI coding assistant
//! session logs.
//!
//! This library provides:
//! - Domain types for session records, scopes and aggregates
//! - Source parsers (Claude Code, Codex, Aider)
//! - A SQLite cache store keyed by file fingerprints
//! - An async coordinator that refreshes the cache and publishes changes
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! A refresh flows through four stages:
//! - **Catalog:** list or stat the log files a scope covers
//! - **Detect:** compare file fingerprints against cached rows
//! - **Parse:** stream changed files into one summary record each
//! - **Commit:** write records and deletions to the store in batches
//!
//! Aggregate queries read the store directly and never wait on a refresh.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sessdex_core::{Config, IndexService, Scope};
//!
//! # async fn run() -> sessdex_core::Result<()> {
//! let config = Config::load()?;
//! let service = IndexService::start(&config)?;
//! service.refresh(Scope::All).await?;
//! let snapshot = service.query(&Scope::All)?;
//! println!("{} sessions", snapshot.sessions);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use catalog::FileCatalog;
pub use config::Config;
pub use coordinator::{IndexService, SubscriptionId};
pub use db::{CacheStore, WriteKind, WriteOutcome};
pub use detect::{ChangeDetector, Classification};
pub use error::{Error, ParseError, Result};
pub use ingest::RecordParser;
pub use types::*;

// Public modules
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod detect;
pub mod error;
pub mod format;
pub mod ingest;
pub mod logging;
pub mod types;
pub mod watch;

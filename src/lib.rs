//! Insert-only client for a Postgres-backed job queue.
//!
//! Jobs are rows in a database table, worked by an external worker pool.
//! This crate covers the producer side: turning typed job args plus
//! insertion options into durable rows, with optional uniqueness enforcement
//! so that logically equivalent jobs aren't enqueued twice.
//!
//! # Quick start
//!
//! ```rust
//! use jobq::{Client, JobArgs, MemoryStorage};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct SortArgs {
//!     strings: Vec<String>,
//! }
//!
//! impl JobArgs for SortArgs {
//!     fn kind(&self) -> &str {
//!         "sort"
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), jobq::InsertError> {
//! let client = Client::new(MemoryStorage::new());
//! let result = client
//!     .insert(&SortArgs { strings: vec!["whale".to_owned(), "tiger".to_owned()] })
//!     .await?;
//! assert_eq!(result.job.kind, "sort");
//! # Ok(())
//! # }
//! ```
//!
//! Production deployments use the Postgres backend instead (feature
//! `postgres`):
//!
//! ```rust,ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! let client = Client::new(PostgresStorage::new(pool));
//! ```
//!
//! # Unique jobs
//!
//! Pass [`UniqueOpts`] inside [`InsertOpts`] to deduplicate insertions along
//! any combination of args, period, and queue. With the default state set
//! deduplication is a single conflict-aware insert; a custom
//! [`by_state`](UniqueOpts::by_state) set falls back to an advisory-lock
//! protected check-then-insert. Either way, a skipped duplicate is reported
//! through [`InsertResult::unique_skipped_as_duplicated`] rather than as an
//! error.

mod bitmask;
mod client;
mod error;
mod fnv;
mod insert_opts;
mod job;
pub mod storage;
mod unique;

pub use bitmask::{InvalidBitmask, UniqueBitmask};
pub use client::{
    Client, ClientConfig, InsertManyParams, InsertResult, MAX_ATTEMPTS_DEFAULT, PRIORITY_DEFAULT,
    QUEUE_DEFAULT,
};
pub use error::{InsertError, StorageError};
pub use insert_opts::{ByArgs, InsertOpts, UniqueOpts};
pub use job::{AttemptError, JobArgs, JobRow, JobState, JsonArgs, UnknownJobState};
pub use storage::{MemoryStorage, Storage, StorageTx};
#[cfg(feature = "postgres")]
pub use storage::PostgresStorage;
pub use unique::{DEFAULT_UNIQUE_STATES, REQUIRED_UNIQUE_STATES};

//! Storage backends for job insertion.
//!
//! This module provides:
//! - [`Storage`] trait - insert operations a backend must supply
//! - [`StorageTx`] trait - transaction-scoped operations for the slow path
//! - [`MemoryStorage`] - in-memory backend for testing
//! - `PostgresStorage` - sqlx-backed Postgres backend (feature `postgres`)

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::bitmask::UniqueBitmask;
use crate::error::StorageError;
use crate::job::{JobRow, JobState};

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{MemoryStorage, MemoryTx};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresStorage, PostgresTx};

/// Resolved parameters for one job insertion.
///
/// Handed to storage backends and meant for internal use; constructed fresh
/// per insertion and immutable once submitted.
#[derive(Clone, Debug, PartialEq)]
pub struct JobInsertParams {
    /// JSON-encoded job payload.
    pub encoded_args: String,
    /// Job kind.
    pub kind: String,
    /// Maximum number of attempts.
    pub max_attempts: i32,
    /// Priority, 1 being the highest.
    pub priority: i16,
    /// Target queue.
    pub queue: String,
    /// Earliest run time; `None` lets the database default to now.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Initial lifecycle state.
    pub state: JobState,
    /// Categorization tags.
    pub tags: Vec<String>,
    /// Uniqueness fingerprint, when the insert is unique.
    pub unique_key: Option<Vec<u8>>,
    /// State set the fingerprint is enforced against.
    pub unique_states: Option<UniqueBitmask>,
}

/// How the args dimension is matched during a slow-path lookup.
#[derive(Clone, Copy, Debug)]
pub enum ArgsMatch<'a> {
    /// The row's payload equals the canonical JSON structurally.
    Exact(&'a str),
    /// The row's payload contains the canonical JSON (used when uniqueness
    /// was computed over a key subset of the payload).
    Contains(&'a str),
}

/// Point-lookup parameters for an existing unique job, used only on the
/// advisory-lock slow path.
#[derive(Clone, Debug)]
pub struct UniqueLookupParams<'a> {
    /// Job kind to match.
    pub kind: &'a str,
    /// Args predicate, when `by_args` is active.
    pub args: Option<ArgsMatch<'a>>,
    /// Half-open `[lower, upper)` creation-time bounds, when `by_period` is
    /// active.
    pub created_at: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Queue to match, when `by_queue` is active.
    pub queue: Option<&'a str>,
    /// States the existing job may be in.
    pub states: &'a [JobState],
}

/// Trait for job insertion backends.
///
/// Implementations must uphold two invariants the unique coordinator depends
/// on: [`Storage::insert_unique`] enforces at most one live row per
/// `unique_key` among rows whose persisted `unique_states` mask contains
/// their current state, and the mask's bit order matches
/// [`UniqueBitmask`] exactly.
pub trait Storage: Send + Sync {
    /// Transaction handle for slow-path operations. Dropping it without
    /// [`StorageTx::commit`] rolls back.
    type Tx: StorageTx;

    /// Insert one job unconditionally.
    fn insert(
        &self,
        params: &JobInsertParams,
    ) -> impl Future<Output = Result<JobRow, StorageError>> + Send;

    /// Conflict-aware single insert: atomically inserts, or returns the
    /// existing row for the same fingerprint together with `true`.
    fn insert_unique(
        &self,
        params: &JobInsertParams,
    ) -> impl Future<Output = Result<(JobRow, bool), StorageError>> + Send;

    /// Conflict-aware bulk insert. Returns one `(row, was_duplicate)` pair
    /// per input, preserving input order.
    fn insert_many(
        &self,
        params: &[JobInsertParams],
    ) -> impl Future<Output = Result<Vec<(JobRow, bool)>, StorageError>> + Send;

    /// Open a transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StorageError>> + Send;
}

/// Transaction-scoped storage operations.
pub trait StorageTx: Send {
    /// Take a transaction-scoped advisory lock, blocking until it is
    /// granted. Released automatically when the transaction ends.
    fn advisory_lock(&mut self, key: i64)
        -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Non-blocking advisory lock variant; returns whether the lock was
    /// acquired.
    fn try_advisory_lock(
        &mut self,
        key: i64,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Look up one existing job by kind and unique properties.
    fn find_by_kind_and_unique_properties(
        &mut self,
        lookup: &UniqueLookupParams<'_>,
    ) -> impl Future<Output = Result<Option<JobRow>, StorageError>> + Send;

    /// Insert one job within the transaction.
    fn insert(
        &mut self,
        params: &JobInsertParams,
    ) -> impl Future<Output = Result<JobRow, StorageError>> + Send;

    /// Commit the transaction.
    fn commit(self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

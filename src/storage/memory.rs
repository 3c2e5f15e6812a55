//! In-memory storage implementation for testing and simple use cases.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ArgsMatch, JobInsertParams, Storage, StorageTx, UniqueLookupParams};
use crate::error::StorageError;
use crate::job::JobRow;

/// In-memory job storage.
///
/// Jobs live in a thread-safe table and advisory lock calls are recorded for
/// inspection, making this the natural backend for unit tests and
/// single-process scenarios. It applies the same unique-index predicate a
/// database backend enforces: a row blocks duplicates only while its
/// persisted `unique_states` mask contains its current state.
///
/// # Cloning
///
/// Cloning creates a new handle to the **same** underlying table.
///
/// # Example
///
/// ```rust,ignore
/// let storage = MemoryStorage::new();
/// let client = Client::new(storage.clone());
/// client.insert(&my_args).await?;
/// assert_eq!(storage.len().await, 1);
/// ```
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

struct MemoryState {
    jobs: Vec<JobRow>,
    next_id: i64,
    advisory_lock_calls: Vec<i64>,
}

impl Clone for MemoryStorage {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new empty memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                jobs: Vec::new(),
                next_id: 0,
                advisory_lock_calls: Vec::new(),
            })),
        }
    }

    /// Get the number of stored jobs.
    #[must_use = "this returns the count, it doesn't modify the table"]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    /// Check if the table is empty.
    #[must_use = "this returns a boolean, it doesn't modify the table"]
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }

    /// Snapshot of all stored jobs, in insertion order.
    pub async fn jobs(&self) -> Vec<JobRow> {
        self.inner.lock().await.jobs.clone()
    }

    /// Advisory lock keys requested so far, in call order. Includes both
    /// blocking and non-blocking acquisitions.
    pub async fn advisory_lock_calls(&self) -> Vec<i64> {
        self.inner.lock().await.advisory_lock_calls.clone()
    }
}

impl MemoryState {
    fn insert_row(&mut self, params: &JobInsertParams) -> JobRow {
        self.next_id += 1;
        let now = Utc::now();
        let job = JobRow {
            id: self.next_id,
            args: serde_json::from_str(&params.encoded_args).unwrap_or(Value::Null),
            attempt: 0,
            attempted_at: None,
            attempted_by: None,
            created_at: now,
            errors: None,
            finalized_at: None,
            kind: params.kind.clone(),
            max_attempts: params.max_attempts,
            metadata: Value::Object(serde_json::Map::new()),
            priority: params.priority,
            queue: params.queue.clone(),
            // The database defaults this column to the insertion time.
            scheduled_at: params.scheduled_at.unwrap_or(now),
            state: params.state,
            tags: params.tags.clone(),
            unique_key: params.unique_key.clone(),
            unique_states: params.unique_states,
        };
        self.jobs.push(job.clone());
        job
    }

    /// The unique-index predicate: an existing row conflicts only while its
    /// own `unique_states` mask contains its own current state.
    fn find_conflicting(&self, params: &JobInsertParams) -> Option<&JobRow> {
        let unique_key = params.unique_key.as_ref()?;
        params.unique_states?;
        self.jobs.iter().find(|job| {
            job.unique_key.as_ref() == Some(unique_key)
                && job.unique_states.is_some_and(|mask| mask.contains(job.state))
        })
    }

    fn insert_unique_row(&mut self, params: &JobInsertParams) -> (JobRow, bool) {
        if let Some(existing) = self.find_conflicting(params) {
            return (existing.clone(), true);
        }
        (self.insert_row(params), false)
    }
}

impl Storage for MemoryStorage {
    type Tx = MemoryTx;

    async fn insert(&self, params: &JobInsertParams) -> Result<JobRow, StorageError> {
        Ok(self.inner.lock().await.insert_row(params))
    }

    async fn insert_unique(&self, params: &JobInsertParams) -> Result<(JobRow, bool), StorageError> {
        Ok(self.inner.lock().await.insert_unique_row(params))
    }

    async fn insert_many(
        &self,
        params: &[JobInsertParams],
    ) -> Result<Vec<(JobRow, bool)>, StorageError> {
        let mut state = self.inner.lock().await;
        Ok(params
            .iter()
            .map(|params| state.insert_unique_row(params))
            .collect())
    }

    async fn begin(&self) -> Result<MemoryTx, StorageError> {
        Ok(MemoryTx {
            state: Arc::clone(&self.inner).lock_owned().await,
            inserted_ids: Vec::new(),
            committed: false,
        })
    }
}

/// Memory-storage transaction.
///
/// Holds the table lock for its whole lifetime, which trivially serializes
/// concurrent transactions the way a database's advisory lock would. Rows
/// inserted through the transaction are removed again if it is dropped
/// without [`StorageTx::commit`].
pub struct MemoryTx {
    state: OwnedMutexGuard<MemoryState>,
    inserted_ids: Vec<i64>,
    committed: bool,
}

impl StorageTx for MemoryTx {
    async fn advisory_lock(&mut self, key: i64) -> Result<(), StorageError> {
        self.state.advisory_lock_calls.push(key);
        Ok(())
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool, StorageError> {
        // The table lock already excludes other transactions, so the lock is
        // always grantable; the call is recorded for test inspection.
        self.state.advisory_lock_calls.push(key);
        Ok(true)
    }

    async fn find_by_kind_and_unique_properties(
        &mut self,
        lookup: &UniqueLookupParams<'_>,
    ) -> Result<Option<JobRow>, StorageError> {
        Ok(self
            .state
            .jobs
            .iter()
            .find(|job| {
                job.kind == lookup.kind
                    && lookup.states.contains(&job.state)
                    && lookup.queue.is_none_or(|queue| job.queue == queue)
                    && lookup
                        .created_at
                        .is_none_or(|(lower, upper)| job.created_at >= lower && job.created_at < upper)
                    && lookup.args.is_none_or(|args| args_match(&job.args, args))
            })
            .cloned())
    }

    async fn insert(&mut self, params: &JobInsertParams) -> Result<JobRow, StorageError> {
        let job = self.state.insert_row(params);
        self.inserted_ids.push(job.id);
        Ok(job)
    }

    async fn commit(mut self) -> Result<(), StorageError> {
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.committed {
            let inserted = std::mem::take(&mut self.inserted_ids);
            self.state.jobs.retain(|job| !inserted.contains(&job.id));
        }
    }
}

fn args_match(row_args: &Value, predicate: ArgsMatch<'_>) -> bool {
    match predicate {
        ArgsMatch::Exact(canonical) => serde_json::from_str::<Value>(canonical)
            .is_ok_and(|wanted| wanted == *row_args),
        ArgsMatch::Contains(canonical) => {
            match (serde_json::from_str::<Value>(canonical), row_args) {
                (Ok(Value::Object(wanted)), Value::Object(actual)) => wanted
                    .iter()
                    .all(|(key, value)| actual.get(key) == Some(value)),
                _ => false,
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

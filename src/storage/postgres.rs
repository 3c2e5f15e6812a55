//! Postgres storage backend via sqlx.
//!
//! Expects the schema in `sql/schema.sql`: a `jobq_job` table with a partial
//! unique index over `unique_key` scoped to rows whose `unique_states`
//! bitmask contains their current state, and a `jobq_state_in_bitmask`
//! helper function. Both invariants must match [`UniqueBitmask`] bit for
//! bit.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};

use super::{ArgsMatch, JobInsertParams, Storage, StorageTx, UniqueLookupParams};
use crate::bitmask::UniqueBitmask;
use crate::error::StorageError;
use crate::job::{AttemptError, JobRow, JobState};

/// Columns selected when hydrating a [`JobRow`]. The enum and bit columns
/// travel as text and int so no custom sqlx type mappings are needed.
const JOB_COLUMNS: &str = "id, args, attempt, attempted_at, attempted_by, created_at, errors, \
     finalized_at, kind, max_attempts, metadata, priority, queue, scheduled_at, \
     state::text AS state, tags, unique_key, unique_states::int AS unique_states";

const INSERT_SQL: &str = "\
    INSERT INTO jobq_job (args, kind, max_attempts, priority, queue, scheduled_at, state, tags, unique_key, unique_states)\n\
    VALUES ($1::jsonb, $2, $3, $4, $5, coalesce($6, now()), $7::jobq_job_state, $8, $9, ($10)::bit(8))";

/// The conflict target is the partial unique index: a fingerprinted row
/// conflicts only while its own mask covers its own state. The no-op update
/// lets RETURNING hand back the winning row, with `xmax != 0` flagging that
/// it pre-existed.
const ON_CONFLICT_SQL: &str = "\n\
    ON CONFLICT (unique_key)\n\
        WHERE unique_key IS NOT NULL\n\
          AND unique_states IS NOT NULL\n\
          AND jobq_state_in_bitmask(unique_states, state)\n\
    DO UPDATE SET kind = EXCLUDED.kind";

/// Postgres-backed job storage.
///
/// # Example
///
/// ```rust,ignore
/// let pool = PgPool::connect(&database_url).await?;
/// let client = Client::new(PostgresStorage::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a storage backed by the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Storage for PostgresStorage {
    type Tx = PostgresTx;

    async fn insert(&self, params: &JobInsertParams) -> Result<JobRow, StorageError> {
        let sql = format!("{INSERT_SQL}\nRETURNING {JOB_COLUMNS}");
        let row = bind_insert_params(sqlx::query(&sql), params)
            .fetch_one(&self.pool)
            .await?;
        job_row_from_pg(&row)
    }

    async fn insert_unique(&self, params: &JobInsertParams) -> Result<(JobRow, bool), StorageError> {
        let sql = format!(
            "{INSERT_SQL}{ON_CONFLICT_SQL}\nRETURNING {JOB_COLUMNS}, (xmax != 0) AS unique_skipped_as_duplicate"
        );
        let row = bind_insert_params(sqlx::query(&sql), params)
            .fetch_one(&self.pool)
            .await?;
        Ok((job_row_from_pg(&row)?, row.try_get("unique_skipped_as_duplicate")?))
    }

    async fn insert_many(
        &self,
        params: &[JobInsertParams],
    ) -> Result<Vec<(JobRow, bool)>, StorageError> {
        let mut args = Vec::with_capacity(params.len());
        let mut kinds = Vec::with_capacity(params.len());
        let mut max_attempts = Vec::with_capacity(params.len());
        let mut priorities = Vec::with_capacity(params.len());
        let mut queues = Vec::with_capacity(params.len());
        let mut scheduled_ats: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(params.len());
        let mut states = Vec::with_capacity(params.len());
        let mut tags = Vec::with_capacity(params.len());
        let mut unique_keys: Vec<Option<Vec<u8>>> = Vec::with_capacity(params.len());
        let mut unique_states: Vec<Option<i32>> = Vec::with_capacity(params.len());

        for row in params {
            args.push(row.encoded_args.clone());
            kinds.push(row.kind.clone());
            max_attempts.push(row.max_attempts);
            priorities.push(row.priority);
            queues.push(row.queue.clone());
            scheduled_ats.push(row.scheduled_at);
            states.push(row.state.as_str().to_owned());
            // Tags travel as one comma-joined string per row; text[] can't
            // nest inside the unnest arrays.
            tags.push(row.tags.join(","));
            unique_keys.push(row.unique_key.clone());
            unique_states.push(row.unique_states.map(|mask| i32::from(mask.as_u8())));
        }

        let sql = format!(
            "INSERT INTO jobq_job (args, kind, max_attempts, priority, queue, scheduled_at, state, tags, unique_key, unique_states)\n\
             SELECT t.args::jsonb, t.kind, t.max_attempts, t.priority, t.queue, coalesce(t.scheduled_at, now()),\n\
                    t.state::jobq_job_state,\n\
                    CASE WHEN t.tags = '' THEN '{{}}'::text[] ELSE string_to_array(t.tags, ',') END,\n\
                    t.unique_key, (t.unique_states)::bit(8)\n\
             FROM unnest($1::text[], $2::text[], $3::int[], $4::smallint[], $5::text[], $6::timestamptz[], $7::text[], $8::text[], $9::bytea[], $10::int[])\n\
                  AS t(args, kind, max_attempts, priority, queue, scheduled_at, state, tags, unique_key, unique_states)\
             {ON_CONFLICT_SQL}\n\
             RETURNING {JOB_COLUMNS}, (xmax != 0) AS unique_skipped_as_duplicate"
        );

        let rows = sqlx::query(&sql)
            .bind(&args)
            .bind(&kinds)
            .bind(&max_attempts)
            .bind(&priorities)
            .bind(&queues)
            .bind(&scheduled_ats)
            .bind(&states)
            .bind(&tags)
            .bind(&unique_keys)
            .bind(&unique_states)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    job_row_from_pg(row)?,
                    row.try_get("unique_skipped_as_duplicate")?,
                ))
            })
            .collect()
    }

    async fn begin(&self) -> Result<PostgresTx, StorageError> {
        Ok(PostgresTx {
            tx: self.pool.begin().await?,
        })
    }
}

/// Postgres transaction handle. Dropping without commit rolls back, and any
/// advisory locks taken through it are transaction-scoped and released with
/// it.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl StorageTx for PostgresTx {
    async fn advisory_lock(&mut self, key: i64) -> Result<(), StorageError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT pg_try_advisory_xact_lock($1) AS acquired")
            .bind(key)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row.try_get("acquired")?)
    }

    async fn find_by_kind_and_unique_properties(
        &mut self,
        lookup: &UniqueLookupParams<'_>,
    ) -> Result<Option<JobRow>, StorageError> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobq_job WHERE kind = "
        ));
        query.push_bind(lookup.kind);

        match lookup.args {
            Some(ArgsMatch::Exact(canonical)) => {
                query.push(" AND args = ");
                query.push_bind(canonical);
                query.push("::jsonb");
            }
            Some(ArgsMatch::Contains(canonical)) => {
                query.push(" AND args @> ");
                query.push_bind(canonical);
                query.push("::jsonb");
            }
            None => {}
        }
        if let Some((lower, upper)) = lookup.created_at {
            query.push(" AND created_at >= ");
            query.push_bind(lower);
            query.push(" AND created_at < ");
            query.push_bind(upper);
        }
        if let Some(queue) = lookup.queue {
            query.push(" AND queue = ");
            query.push_bind(queue);
        }
        let states: Vec<String> = lookup
            .states
            .iter()
            .map(|state| state.as_str().to_owned())
            .collect();
        query.push(" AND state::text = ANY(");
        query.push_bind(states);
        query.push(") ORDER BY id LIMIT 1");

        let row = query.build().fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(job_row_from_pg).transpose()
    }

    async fn insert(&mut self, params: &JobInsertParams) -> Result<JobRow, StorageError> {
        let sql = format!("{INSERT_SQL}\nRETURNING {JOB_COLUMNS}");
        let row = bind_insert_params(sqlx::query(&sql), params)
            .fetch_one(&mut *self.tx)
            .await?;
        job_row_from_pg(&row)
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_insert_params<'q>(query: PgQuery<'q>, params: &'q JobInsertParams) -> PgQuery<'q> {
    query
        .bind(&params.encoded_args)
        .bind(&params.kind)
        .bind(params.max_attempts)
        .bind(params.priority)
        .bind(&params.queue)
        .bind(params.scheduled_at)
        .bind(params.state.as_str())
        .bind(&params.tags)
        .bind(&params.unique_key)
        .bind(params.unique_states.map(|mask| i32::from(mask.as_u8())))
}

fn job_row_from_pg(row: &PgRow) -> Result<JobRow, StorageError> {
    let state: String = row.try_get("state")?;
    let errors: Option<Vec<Json<AttemptError>>> = row.try_get("errors")?;
    let unique_states: Option<i32> = row.try_get("unique_states")?;

    Ok(JobRow {
        id: row.try_get("id")?,
        args: row.try_get("args")?,
        attempt: row.try_get("attempt")?,
        attempted_at: row.try_get("attempted_at")?,
        attempted_by: row.try_get("attempted_by")?,
        created_at: row.try_get("created_at")?,
        errors: errors.map(|errors| errors.into_iter().map(|Json(error)| error).collect()),
        finalized_at: row.try_get("finalized_at")?,
        kind: row.try_get("kind")?,
        max_attempts: row.try_get("max_attempts")?,
        metadata: row.try_get("metadata")?,
        priority: row.try_get("priority")?,
        queue: row.try_get("queue")?,
        scheduled_at: row.try_get("scheduled_at")?,
        state: state.parse::<JobState>()?,
        tags: row.try_get("tags")?,
        unique_key: row.try_get("unique_key")?,
        unique_states: unique_states.map(|mask| UniqueBitmask::from(mask as u8)),
    })
}

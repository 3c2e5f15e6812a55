//! Job insertion client and unique-insert coordination.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bitmask::UniqueBitmask;
use crate::error::InsertError;
use crate::fnv;
use crate::insert_opts::{InsertOpts, UniqueOpts};
use crate::job::{JobArgs, JobRow, JobState};
use crate::storage::{
    ArgsMatch, JobInsertParams, Storage, StorageTx, UniqueLookupParams,
};
use crate::unique::{effective_unique_states, UniqueDims, DEFAULT_UNIQUE_STATES};

/// Default maximum number of attempts.
pub const MAX_ATTEMPTS_DEFAULT: i32 = 25;

/// Default priority (1 is the highest).
pub const PRIORITY_DEFAULT: i16 = 1;

/// Default queue name.
pub const QUEUE_DEFAULT: &str = "default";

/// Configuration for a [`Client`].
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Optional namespace folded into slow-path advisory lock keys, for
    /// deployments sharing one database with other advisory lock users. When
    /// set, lock keys carry the prefix in their high 32 bits and a 32-bit
    /// hash of the lock string in the low bits.
    pub advisory_lock_prefix: Option<u32>,
}

/// Result of a single insertion.
#[derive(Clone, Debug)]
pub struct InsertResult {
    /// The job row as persisted: the pre-existing row when an equivalent
    /// unique job was found, the freshly created row otherwise.
    pub job: JobRow,
    /// Whether the insert was skipped because an equivalent unique job
    /// already existed in one of its protected states.
    pub unique_skipped_as_duplicated: bool,
}

/// A single job within an [`Client::insert_many`] batch, pairing job args
/// with optional insertion options.
#[derive(Clone, Debug)]
pub struct InsertManyParams<A> {
    args: A,
    insert_opts: Option<InsertOpts>,
}

impl<A: JobArgs> InsertManyParams<A> {
    /// Batch entry with no call-site options.
    pub fn new(args: A) -> Self {
        Self {
            args,
            insert_opts: None,
        }
    }

    /// Batch entry with call-site options.
    pub fn with_opts(args: A, insert_opts: InsertOpts) -> Self {
        Self {
            args,
            insert_opts: Some(insert_opts),
        }
    }
}

impl<A: JobArgs> From<A> for InsertManyParams<A> {
    fn from(args: A) -> Self {
        Self::new(args)
    }
}

type TimeSource = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Insert-only client for a database-backed job queue.
///
/// Converts job args plus insertion options into durable rows to be worked
/// by an external worker pool. The client holds no locks or caches of its
/// own and is safe to share across tasks; every call is a plain async call
/// that blocks only on the storage backend.
///
/// # Example
///
/// ```rust,no_run
/// use jobq::{Client, JobArgs, MemoryStorage};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct SortArgs {
///     strings: Vec<String>,
/// }
///
/// impl JobArgs for SortArgs {
///     fn kind(&self) -> &str {
///         "sort"
///     }
/// }
///
/// # async fn example() -> Result<(), jobq::InsertError> {
/// let client = Client::new(MemoryStorage::new());
/// let result = client
///     .insert(&SortArgs { strings: vec!["whale".to_owned(), "tiger".to_owned()] })
///     .await?;
/// println!("inserted job {}", result.job.id);
/// # Ok(())
/// # }
/// ```
pub struct Client<S> {
    storage: S,
    advisory_lock_prefix: Option<u32>,
    time_now_utc: TimeSource,
}

impl<S: Storage> Client<S> {
    /// Create a client with default configuration.
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, ClientConfig::default())
    }

    /// Create a client with the given configuration.
    #[must_use]
    pub fn with_config(storage: S, config: ClientConfig) -> Self {
        Self {
            storage,
            advisory_lock_prefix: config.advisory_lock_prefix,
            time_now_utc: Arc::new(Utc::now),
        }
    }

    /// Replace the client's time source.
    ///
    /// Insertion time feeds period-based uniqueness and the
    /// scheduled-vs-available decision, so tests substitute a fixed instant
    /// here instead of touching process-wide state.
    #[must_use]
    pub fn with_time_source(
        mut self,
        now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.time_now_utc = Arc::new(now);
        self
    }

    /// Insert a new job with default options.
    ///
    /// Job-kind options from [`JobArgs::insert_opts`] still apply.
    ///
    /// # Errors
    ///
    /// Configuration errors ([`InsertError`] variants other than
    /// [`InsertError::Storage`]) are raised before any I/O; storage failures
    /// are propagated unchanged.
    pub async fn insert<A: JobArgs>(&self, args: &A) -> Result<InsertResult, InsertError> {
        self.insert_with_opts(args, InsertOpts::default()).await
    }

    /// Insert a new job with the given insertion options.
    ///
    /// Options are merged field by field: call-site options beat job-kind
    /// options beat system defaults, with only absent fields falling
    /// through.
    ///
    /// # Errors
    ///
    /// See [`Client::insert`].
    pub async fn insert_with_opts<A: JobArgs>(
        &self,
        args: &A,
        insert_opts: InsertOpts,
    ) -> Result<InsertResult, InsertError> {
        let (params, unique_opts) = self.make_insert_params(args, insert_opts)?;
        self.insert_unique(params, unique_opts).await
    }

    /// Insert many jobs as a single batch for improved efficiency.
    ///
    /// Each entry is resolved independently, exactly as
    /// [`Client::insert_with_opts`] would, and the whole batch goes to the
    /// storage backend in one round trip. Unique jobs participate through
    /// the database-enforced fast path only, so a custom `by_state` set is
    /// rejected here. Results come back in input order.
    ///
    /// # Errors
    ///
    /// See [`Client::insert`], plus
    /// [`InsertError::UniqueStatesCustomInBatch`].
    pub async fn insert_many<A, I>(&self, params: I) -> Result<Vec<InsertResult>, InsertError>
    where
        A: JobArgs,
        I: IntoIterator<Item = InsertManyParams<A>>,
    {
        let now = (self.time_now_utc)();
        let mut batch = Vec::new();

        for entry in params {
            let (mut insert_params, unique_opts) =
                self.make_insert_params(&entry.args, entry.insert_opts.unwrap_or_default())?;

            if let Some(unique_opts) = unique_opts.filter(|opts| !opts.is_empty()) {
                let states = effective_unique_states(unique_opts.by_state.as_deref())?;
                if states != DEFAULT_UNIQUE_STATES {
                    return Err(InsertError::UniqueStatesCustomInBatch);
                }
                let dims = UniqueDims::resolve(
                    &insert_params.encoded_args,
                    &insert_params.queue,
                    &unique_opts,
                    now,
                )?;
                insert_params.unique_key =
                    Some(dims.unique_key(&insert_params.kind, unique_opts.exclude_kind));
                insert_params.unique_states = Some(UniqueBitmask::from_states(&states));
            }

            batch.push(insert_params);
        }

        debug!(count = batch.len(), "inserting job batch");
        let rows = self
            .storage
            .insert_many(&batch)
            .await
            .map_err(InsertError::Storage)?;

        Ok(rows
            .into_iter()
            .map(|(job, unique_skipped_as_duplicated)| InsertResult {
                job,
                unique_skipped_as_duplicated,
            })
            .collect())
    }

    /// Merge the three option layers into final insert parameters,
    /// validating as it goes. Raises configuration errors before any I/O.
    fn make_insert_params<A: JobArgs>(
        &self,
        args: &A,
        insert_opts: InsertOpts,
    ) -> Result<(JobInsertParams, Option<UniqueOpts>), InsertError> {
        let kind = args.kind();
        if kind.is_empty() {
            return Err(InsertError::MissingKind);
        }

        let encoded_args = serde_json::to_string(args).map_err(InsertError::ArgsEncoding)?;
        if encoded_args == "null" {
            return Err(InsertError::NullArgs);
        }

        let args_insert_opts = args.insert_opts();

        let scheduled_at = insert_opts
            .scheduled_at
            .or(args_insert_opts.scheduled_at)
            .map(|at| at.with_timezone(&Utc));
        let state = if scheduled_at.is_some_and(|at| at > (self.time_now_utc)()) {
            JobState::Scheduled
        } else {
            JobState::Available
        };

        let tags = insert_opts
            .tags
            .or(args_insert_opts.tags)
            .unwrap_or_default();
        validate_tags(&tags)?;

        let params = JobInsertParams {
            encoded_args,
            kind: kind.to_owned(),
            max_attempts: insert_opts
                .max_attempts
                .or(args_insert_opts.max_attempts)
                .unwrap_or(MAX_ATTEMPTS_DEFAULT),
            priority: insert_opts
                .priority
                .or(args_insert_opts.priority)
                .unwrap_or(PRIORITY_DEFAULT),
            queue: insert_opts
                .queue
                .or(args_insert_opts.queue)
                .unwrap_or_else(|| QUEUE_DEFAULT.to_owned()),
            scheduled_at,
            state,
            tags,
            unique_key: None,
            unique_states: None,
        };

        let unique_opts = insert_opts.unique_opts.or(args_insert_opts.unique_opts);
        Ok((params, unique_opts))
    }

    /// Coordinate one insertion, deduplicating per the unique options.
    ///
    /// With the default state set, deduplication rides entirely on the
    /// database's conflict-aware insert. A custom state set can't be
    /// expressed by that static index predicate, so those inserts serialize
    /// on a transaction-scoped advisory lock and check for an existing row
    /// before inserting.
    async fn insert_unique(
        &self,
        mut params: JobInsertParams,
        unique_opts: Option<UniqueOpts>,
    ) -> Result<InsertResult, InsertError> {
        let Some(unique_opts) = unique_opts.filter(|opts| !opts.is_empty()) else {
            debug!(kind = %params.kind, "inserting job");
            let job = self
                .storage
                .insert(&params)
                .await
                .map_err(InsertError::Storage)?;
            return Ok(InsertResult {
                job,
                unique_skipped_as_duplicated: false,
            });
        };

        let now = (self.time_now_utc)();
        let states = effective_unique_states(unique_opts.by_state.as_deref())?;
        let dims = UniqueDims::resolve(&params.encoded_args, &params.queue, &unique_opts, now)?;
        params.unique_key = Some(dims.unique_key(&params.kind, unique_opts.exclude_kind));
        params.unique_states = Some(UniqueBitmask::from_states(&states));

        if states == DEFAULT_UNIQUE_STATES {
            debug!(kind = %params.kind, "inserting unique job via conflict path");
            let (job, unique_skipped_as_duplicated) = self
                .storage
                .insert_unique(&params)
                .await
                .map_err(InsertError::Storage)?;
            return Ok(InsertResult {
                job,
                unique_skipped_as_duplicated,
            });
        }

        let lock_key = self.advisory_lock_key(&dims.advisory_lock_string(&params.kind));
        debug!(kind = %params.kind, lock_key, "inserting unique job via advisory lock");

        let mut tx = self.storage.begin().await.map_err(InsertError::Storage)?;
        tx.advisory_lock(lock_key)
            .await
            .map_err(InsertError::Storage)?;

        let lookup = UniqueLookupParams {
            kind: &params.kind,
            args: dims.args().map(|(canonical, is_subset)| {
                if is_subset {
                    ArgsMatch::Contains(canonical)
                } else {
                    ArgsMatch::Exact(canonical)
                }
            }),
            created_at: dims.period(),
            queue: dims.queue(),
            states: &states,
        };
        if let Some(existing) = tx
            .find_by_kind_and_unique_properties(&lookup)
            .await
            .map_err(InsertError::Storage)?
        {
            tx.commit().await.map_err(InsertError::Storage)?;
            return Ok(InsertResult {
                job: existing,
                unique_skipped_as_duplicated: true,
            });
        }

        let job = tx.insert(&params).await.map_err(InsertError::Storage)?;
        tx.commit().await.map_err(InsertError::Storage)?;
        Ok(InsertResult {
            job,
            unique_skipped_as_duplicated: false,
        })
    }

    /// Derive a signed advisory lock key from a lock string.
    ///
    /// Unprefixed keys are the 64-bit FNV-1 hash; prefixed keys carry the
    /// configured namespace in the high 32 bits over a 32-bit hash. Either
    /// way the unsigned value is bit-reinterpreted (never truncated
    /// arithmetically) into the signed 64-bit range Postgres expects,
    /// negative values included.
    fn advisory_lock_key(&self, lock_str: &str) -> i64 {
        let key = match self.advisory_lock_prefix {
            Some(prefix) => {
                (u64::from(prefix) << 32) | u64::from(fnv::fnv1_32(lock_str.as_bytes()))
            }
            None => fnv::fnv1_64(lock_str.as_bytes()),
        };
        uint64_to_int64(key)
    }
}

fn uint64_to_int64(value: u64) -> i64 {
    value as i64
}

fn validate_tags(tags: &[String]) -> Result<(), InsertError> {
    for tag in tags {
        if tag.len() > 255 {
            return Err(InsertError::TagTooLong { tag: tag.clone() });
        }
        if !tag_matches_format(tag) {
            return Err(InsertError::TagInvalidFormat { tag: tag.clone() });
        }
    }
    Ok(())
}

/// `\A[\w][\w\-]+[\w]\z`: word characters throughout, hyphens only in the
/// interior, at least three characters total.
fn tag_matches_format(tag: &str) -> bool {
    let word = |byte: u8| byte.is_ascii_alphanumeric() || byte == b'_';
    let bytes = tag.as_bytes();
    bytes.len() >= 3
        && word(bytes[0])
        && word(bytes[bytes.len() - 1])
        && bytes[1..bytes.len() - 1]
            .iter()
            .all(|&byte| word(byte) || byte == b'-')
}

// =============================================================================
// Unit Tests
// =============================================================================

//! Job lifecycle states, job rows, and the job args contract.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bitmask::UniqueBitmask;
use crate::insert_opts::InsertOpts;

/// Lifecycle state of a job row.
///
/// The full state machine is driven by the worker pool in a separate process;
/// this client only ever inserts jobs as [`JobState::Available`] or
/// [`JobState::Scheduled`], but it must reason about the whole set for
/// uniqueness checks.
///
/// Variants are declared in lexicographic order so that the derived `Ord`
/// matches the canonical serialization order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Cancelled,
    Completed,
    Discarded,
    Pending,
    Retryable,
    Running,
    Scheduled,
}

impl JobState {
    /// All states, in canonical ascending order.
    pub const ALL: [JobState; 8] = [
        JobState::Available,
        JobState::Cancelled,
        JobState::Completed,
        JobState::Discarded,
        JobState::Pending,
        JobState::Retryable,
        JobState::Running,
        JobState::Scheduled,
    ];

    /// The state's database enum value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Pending => "pending",
            JobState::Retryable => "retryable",
            JobState::Running => "running",
            JobState::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized job state string.
#[derive(Debug, Error)]
#[error("unknown job state: {0:?}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownJobState(s.to_owned()))
    }
}

/// A failed attempt recorded on a job row by the worker pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    /// When the error occurred.
    pub at: DateTime<Utc>,
    /// Attempt number on which the error occurred.
    pub attempt: i32,
    /// Error message.
    pub error: String,
    /// Backtrace, if one was captured.
    pub trace: String,
}

/// A job row as persisted by a storage backend.
///
/// Rows are created by [`Client::insert`](crate::Client::insert) and later
/// claimed, worked, and finalized by the external worker pool; every field
/// past the insertion parameters is owned by that side of the system.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRow {
    /// Unique row ID.
    pub id: i64,
    /// Decoded job payload.
    pub args: serde_json::Value,
    /// Attempts made so far; zero until first worked.
    pub attempt: i32,
    /// When the job was last attempted.
    pub attempted_at: Option<DateTime<Utc>>,
    /// Client IDs that have attempted the job.
    pub attempted_by: Option<Vec<String>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// Errors from previous attempts.
    pub errors: Option<Vec<AttemptError>>,
    /// When the job reached a terminal state.
    pub finalized_at: Option<DateTime<Utc>>,
    /// Job kind; maps the row to a worker implementation.
    pub kind: String,
    /// Maximum number of attempts before the job is discarded.
    pub max_attempts: i32,
    /// Arbitrary metadata attached to the row.
    pub metadata: serde_json::Value,
    /// Priority, 1 being the highest.
    pub priority: i16,
    /// Queue the job was inserted into.
    pub queue: String,
    /// Earliest time the job may run.
    pub scheduled_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Categorization tags.
    pub tags: Vec<String>,
    /// Uniqueness fingerprint, when the job was inserted unique.
    pub unique_key: Option<Vec<u8>>,
    /// States the fingerprint is enforced against.
    pub unique_states: Option<UniqueBitmask>,
}

/// Contract for insertable job args.
///
/// The serialized form must match whatever the worker-side args type decodes,
/// so `kind` and the JSON layout are shared conventions between the two
/// processes.
///
/// # Example
///
/// ```rust
/// use jobq::{InsertOpts, JobArgs};
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
///
///     // Optional: insertion options applied to every job of this kind,
///     // overridden field-by-field by options passed at the call site.
///     fn insert_opts(&self) -> InsertOpts {
///         InsertOpts {
///             queue: Some("sorting".to_owned()),
///             ..InsertOpts::default()
///         }
///     }
/// }
/// ```
pub trait JobArgs: Serialize {
    /// String that uniquely identifies this job type in the database.
    fn kind(&self) -> &str;

    /// Insertion options applied to all jobs of this kind.
    ///
    /// Call-site options take precedence field by field. The default
    /// implementation supplies no options.
    fn insert_opts(&self) -> InsertOpts {
        InsertOpts::default()
    }
}

/// Ad-hoc job args from a kind string and a raw JSON value.
///
/// Useful when the args type lives on the worker side only and no
/// corresponding Rust struct exists.
///
/// # Example
///
/// ```rust
/// use jobq::JsonArgs;
/// use serde_json::json;
///
/// let args = JsonArgs::new("email_send", json!({"to": "someone@example.com"}));
/// ```
#[derive(Clone, Debug)]
pub struct JsonArgs {
    kind: String,
    args: serde_json::Value,
}

impl JsonArgs {
    /// Create job args with the given kind and payload.
    pub fn new(kind: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }
}

impl Serialize for JsonArgs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.args.serialize(serializer)
    }
}

impl JobArgs for JsonArgs {
    fn kind(&self) -> &str {
        &self.kind
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_str_round_trips() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn state_parse_rejects_unknown() {
        let err = "sleeping".parse::<JobState>().unwrap_err();
        assert_eq!(err.to_string(), r#"unknown job state: "sleeping""#);
    }

    #[test]
    fn state_all_is_sorted() {
        let mut sorted = JobState::ALL;
        sorted.sort_unstable();
        assert_eq!(sorted, JobState::ALL);
    }

    #[test]
    fn state_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobState::Retryable).unwrap(),
            r#""retryable""#
        );
        let state: JobState = serde_json::from_str(r#""available""#).unwrap();
        assert_eq!(state, JobState::Available);
    }

    #[test]
    fn json_args_serialize_payload_only() {
        let args = JsonArgs::new("hash_kind", json!({"job_num": 1}));
        assert_eq!(args.kind(), "hash_kind");
        assert_eq!(serde_json::to_string(&args).unwrap(), r#"{"job_num":1}"#);
    }

    #[test]
    fn attempt_error_round_trips() {
        let original = AttemptError {
            at: "2024-01-15T21:26:36Z".parse().unwrap(),
            attempt: 3,
            error: "boom".to_owned(),
            trace: "stack".to_owned(),
        };
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: AttemptError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);
    }
}

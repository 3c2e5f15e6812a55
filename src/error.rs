//! Error types for job insertion.

use thiserror::Error;

use crate::job::JobState;

/// Shared error type surfaced by storage backends.
///
/// Storage failures are propagated unchanged: the client adds no retries and
/// no wrapping beyond [`InsertError::Storage`].
pub type StorageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when inserting jobs.
///
/// Every variant except [`InsertError::Storage`] is a configuration error:
/// it is raised synchronously before any I/O and retrying without changing
/// the input will never succeed. A duplicate unique job is not an error; it
/// is reported through
/// [`InsertResult::unique_skipped_as_duplicated`](crate::InsertResult::unique_skipped_as_duplicated).
#[derive(Debug, Error)]
pub enum InsertError {
    /// Job args returned an empty `kind`.
    #[error("job args must return a non-empty kind")]
    MissingKind,

    /// Job args failed to encode as JSON.
    #[error("job args failed to encode as JSON: {0}")]
    ArgsEncoding(#[source] serde_json::Error),

    /// Job args encoded to JSON `null`, which the worker side can't decode.
    #[error("job args must encode to a non-null JSON value")]
    NullArgs,

    /// A `by_args` key filter was given but the payload is not a JSON object.
    #[error("unique opts by_args key filter requires a JSON object payload")]
    ByArgsNotObject,

    /// A tag exceeded the 255 character limit.
    #[error("tags should be less than 255 characters in length; got: {tag:?}")]
    TagTooLong {
        /// The offending tag.
        tag: String,
    },

    /// A tag did not match the allowed format.
    #[error(r"tags should match regex \A[\w][\w\-]+[\w]\z; got: {tag:?}")]
    TagInvalidFormat {
        /// The offending tag.
        tag: String,
    },

    /// A custom `by_state` set left out one of the required states.
    #[error("unique opts by_state must include required state: {state}")]
    UniqueStateMissingRequired {
        /// The missing required state.
        state: JobState,
    },

    /// `by_period` was zero.
    #[error("unique opts by_period must be a positive duration")]
    UniquePeriodZero,

    /// A custom `by_state` set was supplied to a bulk insert, which only
    /// supports the default state set.
    #[error("unique opts with a custom by_state set can't be used with insert_many")]
    UniqueStatesCustomInBatch,

    /// A storage backend failure, propagated unchanged.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

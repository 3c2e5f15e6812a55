//! Insertion options and uniqueness options.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::job::JobState;

/// Options for job insertion.
///
/// May be supplied at the call site or returned from
/// [`JobArgs::insert_opts`](crate::JobArgs::insert_opts) to apply to all jobs
/// of a kind. Merging is field by field with "first present wins": call-site
/// options beat job-kind options beat system defaults, and only absent
/// (`None`) fields fall through.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InsertOpts {
    /// Maximum number of total attempts (original run plus retries) before
    /// the job is abandoned and discarded.
    ///
    /// Defaults to [`MAX_ATTEMPTS_DEFAULT`](crate::MAX_ATTEMPTS_DEFAULT).
    pub max_attempts: Option<i32>,

    /// Job priority, 1 being the highest. Workers always fetch higher
    /// priority jobs first.
    ///
    /// Defaults to [`PRIORITY_DEFAULT`](crate::PRIORITY_DEFAULT).
    pub priority: Option<i16>,

    /// Name of the queue to insert into.
    ///
    /// Defaults to [`QUEUE_DEFAULT`](crate::QUEUE_DEFAULT).
    pub queue: Option<String>,

    /// A future time at which to schedule the job. The job is guaranteed not
    /// to run before this time, and is inserted as
    /// [`JobState::Scheduled`](crate::JobState::Scheduled) when the time is
    /// in the future.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Arbitrary keywords attached to the job for grouping and search. No
    /// functional behavior. Tags from the call site replace job-kind tags
    /// wholesale; they are not merged.
    ///
    /// Each tag must be at most 255 characters and match
    /// `\A[\w][\w\-]+[\w]\z` (letters, digits, underscores; hyphens only in
    /// the interior; at least three characters).
    pub tags: Option<Vec<String>>,

    /// Uniqueness options. Absent (or present with no dimension toggled)
    /// means the job is never treated as unique.
    pub unique_opts: Option<UniqueOpts>,
}

/// Which part of the job payload participates in args-based uniqueness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ByArgs {
    /// The whole encoded payload.
    Full,
    /// Only the named top-level payload keys.
    Keys(Vec<String>),
}

/// Uniqueness dimensions for a job.
///
/// With no dimension toggled, no uniqueness is enforced. Each toggled
/// dimension is added to the uniqueness matrix, and with any dimension on,
/// the job's kind counts toward uniqueness unless [`exclude_kind`] opts it
/// out.
///
/// For example, with only [`by_queue`] on, a single instance of a kind is
/// allowed per queue. With [`by_args`] and [`by_queue`] on, one instance is
/// allowed per args-and-queue combination, so changing either admits a new
/// job.
///
/// [`by_args`]: UniqueOpts::by_args
/// [`by_queue`]: UniqueOpts::by_queue
/// [`exclude_kind`]: UniqueOpts::exclude_kind
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UniqueOpts {
    /// Enforce uniqueness per encoded args, either the whole payload or a
    /// subset of its top-level keys.
    pub by_args: Option<ByArgs>,

    /// Enforce uniqueness within the given period. Insertion time is floored
    /// to the nearest multiple of the period, so a job unique per 15 minutes
    /// uses a period of 900 seconds. Must be positive.
    pub by_period: Option<Duration>,

    /// Enforce uniqueness within each queue.
    pub by_queue: bool,

    /// Enforce uniqueness across the given states. For example, with
    /// `[scheduled, running]` a new job may be inserted even while one of the
    /// same kind sits `available`.
    ///
    /// Unlike the other dimensions this gets a default when unset:
    /// [`DEFAULT_UNIQUE_STATES`](crate::DEFAULT_UNIQUE_STATES), under which
    /// cancelled and discarded jobs not yet cleaned out don't count toward
    /// uniqueness. A custom set must include every state in
    /// [`REQUIRED_UNIQUE_STATES`](crate::REQUIRED_UNIQUE_STATES) (the states
    /// representing not-yet-finished work).
    pub by_state: Option<Vec<JobState>>,

    /// Leave the job kind out of the fingerprint. Rarely wanted; useful only
    /// when uniqueness must span multiple kinds.
    pub exclude_kind: bool,
}

impl UniqueOpts {
    /// True when no `by_*` dimension is toggled, in which case no uniqueness
    /// is enforced at all. `exclude_kind` alone does not activate
    /// uniqueness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_args.is_none()
            && self.by_period.is_none()
            && !self.by_queue
            && self.by_state.is_none()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_opts_are_empty() {
        assert!(UniqueOpts::default().is_empty());
    }

    #[test]
    fn exclude_kind_alone_stays_empty() {
        let opts = UniqueOpts {
            exclude_kind: true,
            ..UniqueOpts::default()
        };
        assert!(opts.is_empty());
    }

    #[test]
    fn any_dimension_makes_opts_non_empty() {
        assert!(!UniqueOpts { by_args: Some(ByArgs::Full), ..UniqueOpts::default() }.is_empty());
        assert!(!UniqueOpts { by_period: Some(Duration::from_secs(900)), ..UniqueOpts::default() }.is_empty());
        assert!(!UniqueOpts { by_queue: true, ..UniqueOpts::default() }.is_empty());
        assert!(!UniqueOpts { by_state: Some(vec![]), ..UniqueOpts::default() }.is_empty());
    }
}

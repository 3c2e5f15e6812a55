//! Uniqueness fingerprint derivation.
//!
//! A unique job's fingerprint is the SHA-256 digest of a canonical string
//! assembled from its active uniqueness dimensions in a fixed order (kind,
//! args, period, queue), each clause introduced by an unambiguous separator
//! token. Two insertions that agree on every active dimension therefore
//! produce byte-identical fingerprints regardless of payload key order or
//! caller.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};

use crate::error::InsertError;
use crate::insert_opts::{ByArgs, UniqueOpts};
use crate::job::JobState;

/// States a custom `by_state` set must always include: the states that
/// represent not-yet-finished work and must stay protected against
/// duplication. External consumers depend on this exact set staying stable.
pub const REQUIRED_UNIQUE_STATES: [JobState; 4] = [
    JobState::Available,
    JobState::Pending,
    JobState::Running,
    JobState::Scheduled,
];

/// State set used when `by_state` is not customized. Cancelled and discarded
/// jobs that haven't been cleaned out yet don't count toward uniqueness.
pub const DEFAULT_UNIQUE_STATES: [JobState; 6] = [
    JobState::Available,
    JobState::Completed,
    JobState::Pending,
    JobState::Retryable,
    JobState::Running,
    JobState::Scheduled,
];

/// Resolve the effective unique state set: the validated custom set, sorted
/// and deduplicated, or the default set.
///
/// # Errors
///
/// Returns [`InsertError::UniqueStateMissingRequired`] naming the first
/// required state absent from a custom set.
pub(crate) fn effective_unique_states(
    by_state: Option<&[JobState]>,
) -> Result<Vec<JobState>, InsertError> {
    let Some(states) = by_state else {
        return Ok(DEFAULT_UNIQUE_STATES.to_vec());
    };
    for required in REQUIRED_UNIQUE_STATES {
        if !states.contains(&required) {
            return Err(InsertError::UniqueStateMissingRequired { state: required });
        }
    }
    let mut states = states.to_vec();
    states.sort_unstable();
    states.dedup();
    Ok(states)
}

/// The resolved active dimensions of one unique insertion.
///
/// Computed once per insert and reused for the fingerprint digest, the
/// advisory lock string, and the slow-path lookup.
#[derive(Debug)]
pub(crate) struct UniqueDims {
    /// Canonical (key-sorted, optionally key-filtered) payload JSON.
    canonical_args: Option<String>,
    /// Whether `canonical_args` is a key subset rather than the whole payload.
    args_is_subset: bool,
    /// Half-open `[lower, upper)` bounds of the active period bucket.
    period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    queue: Option<String>,
}

impl UniqueDims {
    /// Resolve the active dimensions from uniqueness options.
    ///
    /// `now` is the injected insertion time; it only matters when
    /// `by_period` is active.
    pub(crate) fn resolve(
        encoded_args: &str,
        queue: &str,
        opts: &UniqueOpts,
        now: DateTime<Utc>,
    ) -> Result<Self, InsertError> {
        let (canonical_args, args_is_subset) = match &opts.by_args {
            None => (None, false),
            Some(ByArgs::Full) => (Some(canonicalize_args(encoded_args, None)?), false),
            Some(ByArgs::Keys(keys)) => (Some(canonicalize_args(encoded_args, Some(keys))?), true),
        };

        let period = match opts.by_period {
            None => None,
            Some(period) if period.as_secs() == 0 => return Err(InsertError::UniquePeriodZero),
            Some(period) => {
                let lower = truncate_time(now, period.as_secs());
                let upper = lower + ChronoDuration::seconds(period.as_secs() as i64);
                Some((lower, upper))
            }
        };

        Ok(Self {
            canonical_args,
            args_is_subset,
            period,
            queue: opts.by_queue.then(|| queue.to_owned()),
        })
    }

    /// SHA-256 fingerprint over the canonical dimension string.
    pub(crate) fn unique_key(&self, kind: &str, exclude_kind: bool) -> Vec<u8> {
        let mut canonical = String::new();
        if !exclude_kind {
            canonical.push_str("&kind=");
            canonical.push_str(kind);
        }
        canonical.push_str(&self.clauses());
        Sha256::digest(canonical.as_bytes()).to_vec()
    }

    /// The string hashed into a slow-path advisory lock key. Unlike the
    /// fingerprint it always includes the kind, so locks for different kinds
    /// never contend even under `exclude_kind`.
    pub(crate) fn advisory_lock_string(&self, kind: &str) -> String {
        format!("unique_keykind={kind}{}", self.clauses())
    }

    /// Canonical args JSON, when `by_args` is active, and whether it was
    /// filtered to a key subset.
    pub(crate) fn args(&self) -> Option<(&str, bool)> {
        self.canonical_args
            .as_deref()
            .map(|args| (args, self.args_is_subset))
    }

    /// Period bucket bounds, when `by_period` is active.
    pub(crate) fn period(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.period
    }

    /// Queue name, when `by_queue` is active.
    pub(crate) fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    fn clauses(&self) -> String {
        let mut clauses = String::new();
        if let Some(args) = &self.canonical_args {
            clauses.push_str("&args=");
            clauses.push_str(args);
        }
        if let Some((lower, _)) = self.period {
            clauses.push_str("&period=");
            clauses.push_str(&lower.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }
        if let Some(queue) = &self.queue {
            clauses.push_str("&queue=");
            clauses.push_str(queue);
        }
        clauses
    }
}

/// Re-encode a payload canonically: keys sorted ascending, optionally
/// filtered to a top-level key subset.
///
/// serde_json's default map representation keeps keys sorted, so one
/// parse/serialize round trip canonicalizes field order.
fn canonicalize_args(encoded_args: &str, keys: Option<&[String]>) -> Result<String, InsertError> {
    let mut value: serde_json::Value =
        serde_json::from_str(encoded_args).map_err(InsertError::ArgsEncoding)?;
    if let Some(keys) = keys {
        let serde_json::Value::Object(map) = &mut value else {
            return Err(InsertError::ByArgsNotObject);
        };
        map.retain(|key, _| keys.iter().any(|wanted| wanted == key));
    }
    serde_json::to_string(&value).map_err(InsertError::ArgsEncoding)
}

/// Floor `now` to the nearest multiple of `period_secs`, dropping any
/// subsecond component.
pub(crate) fn truncate_time(now: DateTime<Utc>, period_secs: u64) -> DateTime<Utc> {
    let secs = now.timestamp();
    let rem = secs.rem_euclid(period_secs as i64);
    now - ChronoDuration::seconds(rem)
        - ChronoDuration::nanoseconds(i64::from(now.timestamp_subsec_nanos()))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dims(encoded_args: &str, opts: &UniqueOpts, now: DateTime<Utc>) -> UniqueDims {
        UniqueDims::resolve(encoded_args, "default", opts, now).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn truncates_time_to_nearest_interval() {
        let now = utc("2024-01-15T21:26:36Z");
        assert_eq!(truncate_time(now, 60), utc("2024-01-15T21:26:00Z"));
        assert_eq!(truncate_time(now, 5 * 60), utc("2024-01-15T21:25:00Z"));
        assert_eq!(truncate_time(now, 15 * 60), utc("2024-01-15T21:15:00Z"));
        assert_eq!(truncate_time(now, 60 * 60), utc("2024-01-15T21:00:00Z"));
        assert_eq!(truncate_time(now, 5 * 60 * 60), utc("2024-01-15T17:00:00Z"));
        assert_eq!(truncate_time(now, 24 * 60 * 60), utc("2024-01-15T00:00:00Z"));
    }

    #[test]
    fn truncate_drops_subseconds() {
        let now = utc("2024-01-15T21:26:36.789Z");
        assert_eq!(truncate_time(now, 60), utc("2024-01-15T21:26:00Z"));
    }

    #[test]
    fn fingerprint_covers_all_active_dimensions() {
        let now = utc("2024-01-15T21:26:36Z");
        let opts = UniqueOpts {
            by_args: Some(ByArgs::Full),
            by_period: Some(Duration::from_secs(15 * 60)),
            by_queue: true,
            ..UniqueOpts::default()
        };
        let dims = dims(r#"{"job_num":1}"#, &opts, now);

        let expected = Sha256::digest(
            br#"&kind=simple&args={"job_num":1}&period=2024-01-15T21:15:00Z&queue=default"#,
        );
        assert_eq!(dims.unique_key("simple", false), expected.to_vec());
    }

    #[test]
    fn fingerprint_skips_inactive_dimensions() {
        let now = utc("2024-01-15T21:26:36Z");
        let opts = UniqueOpts {
            by_queue: true,
            ..UniqueOpts::default()
        };
        let dims = dims(r#"{"job_num":1}"#, &opts, now);

        let expected = Sha256::digest(b"&kind=simple&queue=default");
        assert_eq!(dims.unique_key("simple", false), expected.to_vec());
    }

    #[test]
    fn exclude_kind_drops_kind_clause() {
        let opts = UniqueOpts {
            by_queue: true,
            exclude_kind: true,
            ..UniqueOpts::default()
        };
        let dims = dims("{}", &opts, Utc::now());

        let expected = Sha256::digest(b"&queue=default");
        assert_eq!(dims.unique_key("simple", true), expected.to_vec());
    }

    #[test]
    fn fingerprint_is_independent_of_payload_key_order() {
        let opts = UniqueOpts {
            by_args: Some(ByArgs::Full),
            ..UniqueOpts::default()
        };
        let now = Utc::now();
        let a = dims(r#"{"a":1,"b":2}"#, &opts, now);
        let b = dims(r#"{"b":2,"a":1}"#, &opts, now);
        assert_eq!(a.unique_key("simple", false), b.unique_key("simple", false));
    }

    #[test]
    fn changing_one_dimension_changes_fingerprint() {
        let now = utc("2024-01-15T21:26:36Z");
        let opts = UniqueOpts {
            by_queue: true,
            ..UniqueOpts::default()
        };
        let default_queue = dims("{}", &opts, now).unique_key("simple", false);
        let other_queue = UniqueDims::resolve("{}", "other", &opts, now)
            .unwrap()
            .unique_key("simple", false);
        assert_ne!(default_queue, other_queue);
    }

    #[test]
    fn by_args_key_filter_selects_top_level_keys() {
        let opts = UniqueOpts {
            by_args: Some(ByArgs::Keys(vec!["customer_id".to_owned()])),
            ..UniqueOpts::default()
        };
        let a = dims(r#"{"customer_id":1,"trace_id":"x"}"#, &opts, Utc::now());
        let b = dims(r#"{"customer_id":1,"trace_id":"y"}"#, &opts, Utc::now());
        assert_eq!(
            a.unique_key("simple", false),
            b.unique_key("simple", false)
        );
        assert_eq!(a.args(), Some((r#"{"customer_id":1}"#, true)));
    }

    #[test]
    fn by_args_key_filter_requires_object_payload() {
        let opts = UniqueOpts {
            by_args: Some(ByArgs::Keys(vec!["k".to_owned()])),
            ..UniqueOpts::default()
        };
        let err = UniqueDims::resolve("[1,2]", "default", &opts, Utc::now()).unwrap_err();
        assert!(matches!(err, InsertError::ByArgsNotObject));
    }

    #[test]
    fn zero_period_is_rejected() {
        let opts = UniqueOpts {
            by_period: Some(Duration::ZERO),
            ..UniqueOpts::default()
        };
        let err = UniqueDims::resolve("{}", "default", &opts, Utc::now()).unwrap_err();
        assert!(matches!(err, InsertError::UniquePeriodZero));
    }

    #[test]
    fn advisory_lock_string_always_includes_kind() {
        let opts = UniqueOpts {
            by_queue: true,
            exclude_kind: true,
            ..UniqueOpts::default()
        };
        let dims = dims("{}", &opts, Utc::now());
        assert_eq!(
            dims.advisory_lock_string("simple"),
            "unique_keykind=simple&queue=default"
        );
    }

    #[test]
    fn effective_states_default_when_unset() {
        assert_eq!(
            effective_unique_states(None).unwrap(),
            DEFAULT_UNIQUE_STATES.to_vec()
        );
    }

    #[test]
    fn effective_states_sorts_and_dedups_custom_sets() {
        let custom = vec![
            JobState::Scheduled,
            JobState::Running,
            JobState::Available,
            JobState::Pending,
            JobState::Available,
        ];
        assert_eq!(
            effective_unique_states(Some(&custom)).unwrap(),
            vec![
                JobState::Available,
                JobState::Pending,
                JobState::Running,
                JobState::Scheduled,
            ]
        );
    }

    #[test]
    fn each_required_state_is_enforced_individually() {
        for missing in REQUIRED_UNIQUE_STATES {
            let custom: Vec<JobState> = REQUIRED_UNIQUE_STATES
                .into_iter()
                .filter(|&state| state != missing)
                .collect();
            match effective_unique_states(Some(&custom)) {
                Err(InsertError::UniqueStateMissingRequired { state }) => {
                    assert_eq!(state, missing);
                }
                other => panic!("expected missing-state error, got {other:?}"),
            }
        }
    }

    #[test]
    fn period_bounds_are_half_open_bucket() {
        let now = utc("2024-01-15T21:26:36Z");
        let opts = UniqueOpts {
            by_period: Some(Duration::from_secs(15 * 60)),
            ..UniqueOpts::default()
        };
        let dims = dims("{}", &opts, now);
        assert_eq!(
            dims.period(),
            Some((utc("2024-01-15T21:15:00Z"), utc("2024-01-15T21:30:00Z")))
        );
    }
}

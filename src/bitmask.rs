//! Bitmask codec for sets of job states.
//!
//! Unique jobs persist the set of states their fingerprint is enforced
//! against as a `bit(8)` column. Bit positions are assigned once and never
//! renumbered, since masks written by older clients must keep decoding the
//! same way.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::job::JobState;

/// A set of [`JobState`]s packed into one byte.
///
/// Bit positions, LSB first: `available=0`, `cancelled=1`, `completed=2`,
/// `discarded=3`, `pending=4`, `retryable=5`, `running=6`, `scheduled=7`.
/// Rendered as a fixed-width bit string the highest-numbered state occupies
/// the most significant (leftmost) digit.
///
/// # Example
///
/// ```rust
/// use jobq::{JobState, UniqueBitmask};
///
/// let mask = UniqueBitmask::from_states(&[JobState::Available, JobState::Scheduled]);
/// assert_eq!(mask.to_string(), "10000001");
/// assert_eq!(mask.to_states(), vec![JobState::Available, JobState::Scheduled]);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniqueBitmask(u8);

impl UniqueBitmask {
    /// Encode a set of states. Duplicates are harmless; an empty input
    /// yields the all-zero mask.
    #[must_use]
    pub fn from_states(states: &[JobState]) -> Self {
        let mut mask = 0u8;
        for &state in states {
            mask |= 1 << Self::bit_position(state);
        }
        Self(mask)
    }

    /// Decode into states, in canonical ascending order.
    #[must_use]
    pub fn to_states(self) -> Vec<JobState> {
        JobState::ALL
            .into_iter()
            .filter(|&state| self.contains(state))
            .collect()
    }

    /// Whether the given state's bit is set.
    #[must_use]
    pub fn contains(self, state: JobState) -> bool {
        self.0 & (1 << Self::bit_position(state)) != 0
    }

    /// The raw mask byte.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    fn bit_position(state: JobState) -> u8 {
        match state {
            JobState::Available => 0,
            JobState::Cancelled => 1,
            JobState::Completed => 2,
            JobState::Discarded => 3,
            JobState::Pending => 4,
            JobState::Retryable => 5,
            JobState::Running => 6,
            JobState::Scheduled => 7,
        }
    }
}

impl From<u8> for UniqueBitmask {
    fn from(mask: u8) -> Self {
        Self(mask)
    }
}

impl fmt::Display for UniqueBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}", self.0)
    }
}

/// Error returned when parsing a malformed bit string.
#[derive(Debug, Error)]
#[error("bitmask must be exactly 8 binary digits, got: {0:?}")]
pub struct InvalidBitmask(pub String);

impl FromStr for UniqueBitmask {
    type Err = InvalidBitmask;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 {
            return Err(InvalidBitmask(s.to_owned()));
        }
        u8::from_str_radix(s, 2)
            .map(Self)
            .map_err(|_| InvalidBitmask(s.to_owned()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_single_states_at_fixed_positions() {
        assert_eq!(UniqueBitmask::from_states(&[JobState::Available]).to_string(), "00000001");
        assert_eq!(UniqueBitmask::from_states(&[JobState::Cancelled]).to_string(), "00000010");
        assert_eq!(UniqueBitmask::from_states(&[JobState::Completed]).to_string(), "00000100");
        assert_eq!(UniqueBitmask::from_states(&[JobState::Discarded]).to_string(), "00001000");
        assert_eq!(UniqueBitmask::from_states(&[JobState::Pending]).to_string(), "00010000");
        assert_eq!(UniqueBitmask::from_states(&[JobState::Retryable]).to_string(), "00100000");
        assert_eq!(UniqueBitmask::from_states(&[JobState::Running]).to_string(), "01000000");
        assert_eq!(UniqueBitmask::from_states(&[JobState::Scheduled]).to_string(), "10000000");
    }

    #[test]
    fn encodes_empty_and_full_sets() {
        assert_eq!(UniqueBitmask::from_states(&[]).to_string(), "00000000");
        assert_eq!(UniqueBitmask::from_states(&JobState::ALL).to_string(), "11111111");
    }

    #[test]
    fn decodes_in_ascending_order() {
        let mask = UniqueBitmask::from_states(&[
            JobState::Scheduled,
            JobState::Available,
            JobState::Pending,
        ]);
        assert_eq!(
            mask.to_states(),
            vec![JobState::Available, JobState::Pending, JobState::Scheduled]
        );
    }

    #[test]
    fn every_mask_round_trips() {
        for raw in 0u8..=255 {
            let mask = UniqueBitmask::from(raw);
            assert_eq!(UniqueBitmask::from_states(&mask.to_states()), mask);
        }
    }

    #[test]
    fn bit_string_round_trips() {
        for raw in 0u8..=255 {
            let mask = UniqueBitmask::from(raw);
            assert_eq!(mask.to_string().parse::<UniqueBitmask>().unwrap(), mask);
        }
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        assert!("1111".parse::<UniqueBitmask>().is_err());
        assert!("111101011".parse::<UniqueBitmask>().is_err());
        assert!("1111x101".parse::<UniqueBitmask>().is_err());
    }

    #[test]
    fn contains_matches_membership() {
        let mask = UniqueBitmask::from_states(&[JobState::Running, JobState::Retryable]);
        assert!(mask.contains(JobState::Running));
        assert!(mask.contains(JobState::Retryable));
        assert!(!mask.contains(JobState::Completed));
    }
}

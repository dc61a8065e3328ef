use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use claims_proto::ClaimActionResultData;

/// Result of evaluating one claim action on one chunk.
///
/// Variants are declared in reporting priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimOutcome {
    AlreadyForceloadable,
    AlreadyUnforceloaded,
    ClaimsAreDisabled,
    NoServerPermission,
    ReplacementInProgress,
    TooManyChunks,
    UnclaimableDimension,
    NotClaimedByUserForceload,
    NotClaimedByUser,
    AlreadyClaimed,
    ForceloadLimitReached,
    ClaimLimitReached,
    TooFar,
    SuccessfulUnforceload,
    SuccessfulUnclaim,
    SuccessfulForceload,
    SuccessfulClaim,
}

impl ClaimOutcome {
    pub const ALL: [ClaimOutcome; 17] = [
        ClaimOutcome::AlreadyForceloadable,
        ClaimOutcome::AlreadyUnforceloaded,
        ClaimOutcome::ClaimsAreDisabled,
        ClaimOutcome::NoServerPermission,
        ClaimOutcome::ReplacementInProgress,
        ClaimOutcome::TooManyChunks,
        ClaimOutcome::UnclaimableDimension,
        ClaimOutcome::NotClaimedByUserForceload,
        ClaimOutcome::NotClaimedByUser,
        ClaimOutcome::AlreadyClaimed,
        ClaimOutcome::ForceloadLimitReached,
        ClaimOutcome::ClaimLimitReached,
        ClaimOutcome::TooFar,
        ClaimOutcome::SuccessfulUnforceload,
        ClaimOutcome::SuccessfulUnclaim,
        ClaimOutcome::SuccessfulForceload,
        ClaimOutcome::SuccessfulClaim,
    ];

    pub fn flag(self) -> OutcomeSet {
        OutcomeSet::from_bits_truncate(1 << self as u32)
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            ClaimOutcome::SuccessfulUnforceload
                | ClaimOutcome::SuccessfulUnclaim
                | ClaimOutcome::SuccessfulForceload
                | ClaimOutcome::SuccessfulClaim
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimOutcome::AlreadyForceloadable => "already_forceloadable",
            ClaimOutcome::AlreadyUnforceloaded => "already_unforceloaded",
            ClaimOutcome::ClaimsAreDisabled => "claims_are_disabled",
            ClaimOutcome::NoServerPermission => "no_server_permission",
            ClaimOutcome::ReplacementInProgress => "replacement_in_progress",
            ClaimOutcome::TooManyChunks => "too_many_chunks",
            ClaimOutcome::UnclaimableDimension => "unclaimable_dimension",
            ClaimOutcome::NotClaimedByUserForceload => "not_claimed_by_user_forceload",
            ClaimOutcome::NotClaimedByUser => "not_claimed_by_user",
            ClaimOutcome::AlreadyClaimed => "already_claimed",
            ClaimOutcome::ForceloadLimitReached => "forceload_limit_reached",
            ClaimOutcome::ClaimLimitReached => "claim_limit_reached",
            ClaimOutcome::TooFar => "too_far",
            ClaimOutcome::SuccessfulUnforceload => "successful_unforceload",
            ClaimOutcome::SuccessfulUnclaim => "successful_unclaim",
            ClaimOutcome::SuccessfulForceload => "successful_forceload",
            ClaimOutcome::SuccessfulClaim => "successful_claim",
        }
    }
}

impl fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// De-duplicated outcomes of an area action. Bit order is priority order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OutcomeSet: u32 {
        const ALREADY_FORCELOADABLE = 1 << 0;
        const ALREADY_UNFORCELOADED = 1 << 1;
        const CLAIMS_ARE_DISABLED = 1 << 2;
        const NO_SERVER_PERMISSION = 1 << 3;
        const REPLACEMENT_IN_PROGRESS = 1 << 4;
        const TOO_MANY_CHUNKS = 1 << 5;
        const UNCLAIMABLE_DIMENSION = 1 << 6;
        const NOT_CLAIMED_BY_USER_FORCELOAD = 1 << 7;
        const NOT_CLAIMED_BY_USER = 1 << 8;
        const ALREADY_CLAIMED = 1 << 9;
        const FORCELOAD_LIMIT_REACHED = 1 << 10;
        const CLAIM_LIMIT_REACHED = 1 << 11;
        const TOO_FAR = 1 << 12;
        const SUCCESSFUL_UNFORCELOAD = 1 << 13;
        const SUCCESSFUL_UNCLAIM = 1 << 14;
        const SUCCESSFUL_FORCELOAD = 1 << 15;
        const SUCCESSFUL_CLAIM = 1 << 16;
    }
}

impl OutcomeSet {
    pub fn add(&mut self, outcome: ClaimOutcome) {
        self.insert(outcome.flag());
    }

    pub fn has(&self, outcome: ClaimOutcome) -> bool {
        self.contains(outcome.flag())
    }

    /// Outcomes in priority order.
    pub fn outcomes(&self) -> impl Iterator<Item = ClaimOutcome> + '_ {
        ClaimOutcome::ALL
            .into_iter()
            .filter(move |outcome| self.has(*outcome))
    }

    pub fn highest_priority(&self) -> Option<ClaimOutcome> {
        self.outcomes().next()
    }
}

impl FromIterator<ClaimOutcome> for OutcomeSet {
    fn from_iter<I: IntoIterator<Item = ClaimOutcome>>(iter: I) -> Self {
        let mut set = OutcomeSet::empty();
        for outcome in iter {
            set.add(outcome);
        }
        set
    }
}

/// Result of an area action: the requested rectangle and what happened in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaClaimResult {
    pub outcomes: OutcomeSet,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub cells_evaluated: usize,
}

impl AreaClaimResult {
    pub fn rejected(outcome: ClaimOutcome, left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            outcomes: outcome.flag(),
            left,
            top,
            right,
            bottom,
            cells_evaluated: 0,
        }
    }

    pub fn to_packet(&self) -> ClaimActionResultData {
        ClaimActionResultData {
            outcomes: self.outcomes.bits(),
            left: self.left,
            top: self.top,
            right: self.right,
            bottom: self.bottom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_declaration_order() {
        for (bit, outcome) in ClaimOutcome::ALL.into_iter().enumerate() {
            assert_eq!(outcome.flag().bits(), 1 << bit, "{outcome}");
        }
        assert_eq!(
            ClaimOutcome::SuccessfulClaim.flag(),
            OutcomeSet::SUCCESSFUL_CLAIM
        );
        assert_eq!(ClaimOutcome::TooFar.flag(), OutcomeSet::TOO_FAR);
    }

    #[test]
    fn outcomes_iterate_by_priority() {
        let set: OutcomeSet = [
            ClaimOutcome::SuccessfulClaim,
            ClaimOutcome::AlreadyClaimed,
            ClaimOutcome::SuccessfulClaim,
        ]
        .into_iter()
        .collect();
        let ordered: Vec<_> = set.outcomes().collect();
        assert_eq!(
            ordered,
            vec![ClaimOutcome::AlreadyClaimed, ClaimOutcome::SuccessfulClaim]
        );
        assert_eq!(set.highest_priority(), Some(ClaimOutcome::AlreadyClaimed));
    }

    #[test]
    fn only_the_four_successes_count() {
        let successes = ClaimOutcome::ALL
            .into_iter()
            .filter(|outcome| outcome.is_success())
            .count();
        assert_eq!(successes, 4);
    }
}

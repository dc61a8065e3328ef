use tracing::{debug, info};

use crate::claim::ClaimKey;
use crate::ids::PlayerId;

use super::{MaintenanceContext, SpreadoutTask};

/// Which of an owner's claim values a replacement rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMatcher {
    Any,
    SubConfig {
        sub_config_index: i32,
        forceloadable: bool,
    },
}

impl ClaimMatcher {
    pub fn matches(&self, key: &ClaimKey) -> bool {
        match *self {
            ClaimMatcher::Any => true,
            ClaimMatcher::SubConfig {
                sub_config_index,
                forceloadable,
            } => key.sub_config_index == sub_config_index && key.forceloadable == forceloadable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceReason {
    Expiration,
    SubConfigDeleted(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceResult {
    Success,
    /// The replacement value already satisfies the matcher; nothing to do.
    StateMatches,
}

/// Rewrites every claim of one owner that passes `matcher` to `with`
/// (unclaiming when `with` is `None`), a budgeted slice per tick.
#[derive(Debug, Clone)]
pub struct ClaimReplaceTask {
    owner: PlayerId,
    matcher: ClaimMatcher,
    with: Option<ClaimKey>,
    reason: ReplaceReason,
    replaced: usize,
    state_matches: bool,
    result: Option<ReplaceResult>,
}

impl ClaimReplaceTask {
    pub fn new(
        owner: PlayerId,
        matcher: ClaimMatcher,
        with: Option<ClaimKey>,
        reason: ReplaceReason,
    ) -> Self {
        Self {
            owner,
            matcher,
            with,
            reason,
            replaced: 0,
            state_matches: false,
            result: None,
        }
    }

    pub fn owner(&self) -> PlayerId {
        self.owner
    }

    pub fn reason(&self) -> ReplaceReason {
        self.reason
    }

    pub fn replaced(&self) -> usize {
        self.replaced
    }

    pub fn result(&self) -> Option<ReplaceResult> {
        self.result
    }

    fn finish(
        &mut self,
        ctx: &mut MaintenanceContext<'_>,
        result: ReplaceResult,
        follow_ups: &mut Vec<Self>,
    ) {
        self.result = Some(result);
        info!(
            target: "claims::tasks",
            owner = %self.owner,
            reason = ?self.reason,
            result = ?result,
            replaced = self.replaced,
            "claim_replacement.finished"
        );
        if let Some(next) = ctx.manager.finish_replacement(self.owner) {
            follow_ups.push(next);
        }
    }
}

impl SpreadoutTask<MaintenanceContext<'_>> for ClaimReplaceTask {
    fn on_queued(&mut self, ctx: &mut MaintenanceContext<'_>) {
        ctx.manager.mark_replacement_started(self.owner);
        self.state_matches = self
            .with
            .is_some_and(|with| with.owner == self.owner && self.matcher.matches(&with));
        debug!(
            target: "claims::tasks",
            owner = %self.owner,
            reason = ?self.reason,
            "claim_replacement.queued"
        );
    }

    fn should_work(&self, _ctx: &MaintenanceContext<'_>) -> bool {
        self.result.is_none()
    }

    fn on_tick(
        &mut self,
        ctx: &mut MaintenanceContext<'_>,
        budget: usize,
        follow_ups: &mut Vec<Self>,
    ) {
        if self.state_matches {
            self.finish(ctx, ReplaceResult::StateMatches, follow_ups);
            return;
        }
        let step = ctx
            .manager
            .replace_step(self.owner, &self.matcher, self.with, budget);
        self.replaced += step.replaced;
        if step.finished {
            self.finish(ctx, ReplaceResult::Success, follow_ups);
        }
    }

    fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

use std::collections::VecDeque;

use tracing::info;

use crate::ids::PlayerId;

use super::{MaintenanceContext, SpreadoutTask};

/// Walks a snapshot of claim owners, confirming activity for active ones
/// and expiring those idle for longer than `expiration_ms`.
#[derive(Debug, Clone)]
pub struct ExpirationCheckTask {
    candidates: VecDeque<PlayerId>,
    expiration_ms: u64,
    expiring: Option<PlayerId>,
    checked: usize,
    expired: usize,
    finished: bool,
}

impl ExpirationCheckTask {
    pub fn new(candidates: Vec<PlayerId>, expiration_ms: u64) -> Self {
        Self {
            candidates: candidates.into(),
            expiration_ms,
            expiring: None,
            checked: 0,
            expired: 0,
            finished: false,
        }
    }

    pub fn checked(&self) -> usize {
        self.checked
    }

    pub fn expired(&self) -> usize {
        self.expired
    }

    fn waiting_on_expiration(&self, ctx: &MaintenanceContext<'_>) -> bool {
        self.expiring
            .is_some_and(|owner| ctx.manager.replacement_in_progress(owner))
    }
}

impl SpreadoutTask<MaintenanceContext<'_>> for ExpirationCheckTask {
    fn should_work(&self, ctx: &MaintenanceContext<'_>) -> bool {
        !self.finished && !self.waiting_on_expiration(ctx)
    }

    fn on_tick(
        &mut self,
        ctx: &mut MaintenanceContext<'_>,
        budget: usize,
        _follow_ups: &mut Vec<Self>,
    ) {
        self.expiring = None;
        let mut steps = budget;
        while steps > 0 {
            let Some(owner) = self.candidates.pop_front() else {
                self.finished = true;
                info!(
                    target: "claims::tasks",
                    checked = self.checked,
                    expired = self.expired,
                    "expiration_check.finished"
                );
                return;
            };
            steps -= 1;
            self.checked += 1;

            let Some(last_active) = ctx.manager.owner(owner).map(|info| info.last_active_ms()) else {
                continue;
            };
            if owner.is_reserved() || ctx.manager.is_online(owner) {
                ctx.manager.confirm_activity(owner, ctx.now_ms);
                continue;
            }
            if ctx.now_ms > last_active.saturating_add(self.expiration_ms)
                && ctx.manager.expire_owner(owner)
            {
                self.expired += 1;
                self.expiring = Some(owner);
                // the rest of the slice waits for the replacement to finish
                return;
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

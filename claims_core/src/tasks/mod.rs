//! Cooperative background work sliced across server ticks.
//!
//! Every pool owns a per-tick step budget shared by the tasks that can make
//! progress, so a tick never pays more than `budget x step cost` for
//! background maintenance no matter how much data is queued.

mod expiration;
mod replace;

use std::collections::BTreeMap;

use bevy::prelude::Resource;

use crate::config::SpreadoutSettings;
use crate::ids::PlayerId;
use crate::manager::ClaimsManager;

pub use expiration::ExpirationCheckTask;
pub use replace::{ClaimMatcher, ClaimReplaceTask, ReplaceReason, ReplaceResult};

/// A resumable unit of background work driven with a context `C`.
pub trait SpreadoutTask<C>: Sized {
    fn on_queued(&mut self, _ctx: &mut C) {}

    /// False while the task is blocked; it is retried next tick.
    fn should_work(&self, ctx: &C) -> bool;

    /// True when the task became irrelevant and should be discarded unfinished.
    fn should_drop(&self, _ctx: &C) -> bool {
        false
    }

    /// Performs at most `budget` steps. Tasks to queue afterwards go to `follow_ups`.
    fn on_tick(&mut self, ctx: &mut C, budget: usize, follow_ups: &mut Vec<Self>);

    fn is_finished(&self) -> bool;
}

/// Tick-thread view handed to maintenance tasks.
pub struct MaintenanceContext<'a> {
    pub manager: &'a mut ClaimsManager,
    pub now_ms: u64,
}

/// Global pool: tasks run in queue order and split the per-tick budget.
#[derive(Debug)]
pub struct QueuedTaskHandler<T> {
    tasks: Vec<T>,
    pending: Vec<T>,
    per_tick_limit: usize,
    per_task_limit: usize,
}

impl<T> QueuedTaskHandler<T> {
    pub fn new(per_tick_limit: usize, per_task_limit: usize) -> Self {
        Self {
            tasks: Vec::new(),
            pending: Vec::new(),
            per_tick_limit,
            per_task_limit,
        }
    }

    /// Queues a task; it starts on the next scheduling pass.
    pub fn queue<C>(&mut self, mut task: T, ctx: &mut C)
    where
        T: SpreadoutTask<C>,
    {
        task.on_queued(ctx);
        self.pending.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tasks(&self) -> impl Iterator<Item = &T> {
        self.tasks.iter().chain(self.pending.iter())
    }

    pub fn on_tick<C>(&mut self, ctx: &mut C)
    where
        T: SpreadoutTask<C>,
    {
        self.tasks.append(&mut self.pending);
        self.tasks
            .retain(|task| !task.is_finished() && !task.should_drop(ctx));

        let working = self.tasks.iter().filter(|task| task.should_work(ctx)).count();
        if working == 0 {
            return;
        }
        let per_task = (self.per_tick_limit / working)
            .min(self.per_task_limit)
            .max(1);

        let mut follow_ups = Vec::new();
        for task in &mut self.tasks {
            if task.should_work(ctx) {
                task.on_tick(ctx, per_task, &mut follow_ups);
            }
        }
        self.tasks.retain(|task| !task.is_finished());
        for task in follow_ups {
            self.queue(task, ctx);
        }
    }
}

/// Global maintenance pools ticked by the app.
#[derive(Resource, Debug)]
pub struct MaintenanceTasks {
    pub replacements: QueuedTaskHandler<ClaimReplaceTask>,
    pub expiration: QueuedTaskHandler<ExpirationCheckTask>,
    next_expiration_check_ms: u64,
}

impl MaintenanceTasks {
    pub fn new(settings: &SpreadoutSettings) -> Self {
        Self {
            replacements: QueuedTaskHandler::new(settings.replace_per_tick, settings.replace_per_task),
            expiration: QueuedTaskHandler::new(
                settings.expiration_per_tick,
                settings.expiration_per_task,
            ),
            next_expiration_check_ms: 0,
        }
    }

    /// True once per `interval_ms`, starting with the first call.
    pub fn expiration_check_due(&mut self, now_ms: u64, interval_ms: u64) -> bool {
        if now_ms < self.next_expiration_check_ms {
            return false;
        }
        self.next_expiration_check_ms = now_ms.saturating_add(interval_ms.max(1));
        true
    }

    /// Moves replacements the manager started into the pool, then runs
    /// both pools for one tick.
    pub fn on_tick(&mut self, ctx: &mut MaintenanceContext<'_>) {
        self.adopt_started(ctx);
        self.replacements.on_tick(ctx);
        self.expiration.on_tick(ctx);
        self.adopt_started(ctx);
    }

    fn adopt_started(&mut self, ctx: &mut MaintenanceContext<'_>) {
        for task in ctx.manager.take_started_replacements() {
            self.replacements.queue(task, ctx);
        }
    }
}

/// Lets a per-player pool skip players whose packet channel is backed up.
pub trait PlayerTaskContext {
    fn is_clogged(&self, player: PlayerId) -> bool;
}

/// Per-player pool: one task per player, budget split across unclogged players.
#[derive(Debug)]
pub struct PlayerTaskHandler<T> {
    tasks: BTreeMap<PlayerId, T>,
    per_tick_limit: usize,
    per_player_limit: usize,
}

impl<T> PlayerTaskHandler<T> {
    pub fn new(per_tick_limit: usize, per_player_limit: usize) -> Self {
        Self {
            tasks: BTreeMap::new(),
            per_tick_limit,
            per_player_limit,
        }
    }

    pub fn insert<C>(&mut self, player: PlayerId, mut task: T, ctx: &mut C)
    where
        T: SpreadoutTask<C>,
    {
        task.on_queued(ctx);
        self.tasks.insert(player, task);
    }

    pub fn remove(&mut self, player: PlayerId) -> Option<T> {
        self.tasks.remove(&player)
    }

    pub fn get(&self, player: PlayerId) -> Option<&T> {
        self.tasks.get(&player)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.tasks.keys().copied()
    }

    pub fn on_tick<C>(&mut self, ctx: &mut C)
    where
        C: PlayerTaskContext,
        T: SpreadoutTask<C>,
    {
        self.tasks.retain(|_, task| !task.should_drop(ctx));
        let active: Vec<PlayerId> = self
            .tasks
            .iter()
            .filter(|(player, task)| task.should_work(ctx) && !ctx.is_clogged(**player))
            .map(|(player, _)| *player)
            .collect();
        if active.is_empty() {
            return;
        }
        let per_player = (self.per_tick_limit / active.len())
            .min(self.per_player_limit)
            .max(1);
        let mut follow_ups = Vec::new();
        for player in active {
            if let Some(task) = self.tasks.get_mut(&player) {
                task.on_tick(ctx, per_player, &mut follow_ups);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::claim::{ClaimKey, MAIN_SUB_CONFIG};
    use crate::config::ClaimsConfig;
    use crate::ids::{ChunkPos, DimensionId};

    /// Counts down `remaining` units of work.
    struct Countdown {
        remaining: usize,
        ticks: usize,
        blocked: bool,
        spawn_on_finish: Option<usize>,
    }

    impl Countdown {
        fn new(work: usize) -> Self {
            Self {
                remaining: work,
                ticks: 0,
                blocked: false,
                spawn_on_finish: None,
            }
        }
    }

    #[derive(Default)]
    struct Ctx {
        steps: usize,
        clogged: HashSet<PlayerId>,
    }

    impl PlayerTaskContext for Ctx {
        fn is_clogged(&self, player: PlayerId) -> bool {
            self.clogged.contains(&player)
        }
    }

    impl SpreadoutTask<Ctx> for Countdown {
        fn should_work(&self, _ctx: &Ctx) -> bool {
            !self.blocked && self.remaining > 0
        }

        fn on_tick(&mut self, ctx: &mut Ctx, budget: usize, follow_ups: &mut Vec<Self>) {
            let done = budget.min(self.remaining);
            self.remaining -= done;
            self.ticks += 1;
            ctx.steps += done;
            if self.remaining == 0 {
                if let Some(work) = self.spawn_on_finish.take() {
                    follow_ups.push(Countdown::new(work));
                }
            }
        }

        fn is_finished(&self) -> bool {
            self.remaining == 0
        }
    }

    #[test]
    fn work_finishes_in_ceil_w_over_b_ticks() {
        let mut handler = QueuedTaskHandler::new(64, 8);
        let mut ctx = Ctx::default();
        handler.queue(Countdown::new(50), &mut ctx);
        let mut ticks = 0;
        while !handler.is_empty() {
            handler.on_tick(&mut ctx);
            ticks += 1;
            assert!(ticks < 100);
        }
        assert_eq!(ctx.steps, 50);
        // ceil(50 / 8) = 7 working passes, plus the pass that discards the task
        assert!((7..=8).contains(&ticks), "took {ticks} ticks");
    }

    #[test]
    fn budget_is_shared_between_working_tasks() {
        let mut handler = QueuedTaskHandler::new(10, 100);
        let mut ctx = Ctx::default();
        for _ in 0..4 {
            handler.queue(Countdown::new(1_000), &mut ctx);
        }
        handler.on_tick(&mut ctx);
        // 10 / 4 = 2 steps per task
        assert_eq!(ctx.steps, 8);
    }

    #[test]
    fn blocked_tasks_are_kept_but_not_ticked() {
        let mut handler = QueuedTaskHandler::new(10, 10);
        let mut ctx = Ctx::default();
        let mut task = Countdown::new(5);
        task.blocked = true;
        handler.queue(task, &mut ctx);
        for _ in 0..3 {
            handler.on_tick(&mut ctx);
        }
        assert_eq!(ctx.steps, 0);
        assert_eq!(handler.len(), 1);
        assert!(handler.tasks().all(|task| task.ticks == 0));
    }

    #[test]
    fn follow_ups_start_on_the_next_pass() {
        let mut handler = QueuedTaskHandler::new(10, 10);
        let mut ctx = Ctx::default();
        let mut task = Countdown::new(3);
        task.spawn_on_finish = Some(4);
        handler.queue(task, &mut ctx);
        handler.on_tick(&mut ctx);
        assert_eq!(ctx.steps, 3);
        assert_eq!(handler.len(), 1);
        handler.on_tick(&mut ctx);
        assert_eq!(ctx.steps, 7);
    }

    #[test]
    fn clogged_players_are_skipped_and_budget_split() {
        let mut handler = PlayerTaskHandler::new(30, 16);
        let mut ctx = Ctx::default();
        let players: Vec<PlayerId> = (1..=3).map(PlayerId::from_u128).collect();
        for player in &players {
            handler.insert(*player, Countdown::new(100), &mut ctx);
        }
        ctx.clogged.insert(players[0]);
        handler.on_tick(&mut ctx);
        // two active players: min(16, 30 / 2) = 15 each
        assert_eq!(ctx.steps, 30);
        assert_eq!(handler.get(players[0]).map(|task| task.remaining), Some(100));
        assert_eq!(handler.get(players[1]).map(|task| task.remaining), Some(85));
    }

    fn claimed_manager(owner: PlayerId, sub_config_index: i32, count: i32) -> ClaimsManager {
        let mut manager = ClaimsManager::new(&ClaimsConfig::default());
        for x in 0..count {
            manager.set_claim(
                &DimensionId::overworld(),
                ChunkPos::new(x, 0),
                Some(ClaimKey::new(owner, sub_config_index, false)),
            );
        }
        manager
    }

    #[test]
    fn deleted_sub_config_claims_return_to_main() {
        let owner = PlayerId::from_u128(11);
        let mut manager = claimed_manager(owner, 3, 10);
        manager.set_claim(
            &DimensionId::overworld(),
            ChunkPos::new(40, 0),
            Some(ClaimKey::new(owner, 4, false)),
        );
        manager.delete_sub_config(owner, 3);
        assert!(manager.replacement_in_progress(owner));

        let mut tasks = MaintenanceTasks::new(&SpreadoutSettings::default());
        let mut ctx = MaintenanceContext {
            manager: &mut manager,
            now_ms: 0,
        };
        let mut ticks = 0;
        while ctx.manager.replacement_in_progress(owner) {
            tasks.on_tick(&mut ctx);
            ticks += 1;
            assert!(ticks < 10, "replacement never finished");
        }

        for x in 0..10 {
            let claim = manager.get(&DimensionId::overworld(), ChunkPos::new(x, 0));
            assert_eq!(claim.map(|claim| claim.sub_config_index), Some(MAIN_SUB_CONFIG));
        }
        let untouched = manager.get(&DimensionId::overworld(), ChunkPos::new(40, 0));
        assert_eq!(untouched.map(|claim| claim.sub_config_index), Some(4));
        assert_eq!(manager.owner(owner).map(|info| info.claim_count()), Some(11));
    }

    #[test]
    fn replacement_already_in_target_state_finishes_without_work() {
        let owner = PlayerId::from_u128(12);
        let mut manager = claimed_manager(owner, 2, 5);
        let key = ClaimKey::new(owner, 2, false);
        let mut task = ClaimReplaceTask::new(
            owner,
            ClaimMatcher::SubConfig {
                sub_config_index: 2,
                forceloadable: false,
            },
            Some(key),
            ReplaceReason::SubConfigDeleted(2),
        );
        let mut ctx = MaintenanceContext {
            manager: &mut manager,
            now_ms: 0,
        };
        let mut follow_ups = Vec::new();
        task.on_queued(&mut ctx);
        assert!(ctx.manager.replacement_in_progress(owner));
        task.on_tick(&mut ctx, 32, &mut follow_ups);

        assert_eq!(task.result(), Some(ReplaceResult::StateMatches));
        assert_eq!(task.replaced(), 0);
        assert!(follow_ups.is_empty());
        assert!(!manager.replacement_in_progress(owner));
        assert_eq!(manager.owner(owner).map(|info| info.claim_count()), Some(5));
    }

    #[test]
    fn replacements_start_immediately_unless_one_is_running() {
        let alice = PlayerId::from_u128(13);
        let bob = PlayerId::from_u128(14);
        let mut manager = claimed_manager(alice, MAIN_SUB_CONFIG, 3);
        let unclaim_all =
            |owner| ClaimReplaceTask::new(owner, ClaimMatcher::Any, None, ReplaceReason::Expiration);

        manager.queue_replacement(unclaim_all(alice));
        manager.queue_replacement(unclaim_all(alice));
        manager.queue_replacement(unclaim_all(bob));
        let started: Vec<PlayerId> = manager
            .take_started_replacements()
            .iter()
            .map(ClaimReplaceTask::owner)
            .collect();
        assert_eq!(started, vec![alice, bob]);

        // the parked task is handed out when the running one finishes
        assert!(manager.finish_replacement(alice).is_some());
        assert!(manager.replacement_in_progress(alice));
        assert!(manager.finish_replacement(alice).is_none());
        assert!(!manager.replacement_in_progress(alice));
    }
}

//! Validated claim mutations.
//!
//! [`ClaimsManager`] is the only code that writes to the claims index. Every
//! write keeps the spatial index, the per-owner bookkeeping, the claim-state
//! registry and the force-load tickets in step, then notifies the change
//! tracker. Policy failures come back as [`ClaimOutcome`] values.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use bevy::prelude::Resource;
use tracing::{debug, info, warn};

use claims_proto::{ClaimAction, ClaimLimitsData};

use crate::claim::{ChunkClaim, ClaimKey, ClaimStateRegistry, MAIN_SUB_CONFIG};
use crate::config::{ClaimsConfig, ExpirationSettings, GeneralSettings};
use crate::ids::{ChunkPos, DimensionId, PlayerId, RegionPos};
use crate::index::ClaimsIndex;
use crate::limits::{ConfigLimits, DimensionPolicy, OwnerLimitProvider};
use crate::outcome::{AreaClaimResult, ClaimOutcome, OutcomeSet};
use crate::owner::PlayerClaimInfo;
use crate::persistence::OwnerClaimsRecord;
use crate::tasks::{ClaimMatcher, ClaimReplaceTask, ReplaceReason};
use crate::tickets::{ForceloadTickets, TicketPolicy};
use crate::tracker::{ChangeTracker, ClaimsListener};

/// Who is acting and from where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimActor {
    pub owner: PlayerId,
    pub sub_config_index: i32,
    pub from: ChunkPos,
    /// Admin mode: may act on other owners' claims and ignores distance.
    pub by_admin: bool,
}

impl ClaimActor {
    pub fn player(owner: PlayerId, from: ChunkPos) -> Self {
        Self {
            owner,
            sub_config_index: MAIN_SUB_CONFIG,
            from,
            by_admin: false,
        }
    }

    pub fn server(from: ChunkPos) -> Self {
        Self::player(PlayerId::SERVER, from)
    }

    pub fn with_sub_config(self, sub_config_index: i32) -> Self {
        Self {
            sub_config_index,
            ..self
        }
    }

    pub fn as_admin(self) -> Self {
        Self {
            by_admin: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceStep {
    pub replaced: usize,
    pub finished: bool,
}

#[derive(Resource)]
pub struct ClaimsManager {
    settings: GeneralSettings,
    expiration: ExpirationSettings,
    index: ClaimsIndex,
    states: ClaimStateRegistry,
    owners: BTreeMap<PlayerId, PlayerClaimInfo>,
    tickets: ForceloadTickets,
    tracker: ChangeTracker,
    limits: Box<dyn OwnerLimitProvider>,
    dimensions: Box<dyn DimensionPolicy>,
    online: BTreeSet<PlayerId>,
    server_operators: HashSet<PlayerId>,
    pending_replacements: HashMap<PlayerId, VecDeque<ClaimReplaceTask>>,
    started_replacements: Vec<ClaimReplaceTask>,
    now_ms: u64,
}

impl ClaimsManager {
    pub fn new(config: &ClaimsConfig) -> Self {
        Self {
            settings: config.general.clone(),
            expiration: config.expiration.clone(),
            index: ClaimsIndex::new(),
            states: ClaimStateRegistry::new(),
            owners: BTreeMap::new(),
            tickets: ForceloadTickets::new(),
            tracker: ChangeTracker::new(),
            limits: Box::new(ConfigLimits::from_settings(&config.general)),
            dimensions: Box::new(config.general.claimable_dimensions.clone()),
            online: BTreeSet::new(),
            server_operators: HashSet::new(),
            pending_replacements: HashMap::new(),
            started_replacements: Vec::new(),
            now_ms: 0,
        }
    }

    pub fn with_limits(mut self, limits: Box<dyn OwnerLimitProvider>) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_dimension_policy(mut self, policy: Box<dyn DimensionPolicy>) -> Self {
        self.dimensions = policy;
        self
    }

    pub fn register_listener(&mut self, listener: Box<dyn ClaimsListener>) {
        self.tracker.register(listener);
    }

    pub fn settings(&self) -> &GeneralSettings {
        &self.settings
    }

    pub fn index(&self) -> &ClaimsIndex {
        &self.index
    }

    pub fn states(&self) -> &ClaimStateRegistry {
        &self.states
    }

    pub fn tickets(&self) -> &ForceloadTickets {
        &self.tickets
    }

    pub fn owner(&self, owner: PlayerId) -> Option<&PlayerClaimInfo> {
        self.owners.get(&owner)
    }

    pub fn owners(&self) -> impl Iterator<Item = &PlayerClaimInfo> {
        self.owners.values()
    }

    pub fn set_now(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }

    pub fn is_claimable(&self, dimension: &DimensionId) -> bool {
        self.dimensions.is_claimable(dimension)
    }

    /// The claim visible at a position. Claims in unclaimable dimensions are
    /// hidden unless existing claims are allowed to remain there.
    pub fn get(&self, dimension: &DimensionId, pos: ChunkPos) -> Option<ChunkClaim> {
        if !self.settings.allow_existing_claims_in_unclaimable_dimensions
            && !self.dimensions.is_claimable(dimension)
        {
            return None;
        }
        self.index.get(dimension, pos)
    }

    // Connections and permissions

    pub fn is_online(&self, player: PlayerId) -> bool {
        self.online.contains(&player)
    }

    pub fn online_players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.online.iter().copied()
    }

    pub fn on_player_join(&mut self, player: PlayerId) {
        self.online.insert(player);
        self.confirm_activity(player, self.now_ms);
        self.refresh_tickets(player);
    }

    pub fn on_player_leave(&mut self, player: PlayerId) {
        self.online.remove(&player);
        self.confirm_activity(player, self.now_ms);
        self.refresh_tickets(player);
    }

    pub fn grant_server_permission(&mut self, player: PlayerId) {
        self.server_operators.insert(player);
    }

    pub fn revoke_server_permission(&mut self, player: PlayerId) {
        self.server_operators.remove(&player);
    }

    pub fn has_server_permission(&self, player: PlayerId) -> bool {
        self.server_operators.contains(&player)
    }

    pub fn confirm_activity(&mut self, owner: PlayerId, now_ms: u64) {
        if let Some(info) = self.owners.get_mut(&owner) {
            info.confirm_activity(now_ms);
        }
    }

    // Limits

    /// `None` means unlimited.
    pub fn claim_limit(&self, owner: PlayerId) -> Option<i32> {
        if owner.is_reserved() {
            return None;
        }
        let online = self.is_online(owner);
        Some(self.limits.base_claim_limit(owner, online) + self.limits.bonus_claims(owner))
    }

    pub fn forceload_limit(&self, owner: PlayerId) -> Option<i32> {
        if owner.is_reserved() {
            return None;
        }
        let online = self.is_online(owner);
        Some(self.limits.base_forceload_limit(owner, online) + self.limits.bonus_forceloads(owner))
    }

    pub fn limits_packet(&self, owner: PlayerId) -> ClaimLimitsData {
        let info = self.owners.get(&owner);
        ClaimLimitsData {
            loading_claim_count: info.map_or(0, |info| info.claim_count() as u32),
            loading_forceload_count: info.map_or(0, |info| info.forceloadable_count() as u32),
            claim_limit: self.claim_limit(owner).unwrap_or(i32::MAX),
            forceload_limit: self.forceload_limit(owner).unwrap_or(i32::MAX),
            max_distance: self.settings.max_claim_distance,
            always_use_loading_values: false,
        }
    }

    fn claim_count(&self, owner: PlayerId) -> usize {
        self.owners.get(&owner).map_or(0, PlayerClaimInfo::claim_count)
    }

    fn forceloadable_count(&self, owner: PlayerId) -> usize {
        self.owners
            .get(&owner)
            .map_or(0, PlayerClaimInfo::forceloadable_count)
    }

    fn ticket_policy(&self, owner: PlayerId) -> TicketPolicy {
        let present = owner.is_reserved()
            || self.is_online(owner)
            || self.limits.offline_forceload(owner);
        TicketPolicy {
            eligible: self.limits.forceload_enabled(owner) && present,
            limit: self.forceload_limit(owner).map(|limit| limit.max(0) as usize),
            allow_in_unclaimable: self.settings.allow_existing_forceloads_in_unclaimable_dimensions,
        }
    }

    /// Re-evaluates every force-load ticket of an owner.
    pub fn refresh_tickets(&mut self, owner: PlayerId) {
        let policy = self.ticket_policy(owner);
        let dimensions = &self.dimensions;
        self.tickets
            .update_owner(owner, policy, |dimension| dimensions.is_claimable(dimension));
    }

    // Claim actions

    fn request_rejection(&self, owner: PlayerId) -> Option<ClaimOutcome> {
        if !self.settings.claims_enabled {
            return Some(ClaimOutcome::ClaimsAreDisabled);
        }
        if self.replacement_in_progress(owner) {
            return Some(ClaimOutcome::ReplacementInProgress);
        }
        None
    }

    pub fn try_single_claim_action(
        &mut self,
        dimension: &DimensionId,
        actor: &ClaimActor,
        pos: ChunkPos,
        action: ClaimAction,
    ) -> ClaimOutcome {
        if let Some(rejection) = self.request_rejection(actor.owner) {
            return rejection;
        }
        let outcome = self.evaluate_cell(dimension, actor, pos, action);
        debug!(
            target: "claims::manager",
            owner = %actor.owner,
            dimension = %dimension,
            %pos,
            action = action.as_str(),
            %outcome,
            "claim_action.evaluated"
        );
        outcome
    }

    /// Applies `action` to every chunk of the rectangle, nearest to the
    /// requester first. Each cell's result stands on its own.
    pub fn try_claim_action_over_area(
        &mut self,
        dimension: &DimensionId,
        actor: &ClaimActor,
        (left, top, right, bottom): (i32, i32, i32, i32),
        action: ClaimAction,
    ) -> AreaClaimResult {
        if let Some(rejection) = self.request_rejection(actor.owner) {
            return AreaClaimResult::rejected(rejection, left, top, right, bottom);
        }
        let (min_x, max_x) = (left.min(right), left.max(right));
        let (min_z, max_z) = (top.min(bottom), top.max(bottom));
        let cells = (max_x as i64 - min_x as i64 + 1) * (max_z as i64 - min_z as i64 + 1);
        if cells > self.settings.max_area_request_cells as i64 {
            return AreaClaimResult::rejected(ClaimOutcome::TooManyChunks, left, top, right, bottom);
        }

        let mut positions: Vec<ChunkPos> = (min_x..=max_x)
            .flat_map(|x| (min_z..=max_z).map(move |z| ChunkPos::new(x, z)))
            .collect();
        let from = actor.from;
        positions.sort_by_key(|pos| (pos.chebyshev(from), pos.manhattan(from), pos.x, pos.z));

        let mut outcomes = OutcomeSet::empty();
        let mut successes = 0usize;
        for pos in &positions {
            if successes >= self.settings.max_claims_per_request {
                outcomes.add(ClaimOutcome::TooManyChunks);
                continue;
            }
            let outcome = self.evaluate_cell(dimension, actor, *pos, action);
            if outcome.is_success() {
                successes += 1;
            }
            outcomes.add(outcome);
        }
        info!(
            target: "claims::manager",
            owner = %actor.owner,
            dimension = %dimension,
            action = action.as_str(),
            cells = positions.len(),
            successes,
            outcomes = outcomes.bits(),
            "area_action.applied"
        );
        AreaClaimResult {
            outcomes,
            left,
            top,
            right,
            bottom,
            cells_evaluated: positions.len(),
        }
    }

    fn too_far(&self, actor: &ClaimActor, pos: ChunkPos) -> bool {
        !actor.by_admin
            && i64::from(pos.chebyshev(actor.from)) > i64::from(self.settings.max_claim_distance)
    }

    fn evaluate_cell(
        &mut self,
        dimension: &DimensionId,
        actor: &ClaimActor,
        pos: ChunkPos,
        action: ClaimAction,
    ) -> ClaimOutcome {
        let owner = actor.owner;
        let adds_claim = matches!(action, ClaimAction::Claim | ClaimAction::ForceloadOn);
        if adds_claim && owner != PlayerId::SERVER && !self.dimensions.is_claimable(dimension) {
            return ClaimOutcome::UnclaimableDimension;
        }
        let current = self.index.get(dimension, pos);
        match action {
            ClaimAction::Claim => {
                let requested = ClaimKey::new(owner, actor.sub_config_index, false);
                if let Some(existing) = current {
                    let same_type = existing.key().is_same_claim_type(&requested);
                    if same_type || (existing.owner != owner && !actor.by_admin) {
                        return ClaimOutcome::AlreadyClaimed;
                    }
                }
                let new_slot = current.map_or(true, |existing| existing.owner != owner);
                if new_slot {
                    if let Some(limit) = self.claim_limit(owner) {
                        if self.claim_count(owner) as i64 >= limit as i64 {
                            return ClaimOutcome::ClaimLimitReached;
                        }
                    }
                }
                if self.too_far(actor, pos) {
                    return ClaimOutcome::TooFar;
                }
                let forceloadable =
                    current.is_some_and(|existing| existing.owner == owner && existing.forceloadable);
                let key = requested.with_forceloadable(forceloadable);
                self.apply_claim(dimension, pos, Some(key), true);
                ClaimOutcome::SuccessfulClaim
            }
            ClaimAction::Unclaim => {
                let Some(existing) = current else {
                    return ClaimOutcome::NotClaimedByUser;
                };
                if existing.owner != owner && !actor.by_admin {
                    return ClaimOutcome::NotClaimedByUser;
                }
                if self.too_far(actor, pos) {
                    return ClaimOutcome::TooFar;
                }
                self.apply_claim(dimension, pos, None, true);
                ClaimOutcome::SuccessfulUnclaim
            }
            ClaimAction::ForceloadOn | ClaimAction::ForceloadOff => {
                let enable = action == ClaimAction::ForceloadOn;
                let Some(existing) = current else {
                    return ClaimOutcome::NotClaimedByUserForceload;
                };
                if existing.owner != owner && !actor.by_admin {
                    return ClaimOutcome::NotClaimedByUserForceload;
                }
                if existing.forceloadable == enable {
                    return if enable {
                        ClaimOutcome::AlreadyForceloadable
                    } else {
                        ClaimOutcome::AlreadyUnforceloaded
                    };
                }
                if enable {
                    if let Some(limit) = self.forceload_limit(existing.owner) {
                        if self.forceloadable_count(existing.owner) as i64 >= limit as i64 {
                            return ClaimOutcome::ForceloadLimitReached;
                        }
                    }
                }
                if self.too_far(actor, pos) {
                    return ClaimOutcome::TooFar;
                }
                let key = existing.key().with_forceloadable(enable);
                self.apply_claim(dimension, pos, Some(key), true);
                if enable {
                    ClaimOutcome::SuccessfulForceload
                } else {
                    ClaimOutcome::SuccessfulUnforceload
                }
            }
        }
    }

    /// Writes a claim without policy checks. Used by loading, replacement and
    /// admin tooling; everything else goes through the claim actions.
    pub fn set_claim(&mut self, dimension: &DimensionId, pos: ChunkPos, key: Option<ClaimKey>) -> bool {
        self.apply_claim(dimension, pos, key, true)
    }

    fn apply_claim(
        &mut self,
        dimension: &DimensionId,
        pos: ChunkPos,
        key: Option<ClaimKey>,
        notify: bool,
    ) -> bool {
        let previous = self.index.get(dimension, pos);
        if previous.map(|claim| claim.key()) == key {
            return false;
        }
        let claim = match key {
            Some(key) => {
                let (claim, created) = self.states.get_or_create(key);
                if created {
                    self.tracker.claim_state_created(claim);
                }
                Some(claim)
            }
            None => None,
        };

        let change = self.index.set(dimension, pos, claim);
        if let Some(added) = change.added {
            self.states.region_added(&added);
        }
        let removed_state = change
            .removed
            .and_then(|removed| self.states.region_removed(&removed));

        let keeps_ticket = |old: &ChunkClaim, new: Option<ChunkClaim>| {
            new.is_some_and(|new| new.owner == old.owner && new.forceloadable)
        };
        if let Some(old) = previous {
            self.owner_entry(old.owner).on_unclaim(dimension, &old, pos);
            if old.forceloadable && !keeps_ticket(&old, claim) {
                let policy = self.ticket_policy(old.owner);
                let dimensions = &self.dimensions;
                self.tickets.remove_and_update(dimension, pos, policy, |dimension| {
                    dimensions.is_claimable(dimension)
                });
            }
        }
        if let Some(new) = claim {
            self.owner_entry(new.owner).on_claim(dimension, &new, pos);
            let had_ticket = previous.is_some_and(|old| old.forceloadable && old.owner == new.owner);
            if new.forceloadable && !had_ticket {
                let policy = self.ticket_policy(new.owner);
                let claimable = self.dimensions.is_claimable(dimension);
                self.tickets.add(new.owner, dimension, pos, policy, claimable);
            }
        }

        if notify {
            self.tracker.chunk_changed(dimension, pos, claim, previous);
        }
        if let Some(state) = removed_state {
            self.tracker.claim_state_removed(state);
        }
        true
    }

    fn owner_entry(&mut self, owner: PlayerId) -> &mut PlayerClaimInfo {
        let now_ms = self.now_ms;
        self.owners
            .entry(owner)
            .or_insert_with(|| PlayerClaimInfo::new(owner, now_ms))
    }

    // Background replacement

    pub fn replacement_in_progress(&self, owner: PlayerId) -> bool {
        self.owners
            .get(&owner)
            .is_some_and(PlayerClaimInfo::replacement_in_progress)
    }

    pub(crate) fn mark_replacement_started(&mut self, owner: PlayerId) {
        self.owner_entry(owner).set_replacement_in_progress(true);
    }

    /// Starts a replacement, or parks it behind the owner's running one.
    pub fn queue_replacement(&mut self, task: ClaimReplaceTask) {
        let owner = task.owner();
        if self.replacement_in_progress(owner) {
            self.pending_replacements
                .entry(owner)
                .or_default()
                .push_back(task);
            return;
        }
        self.mark_replacement_started(owner);
        self.started_replacements.push(task);
    }

    /// Replacements started since the last call, for the scheduler to pick up.
    pub fn take_started_replacements(&mut self) -> Vec<ClaimReplaceTask> {
        std::mem::take(&mut self.started_replacements)
    }

    /// Ends the owner's running replacement and hands out the next parked one.
    pub fn finish_replacement(&mut self, owner: PlayerId) -> Option<ClaimReplaceTask> {
        if let Some(queue) = self.pending_replacements.get_mut(&owner) {
            if let Some(next) = queue.pop_front() {
                return Some(next);
            }
            self.pending_replacements.remove(&owner);
        }
        if let Some(info) = self.owners.get_mut(&owner) {
            info.set_replacement_in_progress(false);
        }
        None
    }

    /// Rewrites up to `budget` of the owner's matching claims.
    pub fn replace_step(
        &mut self,
        owner: PlayerId,
        matcher: &ClaimMatcher,
        with: Option<ClaimKey>,
        budget: usize,
    ) -> ReplaceStep {
        let Some(info) = self.owners.get(&owner) else {
            return ReplaceStep {
                replaced: 0,
                finished: true,
            };
        };
        let found = info.matching_positions(|key| matcher.matches(key), budget.saturating_add(1));
        let finished = found.len() <= budget;
        let mut replaced = 0;
        for (dimension, _, pos) in found.into_iter().take(budget) {
            if self.apply_claim(&dimension, pos, with, true) {
                replaced += 1;
            }
        }
        ReplaceStep { replaced, finished }
    }

    /// Queues the conversion (or removal) of every claim of an idle owner.
    pub fn expire_owner(&mut self, owner: PlayerId) -> bool {
        if owner.is_reserved() || self.replacement_in_progress(owner) {
            return false;
        }
        let with = self
            .expiration
            .convert_expired_claims
            .then(|| ClaimKey::main(PlayerId::EXPIRED));
        info!(
            target: "claims::manager",
            %owner,
            claims = self.claim_count(owner),
            converted = with.is_some(),
            "owner.expired"
        );
        self.queue_replacement(ClaimReplaceTask::new(
            owner,
            ClaimMatcher::Any,
            with,
            ReplaceReason::Expiration,
        ));
        true
    }

    /// Moves claims that used a deleted sub-config back to the main config.
    pub fn delete_sub_config(&mut self, owner: PlayerId, sub_config_index: i32) {
        if sub_config_index == MAIN_SUB_CONFIG {
            warn!(target: "claims::manager", %owner, "sub_config.delete_main_refused");
            return;
        }
        for forceloadable in [false, true] {
            self.queue_replacement(ClaimReplaceTask::new(
                owner,
                ClaimMatcher::SubConfig {
                    sub_config_index,
                    forceloadable,
                },
                Some(ClaimKey::new(owner, MAIN_SUB_CONFIG, forceloadable)),
                ReplaceReason::SubConfigDeleted(sub_config_index),
            ));
        }
    }

    /// Owners whose claims can expire.
    pub fn expiration_candidates(&self) -> Vec<PlayerId> {
        self.owners
            .values()
            .filter(|info| !info.owner().is_reserved() && info.claim_count() > 0)
            .map(PlayerClaimInfo::owner)
            .collect()
    }

    // Persistence

    /// Bulk-loads one owner's record, announcing touched regions once each.
    pub fn load_owner_record(&mut self, record: &OwnerClaimsRecord) -> usize {
        let owner = record.owner;
        let mut loaded = 0;
        let mut touched: BTreeSet<(DimensionId, RegionPos)> = BTreeSet::new();
        for (dimension_name, groups) in &record.dimensions {
            let dimension = DimensionId::new(dimension_name.clone());
            for group in groups {
                let key = ClaimKey::new(owner, group.sub_config_index, group.forceloadable);
                for [x, z] in &group.positions {
                    let pos = ChunkPos::new(*x, *z);
                    if let Some(existing) = self.index.get(&dimension, pos) {
                        if existing.owner != owner {
                            warn!(
                                target: "claims::persistence",
                                %owner,
                                holder = %existing.owner,
                                dimension = %dimension,
                                %pos,
                                "claim_record.overlap_skipped"
                            );
                            continue;
                        }
                    }
                    if self.apply_claim(&dimension, pos, Some(key), false) {
                        loaded += 1;
                        touched.insert((dimension.clone(), pos.region()));
                    }
                }
            }
        }
        let info = self.owner_entry(owner);
        info.confirm_activity(record.last_active_ms);
        info.mark_clean();
        for (dimension, region) in touched {
            self.tracker.whole_region_changed(&dimension, region);
        }
        loaded
    }

    /// Records of every owner changed since the last call.
    pub fn take_dirty_records(&mut self) -> Vec<OwnerClaimsRecord> {
        let mut records = Vec::new();
        for info in self.owners.values_mut() {
            if info.is_dirty() {
                records.push(info.to_record());
                info.mark_clean();
            }
        }
        records
    }

    /// Flags an owner for the next save, e.g. after a failed write.
    pub fn mark_dirty(&mut self, owner: PlayerId) {
        if let Some(info) = self.owners.get_mut(&owner) {
            info.mark_dirty();
        }
    }

    pub fn owner_record(&self, owner: PlayerId) -> Option<OwnerClaimsRecord> {
        self.owners.get(&owner).map(PlayerClaimInfo::to_record)
    }

    pub fn all_records(&self) -> Vec<OwnerClaimsRecord> {
        self.owners.values().map(PlayerClaimInfo::to_record).collect()
    }
}

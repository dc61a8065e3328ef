//! Force-load tickets for forceloadable claims.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};

use tracing::debug;

use crate::ids::{ChunkPos, DimensionId, PlayerId};

/// A request to keep one chunk loaded. Identified by location only.
#[derive(Debug, Clone)]
pub struct ClaimTicket {
    pub owner: PlayerId,
    pub dimension: DimensionId,
    pub pos: ChunkPos,
    pub enabled: bool,
}

impl PartialEq for ClaimTicket {
    fn eq(&self, other: &Self) -> bool {
        self.dimension == other.dimension && self.pos == other.pos
    }
}

impl Eq for ClaimTicket {}

impl Hash for ClaimTicket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dimension.hash(state);
        self.pos.hash(state);
    }
}

/// Whether an owner's tickets may be enabled right now, and how many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketPolicy {
    pub eligible: bool,
    /// `None` is unlimited.
    pub limit: Option<usize>,
    pub allow_in_unclaimable: bool,
}

type TicketKey = (DimensionId, ChunkPos);

#[derive(Debug, Default)]
pub struct ForceloadTickets {
    tickets: HashMap<TicketKey, ClaimTicket>,
    by_owner: HashMap<PlayerId, BTreeSet<TicketKey>>,
    enabled_per_dimension: HashMap<DimensionId, usize>,
    failed_to_enable: HashSet<PlayerId>,
}

impl ForceloadTickets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dimension: &DimensionId, pos: ChunkPos) -> Option<&ClaimTicket> {
        self.tickets.get(&(dimension.clone(), pos))
    }

    pub fn is_enabled(&self, dimension: &DimensionId, pos: ChunkPos) -> bool {
        self.get(dimension, pos).is_some_and(|ticket| ticket.enabled)
    }

    pub fn enabled_count(&self, owner: PlayerId) -> usize {
        self.by_owner
            .get(&owner)
            .map(|keys| {
                keys.iter()
                    .filter(|key| self.tickets.get(*key).is_some_and(|ticket| ticket.enabled))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn enabled_in(&self, dimension: &DimensionId) -> usize {
        self.enabled_per_dimension.get(dimension).copied().unwrap_or(0)
    }

    pub fn total_enabled(&self) -> usize {
        self.enabled_per_dimension.values().sum()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// True if the owner has tickets that stayed disabled because of the limit.
    pub fn failed_to_enable_some(&self, owner: PlayerId) -> bool {
        self.failed_to_enable.contains(&owner)
    }

    pub fn add(
        &mut self,
        owner: PlayerId,
        dimension: &DimensionId,
        pos: ChunkPos,
        policy: TicketPolicy,
        dimension_claimable: bool,
    ) {
        let key = (dimension.clone(), pos);
        if self.tickets.contains_key(&key) {
            self.remove(dimension, pos);
        }
        let enabled_now = self.enabled_count(owner);
        let allowed = dimension_claimable || policy.allow_in_unclaimable;
        let within_limit = policy.limit.map_or(true, |limit| enabled_now < limit);
        let enabled = policy.eligible && allowed && within_limit;
        if policy.eligible && allowed && !within_limit {
            self.failed_to_enable.insert(owner);
        }

        self.tickets.insert(
            key.clone(),
            ClaimTicket {
                owner,
                dimension: dimension.clone(),
                pos,
                enabled: false,
            },
        );
        self.by_owner.entry(owner).or_default().insert(key.clone());
        if enabled {
            self.set_enabled(&key, true);
        }
    }

    /// Removes the ticket at a location. When its owner had tickets held back
    /// by the limit, those get another chance under `policy`.
    pub fn remove_and_update(
        &mut self,
        dimension: &DimensionId,
        pos: ChunkPos,
        policy: TicketPolicy,
        dimension_claimable: impl Fn(&DimensionId) -> bool,
    ) -> Option<ClaimTicket> {
        let removed = self.remove(dimension, pos)?;
        if self.failed_to_enable.contains(&removed.owner) {
            self.update_owner(removed.owner, policy, dimension_claimable);
        }
        Some(removed)
    }

    fn remove(&mut self, dimension: &DimensionId, pos: ChunkPos) -> Option<ClaimTicket> {
        let key = (dimension.clone(), pos);
        self.set_enabled(&key, false);
        let ticket = self.tickets.remove(&key)?;
        if let Some(keys) = self.by_owner.get_mut(&ticket.owner) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_owner.remove(&ticket.owner);
                self.failed_to_enable.remove(&ticket.owner);
            }
        }
        Some(ticket)
    }

    /// Re-evaluates every ticket of an owner, enabling them in location order
    /// up to the limit.
    pub fn update_owner(
        &mut self,
        owner: PlayerId,
        policy: TicketPolicy,
        dimension_claimable: impl Fn(&DimensionId) -> bool,
    ) {
        let Some(keys) = self.by_owner.get(&owner).cloned() else {
            self.failed_to_enable.remove(&owner);
            return;
        };
        let mut enabled = 0usize;
        let mut failed = false;
        for key in keys {
            let allowed = policy.allow_in_unclaimable || dimension_claimable(&key.0);
            let within_limit = policy.limit.map_or(true, |limit| enabled < limit);
            let enable = policy.eligible && allowed && within_limit;
            if policy.eligible && allowed && !within_limit {
                failed = true;
            }
            self.set_enabled(&key, enable);
            if enable {
                enabled += 1;
            }
        }
        if failed {
            self.failed_to_enable.insert(owner);
        } else {
            self.failed_to_enable.remove(&owner);
        }
    }

    fn set_enabled(&mut self, key: &TicketKey, enabled: bool) {
        let Some(ticket) = self.tickets.get_mut(key) else {
            return;
        };
        if ticket.enabled == enabled {
            return;
        }
        ticket.enabled = enabled;
        let counter = self
            .enabled_per_dimension
            .entry(ticket.dimension.clone())
            .or_default();
        if enabled {
            *counter += 1;
        } else {
            *counter = counter.saturating_sub(1);
        }
        debug!(
            target: "claims::tickets",
            owner = %ticket.owner,
            dimension = %ticket.dimension,
            pos = %ticket.pos,
            enabled,
            "ticket.toggled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: usize) -> TicketPolicy {
        TicketPolicy {
            eligible: true,
            limit: Some(limit),
            allow_in_unclaimable: false,
        }
    }

    #[test]
    fn tickets_are_keyed_by_location() {
        let a = ClaimTicket {
            owner: PlayerId::from_u128(1),
            dimension: DimensionId::overworld(),
            pos: ChunkPos::new(1, 2),
            enabled: true,
        };
        let b = ClaimTicket {
            owner: PlayerId::from_u128(2),
            enabled: false,
            ..a.clone()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn limit_holds_back_extra_tickets_until_one_is_removed() {
        let owner = PlayerId::from_u128(9);
        let overworld = DimensionId::overworld();
        let mut tickets = ForceloadTickets::new();
        for x in 0..3 {
            tickets.add(owner, &overworld, ChunkPos::new(x, 0), policy(2), true);
        }
        assert_eq!(tickets.enabled_count(owner), 2);
        assert!(!tickets.is_enabled(&overworld, ChunkPos::new(2, 0)));
        assert!(tickets.failed_to_enable_some(owner));

        tickets.remove_and_update(&overworld, ChunkPos::new(0, 0), policy(2), |_| true);
        assert_eq!(tickets.enabled_count(owner), 2);
        assert!(tickets.is_enabled(&overworld, ChunkPos::new(2, 0)));
        assert!(!tickets.failed_to_enable_some(owner));
        assert_eq!(tickets.enabled_in(&overworld), 2);
    }

    #[test]
    fn ineligible_owner_keeps_tickets_disabled() {
        let owner = PlayerId::from_u128(10);
        let overworld = DimensionId::overworld();
        let mut tickets = ForceloadTickets::new();
        let offline = TicketPolicy {
            eligible: false,
            limit: Some(10),
            allow_in_unclaimable: false,
        };
        tickets.add(owner, &overworld, ChunkPos::new(0, 0), offline, true);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets.total_enabled(), 0);

        tickets.update_owner(owner, policy(10), |_| true);
        assert_eq!(tickets.total_enabled(), 1);
    }

    #[test]
    fn unclaimable_dimension_blocks_enabling() {
        let owner = PlayerId::from_u128(11);
        let end = DimensionId::new("minecraft:the_end");
        let mut tickets = ForceloadTickets::new();
        tickets.add(owner, &end, ChunkPos::new(0, 0), policy(5), false);
        assert!(!tickets.is_enabled(&end, ChunkPos::new(0, 0)));

        let allowing = TicketPolicy {
            allow_in_unclaimable: true,
            ..policy(5)
        };
        tickets.update_owner(owner, allowing, |_| false);
        assert!(tickets.is_enabled(&end, ChunkPos::new(0, 0)));
    }
}

//! Per-owner claim bookkeeping kept in step with the spatial index.

use std::collections::BTreeMap;

use crate::claim::{ChunkClaim, ClaimKey};
use crate::ids::{ChunkPos, DimensionId, PlayerId};
use crate::persistence::{ClaimGroupRecord, OwnerClaimsRecord};

/// Sorted packed positions holding one claim value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClaimPosList {
    positions: Vec<i64>,
}

impl ClaimPosList {
    pub fn add(&mut self, pos: ChunkPos) -> bool {
        let key = pos.packed();
        match self.positions.binary_search(&key) {
            Ok(_) => false,
            Err(at) => {
                self.positions.insert(at, key);
                true
            }
        }
    }

    pub fn remove(&mut self, pos: ChunkPos) -> bool {
        match self.positions.binary_search(&pos.packed()) {
            Ok(at) => {
                self.positions.remove(at);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.positions.binary_search(&pos.packed()).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.positions.iter().copied().map(ChunkPos::from_packed)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct PlayerDimensionClaims {
    lists: BTreeMap<ClaimKey, ClaimPosList>,
    count: usize,
    forceloadable_count: usize,
}

impl PlayerDimensionClaims {
    pub fn lists(&self) -> impl Iterator<Item = (&ClaimKey, &ClaimPosList)> {
        self.lists.iter()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn forceloadable_count(&self) -> usize {
        self.forceloadable_count
    }
}

#[derive(Debug, Clone)]
pub struct PlayerClaimInfo {
    owner: PlayerId,
    dimensions: BTreeMap<DimensionId, PlayerDimensionClaims>,
    claim_count: usize,
    forceloadable_count: usize,
    last_active_ms: u64,
    replacement_in_progress: bool,
    dirty: bool,
}

impl PlayerClaimInfo {
    pub fn new(owner: PlayerId, last_active_ms: u64) -> Self {
        Self {
            owner,
            dimensions: BTreeMap::new(),
            claim_count: 0,
            forceloadable_count: 0,
            last_active_ms,
            replacement_in_progress: false,
            dirty: false,
        }
    }

    pub fn owner(&self) -> PlayerId {
        self.owner
    }

    pub fn claim_count(&self) -> usize {
        self.claim_count
    }

    pub fn forceloadable_count(&self) -> usize {
        self.forceloadable_count
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms
    }

    pub fn confirm_activity(&mut self, now_ms: u64) {
        if now_ms > self.last_active_ms {
            self.last_active_ms = now_ms;
            self.dirty = true;
        }
    }

    pub fn replacement_in_progress(&self) -> bool {
        self.replacement_in_progress
    }

    pub fn set_replacement_in_progress(&mut self, value: bool) {
        self.replacement_in_progress = value;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn dimension(&self, dimension: &DimensionId) -> Option<&PlayerDimensionClaims> {
        self.dimensions.get(dimension)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (&DimensionId, &PlayerDimensionClaims)> {
        self.dimensions.iter()
    }

    pub fn holds(&self, dimension: &DimensionId, claim: &ChunkClaim, pos: ChunkPos) -> bool {
        self.dimensions
            .get(dimension)
            .and_then(|claims| claims.lists.get(&claim.key()))
            .is_some_and(|list| list.contains(pos))
    }

    pub fn on_claim(&mut self, dimension: &DimensionId, claim: &ChunkClaim, pos: ChunkPos) {
        let claims = self.dimensions.entry(dimension.clone()).or_default();
        if !claims.lists.entry(claim.key()).or_default().add(pos) {
            return;
        }
        claims.count += 1;
        self.claim_count += 1;
        if claim.forceloadable {
            claims.forceloadable_count += 1;
            self.forceloadable_count += 1;
        }
        self.dirty = true;
    }

    pub fn on_unclaim(&mut self, dimension: &DimensionId, claim: &ChunkClaim, pos: ChunkPos) {
        let Some(claims) = self.dimensions.get_mut(dimension) else {
            return;
        };
        let key = claim.key();
        let Some(list) = claims.lists.get_mut(&key) else {
            return;
        };
        if !list.remove(pos) {
            return;
        }
        if list.is_empty() {
            claims.lists.remove(&key);
        }
        claims.count -= 1;
        self.claim_count -= 1;
        if claim.forceloadable {
            claims.forceloadable_count -= 1;
            self.forceloadable_count -= 1;
        }
        if claims.lists.is_empty() {
            self.dimensions.remove(dimension);
        }
        self.dirty = true;
    }

    /// Collects up to `limit` positions whose claim value passes `matches`,
    /// in dimension, value and position order.
    pub fn matching_positions(
        &self,
        mut matches: impl FnMut(&ClaimKey) -> bool,
        limit: usize,
    ) -> Vec<(DimensionId, ClaimKey, ChunkPos)> {
        let mut found = Vec::new();
        for (dimension, claims) in &self.dimensions {
            for (key, list) in &claims.lists {
                if !matches(key) {
                    continue;
                }
                for pos in list.iter() {
                    if found.len() >= limit {
                        return found;
                    }
                    found.push((dimension.clone(), *key, pos));
                }
            }
        }
        found
    }

    /// Positions of forceloadable claims, used to rebuild tickets.
    pub fn forceloadable_positions(&self) -> Vec<(DimensionId, ChunkPos)> {
        let mut positions = Vec::new();
        for (dimension, claims) in &self.dimensions {
            for (key, list) in &claims.lists {
                if key.forceloadable {
                    positions.extend(list.iter().map(|pos| (dimension.clone(), pos)));
                }
            }
        }
        positions
    }

    pub fn to_record(&self) -> OwnerClaimsRecord {
        let dimensions = self
            .dimensions
            .iter()
            .map(|(dimension, claims)| {
                let groups = claims
                    .lists
                    .iter()
                    .map(|(key, list)| ClaimGroupRecord {
                        sub_config_index: key.sub_config_index,
                        forceloadable: key.forceloadable,
                        positions: list.iter().map(|pos| [pos.x, pos.z]).collect(),
                    })
                    .collect();
                (dimension.0.clone(), groups)
            })
            .collect();
        OwnerClaimsRecord {
            owner: self.owner,
            last_active_ms: self.last_active_ms,
            dimensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(owner: PlayerId, forceloadable: bool) -> ChunkClaim {
        ChunkClaim {
            owner,
            sub_config_index: -1,
            forceloadable,
            sync_index: 0,
        }
    }

    #[test]
    fn counts_follow_claims() {
        let owner = PlayerId::from_u128(11);
        let mut info = PlayerClaimInfo::new(owner, 0);
        let overworld = DimensionId::overworld();
        info.on_claim(&overworld, &claim(owner, false), ChunkPos::new(0, 0));
        info.on_claim(&overworld, &claim(owner, true), ChunkPos::new(0, 1));
        info.on_claim(&overworld, &claim(owner, true), ChunkPos::new(0, 1));
        assert_eq!(info.claim_count(), 2);
        assert_eq!(info.forceloadable_count(), 1);
        assert!(info.is_dirty());

        info.on_unclaim(&overworld, &claim(owner, true), ChunkPos::new(0, 1));
        assert_eq!(info.claim_count(), 1);
        assert_eq!(info.forceloadable_count(), 0);

        info.on_unclaim(&overworld, &claim(owner, false), ChunkPos::new(0, 0));
        assert!(info.dimension(&overworld).is_none());
    }

    #[test]
    fn matching_positions_respects_limit() {
        let owner = PlayerId::from_u128(12);
        let mut info = PlayerClaimInfo::new(owner, 0);
        let overworld = DimensionId::overworld();
        for x in 0..10 {
            info.on_claim(&overworld, &claim(owner, x % 2 == 0), ChunkPos::new(x, -x));
        }
        let forceloaded = info.matching_positions(|key| key.forceloadable, 3);
        assert_eq!(forceloaded.len(), 3);
        assert!(forceloaded.iter().all(|(_, key, _)| key.forceloadable));
        assert_eq!(info.matching_positions(|_| true, 100).len(), 10);
        assert_eq!(info.forceloadable_positions().len(), 5);
    }

    #[test]
    fn record_groups_positions_by_value() {
        let owner = PlayerId::from_u128(13);
        let mut info = PlayerClaimInfo::new(owner, 77);
        let overworld = DimensionId::overworld();
        info.on_claim(&overworld, &claim(owner, false), ChunkPos::new(2, 3));
        info.on_claim(&overworld, &claim(owner, false), ChunkPos::new(-2, 3));
        info.on_claim(&overworld, &claim(owner, true), ChunkPos::new(9, 9));
        let record = info.to_record();
        assert_eq!(record.last_active_ms, 77);
        let groups = &record.dimensions[DimensionId::OVERWORLD];
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].positions, vec![[-2, 3], [2, 3]]);
        assert!(groups[1].forceloadable);
    }
}

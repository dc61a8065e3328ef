use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::ids::PlayerId;

/// Sub-config index of an owner's main claim configuration.
pub const MAIN_SUB_CONFIG: i32 = -1;

/// The distinguishing fields of a claim value, without its wire index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimKey {
    pub owner: PlayerId,
    pub sub_config_index: i32,
    pub forceloadable: bool,
}

impl ClaimKey {
    pub fn new(owner: PlayerId, sub_config_index: i32, forceloadable: bool) -> Self {
        Self {
            owner,
            sub_config_index,
            forceloadable,
        }
    }

    pub fn main(owner: PlayerId) -> Self {
        Self::new(owner, MAIN_SUB_CONFIG, false)
    }

    pub fn with_forceloadable(self, forceloadable: bool) -> Self {
        Self {
            forceloadable,
            ..self
        }
    }

    /// Same owner and sub-config, force-load flag aside.
    pub fn is_same_claim_type(&self, other: &ClaimKey) -> bool {
        self.owner == other.owner && self.sub_config_index == other.sub_config_index
    }
}

/// Immutable claim value stored in region palettes.
///
/// Equality ignores `sync_index`: two values with the same owner, sub-config
/// and force-load flag are the same claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkClaim {
    pub owner: PlayerId,
    pub sub_config_index: i32,
    pub forceloadable: bool,
    pub sync_index: u32,
}

impl ChunkClaim {
    pub fn key(&self) -> ClaimKey {
        ClaimKey::new(self.owner, self.sub_config_index, self.forceloadable)
    }

    pub fn is_same_claim_type(&self, other: &ChunkClaim) -> bool {
        self.key().is_same_claim_type(&other.key())
    }
}

impl PartialEq for ChunkClaim {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ChunkClaim {}

impl Hash for ChunkClaim {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

#[derive(Debug, Clone)]
struct StateEntry {
    claim: ChunkClaim,
    regions: u32,
}

/// Interns claim values and hands out their sync indices.
///
/// Indices come from a counter and are never reused, so a client can never
/// confuse a removed state with a later one.
#[derive(Debug, Default, Clone)]
pub struct ClaimStateRegistry {
    states: HashMap<ClaimKey, StateEntry>,
    by_index: BTreeMap<u32, ClaimKey>,
    next_index: u32,
}

impl ClaimStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ClaimKey) -> Option<ChunkClaim> {
        self.states.get(key).map(|entry| entry.claim)
    }

    pub fn by_sync_index(&self, index: u32) -> Option<ChunkClaim> {
        self.by_index
            .get(&index)
            .and_then(|key| self.states.get(key))
            .map(|entry| entry.claim)
    }

    /// Returns the interned value and whether it was created by this call.
    pub fn get_or_create(&mut self, key: ClaimKey) -> (ChunkClaim, bool) {
        if let Some(entry) = self.states.get(&key) {
            return (entry.claim, false);
        }
        let claim = ChunkClaim {
            owner: key.owner,
            sub_config_index: key.sub_config_index,
            forceloadable: key.forceloadable,
            sync_index: self.next_index,
        };
        self.next_index += 1;
        self.states.insert(key, StateEntry { claim, regions: 0 });
        self.by_index.insert(claim.sync_index, key);
        (claim, true)
    }

    pub fn region_added(&mut self, claim: &ChunkClaim) {
        if let Some(entry) = self.states.get_mut(&claim.key()) {
            entry.regions += 1;
        }
    }

    /// Returns the state if it is no longer referenced by any region and
    /// was therefore removed.
    pub fn region_removed(&mut self, claim: &ChunkClaim) -> Option<ChunkClaim> {
        let key = claim.key();
        let entry = self.states.get_mut(&key)?;
        entry.regions = entry.regions.saturating_sub(1);
        if entry.regions > 0 {
            return None;
        }
        let removed = self.states.remove(&key)?;
        self.by_index.remove(&removed.claim.sync_index);
        Some(removed.claim)
    }

    pub fn region_count(&self, claim: &ChunkClaim) -> u32 {
        self.states
            .get(&claim.key())
            .map(|entry| entry.regions)
            .unwrap_or(0)
    }

    /// States in sync-index order.
    pub fn iter(&self) -> impl Iterator<Item = ChunkClaim> + '_ {
        self.by_index
            .values()
            .filter_map(|key| self.states.get(key))
            .map(|entry| entry.claim)
    }

    /// First state whose sync index is at least `index`.
    pub fn next_from(&self, index: u32) -> Option<ChunkClaim> {
        self.by_index
            .range(index..)
            .find_map(|(_, key)| self.states.get(key))
            .map(|entry| entry.claim)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_sync_index() {
        let owner = PlayerId::from_u128(7);
        let a = ChunkClaim {
            owner,
            sub_config_index: 2,
            forceloadable: false,
            sync_index: 1,
        };
        let b = ChunkClaim { sync_index: 40, ..a };
        let c = ChunkClaim {
            forceloadable: true,
            ..a
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_same_claim_type(&c));
        assert!(!a.key().is_same_claim_type(&ClaimKey::main(owner)));
    }

    #[test]
    fn sync_indices_are_never_reused() {
        let mut registry = ClaimStateRegistry::new();
        let key = ClaimKey::main(PlayerId::from_u128(1));
        let (first, created) = registry.get_or_create(key);
        assert!(created);
        registry.region_added(&first);
        assert_eq!(registry.get_or_create(key), (first, false));

        assert_eq!(registry.region_removed(&first), Some(first));
        assert!(registry.by_sync_index(first.sync_index).is_none());

        let (second, created) = registry.get_or_create(key);
        assert!(created);
        assert_ne!(second.sync_index, first.sync_index);
    }

    #[test]
    fn state_survives_while_any_region_references_it() {
        let mut registry = ClaimStateRegistry::new();
        let (claim, _) = registry.get_or_create(ClaimKey::main(PlayerId::SERVER));
        registry.region_added(&claim);
        registry.region_added(&claim);
        assert_eq!(registry.region_removed(&claim), None);
        assert_eq!(registry.region_count(&claim), 1);
        assert_eq!(registry.region_removed(&claim), Some(claim));
        assert!(registry.is_empty());
    }
}

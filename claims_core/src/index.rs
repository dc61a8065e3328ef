//! Sparse dimension -> region -> palette store lookup.

use std::collections::BTreeMap;

use crate::claim::ChunkClaim;
use crate::ids::{ChunkPos, DimensionId, RegionPos};
use crate::palette::{PaletteChange, PaletteRegionStore};

/// Regions of one dimension. A region exists only while it holds a claim.
#[derive(Debug, Default, Clone)]
pub struct DimensionClaims {
    regions: BTreeMap<RegionPos, PaletteRegionStore>,
}

impl DimensionClaims {
    pub fn get(&self, pos: ChunkPos) -> Option<ChunkClaim> {
        let (x, z) = pos.local();
        self.regions.get(&pos.region())?.get(x, z)
    }

    pub fn set(&mut self, pos: ChunkPos, value: Option<ChunkClaim>) -> PaletteChange {
        let region = pos.region();
        let (x, z) = pos.local();
        match value {
            Some(_) => self.regions.entry(region).or_default().set(x, z, value),
            None => {
                let Some(store) = self.regions.get_mut(&region) else {
                    return PaletteChange::default();
                };
                let change = store.set(x, z, None);
                if store.is_empty() {
                    self.regions.remove(&region);
                }
                change
            }
        }
    }

    pub fn region(&self, region: RegionPos) -> Option<&PaletteRegionStore> {
        self.regions.get(&region)
    }

    pub fn regions(&self) -> impl Iterator<Item = (RegionPos, &PaletteRegionStore)> {
        self.regions.iter().map(|(pos, store)| (*pos, store))
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ClaimsIndex {
    dimensions: BTreeMap<DimensionId, DimensionClaims>,
}

impl ClaimsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dimension: &DimensionId, pos: ChunkPos) -> Option<ChunkClaim> {
        self.dimensions.get(dimension)?.get(pos)
    }

    pub fn set(
        &mut self,
        dimension: &DimensionId,
        pos: ChunkPos,
        value: Option<ChunkClaim>,
    ) -> PaletteChange {
        if value.is_none() && !self.dimensions.contains_key(dimension) {
            return PaletteChange::default();
        }
        let claims = self.dimensions.entry(dimension.clone()).or_default();
        let change = claims.set(pos, value);
        if claims.is_empty() {
            self.dimensions.remove(dimension);
        }
        change
    }

    pub fn dimension(&self, dimension: &DimensionId) -> Option<&DimensionClaims> {
        self.dimensions.get(dimension)
    }

    pub fn region(&self, dimension: &DimensionId, region: RegionPos) -> Option<&PaletteRegionStore> {
        self.dimensions.get(dimension)?.region(region)
    }

    pub fn regions_of(
        &self,
        dimension: &DimensionId,
    ) -> impl Iterator<Item = (RegionPos, &PaletteRegionStore)> {
        self.dimensions
            .get(dimension)
            .into_iter()
            .flat_map(DimensionClaims::regions)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (&DimensionId, &DimensionClaims)> {
        self.dimensions.iter()
    }

    /// Every region key in dimension then region order.
    pub fn region_keys(&self) -> Vec<(DimensionId, RegionPos)> {
        self.dimensions
            .iter()
            .flat_map(|(dimension, claims)| {
                claims
                    .regions
                    .keys()
                    .map(move |region| (dimension.clone(), *region))
            })
            .collect()
    }

    pub fn region_count(&self) -> usize {
        self.dimensions.values().map(DimensionClaims::region_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PlayerId;

    fn claim() -> ChunkClaim {
        ChunkClaim {
            owner: PlayerId::from_u128(5),
            sub_config_index: -1,
            forceloadable: false,
            sync_index: 0,
        }
    }

    #[test]
    fn regions_are_created_and_destroyed_lazily() {
        let mut index = ClaimsIndex::new();
        let overworld = DimensionId::overworld();
        let pos = ChunkPos::new(-40, 70);
        assert_eq!(index.get(&overworld, pos), None);

        index.set(&overworld, pos, Some(claim()));
        assert_eq!(index.get(&overworld, pos), Some(claim()));
        assert_eq!(index.region_count(), 1);
        assert!(index.region(&overworld, RegionPos::new(-2, 2)).is_some());

        index.set(&overworld, pos, None);
        assert_eq!(index.region_count(), 0);
        assert!(index.dimension(&overworld).is_none());
    }

    #[test]
    fn unclaiming_missing_cells_is_a_no_op() {
        let mut index = ClaimsIndex::new();
        let change = index.set(&DimensionId::overworld(), ChunkPos::new(1, 1), None);
        assert_eq!(change, PaletteChange::default());
        assert_eq!(index.region_count(), 0);
    }

    #[test]
    fn region_keys_are_ordered() {
        let mut index = ClaimsIndex::new();
        let nether = DimensionId::new("minecraft:the_nether");
        let overworld = DimensionId::overworld();
        index.set(&overworld, ChunkPos::new(100, 0), Some(claim()));
        index.set(&overworld, ChunkPos::new(0, 0), Some(claim()));
        index.set(&nether, ChunkPos::new(0, 0), Some(claim()));
        assert_eq!(
            index.region_keys(),
            vec![
                (overworld.clone(), RegionPos::new(0, 0)),
                (overworld, RegionPos::new(3, 0)),
                (nether, RegionPos::new(0, 0)),
            ]
        );
    }
}

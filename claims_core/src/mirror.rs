//! Client-side replica rebuilt from clientbound packets.
//!
//! Used by clients and by tests to check that what the server streams is
//! enough to reproduce its claim index.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use claims_proto::{
    ClaimActionResultData, ClaimLimitsData, ClientboundPacket, RegionBulkData, ServerboundPacket,
};

use crate::claim::ChunkClaim;
use crate::ids::{ChunkPos, DimensionId, PlayerId, RegionPos};
use crate::palette::{PaletteError, PaletteRegionStore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MirrorError {
    #[error("packet references unknown claim state {0}")]
    UnknownState(u32),
    #[error("invalid region bulk for {dimension} [{region_x}, {region_z}]: {source}")]
    InvalidRegion {
        dimension: String,
        region_x: i32,
        region_z: i32,
        #[source]
        source: PaletteError,
    },
}

#[derive(Debug, Default)]
pub struct ClaimsMirror {
    states: HashMap<u32, ChunkClaim>,
    regions: BTreeMap<(DimensionId, RegionPos), PaletteRegionStore>,
    limits: Option<ClaimLimitsData>,
    last_result: Option<ClaimActionResultData>,
    sync_finished: bool,
}

impl ClaimsMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dimension: &DimensionId, pos: ChunkPos) -> Option<ChunkClaim> {
        let local = pos.local();
        self.regions
            .get(&(dimension.clone(), pos.region()))?
            .get(local.0, local.1)
    }

    pub fn state(&self, sync_index: u32) -> Option<ChunkClaim> {
        self.states.get(&sync_index).copied()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn limits(&self) -> Option<&ClaimLimitsData> {
        self.limits.as_ref()
    }

    pub fn last_result(&self) -> Option<&ClaimActionResultData> {
        self.last_result.as_ref()
    }

    pub fn sync_finished(&self) -> bool {
        self.sync_finished
    }

    /// Every claimed chunk, in dimension and region order.
    pub fn claimed(&self) -> Vec<(DimensionId, ChunkPos, ChunkClaim)> {
        let mut claimed = Vec::new();
        for ((dimension, region), store) in &self.regions {
            store.for_each_claimed(|x, z, claim| {
                claimed.push((dimension.clone(), region.chunk(x, z), claim));
            });
        }
        claimed
    }

    fn resolve(&self, sync_index: u32) -> Result<ChunkClaim, MirrorError> {
        self.state(sync_index)
            .ok_or(MirrorError::UnknownState(sync_index))
    }

    /// Applies one packet. Returns the reply the client owes, if any.
    pub fn apply(
        &mut self,
        packet: &ClientboundPacket,
    ) -> Result<Option<ServerboundPacket>, MirrorError> {
        match packet {
            ClientboundPacket::ClaimState(data) => {
                let claim = ChunkClaim {
                    owner: PlayerId(data.owner),
                    sub_config_index: data.sub_config_index,
                    forceloadable: data.forceloadable,
                    sync_index: data.sync_index,
                };
                self.states.insert(data.sync_index, claim);
            }
            ClientboundPacket::RemoveClaimState { sync_index } => {
                self.states.remove(sync_index);
            }
            ClientboundPacket::RegionBulk(data) => self.apply_bulk(data)?,
            ClientboundPacket::ChunkDelta(delta) => {
                let claim = delta
                    .sync_index
                    .map(|index| self.resolve(index))
                    .transpose()?;
                let dimension = DimensionId::new(delta.dimension.clone());
                let pos = ChunkPos::new(delta.x, delta.z);
                let key = (dimension, pos.region());
                let (x, z) = pos.local();
                let store = self.regions.entry(key.clone()).or_default();
                store.set(x, z, claim);
                if store.is_empty() {
                    self.regions.remove(&key);
                }
            }
            ClientboundPacket::ClaimLimits(limits) => self.limits = Some(limits.clone()),
            ClientboundPacket::ClaimActionResult(result) => self.last_result = Some(result.clone()),
            ClientboundPacket::ConfirmationRequest => {
                return Ok(Some(ServerboundPacket::LazyPacketConfirmation));
            }
            ClientboundPacket::SyncFinished => self.sync_finished = true,
        }
        Ok(None)
    }

    fn apply_bulk(&mut self, data: &RegionBulkData) -> Result<(), MirrorError> {
        let palette = data
            .palette
            .iter()
            .map(|slot| slot.map(|index| self.resolve(index)).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        let store = PaletteRegionStore::try_from_bulk(palette, data.bits, data.words.clone())
            .map_err(|source| MirrorError::InvalidRegion {
                dimension: data.dimension.clone(),
                region_x: data.region_x,
                region_z: data.region_z,
                source,
            })?;
        let key = (
            DimensionId::new(data.dimension.clone()),
            RegionPos::new(data.region_x, data.region_z),
        );
        if store.is_empty() {
            self.regions.remove(&key);
        } else {
            self.regions.insert(key, store);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims_proto::{ChunkDeltaData, ClaimStateData};
    use uuid::Uuid;

    fn state(sync_index: u32, owner: u128) -> ClientboundPacket {
        ClientboundPacket::ClaimState(ClaimStateData {
            sync_index,
            owner: Uuid::from_u128(owner),
            sub_config_index: -1,
            forceloadable: false,
        })
    }

    fn delta(x: i32, z: i32, sync_index: Option<u32>) -> ClientboundPacket {
        ClientboundPacket::ChunkDelta(ChunkDeltaData {
            dimension: DimensionId::OVERWORLD.to_string(),
            x,
            z,
            sync_index,
        })
    }

    #[test]
    fn deltas_need_known_states() {
        let mut mirror = ClaimsMirror::new();
        assert_eq!(mirror.apply(&delta(0, 0, Some(3))), Err(MirrorError::UnknownState(3)));

        mirror.apply(&state(3, 9)).expect("state");
        mirror.apply(&delta(-1, 40, Some(3))).expect("delta");
        let claim = mirror
            .get(&DimensionId::overworld(), ChunkPos::new(-1, 40))
            .expect("claimed");
        assert_eq!(claim.owner, PlayerId::from_u128(9));

        mirror.apply(&delta(-1, 40, None)).expect("unclaim");
        assert_eq!(mirror.region_count(), 0);
    }

    #[test]
    fn bulk_replaces_region_contents() {
        let mut mirror = ClaimsMirror::new();
        mirror.apply(&state(0, 1)).expect("state");
        let mut source = PaletteRegionStore::new();
        let claim = mirror.state(0).expect("known");
        source.set(4, 5, Some(claim));
        source.set(31, 31, Some(claim));
        let bulk = ClientboundPacket::RegionBulk(RegionBulkData {
            dimension: DimensionId::OVERWORLD.to_string(),
            region_x: 1,
            region_z: -1,
            palette: source.palette_sync_indices(),
            bits: source.bits(),
            words: source.words().to_vec(),
        });
        mirror.apply(&bulk).expect("bulk");
        assert_eq!(mirror.claimed().len(), 2);
        assert_eq!(
            mirror.get(&DimensionId::overworld(), ChunkPos::new(32 + 4, -32 + 5)),
            Some(claim)
        );
    }

    #[test]
    fn confirmation_request_gets_an_answer() {
        let mut mirror = ClaimsMirror::new();
        assert_eq!(
            mirror.apply(&ClientboundPacket::ConfirmationRequest),
            Ok(Some(ServerboundPacket::LazyPacketConfirmation))
        );
    }
}

//! Replication of claim state to connected players.
//!
//! A joining player gets a [`PlayerSyncTask`] that streams every claim state
//! and then every region through the lazy packet pipeline. Live changes
//! arrive as [`ClaimEvent`]s from the manager and become deltas for players
//! whose initial sync has progressed far enough to understand them.

use std::collections::VecDeque;

use bevy::prelude::Resource;
use crossbeam_channel::Receiver;
use tracing::{debug, info};

use claims_proto::{ChunkDeltaData, ClaimStateData, ClientboundPacket, RegionBulkData};

use crate::claim::ChunkClaim;
use crate::config::{ClaimsSyncMode, SpreadoutSettings};
use crate::ids::{DimensionId, PlayerId, RegionPos};
use crate::lazy_packets::LazyPacketSender;
use crate::manager::ClaimsManager;
use crate::palette::PaletteRegionStore;
use crate::tasks::{PlayerTaskContext, PlayerTaskHandler, SpreadoutTask};
use crate::tracker::ClaimEvent;

/// Whether `player` is shown claims owned by `owner` under `mode`.
pub fn is_visible(mode: ClaimsSyncMode, player: PlayerId, owner: PlayerId) -> bool {
    match mode {
        ClaimsSyncMode::All => true,
        ClaimsSyncMode::OwnedOnly => owner == player || owner == PlayerId::SERVER,
        ClaimsSyncMode::NotSynced => false,
    }
}

pub fn claim_state_packet(claim: &ChunkClaim) -> ClientboundPacket {
    ClientboundPacket::ClaimState(ClaimStateData {
        sync_index: claim.sync_index,
        owner: claim.owner.0,
        sub_config_index: claim.sub_config_index,
        forceloadable: claim.forceloadable,
    })
}

/// Bulk packet for one region as seen by `player`. A missing store is sent
/// as an empty region so the client clears it.
pub fn region_bulk_packet(
    dimension: &DimensionId,
    region: RegionPos,
    store: Option<&PaletteRegionStore>,
    mode: ClaimsSyncMode,
    player: PlayerId,
) -> ClientboundPacket {
    let visible = match (store, mode) {
        (Some(store), ClaimsSyncMode::All) => store.clone(),
        (Some(store), _) => store.filtered(|claim| is_visible(mode, player, claim.owner)),
        (None, _) => PaletteRegionStore::new(),
    };
    ClientboundPacket::RegionBulk(RegionBulkData {
        dimension: dimension.as_str().to_string(),
        region_x: region.x,
        region_z: region.z,
        palette: visible.palette_sync_indices(),
        bits: visible.bits(),
        words: visible.words().to_vec(),
    })
}

/// Tick-thread view handed to sync tasks.
pub struct SyncContext<'a> {
    pub manager: &'a ClaimsManager,
    pub sender: &'a mut LazyPacketSender,
    pub mode: ClaimsSyncMode,
    pub now_ms: u64,
}

impl PlayerTaskContext for SyncContext<'_> {
    fn is_clogged(&self, player: PlayerId) -> bool {
        self.sender.is_clogged(player, self.now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    States,
    Regions,
    Finished,
}

/// Initial sync for one player: claim states in sync-index order, then
/// region bulks, then a finish marker.
#[derive(Debug)]
pub struct PlayerSyncTask {
    player: PlayerId,
    phase: SyncPhase,
    state_cursor: u32,
    regions: VecDeque<(DimensionId, RegionPos)>,
}

impl PlayerSyncTask {
    pub fn new(player: PlayerId) -> Self {
        Self {
            player,
            phase: SyncPhase::States,
            state_cursor: 0,
            regions: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Sync indices below this have been sent.
    pub fn state_cursor(&self) -> u32 {
        self.state_cursor
    }

    fn sync_states(&mut self, ctx: &mut SyncContext<'_>, steps: &mut usize) {
        while *steps > 0 {
            let Some(claim) = ctx.manager.states().next_from(self.state_cursor) else {
                self.phase = SyncPhase::Regions;
                self.regions = ctx.manager.index().region_keys().into();
                return;
            };
            *steps -= 1;
            self.state_cursor = claim.sync_index + 1;
            if is_visible(ctx.mode, self.player, claim.owner) {
                ctx.sender
                    .enqueue_packet(self.player, &claim_state_packet(&claim));
            }
        }
    }

    fn sync_regions(&mut self, ctx: &mut SyncContext<'_>, steps: &mut usize) {
        while *steps > 0 {
            let Some((dimension, region)) = self.regions.pop_front() else {
                self.phase = SyncPhase::Finished;
                ctx.sender
                    .enqueue_packet(self.player, &ClientboundPacket::SyncFinished);
                debug!(target: "claims::sync", player = %self.player, "player_sync.finished");
                return;
            };
            *steps -= 1;
            // regions emptied since the snapshot are skipped; their removal
            // was never announced to this player
            let Some(store) = ctx.manager.index().region(&dimension, region) else {
                continue;
            };
            if ctx.mode == ClaimsSyncMode::OwnedOnly
                && !store
                    .claims()
                    .any(|claim| is_visible(ctx.mode, self.player, claim.owner))
            {
                continue;
            }
            let packet = region_bulk_packet(&dimension, region, Some(store), ctx.mode, self.player);
            ctx.sender.enqueue_packet(self.player, &packet);
        }
    }
}

impl SpreadoutTask<SyncContext<'_>> for PlayerSyncTask {
    fn should_work(&self, _ctx: &SyncContext<'_>) -> bool {
        self.phase != SyncPhase::Finished
    }

    fn should_drop(&self, ctx: &SyncContext<'_>) -> bool {
        ctx.sender.is_dropped(self.player)
    }

    fn on_tick(
        &mut self,
        ctx: &mut SyncContext<'_>,
        budget: usize,
        _follow_ups: &mut Vec<Self>,
    ) {
        let mut steps = budget;
        if self.phase == SyncPhase::States {
            self.sync_states(ctx, &mut steps);
        }
        if self.phase == SyncPhase::Regions {
            self.sync_regions(ctx, &mut steps);
        }
    }

    fn is_finished(&self) -> bool {
        self.phase == SyncPhase::Finished
    }
}

/// Turns claim events into packets and drives per-player initial sync.
#[derive(Resource)]
pub struct ClaimsSynchronizer {
    events: Receiver<ClaimEvent>,
    mode: ClaimsSyncMode,
    players: PlayerTaskHandler<PlayerSyncTask>,
}

impl ClaimsSynchronizer {
    pub fn new(events: Receiver<ClaimEvent>, mode: ClaimsSyncMode, settings: &SpreadoutSettings) -> Self {
        Self {
            events,
            mode,
            players: PlayerTaskHandler::new(settings.sync_per_tick, settings.sync_per_player),
        }
    }

    pub fn mode(&self) -> ClaimsSyncMode {
        self.mode
    }

    pub fn sync_phase(&self, player: PlayerId) -> Option<SyncPhase> {
        self.players.get(player).map(PlayerSyncTask::phase)
    }

    pub fn active_tasks(&self) -> usize {
        self.players
            .players()
            .filter(|player| self.sync_phase(*player) != Some(SyncPhase::Finished))
            .count()
    }

    pub fn start_syncing(&mut self, player: PlayerId, ctx: &mut SyncContext<'_>) {
        if self.mode == ClaimsSyncMode::NotSynced {
            return;
        }
        self.players.insert(player, PlayerSyncTask::new(player), ctx);
        debug!(target: "claims::sync", %player, "player_sync.started");
    }

    pub fn stop_syncing(&mut self, player: PlayerId) {
        self.players.remove(player);
    }

    /// The player's queue was dropped; nothing more is sent until reconnect.
    pub fn on_lazy_packets_dropped(&mut self, player: PlayerId) {
        if self.players.remove(player).is_some() {
            info!(target: "claims::sync", %player, "player_sync.cleared=packets_dropped");
        }
    }

    /// Converts pending claim events into packets for every syncing player.
    pub fn flush_events(&mut self, ctx: &mut SyncContext<'_>) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            handled += 1;
            if self.mode == ClaimsSyncMode::NotSynced {
                continue;
            }
            let players: Vec<(PlayerId, SyncPhase, u32)> = self
                .players
                .players()
                .filter_map(|player| {
                    self.players
                        .get(player)
                        .map(|task| (player, task.phase(), task.state_cursor()))
                })
                .collect();
            for (player, phase, cursor) in players {
                if let Some(packet) = self.packet_for(&event, ctx, player, phase, cursor) {
                    ctx.sender.enqueue_packet(player, &packet);
                }
            }
        }
        handled
    }

    fn packet_for(
        &self,
        event: &ClaimEvent,
        ctx: &SyncContext<'_>,
        player: PlayerId,
        phase: SyncPhase,
        state_cursor: u32,
    ) -> Option<ClientboundPacket> {
        let visible = |claim: &ChunkClaim| is_visible(self.mode, player, claim.owner);
        match event {
            // the player's own sync pass will pick these up from live data
            ClaimEvent::StateCreated(_)
            | ClaimEvent::ChunkChanged { .. }
            | ClaimEvent::RegionChanged { .. }
                if phase == SyncPhase::States =>
            {
                None
            }
            ClaimEvent::StateCreated(claim) => visible(claim).then(|| claim_state_packet(claim)),
            ClaimEvent::StateRemoved(claim) => {
                let sent = phase != SyncPhase::States || claim.sync_index < state_cursor;
                (sent && visible(claim)).then_some(ClientboundPacket::RemoveClaimState {
                    sync_index: claim.sync_index,
                })
            }
            ClaimEvent::ChunkChanged {
                dimension,
                pos,
                claim,
                previous,
            } => {
                let sync_index = match (claim, previous) {
                    (Some(claim), _) if visible(claim) => Some(claim.sync_index),
                    (_, Some(previous)) if visible(previous) => None,
                    _ => return None,
                };
                Some(ClientboundPacket::ChunkDelta(ChunkDeltaData {
                    dimension: dimension.as_str().to_string(),
                    x: pos.x,
                    z: pos.z,
                    sync_index,
                }))
            }
            ClaimEvent::RegionChanged { dimension, region } => Some(region_bulk_packet(
                dimension,
                *region,
                ctx.manager.index().region(dimension, *region),
                self.mode,
                player,
            )),
        }
    }

    pub fn on_tick(&mut self, ctx: &mut SyncContext<'_>) {
        self.players.on_tick(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims_proto::decode_clientbound;

    use crate::claim::ClaimKey;
    use crate::config::{ClaimsConfig, LazyPacketSettings};
    use crate::ids::ChunkPos;
    use crate::lazy_packets::PacketSink;
    use crate::tracker::ChannelListener;

    #[derive(Default)]
    struct Collect(Vec<(PlayerId, ClientboundPacket)>);

    impl PacketSink for Collect {
        fn send(&mut self, player: PlayerId, bytes: &[u8]) {
            self.0.push((player, decode_clientbound(bytes).expect("decodable")));
        }
    }

    struct Fixture {
        manager: ClaimsManager,
        sender: LazyPacketSender,
        sync: ClaimsSynchronizer,
    }

    impl Fixture {
        fn new(mode: ClaimsSyncMode) -> Self {
            let config = ClaimsConfig::default();
            let mut manager = ClaimsManager::new(&config);
            let (listener, events) = ChannelListener::channel();
            manager.register_listener(Box::new(listener));
            Self {
                manager,
                sender: LazyPacketSender::new(LazyPacketSettings::default()),
                sync: ClaimsSynchronizer::new(events, mode, &config.spreadout),
            }
        }

        fn join(&mut self, player: PlayerId) {
            self.sender.register(player);
            let mut ctx = SyncContext {
                manager: &self.manager,
                sender: &mut self.sender,
                mode: self.sync.mode(),
                now_ms: 0,
            };
            self.sync.start_syncing(player, &mut ctx);
        }

        fn tick(&mut self) -> Vec<(PlayerId, ClientboundPacket)> {
            let mut ctx = SyncContext {
                manager: &self.manager,
                sender: &mut self.sender,
                mode: self.sync.mode(),
                now_ms: 0,
            };
            self.sync.flush_events(&mut ctx);
            self.sync.on_tick(&mut ctx);
            let mut sink = Collect::default();
            self.sender.on_server_tick(0, &mut sink);
            sink.0
        }
    }

    fn overworld() -> DimensionId {
        DimensionId::overworld()
    }

    #[test]
    fn initial_sync_sends_states_regions_then_finish() {
        let mut fx = Fixture::new(ClaimsSyncMode::All);
        let owner = PlayerId::from_u128(1);
        fx.manager
            .set_claim(&overworld(), ChunkPos::new(0, 0), Some(ClaimKey::main(owner)));
        fx.manager
            .set_claim(&overworld(), ChunkPos::new(64, 0), Some(ClaimKey::main(owner)));
        let viewer = PlayerId::from_u128(2);
        fx.join(viewer);

        let packets = fx.tick();
        let kinds: Vec<&str> = packets.iter().map(|(_, packet)| packet.kind()).collect();
        assert_eq!(kinds, vec!["claim_state", "region_bulk", "region_bulk", "sync_finished"]);
        assert_eq!(fx.sync.sync_phase(viewer), Some(SyncPhase::Finished));
    }

    #[test]
    fn live_changes_become_deltas_after_sync() {
        let mut fx = Fixture::new(ClaimsSyncMode::All);
        let viewer = PlayerId::from_u128(2);
        fx.join(viewer);
        fx.tick();

        let owner = PlayerId::from_u128(1);
        fx.manager
            .set_claim(&overworld(), ChunkPos::new(5, 6), Some(ClaimKey::main(owner)));
        let packets = fx.tick();
        assert!(matches!(packets[0].1, ClientboundPacket::ClaimState(_)));
        assert!(matches!(
            &packets[1].1,
            ClientboundPacket::ChunkDelta(delta) if delta.x == 5 && delta.z == 6 && delta.sync_index == Some(0)
        ));

        fx.manager.set_claim(&overworld(), ChunkPos::new(5, 6), None);
        let packets = fx.tick();
        assert!(matches!(
            &packets[0].1,
            ClientboundPacket::ChunkDelta(delta) if delta.sync_index.is_none()
        ));
        assert!(matches!(
            packets[1].1,
            ClientboundPacket::RemoveClaimState { sync_index: 0 }
        ));
    }

    #[test]
    fn owned_only_hides_other_players_claims() {
        let mut fx = Fixture::new(ClaimsSyncMode::OwnedOnly);
        let alice = PlayerId::from_u128(1);
        let bob = PlayerId::from_u128(2);
        fx.join(alice);
        fx.tick();

        fx.manager
            .set_claim(&overworld(), ChunkPos::new(1, 1), Some(ClaimKey::main(bob)));
        assert!(fx.tick().is_empty());

        fx.manager
            .set_claim(&overworld(), ChunkPos::new(1, 1), Some(ClaimKey::main(alice)));
        let packets = fx.tick();
        assert_eq!(packets.len(), 2);

        // moving away from alice sends her a removal delta
        fx.manager
            .set_claim(&overworld(), ChunkPos::new(1, 1), Some(ClaimKey::main(bob)));
        let packets = fx.tick();
        assert!(packets.iter().any(|(_, packet)| matches!(
            packet,
            ClientboundPacket::ChunkDelta(delta) if delta.sync_index.is_none()
        )));
    }

    #[test]
    fn dropped_player_loses_sync_task() {
        let mut fx = Fixture::new(ClaimsSyncMode::All);
        let viewer = PlayerId::from_u128(3);
        fx.join(viewer);
        fx.sync.on_lazy_packets_dropped(viewer);
        assert_eq!(fx.sync.sync_phase(viewer), None);
    }
}

use bevy::{ecs::system::SystemParam, prelude::*};
use tracing::{error, info};

use claims_proto::ClientboundPacket;

use crate::config::ClaimsConfigHandle;
use crate::lazy_packets::LazyPacketSender;
use crate::manager::ClaimsManager;
use crate::metrics::ClaimsMetrics;
use crate::persistence::ClaimsPersistence;
use crate::requests::answer_claim_request;
use crate::resources::{
    ClaimRequestQueue, ConfirmationQueue, ConnectionEvent, ConnectionEvents, PacketOutbox,
    ServerTick,
};
use crate::sync::{ClaimsSynchronizer, SyncContext};
use crate::tasks::{ExpirationCheckTask, MaintenanceContext, MaintenanceTasks};

#[derive(SystemParam)]
pub struct ConnectionParams<'w> {
    pub config: Res<'w, ClaimsConfigHandle>,
    pub tick: Res<'w, ServerTick>,
    pub events: ResMut<'w, ConnectionEvents>,
    pub manager: ResMut<'w, ClaimsManager>,
    pub sender: ResMut<'w, LazyPacketSender>,
    pub synchronizer: ResMut<'w, ClaimsSynchronizer>,
    pub requests: ResMut<'w, ClaimRequestQueue>,
    pub outbox: ResMut<'w, PacketOutbox>,
}

#[derive(SystemParam)]
pub struct SyncParams<'w> {
    pub config: Res<'w, ClaimsConfigHandle>,
    pub tick: Res<'w, ServerTick>,
    pub manager: Res<'w, ClaimsManager>,
    pub sender: ResMut<'w, LazyPacketSender>,
    pub synchronizer: ResMut<'w, ClaimsSynchronizer>,
}

impl SyncParams<'_> {
    fn split(&mut self) -> (&mut ClaimsSynchronizer, SyncContext<'_>) {
        let now_ms = self.config.0.tick_to_millis(self.tick.0);
        let mode = self.synchronizer.mode();
        let ctx = SyncContext {
            manager: &self.manager,
            sender: &mut self.sender,
            mode,
            now_ms,
        };
        (&mut *self.synchronizer, ctx)
    }
}

/// Publishes the tick-derived clock to the manager.
pub fn update_clock(
    config: Res<ClaimsConfigHandle>,
    tick: Res<ServerTick>,
    mut manager: ResMut<ClaimsManager>,
) {
    manager.set_now(config.0.tick_to_millis(tick.0));
}

pub fn process_connection_events(mut params: ConnectionParams) {
    for event in params.events.drain() {
        match event {
            ConnectionEvent::Joined(player) => {
                params.manager.on_player_join(player);
                params.sender.register(player);
                let limits = params.manager.limits_packet(player);
                params
                    .outbox
                    .send_packet(player, &ClientboundPacket::ClaimLimits(limits));
                let mode = params.synchronizer.mode();
                let mut ctx = SyncContext {
                    manager: &params.manager,
                    sender: &mut params.sender,
                    mode,
                    now_ms: params.config.0.tick_to_millis(params.tick.0),
                };
                params.synchronizer.start_syncing(player, &mut ctx);
                info!(target: "claims::server", %player, tick = params.tick.0, "player.joined");
            }
            ConnectionEvent::Left(player) => {
                params.manager.on_player_leave(player);
                params.sender.clear_for_player(player);
                params.synchronizer.stop_syncing(player);
                params.requests.forget(player);
                info!(target: "claims::server", %player, tick = params.tick.0, "player.left");
            }
        }
    }
}

pub fn process_claim_requests(
    mut requests: ResMut<ClaimRequestQueue>,
    mut manager: ResMut<ClaimsManager>,
    mut outbox: ResMut<PacketOutbox>,
) {
    for request in requests.next_batch() {
        answer_claim_request(&mut manager, &mut outbox, &request);
    }
}

pub fn process_confirmations(
    mut confirmations: ResMut<ConfirmationQueue>,
    mut sender: ResMut<LazyPacketSender>,
) {
    for player in confirmations.drain() {
        sender.on_confirmation(player);
    }
}

/// Starts an expiration pass every check interval unless one is still running.
pub fn schedule_expiration_checks(
    config: Res<ClaimsConfigHandle>,
    tick: Res<ServerTick>,
    mut manager: ResMut<ClaimsManager>,
    mut tasks: ResMut<MaintenanceTasks>,
) {
    let expiration = &config.0.expiration;
    if !expiration.enabled {
        return;
    }
    let now_ms = config.0.tick_to_millis(tick.0);
    if !tasks.expiration_check_due(now_ms, expiration.check_interval_millis())
        || !tasks.expiration.is_empty()
    {
        return;
    }
    let candidates = manager.expiration_candidates();
    info!(
        target: "claims::tasks",
        candidates = candidates.len(),
        "expiration_check.queued"
    );
    let mut ctx = MaintenanceContext {
        manager: &mut manager,
        now_ms,
    };
    tasks.expiration.queue(
        ExpirationCheckTask::new(candidates, expiration.expiration_millis()),
        &mut ctx,
    );
}

pub fn run_spreadout_tasks(
    config: Res<ClaimsConfigHandle>,
    tick: Res<ServerTick>,
    mut manager: ResMut<ClaimsManager>,
    mut tasks: ResMut<MaintenanceTasks>,
) {
    let mut ctx = MaintenanceContext {
        manager: &mut manager,
        now_ms: config.0.tick_to_millis(tick.0),
    };
    tasks.on_tick(&mut ctx);
}

/// Turns claim change events raised this tick into packets.
pub fn flush_claim_changes(mut params: SyncParams) {
    let (synchronizer, mut ctx) = params.split();
    synchronizer.flush_events(&mut ctx);
}

pub fn run_player_sync(mut params: SyncParams) {
    let (synchronizer, mut ctx) = params.split();
    synchronizer.on_tick(&mut ctx);
}

pub fn send_lazy_packets(
    config: Res<ClaimsConfigHandle>,
    tick: Res<ServerTick>,
    mut sender: ResMut<LazyPacketSender>,
    mut synchronizer: ResMut<ClaimsSynchronizer>,
    mut outbox: ResMut<PacketOutbox>,
    mut metrics: ResMut<ClaimsMetrics>,
) {
    let now_ms = config.0.tick_to_millis(tick.0);
    let dropped = sender.on_server_tick(now_ms, &mut *outbox);
    for player in dropped {
        synchronizer.on_lazy_packets_dropped(player);
        metrics.dropped_players += 1;
    }
}

/// Hands dirty owner records to the I/O worker every save interval.
pub fn save_dirty_claims(
    tick: Res<ServerTick>,
    mut manager: ResMut<ClaimsManager>,
    persistence: Option<ResMut<ClaimsPersistence>>,
) {
    let Some(mut persistence) = persistence else {
        return;
    };
    for owner in persistence.collect() {
        manager.mark_dirty(owner);
    }
    if !persistence.save_due(tick.0) {
        return;
    }
    let records = manager.take_dirty_records();
    let owners: Vec<_> = records.iter().map(|record| record.owner).collect();
    if let Err(err) = persistence.submit(records) {
        error!(target: "claims::persistence", error = %err, "claims.save_failed");
        for owner in owners {
            manager.mark_dirty(owner);
        }
    }
}

pub fn advance_tick(mut tick: ResMut<ServerTick>) {
    tick.0 = tick.0.wrapping_add(1);
}

use bevy::prelude::*;

use crate::lazy_packets::LazyPacketSender;
use crate::manager::ClaimsManager;
use crate::persistence::ClaimsPersistence;
use crate::resources::ServerTick;
use crate::sync::ClaimsSynchronizer;
use crate::tasks::MaintenanceTasks;

#[derive(Resource, Default, Debug, Clone)]
pub struct ClaimsMetrics {
    pub tick: u64,
    pub regions: usize,
    pub claim_states: usize,
    pub owners: usize,
    pub online_players: usize,
    pub tickets_enabled: usize,
    pub bytes_queued: usize,
    pub replacement_tasks: usize,
    pub expiration_tasks: usize,
    pub sync_tasks: usize,
    pub dropped_players: u64,
    pub records_saved: usize,
    pub record_save_failures: usize,
}

pub fn collect_metrics(
    tick: Res<ServerTick>,
    manager: Res<ClaimsManager>,
    sender: Res<LazyPacketSender>,
    tasks: Res<MaintenanceTasks>,
    synchronizer: Res<ClaimsSynchronizer>,
    persistence: Option<Res<ClaimsPersistence>>,
    mut metrics: ResMut<ClaimsMetrics>,
) {
    metrics.tick = tick.0;
    metrics.regions = manager.index().region_count();
    metrics.claim_states = manager.states().len();
    metrics.owners = manager.owners().count();
    metrics.online_players = manager.online_players().count();
    metrics.tickets_enabled = manager.tickets().total_enabled();
    metrics.bytes_queued = sender.total_enqueued();
    metrics.replacement_tasks = tasks.replacements.len();
    metrics.expiration_tasks = tasks.expiration.len();
    metrics.sync_tasks = synchronizer.active_tasks();

    if let Some(persistence) = persistence {
        metrics.records_saved = persistence.saved_total();
        metrics.record_save_failures = persistence.failed_total();
    }
}

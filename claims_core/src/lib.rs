//! Chunk-claim storage and replication engine.
//!
//! Claims live in paletted per-region stores indexed by dimension. The
//! [`ClaimsManager`] validates player actions against them, keeps per-owner
//! bookkeeping and forceload tickets in step, and raises change events that
//! the [`ClaimsSynchronizer`] turns into packets for the
//! [`LazyPacketSender`]. Long-running work (initial sync, claim
//! replacement, expiration) is spread over ticks.
//!
//! Everything is driven by a headless Bevy [`App`] built with
//! [`build_claims_app`]; call [`run_tick`] once per server tick.

pub mod claim;
pub mod config;
pub mod ids;
pub mod index;
pub mod lazy_packets;
pub mod limits;
pub mod manager;
pub mod metrics;
pub mod mirror;
pub mod network;
pub mod outcome;
pub mod owner;
pub mod palette;
pub mod persistence;
pub mod requests;
pub mod resources;
pub mod sync;
pub mod systems;
pub mod tasks;
pub mod tickets;
pub mod tracker;

use std::sync::Arc;

use bevy::prelude::*;

pub use claim::{ChunkClaim, ClaimKey, ClaimStateRegistry, MAIN_SUB_CONFIG};
pub use config::{
    load_claims_config_from_env, ClaimsConfig, ClaimsConfigHandle, ClaimsConfigMetadata,
    ClaimsSyncMode,
};
pub use ids::{ChunkPos, DimensionId, PlayerId, RegionPos};
pub use index::ClaimsIndex;
pub use lazy_packets::{LazyPacketSender, PacketSink};
pub use manager::{ClaimActor, ClaimsManager};
pub use metrics::ClaimsMetrics;
pub use mirror::{ClaimsMirror, MirrorError};
pub use outcome::{AreaClaimResult, ClaimOutcome, OutcomeSet};
pub use palette::PaletteRegionStore;
pub use persistence::{
    ClaimsBackend, ClaimsPersistence, IoWorker, JsonDirectoryBackend, LoadSummary, MemoryBackend,
    PersistenceError,
};
pub use resources::{
    receive_serverbound, ClaimRequest, ClaimRequestQueue, ConfirmationQueue, ConnectionEvents,
    PacketOutbox, PlayerLocation, ServerTick,
};
pub use sync::{ClaimsSynchronizer, SyncPhase};
pub use tasks::MaintenanceTasks;
pub use tracker::{ChannelListener, ClaimEvent, ClaimsListener};

/// Construct a Bevy [`App`] running the claims tick pipeline without storage.
pub fn build_claims_app(config: Arc<ClaimsConfig>) -> App {
    let mut app = App::new();

    let (listener, events) = ChannelListener::channel();
    let mut manager = ClaimsManager::new(&config);
    manager.register_listener(Box::new(listener));
    let synchronizer = ClaimsSynchronizer::new(
        events,
        config.general.claims_synchronization,
        &config.spreadout,
    );

    app.insert_resource(ClaimsConfigHandle::new(Arc::clone(&config)))
        .insert_resource(ServerTick::default())
        .insert_resource(manager)
        .insert_resource(LazyPacketSender::new(config.lazy_packets.clone()))
        .insert_resource(synchronizer)
        .insert_resource(MaintenanceTasks::new(&config.spreadout))
        .insert_resource(ConnectionEvents::default())
        .insert_resource(ClaimRequestQueue::default())
        .insert_resource(ConfirmationQueue::default())
        .insert_resource(PacketOutbox::default())
        .insert_resource(ClaimsMetrics::default())
        .add_plugins(MinimalPlugins)
        .add_systems(
            Update,
            (
                systems::update_clock,
                systems::process_connection_events,
                systems::process_claim_requests,
                systems::process_confirmations,
                systems::schedule_expiration_checks,
                systems::run_spreadout_tasks,
                systems::flush_claim_changes,
                systems::run_player_sync,
                systems::send_lazy_packets,
                systems::save_dirty_claims,
                metrics::collect_metrics,
                systems::advance_tick,
            )
                .chain(),
        );

    app
}

/// Like [`build_claims_app`], but loads stored claims from `backend` first
/// and saves dirty owners back to it on a background worker.
pub fn build_claims_app_with_backend(
    config: Arc<ClaimsConfig>,
    backend: Box<dyn ClaimsBackend>,
) -> Result<App, PersistenceError> {
    let mut app = build_claims_app(Arc::clone(&config));
    {
        let mut manager = app.world.resource_mut::<ClaimsManager>();
        persistence::load_all(backend.as_ref(), &mut manager)?;
    }
    app.insert_resource(ClaimsPersistence::new(
        IoWorker::spawn(backend),
        config.persistence.save_interval_ticks,
    ));
    Ok(app)
}

/// Execute a single server tick.
///
/// Runs the chained systems configured in [`build_claims_app`]: connection
/// events, claim requests, confirmations, maintenance tasks, change flush,
/// player sync, lazy packet sending, saving, metrics and tick increment.
/// Callers deliver the frames left in [`PacketOutbox`].
pub fn run_tick(app: &mut App) {
    app.update();
}

/// Saves every dirty owner and stops the storage worker, if one is running.
pub fn shutdown_claims_app(app: &mut App) -> Result<(), PersistenceError> {
    let Some(mut persistence) = app.world.remove_resource::<ClaimsPersistence>() else {
        return Ok(());
    };
    let mut manager = app.world.resource_mut::<ClaimsManager>();
    persistence.flush(&mut manager)
}

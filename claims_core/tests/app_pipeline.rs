use std::collections::BTreeMap;
use std::sync::Arc;

use bevy::prelude::{App, Mut};
use claims_core::{
    build_claims_app, receive_serverbound, run_tick, ChunkPos, ClaimRequest, ClaimRequestQueue,
    ClaimsConfig, ClaimsManager, ClaimsMetrics, ClaimsMirror, ClaimsSyncMode, ClaimsSynchronizer,
    ConfirmationQueue, ConnectionEvents, DimensionId, LazyPacketSender, PacketOutbox, PlayerId,
    PlayerLocation,
};
use claims_proto::{decode_clientbound, ClaimAction};

/// Host stand-in: delivers outbox frames to per-player mirrors and routes
/// their replies back into the app.
struct Harness {
    app: App,
    mirrors: BTreeMap<PlayerId, ClaimsMirror>,
    silent: Vec<PlayerId>,
}

impl Harness {
    fn new(config: ClaimsConfig) -> Self {
        Self {
            app: build_claims_app(Arc::new(config)),
            mirrors: BTreeMap::new(),
            silent: Vec::new(),
        }
    }

    fn join(&mut self, player: PlayerId) {
        self.mirrors.insert(player, ClaimsMirror::new());
        self.app.world.resource_mut::<ConnectionEvents>().join(player);
    }

    fn leave(&mut self, player: PlayerId) {
        self.mirrors.remove(&player);
        self.app.world.resource_mut::<ConnectionEvents>().leave(player);
    }

    fn request(&mut self, player: PlayerId, action: ClaimAction, area: (i32, i32, i32, i32)) {
        let (left, top, right, bottom) = area;
        self.app
            .world
            .resource_mut::<ClaimRequestQueue>()
            .push(ClaimRequest {
                left,
                top,
                right,
                bottom,
                ..ClaimRequest::single(player, origin(), action, ChunkPos::new(left, top))
            });
    }

    fn tick(&mut self, ticks: usize) {
        for _ in 0..ticks {
            run_tick(&mut self.app);
            let frames = self.app.world.resource_mut::<PacketOutbox>().drain();
            for (player, frame) in frames {
                let Some(mirror) = self.mirrors.get_mut(&player) else {
                    continue;
                };
                let packet = decode_clientbound(&frame).expect("clientbound frame decodes");
                let reply = mirror.apply(&packet).expect("mirror accepts packet");
                let Some(reply) = reply else {
                    continue;
                };
                if self.silent.contains(&player) {
                    continue;
                }
                self.app
                    .world
                    .resource_scope(|world, mut requests: Mut<ClaimRequestQueue>| {
                        let mut confirmations = world.resource_mut::<ConfirmationQueue>();
                        receive_serverbound(
                            &mut requests,
                            &mut confirmations,
                            player,
                            origin(),
                            reply,
                        );
                    });
            }
        }
    }

    fn server_claim(&self, pos: ChunkPos) -> Option<PlayerId> {
        self.app
            .world
            .resource::<ClaimsManager>()
            .get(&DimensionId::overworld(), pos)
            .map(|claim| claim.owner)
    }

    fn mirror_claim(&self, player: PlayerId, pos: ChunkPos) -> Option<PlayerId> {
        self.mirrors[&player]
            .get(&DimensionId::overworld(), pos)
            .map(|claim| claim.owner)
    }
}

fn origin() -> PlayerLocation {
    PlayerLocation::new(DimensionId::overworld(), ChunkPos::new(0, 0))
}

fn cells(radius: i32) -> impl Iterator<Item = ChunkPos> {
    (-radius..=radius).flat_map(move |x| (-radius..=radius).map(move |z| ChunkPos::new(x, z)))
}

#[test]
fn late_joiner_converges_with_server() {
    let alice = PlayerId::from_u128(1);
    let bob = PlayerId::from_u128(2);
    let mut harness = Harness::new(ClaimsConfig::default());

    harness.join(alice);
    harness.request(alice, ClaimAction::Claim, (-1, -1, 1, 1));
    harness.tick(5);
    harness.join(bob);
    harness.tick(20);

    for pos in cells(3) {
        let expected = harness.server_claim(pos);
        assert_eq!(harness.mirror_claim(alice, pos), expected, "alice at {pos}");
        assert_eq!(harness.mirror_claim(bob, pos), expected, "bob at {pos}");
    }
    assert_eq!(harness.server_claim(ChunkPos::new(0, 0)), Some(alice));
    assert!(harness.mirrors[&bob].sync_finished());

    let limits = harness.mirrors[&alice].limits().expect("limits sent");
    assert_eq!(limits.loading_claim_count, 9);
}

#[test]
fn unclaims_reach_every_mirror() {
    let alice = PlayerId::from_u128(1);
    let bob = PlayerId::from_u128(2);
    let mut harness = Harness::new(ClaimsConfig::default());

    harness.join(alice);
    harness.join(bob);
    harness.request(alice, ClaimAction::Claim, (0, 0, 1, 0));
    harness.tick(5);
    assert_eq!(harness.mirror_claim(bob, ChunkPos::new(1, 0)), Some(alice));

    harness.request(alice, ClaimAction::Unclaim, (0, 0, 1, 0));
    harness.tick(5);
    for player in [alice, bob] {
        assert_eq!(harness.mirror_claim(player, ChunkPos::new(0, 0)), None);
        assert_eq!(harness.mirror_claim(player, ChunkPos::new(1, 0)), None);
        assert_eq!(harness.mirrors[&player].region_count(), 0);
    }
}

#[test]
fn owned_only_mode_hides_other_players() {
    let alice = PlayerId::from_u128(1);
    let bob = PlayerId::from_u128(2);
    let mut config = ClaimsConfig::default();
    config.general.claims_synchronization = ClaimsSyncMode::OwnedOnly;
    let mut harness = Harness::new(config);

    harness.join(alice);
    harness.join(bob);
    harness.request(alice, ClaimAction::Claim, (0, 0, 0, 0));
    harness.request(bob, ClaimAction::Claim, (1, 1, 1, 1));
    harness.tick(5);

    assert_eq!(harness.mirror_claim(alice, ChunkPos::new(0, 0)), Some(alice));
    assert_eq!(harness.mirror_claim(alice, ChunkPos::new(1, 1)), None);
    assert_eq!(harness.mirror_claim(bob, ChunkPos::new(1, 1)), Some(bob));
    assert_eq!(harness.mirror_claim(bob, ChunkPos::new(0, 0)), None);
}

#[test]
fn idle_owners_expire_over_ticks() {
    let alice = PlayerId::from_u128(1);
    let mut config = ClaimsConfig::default();
    // one hour per tick
    config.general.tick_millis = 60 * 60 * 1000;
    config.expiration.expiration_hours = 2;
    config.expiration.check_interval_minutes = 60;
    let mut harness = Harness::new(config);

    harness.join(alice);
    harness.request(alice, ClaimAction::Claim, (0, 0, 1, 0));
    harness.tick(1);
    harness.leave(alice);
    harness.tick(2);
    assert_eq!(harness.server_claim(ChunkPos::new(0, 0)), Some(alice));

    harness.tick(6);
    assert_eq!(harness.server_claim(ChunkPos::new(0, 0)), Some(PlayerId::EXPIRED));
    assert_eq!(harness.server_claim(ChunkPos::new(1, 0)), Some(PlayerId::EXPIRED));
    let manager = harness.app.world.resource::<ClaimsManager>();
    assert_eq!(manager.owner(alice).map(|info| info.claim_count()), Some(0));
    assert!(!manager.replacement_in_progress(alice));
}

#[test]
fn silent_players_are_dropped_after_timeout() {
    let alice = PlayerId::from_u128(1);
    let bob = PlayerId::from_u128(2);
    let mut config = ClaimsConfig::default();
    config.lazy_packets.bytes_per_confirmation = 64;
    config.lazy_packets.confirmation_timeout_ms = 500;
    let mut harness = Harness::new(config);
    harness.silent.push(bob);

    harness.join(alice);
    harness.request(alice, ClaimAction::Claim, (-2, -2, 2, 2));
    harness.tick(3);
    harness.join(bob);
    harness.tick(30);

    let sender = harness.app.world.resource::<LazyPacketSender>();
    assert!(sender.is_dropped(bob));
    assert!(!sender.is_dropped(alice));
    assert_eq!(harness.app.world.resource::<ClaimsMetrics>().dropped_players, 1);
    assert_eq!(
        harness.app.world.resource::<ClaimsSynchronizer>().sync_phase(bob),
        None
    );

    // alice keeps confirming and keeps receiving updates
    harness.request(alice, ClaimAction::Unclaim, (0, 0, 0, 0));
    harness.tick(5);
    assert_eq!(harness.mirror_claim(alice, ChunkPos::new(0, 0)), None);
    assert_eq!(harness.mirror_claim(alice, ChunkPos::new(1, 1)), Some(alice));
}

mod common;

use bevy::app::App;
use claims_core::{
    build_claims_app, run_tick, ChunkPos, ClaimRequest, ClaimRequestQueue, ClaimsManager,
    ConnectionEvents, DimensionId, PacketOutbox, PlayerId, PlayerLocation,
};
use claims_proto::ClaimAction;

fn scripted_session(app: &mut App) -> Vec<Vec<(PlayerId, Vec<u8>)>> {
    let players: Vec<PlayerId> = (1..=4).map(PlayerId::from_u128).collect();
    let mut frames_per_tick = Vec::new();
    for tick in 0..40i32 {
        if tick < 4 {
            app.world
                .resource_mut::<ConnectionEvents>()
                .join(players[tick as usize]);
        }
        if tick % 3 == 0 {
            let player = players[(tick as usize / 3) % players.len()];
            let center = ChunkPos::new((tick % 7) * 3, (tick % 5) * 3);
            let action = if tick % 9 == 0 {
                ClaimAction::Unclaim
            } else {
                ClaimAction::Claim
            };
            app.world.resource_mut::<ClaimRequestQueue>().push(ClaimRequest {
                left: center.x - 1,
                top: center.z - 1,
                right: center.x + 1,
                bottom: center.z + 1,
                ..ClaimRequest::single(
                    player,
                    PlayerLocation::new(DimensionId::overworld(), center),
                    action,
                    center,
                )
            });
        }
        if tick == 30 {
            app.world.resource_mut::<ConnectionEvents>().leave(players[1]);
        }
        run_tick(app);
        frames_per_tick.push(app.world.resource_mut::<PacketOutbox>().drain());
    }
    frames_per_tick
}

#[test]
fn identical_sessions_produce_identical_output() {
    let config = common::test_config();
    let mut first = build_claims_app(config.clone());
    let mut second = build_claims_app(config);

    let first_frames = scripted_session(&mut first);
    let second_frames = scripted_session(&mut second);
    assert_eq!(first_frames, second_frames);
    assert!(first_frames.iter().any(|frames| !frames.is_empty()));

    let first_records = first.world.resource::<ClaimsManager>().all_records();
    let second_records = second.world.resource::<ClaimsManager>().all_records();
    assert!(!first_records.is_empty());
    assert_eq!(first_records, second_records);
}

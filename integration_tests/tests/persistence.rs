mod common;

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use claims_core::{
    build_claims_app_with_backend, run_tick, shutdown_claims_app, ChunkPos, ClaimRequest,
    ClaimRequestQueue, ClaimsManager, ClaimsMetrics, DimensionId, JsonDirectoryBackend,
    MemoryBackend, PersistenceError, PlayerId, PlayerLocation, ServerTick,
};
use claims_proto::ClaimAction;

fn claim_square(player: PlayerId, center: ChunkPos, radius: i32) -> ClaimRequest {
    ClaimRequest {
        left: center.x - radius,
        top: center.z - radius,
        right: center.x + radius,
        bottom: center.z + radius,
        ..ClaimRequest::single(
            player,
            PlayerLocation::new(DimensionId::overworld(), center),
            ClaimAction::Claim,
            center,
        )
    }
}

#[test]
fn claims_survive_a_restart() -> anyhow::Result<()> {
    let config = common::test_config();
    let dir = common::scratch_dir("restart");
    let alice = PlayerId::from_u128(0xa11ce);
    let bob = PlayerId::from_u128(0xb0b);

    let mut app =
        build_claims_app_with_backend(config.clone(), Box::new(JsonDirectoryBackend::new(&dir)))?;
    {
        let mut requests = app.world.resource_mut::<ClaimRequestQueue>();
        requests.push(claim_square(alice, ChunkPos::new(0, 0), 2));
        requests.push(claim_square(bob, ChunkPos::new(40, 40), 1));
    }
    for _ in 0..8 {
        run_tick(&mut app);
    }
    let expected = app.world.resource::<ClaimsManager>().all_records();
    shutdown_claims_app(&mut app)?;
    drop(app);
    assert!(dir.join(format!("{}.json", alice.0)).exists());

    let reloaded =
        build_claims_app_with_backend(config, Box::new(JsonDirectoryBackend::new(&dir)))?;
    let manager = reloaded.world.resource::<ClaimsManager>();
    let overworld = DimensionId::overworld();
    assert_eq!(manager.owner(alice).map(|info| info.claim_count()), Some(25));
    assert_eq!(manager.owner(bob).map(|info| info.claim_count()), Some(9));
    assert_eq!(
        manager.get(&overworld, ChunkPos::new(41, 39)).map(|claim| claim.owner),
        Some(bob)
    );
    assert_eq!(manager.all_records(), expected);

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn dirty_owners_are_saved_on_the_interval() -> anyhow::Result<()> {
    let config = common::test_config();
    let backend = MemoryBackend::new();
    let alice = PlayerId::from_u128(7);

    let mut app = build_claims_app_with_backend(config, Box::new(backend.clone()))?;
    app.world
        .resource_mut::<ClaimRequestQueue>()
        .push(claim_square(alice, ChunkPos::new(3, 3), 0));
    run_tick(&mut app);
    assert!(backend.raw(alice).is_none());

    // the worker writes asynchronously; keep ticking until the report comes back
    let deadline = Instant::now() + Duration::from_secs(5);
    while app.world.resource::<ClaimsMetrics>().records_saved == 0 {
        assert!(Instant::now() < deadline, "save report never arrived");
        run_tick(&mut app);
        thread::sleep(Duration::from_millis(5));
    }
    assert!(app.world.resource::<ServerTick>().0 > 5);

    let raw = backend.raw(alice).expect("record saved");
    let record: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(
        record["dimensions"]["minecraft:overworld"][0]["positions"],
        serde_json::json!([[3, 3]])
    );
    assert_eq!(app.world.resource::<ClaimsMetrics>().records_saved, 1);
    Ok(())
}

#[test]
fn corrupt_server_record_aborts_startup() {
    let config = common::test_config();
    let backend = MemoryBackend::new();
    backend.insert_raw(PlayerId::SERVER, "{ not json");

    let err = build_claims_app_with_backend(config, Box::new(backend))
        .err()
        .expect("startup should fail");
    assert!(matches!(
        err,
        PersistenceError::CorruptGlobal { owner, .. } if owner == PlayerId::SERVER
    ));
}

#[test]
fn corrupt_player_record_is_skipped() -> anyhow::Result<()> {
    let config = common::test_config();
    let backend = MemoryBackend::new();
    let broken = PlayerId::from_u128(1);
    let intact = PlayerId::from_u128(2);
    backend.insert_raw(broken, "{ \"owner\": ");
    backend.insert_raw(
        intact,
        format!(
            r#"{{ "owner": "{}", "dimensions": {{ "minecraft:overworld": [ {{ "positions": [[5, 5], [6, 5]] }} ] }} }}"#,
            intact.0
        ),
    );

    let app = build_claims_app_with_backend(config, Box::new(backend))?;
    let manager = app.world.resource::<ClaimsManager>();
    assert!(manager.owner(broken).is_none());
    assert_eq!(manager.owner(intact).map(|info| info.claim_count()), Some(2));
    Ok(())
}

mod common;

use claims_core::{build_claims_app, run_tick, ClaimsConfigHandle, ClaimsMetrics, ServerTick};

#[test]
fn app_initializes() {
    let config = common::test_config();
    let mut app = build_claims_app(config);
    run_tick(&mut app);
    run_tick(&mut app);

    assert_eq!(app.world.resource::<ServerTick>().0, 2);
    let metrics = app.world.resource::<ClaimsMetrics>();
    assert_eq!(metrics.tick, 1);
    assert_eq!(metrics.regions, 0);
    assert_eq!(metrics.bytes_queued, 0);
}

#[test]
fn fixture_config_is_applied() {
    let config = common::test_config();
    let app = build_claims_app(config);
    let handle = app.world.resource::<ClaimsConfigHandle>();
    assert_eq!(handle.0.general.max_player_claims, 40);
    assert_eq!(handle.0.persistence.save_interval_ticks, 5);
    assert!(!handle.0.expiration.enabled);
}

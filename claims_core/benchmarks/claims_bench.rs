use claims_core::palette::REGION_SIDE;
use claims_core::{
    ChunkPos, ClaimActor, ClaimKey, ClaimStateRegistry, ClaimsConfig, ClaimsManager, DimensionId,
    PaletteRegionStore, PlayerId,
};
use claims_proto::ClaimAction;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn bench_palette_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("palette_churn");

    for owners in [1u128, 8, 64, 512] {
        let mut states = ClaimStateRegistry::new();
        let claims: Vec<_> = (0..owners)
            .map(|owner| states.get_or_create(ClaimKey::main(PlayerId::from_u128(owner + 1))).0)
            .collect();

        group.bench_with_input(BenchmarkId::new("owners", owners), &claims, |b, claims| {
            b.iter_batched(
                || (PaletteRegionStore::new(), SmallRng::seed_from_u64(7)),
                |(mut store, mut rng)| {
                    for _ in 0..4096 {
                        let x = rng.gen_range(0..REGION_SIDE);
                        let z = rng.gen_range(0..REGION_SIDE);
                        let value = if rng.gen_bool(0.2) {
                            None
                        } else {
                            Some(claims[rng.gen_range(0..claims.len())])
                        };
                        store.set(x, z, value);
                    }
                    store
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_area_claims(c: &mut Criterion) {
    let mut group = c.benchmark_group("area_claims");

    for radius in [1i32, 2, 5] {
        group.bench_with_input(BenchmarkId::new("radius", radius), &radius, |b, &radius| {
            b.iter_batched(
                || ClaimsManager::new(&ClaimsConfig::default()),
                |mut manager| {
                    let dimension = DimensionId::overworld();
                    for owner in 0..16u128 {
                        let origin = ChunkPos::new(owner as i32 * 16, 0);
                        let actor = ClaimActor::player(PlayerId::from_u128(owner + 1), origin);
                        manager.try_claim_action_over_area(
                            &dimension,
                            &actor,
                            (origin.x - radius, origin.z - radius, origin.x + radius, origin.z + radius),
                            ClaimAction::Claim,
                        );
                    }
                    manager
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(claims_benches, bench_palette_churn, bench_area_claims);
criterion_main!(claims_benches);

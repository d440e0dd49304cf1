use cellscape_core::{
    CatalogBuilder, CellDefinition, CellTypeId, MeshSpec, Simulation, SimulationConfig,
    StandardModels, UniformField,
};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use glam::DVec3;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(fallback)
}

fn build_simulation(cells: usize) -> Simulation {
    let mut builder = CatalogBuilder::new();
    let models = StandardModels::register(&mut builder).expect("models");
    let mut definition = CellDefinition::new("tumor", models.ki67_advanced);
    definition.phenotype.death.add_model(models.apoptosis, 5.31667e-05);
    definition.phenotype.death.add_model(models.necrosis, 0.0);
    builder.define(definition);
    let catalog = builder.build(0).expect("catalog");

    // Packed lattice so every cell has a full set of neighbors
    let spacing = 15.0;
    let side = (cells as f64).cbrt().ceil() as usize;
    let half = side as f64 * spacing * 0.5 + 50.0;
    let config = SimulationConfig {
        domain: MeshSpec::cube(half, 30.0),
        dt: 0.1,
        rng_seed: Some(0xBEEF),
        history_capacity: 1,
        ..SimulationConfig::default()
    };
    let mut sim = Simulation::new(config, catalog, UniformField::default()).expect("simulation");
    let offset = (side as f64 - 1.0) * spacing * 0.5;
    for i in 0..cells {
        let (x, y, z) = (i % side, (i / side) % side, i / (side * side));
        let position = DVec3::new(x as f64, y as f64, z as f64) * spacing - DVec3::splat(offset);
        sim.spawn(CellTypeId(0), position).expect("spawn");
    }
    sim
}

fn bench_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("cellscape_step");
    let samples: usize = env_or("CELLSCAPE_BENCH_SAMPLES", 20).max(10);
    let warm: u64 = env_or("CELLSCAPE_BENCH_WARMUP_SECS", 2);
    let measure: u64 = env_or("CELLSCAPE_BENCH_MEASURE_SECS", 10);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));
    // Steps per bench iteration (can override via CELLSCAPE_BENCH_STEPS)
    let steps: usize = env_or("CELLSCAPE_BENCH_STEPS", 10).max(1);
    let cell_counts: Vec<usize> = std::env::var("CELLSCAPE_BENCH_CELLS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![1000_usize, 8000, 27000]);
    for &cells in &cell_counts {
        group.bench_function(format!("steps{steps}_cells{cells}"), |b| {
            b.iter_batched(
                || build_simulation(cells),
                |mut sim| {
                    for _ in 0..steps {
                        sim.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_steps);
criterion_main!(benches);

use anyhow::{Context, Result};
use cellscape_core::{
    CatalogBuilder, CellDefinition, Membrane, MeshSpec, Simulation, SimulationConfig,
    StandardModels, UniformField, random_unit_vector,
};
use rand::Rng;
use tracing::{info, warn};

fn main() -> Result<()> {
    init_tracing();
    let cells: usize = env_or("CELLSCAPE_CELLS", 200)?;
    let steps: usize = env_or("CELLSCAPE_STEPS", 600)?;
    let report_every: usize = env_or("CELLSCAPE_REPORT_EVERY", 60)?.max(1);

    let mut sim = bootstrap(cells)?;
    info!(seed = sim.seed(), cells, steps, "Starting cellscape spheroid run");

    for step in 1..=steps {
        let events = sim.step();
        if events.out_of_domain > 0 {
            warn!(tick = events.tick.0, count = events.out_of_domain, "cells escaped the domain");
        }
        if step % report_every == 0 {
            report(&sim);
        }
    }
    report(&sim);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must parse, got `{raw}`")),
        Err(_) => Ok(fallback),
    }
}

fn bootstrap(cells: usize) -> Result<Simulation> {
    let mut builder = CatalogBuilder::new();
    let models = StandardModels::register(&mut builder)?;
    let mut definition = CellDefinition::new("tumor", models.ki67_advanced);
    definition.phenotype.death.add_model(models.apoptosis, 5.31667e-05);
    definition.phenotype.death.add_model(models.necrosis, 0.0);
    builder.define(definition);
    let catalog = builder.build(0)?;

    let seed = std::env::var("CELLSCAPE_SEED")
        .ok()
        .and_then(|raw| raw.parse().ok());
    let config = SimulationConfig {
        domain: MeshSpec::cube(400.0, 30.0),
        dt: 0.1,
        rng_seed: seed,
        membrane: Membrane::DomainWalls,
        history_capacity: 600,
        ..SimulationConfig::default()
    };
    let mut sim = Simulation::new(config, catalog, UniformField::default())?;
    let tumor = sim.catalog().find_type("tumor")?;

    // Loose ball of cells roughly one diameter apart
    let radius = 10.0 * (cells as f64).cbrt();
    for _ in 0..cells {
        let rng = sim.rng();
        let direction = random_unit_vector(rng, false);
        let distance = radius * rng.random::<f64>().cbrt();
        sim.spawn(tumor, direction * distance)?;
    }
    Ok(sim)
}

fn report(sim: &Simulation) {
    match sim.history().last() {
        Some(summary) => info!(
            tick = summary.tick.0,
            minutes = summary.time,
            live = summary.live,
            dead = summary.dead,
            births = summary.births,
            deaths = summary.deaths,
            mean_pressure = summary.mean_pressure,
            "spheroid summary",
        ),
        None => warn!("no steps recorded yet"),
    }
}

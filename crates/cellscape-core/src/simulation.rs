//! Step driver tying the registry, mechanics and phenotype passes together.

use crate::catalog::{Catalog, CellTypeId};
use crate::cell::Cell;
use crate::config::{ConfigError, SimulationConfig};
use crate::container::CellContainer;
use crate::division::{divide, remove_all};
use crate::field::Microenvironment;
use crate::interactions::{self, InteractionTally};
use crate::mechanics::{integrate_positions, update_velocities};
use crate::phenotype::{self, PhenotypeTally};
use crate::rng::{Stream, agent_rng};
use crate::{AgentHandle, Tick};
use glam::DVec3;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

/// Events emitted after processing a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepEvents {
    pub tick: Tick,
    /// Simulated minutes elapsed after this step.
    pub time: f64,
    pub births: usize,
    pub deaths: usize,
    pub deaths_started: usize,
    pub transitions: usize,
    pub ingested: usize,
    pub fused: usize,
    pub damage_delivered: f64,
    pub out_of_domain: usize,
}

/// Population summary retained in the history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub tick: Tick,
    pub time: f64,
    pub live: usize,
    pub dead: usize,
    pub births: usize,
    pub deaths: usize,
    pub mean_pressure: f64,
}

pub struct Simulation {
    config: SimulationConfig,
    catalog: Catalog,
    container: CellContainer,
    field: Box<dyn Microenvironment>,
    pool: ThreadPool,
    seed: u64,
    rng: SmallRng,
    tick: Tick,
    time: f64,
    pending_divisions: Vec<AgentHandle>,
    pending_removals: Vec<AgentHandle>,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("time", &self.time)
            .field("seed", &self.seed)
            .field("cell_count", &self.container.len())
            .finish()
    }
}

impl Simulation {
    /// Validate `config` against `catalog` and `field` and build an empty simulation.
    pub fn new(
        config: SimulationConfig,
        catalog: Catalog,
        field: impl Microenvironment + 'static,
    ) -> Result<Self, ConfigError> {
        let mesh = config.validate()?;
        if catalog.substrate_count() != field.substrate_count() {
            return Err(ConfigError::SubstrateMismatch {
                expected: catalog.substrate_count(),
                found: field.substrate_count(),
            });
        }

        let mut builder =
            ThreadPoolBuilder::new().thread_name(|index| format!("cellscape-worker-{index}"));
        if let Some(threads) = config.worker_threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;

        let seed = config.resolved_seed();
        let [nx, ny, nz] = mesh.dims();
        debug!(seed, nx, ny, nz, threads = pool.current_num_threads(), "simulation ready");
        let history_capacity = config.history_capacity;
        Ok(Self {
            rng: SimulationConfig::seeded_rng(seed),
            config,
            catalog,
            container: CellContainer::from_mesh(mesh),
            field: Box::new(field),
            pool,
            seed,
            tick: Tick::zero(),
            time: 0.0,
            pending_divisions: Vec::new(),
            pending_removals: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Create a cell of `type_id` at `position`.
    pub fn spawn(
        &mut self,
        type_id: CellTypeId,
        position: DVec3,
    ) -> Result<AgentHandle, ConfigError> {
        self.spawn_with(type_id, position, |_| {})
    }

    /// Create a cell, letting `customize` adjust it before it is placed.
    pub fn spawn_with(
        &mut self,
        type_id: CellTypeId,
        position: DVec3,
        customize: impl FnOnce(&mut Cell),
    ) -> Result<AgentHandle, ConfigError> {
        let mut cell = self.catalog.instantiate(type_id)?;
        customize(&mut cell);
        let handle = self.container.create(cell);
        self.container.assign_position(handle, position);
        Ok(handle)
    }

    pub fn spawn_by_name(
        &mut self,
        name: &str,
        position: DVec3,
    ) -> Result<AgentHandle, ConfigError> {
        let type_id = self.catalog.find_type(name)?;
        self.spawn(type_id, position)
    }

    /// Ask for `handle` to divide at the next barrier. False if the handle is stale.
    pub fn flag_for_division(&mut self, handle: AgentHandle) -> bool {
        self.container
            .get_mut(handle)
            .map(|cell| cell.flags.division_pending = true)
            .is_some()
    }

    /// Ask for `handle` to be removed at the next barrier. False if the handle is stale.
    pub fn flag_for_removal(&mut self, handle: AgentHandle) -> bool {
        self.container
            .get_mut(handle)
            .map(|cell| cell.flags.removal_pending = true)
            .is_some()
    }

    /// Start death model `index` for `handle` at its next phenotype update.
    pub fn request_death(&mut self, handle: AgentHandle, index: usize) -> bool {
        self.container
            .get_mut(handle)
            .map(|cell| cell.phenotype.death.request(index))
            .is_some()
    }

    fn stage_custom_rules(&mut self, dt: f64) {
        let cells = self.container.cells_mut();
        let field = &*self.field;
        self.pool.install(|| {
            cells.par_iter_mut().for_each(|cell| {
                if !cell.flags.active || cell.flags.removal_pending {
                    return;
                }
                if let Some(rule) = cell.functions.custom_rule {
                    rule(cell, field, dt);
                }
            });
        });
    }

    fn stage_mechanics(&mut self, next_tick: Tick, dt: f64) {
        let (cells, index) = self.container.split();
        let field = &*self.field;
        let (membrane, seed) = (self.config.membrane, self.seed);
        self.pool.install(|| {
            update_velocities(cells, index, membrane, field, seed, next_tick, dt);
        });
    }

    fn stage_interactions(&mut self, next_tick: Tick, dt: f64) -> InteractionTally {
        let seed = self.seed;
        let cells = self.container.cells();
        let proposals = self
            .pool
            .install(|| interactions::gather(cells, seed, next_tick, dt));
        interactions::commit(&mut self.container, &proposals)
    }

    fn stage_phenotype(&mut self, next_tick: Tick, dt: f64) -> PhenotypeTally {
        let cells = self.container.cells_mut();
        let catalog = &self.catalog;
        let seed = self.seed;
        self.pool
            .install(|| phenotype::advance_all(cells, catalog, seed, next_tick, dt))
    }

    /// Gather flagged cells. A cell flagged for both is only removed.
    fn stage_collect_flags(&mut self) {
        for cell in self.container.cells_mut() {
            if cell.flags.removal_pending {
                cell.flags.division_pending = false;
                self.pending_removals.push(cell.handle);
            } else if cell.flags.division_pending {
                self.pending_divisions.push(cell.handle);
            }
        }
    }

    /// Serial barrier: divisions, then removals.
    fn stage_structural_mutation(&mut self, next_tick: Tick) -> (usize, usize) {
        let mut births = 0;
        for parent in std::mem::take(&mut self.pending_divisions) {
            let mut rng = agent_rng(self.seed, next_tick, parent, Stream::Division);
            if divide(&mut self.container, parent, &mut rng).is_some() {
                births += 1;
            }
        }
        let deaths = remove_all(&mut self.container, std::mem::take(&mut self.pending_removals));
        (births, deaths)
    }

    /// Move cells and refresh their voxel membership. Returns how many cells left the
    /// domain this step.
    fn stage_reindex(&mut self, dt: f64) -> usize {
        let cells = self.container.cells_mut();
        self.pool.install(|| integrate_positions(cells, dt));
        let mut escaped = 0;
        for slot in 0..self.container.len() {
            let handle = AgentHandle(slot);
            let was_inside = self
                .container
                .get(handle)
                .is_some_and(|cell| !cell.flags.out_of_domain);
            if was_inside && !self.container.update_voxel(handle) {
                escaped += 1;
            }
        }
        escaped
    }

    fn stage_history(&mut self, next_tick: Tick, births: usize, deaths: usize) -> StepSummary {
        let cells = self.container.cells();
        let dead = cells.iter().filter(|cell| cell.is_dead()).count();
        let mean_pressure = if cells.is_empty() {
            0.0
        } else {
            cells.iter().map(|cell| cell.state.simple_pressure).sum::<f64>() / cells.len() as f64
        };
        let summary = StepSummary {
            tick: next_tick,
            time: self.time,
            live: cells.len() - dead,
            dead,
            births,
            deaths,
            mean_pressure,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    /// Execute one step of `config.dt` minutes.
    pub fn step(&mut self) -> StepEvents {
        self.step_by(self.config.dt)
    }

    /// Execute one step of `dt` minutes. A non-positive `dt` changes nothing and
    /// reports the current tick.
    pub fn step_by(&mut self, dt: f64) -> StepEvents {
        if dt.is_nan() || dt <= 0.0 {
            return StepEvents {
                tick: self.tick,
                time: self.time,
                ..StepEvents::default()
            };
        }
        let next_tick = self.tick.next();

        self.stage_custom_rules(dt);
        self.stage_mechanics(next_tick, dt);
        let contact = self.stage_interactions(next_tick, dt);
        let phenotype = self.stage_phenotype(next_tick, dt);
        self.stage_collect_flags();
        let (births, deaths) = self.stage_structural_mutation(next_tick);
        let out_of_domain = self.stage_reindex(dt);

        self.tick = next_tick;
        self.time += dt;
        let summary = self.stage_history(next_tick, births, deaths);
        debug!(
            tick = next_tick.0,
            live = summary.live,
            dead = summary.dead,
            births,
            deaths,
            "step complete"
        );

        StepEvents {
            tick: next_tick,
            time: self.time,
            births,
            deaths,
            deaths_started: phenotype.deaths_started,
            transitions: phenotype.transitions,
            ingested: contact.ingested,
            fused: contact.fused,
            damage_delivered: contact.damage_delivered,
            out_of_domain,
        }
    }

    /// Run `steps` steps, discarding the per-step events.
    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn field(&self) -> &dyn Microenvironment {
        &*self.field
    }

    /// Replace the substrate field, e.g. after an external solver advanced it.
    pub fn set_field(&mut self, field: impl Microenvironment + 'static) -> Result<(), ConfigError> {
        if field.substrate_count() != self.catalog.substrate_count() {
            return Err(ConfigError::SubstrateMismatch {
                expected: self.catalog.substrate_count(),
                found: field.substrate_count(),
            });
        }
        self.field = Box::new(field);
        Ok(())
    }

    #[must_use]
    pub fn cells(&self) -> &CellContainer {
        &self.container
    }

    /// Mutable registry access. Only call between steps.
    #[must_use]
    pub fn cells_mut(&mut self) -> &mut CellContainer {
        &mut self.container
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.container.len()
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Simulated minutes elapsed.
    #[must_use]
    pub const fn time(&self) -> f64 {
        self.time
    }

    /// Seed every per-agent stream is derived from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Simulation RNG for deterministic setup such as initial placement.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Iterate over retained step summaries.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogBuilder, CellDefinition};
    use crate::field::UniformField;
    use crate::phase::{LinkTiming, PhaseModel};
    use cellscape_index::MeshSpec;

    fn quiet_catalog() -> Catalog {
        let mut builder = CatalogBuilder::new();
        let mut model = PhaseModel::new("resting");
        model.add_phase("resting");
        let model = builder.add_model(model);
        builder.define(CellDefinition::new("resting", model));
        builder.build(0).expect("catalog")
    }

    fn config() -> SimulationConfig {
        SimulationConfig {
            domain: MeshSpec::cube(100.0, 20.0),
            dt: 0.1,
            rng_seed: Some(17),
            worker_threads: Some(2),
            history_capacity: 4,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn substrate_counts_must_match() {
        let result = Simulation::new(config(), quiet_catalog(), UniformField::new(vec![1.0]));
        assert!(matches!(
            result,
            Err(ConfigError::SubstrateMismatch {
                expected: 0,
                found: 1
            })
        ));
    }

    #[test]
    fn history_is_bounded() {
        let mut sim =
            Simulation::new(config(), quiet_catalog(), UniformField::default()).expect("sim");
        sim.spawn_by_name("resting", DVec3::ZERO).expect("spawn");
        sim.run(6);
        let ticks: Vec<Tick> = sim.history().map(|summary| summary.tick).collect();
        assert_eq!(ticks, vec![Tick(3), Tick(4), Tick(5), Tick(6)]);
        assert!((sim.time() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn flagged_removal_wins_over_division() {
        let mut sim =
            Simulation::new(config(), quiet_catalog(), UniformField::default()).expect("sim");
        let handle = sim.spawn_by_name("resting", DVec3::ZERO).expect("spawn");
        assert!(sim.flag_for_division(handle));
        assert!(sim.flag_for_removal(handle));
        let events = sim.step();
        assert_eq!(events.births, 0);
        assert_eq!(events.deaths, 1);
        assert_eq!(sim.cell_count(), 0);
        assert!(!sim.flag_for_division(handle));
    }

    #[test]
    fn zero_dt_changes_nothing() {
        let mut sim =
            Simulation::new(config(), quiet_catalog(), UniformField::default()).expect("sim");
        sim.spawn_by_name("resting", DVec3::ZERO).expect("spawn");
        sim.spawn_by_name("resting", DVec3::new(5.0, 0.0, 0.0)).expect("spawn");
        let before: Vec<Cell> = sim.cells().cells().to_vec();
        let events = sim.step_by(0.0);
        assert_eq!(events.tick, Tick(0));
        assert_eq!(sim.history().count(), 0);
        for (old, new) in before.iter().zip(sim.cells().cells()) {
            assert_eq!(old.position, new.position);
            assert_eq!(old.phenotype, new.phenotype);
        }
    }

    #[test]
    fn fixed_duration_links_survive_the_driver() {
        let mut builder = CatalogBuilder::new();
        let mut model = PhaseModel::new("timer");
        let a = model.add_phase("a");
        let b = model.add_phase("b");
        model
            .add_link(a, b, 1.0, LinkTiming::FixedDuration)
            .expect("link");
        let model = builder.add_model(model);
        builder.define(CellDefinition::new("timer", model));
        let catalog = builder.build(0).expect("catalog");

        let mut sim = Simulation::new(config(), catalog, UniformField::default()).expect("sim");
        let handle = sim.spawn_by_name("timer", DVec3::ZERO).expect("spawn");
        sim.run(9);
        assert_eq!(sim.cells().get(handle).expect("cell").phenotype.cycle.current, a);
        sim.run(1);
        assert_eq!(sim.cells().get(handle).expect("cell").phenotype.cycle.current, b);
    }
}

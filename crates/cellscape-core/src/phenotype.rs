//! Per-cell state machine: death checks, phase advancement and volume change.
//!
//! Runs in parallel; a cell only ever writes to itself here. Division and removal are
//! requested through flags and carried out later at the serial barrier.

use crate::Tick;
use crate::catalog::Catalog;
use crate::cell::Cell;
use crate::phase::PhaseOutcome;
use crate::rng::{Stream, agent_rng};
use rand::Rng;
use rayon::prelude::*;

/// Counts gathered from one phenotype pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhenotypeTally {
    pub deaths_started: usize,
    pub transitions: usize,
}

impl PhenotypeTally {
    fn merge(self, other: Self) -> Self {
        Self {
            deaths_started: self.deaths_started + other.deaths_started,
            transitions: self.transitions + other.transitions,
        }
    }
}

pub(crate) fn advance_all(
    cells: &mut [Cell],
    catalog: &Catalog,
    seed: u64,
    tick: Tick,
    dt: f64,
) -> PhenotypeTally {
    cells
        .par_iter_mut()
        .map(|cell| {
            let mut rng = agent_rng(seed, tick, cell.handle, Stream::Phenotype);
            advance_cell(cell, catalog, &mut rng, dt)
        })
        .reduce(PhenotypeTally::default, PhenotypeTally::merge)
}

/// One phenotype update for a single cell.
///
/// A pending death request wins over the stochastic death rates. A cell that has
/// started dying advances through its death model from this step on.
pub fn advance_cell<R: Rng + ?Sized>(
    cell: &mut Cell,
    catalog: &Catalog,
    rng: &mut R,
    dt: f64,
) -> PhenotypeTally {
    let mut tally = PhenotypeTally::default();
    if cell.flags.removal_pending || dt <= 0.0 {
        return tally;
    }

    if !cell.is_dead() {
        let requested = cell.phenotype.death.take_request();
        let chosen = requested.or_else(|| draw_death(cell, rng, dt));
        if chosen.is_some_and(|index| start_death(cell, catalog, index, dt)) {
            tally.deaths_started += 1;
        }
    }

    if let Some(model) = catalog.model(cell.cycle_model()) {
        match model.advance(cell, rng, dt) {
            PhaseOutcome::Stayed => {}
            PhaseOutcome::Transitioned { .. } | PhaseOutcome::Removed { .. } => {
                tally.transitions += 1;
            }
        }
    }
    if cell.flags.removal_pending {
        return tally;
    }

    let update = cell.functions.update_volume.unwrap_or(standard_volume);
    update(cell, dt);
    tally
}

/// First death model whose rate fires this step.
fn draw_death<R: Rng + ?Sized>(cell: &Cell, rng: &mut R, dt: f64) -> Option<usize> {
    cell.phenotype
        .death
        .rates
        .iter()
        .position(|rate| *rate > 0.0 && rng.random::<f64>() < rate * dt)
}

/// Switch the cell onto death model `index`. Returns false if the index or the model
/// is unknown.
pub fn start_death(cell: &mut Cell, catalog: &Catalog, index: usize, dt: f64) -> bool {
    let Some(&model_id) = cell.phenotype.death.models.get(index) else {
        return false;
    };
    let Some(model) = catalog.model(model_id) else {
        return false;
    };

    let death = &mut cell.phenotype.death;
    death.dead = true;
    death.current = Some(index);
    cell.phenotype.cycle = model.start_state(model_id, model.default_phase());
    cell.phenotype.motility.disable();
    cell.phenotype.secretion.silence();
    cell.flags.division_pending = false;

    if let Some(entry) = model.phase(model.default_phase()).and_then(|phase| phase.entry) {
        entry(cell, dt);
    }
    true
}

/// Relax the volume compartments and resize the cell to match.
pub fn standard_volume(cell: &mut Cell, dt: f64) {
    cell.phenotype.volume.relax(dt);
    cell.radius = cell.phenotype.volume.radius();
}

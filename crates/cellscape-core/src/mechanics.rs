//! Contact mechanics, membrane response and motility.
//!
//! Velocities are computed per cell in parallel against a read-only snapshot of every
//! other cell, then written back serially. Positions move later, after the structural
//! mutation barrier, so the pass never observes a half-updated population.

use crate::cell::Cell;
use crate::field::Microenvironment;
use crate::rng::{Stream, agent_rng, random_unit_vector};
use crate::{AgentHandle, Tick};
use cellscape_index::{MeshSpec, NeighborhoodIndex, VoxelIndex};
use glam::DVec3;
use rand::{Rng, RngCore};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Pressure of one neighbor at full overlap, normalised so twelve close-packed
/// neighbors sum to one.
pub const SIMPLE_PRESSURE_SCALE: f64 = 0.027288820670331;

/// Smallest separation used as a divisor.
pub const DISTANCE_EPSILON: f64 = 1e-5;

/// Boundary that cells adhere to and are repelled by.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Membrane {
    #[default]
    None,
    /// The faces of the domain box (z faces are skipped on planar meshes).
    DomainWalls,
    Sphere { center: DVec3, radius: f64 },
}

impl Membrane {
    /// Distance from `position` to the membrane and the unit normal pointing away from
    /// it into the interior.
    #[must_use]
    pub fn probe(&self, position: DVec3, domain: &MeshSpec, planar: bool) -> Option<(f64, DVec3)> {
        match *self {
            Membrane::None => None,
            Membrane::DomainWalls => {
                let axes = if planar { 2 } else { 3 };
                let mut nearest: Option<(f64, DVec3)> = None;
                for axis in 0..axes {
                    let unit = DVec3::AXES[axis];
                    let candidates = [
                        (position[axis] - domain.lower[axis], unit),
                        (domain.upper[axis] - position[axis], -unit),
                    ];
                    for candidate in candidates {
                        if nearest.is_none_or(|(best, _)| candidate.0 < best) {
                            nearest = Some(candidate);
                        }
                    }
                }
                nearest
            }
            Membrane::Sphere { center, radius } => {
                let inward = center - position;
                let from_center = inward.length();
                let normal = inward.try_normalize().unwrap_or(DVec3::ZERO);
                Some((radius - from_center, normal))
            }
        }
    }
}

/// Read-only view handed to velocity updates.
pub struct MechanicsContext<'a> {
    pub cells: &'a [Cell],
    pub index: &'a VoxelIndex<AgentHandle>,
    pub membrane: Membrane,
    pub planar: bool,
    pub field: &'a dyn Microenvironment,
}

/// Contribution of one velocity update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MechanicsResult {
    /// Added to the cell's velocity, motility included.
    pub velocity: DVec3,
    pub simple_pressure: f64,
    pub neighbors: Vec<AgentHandle>,
    /// New locomotive velocity.
    pub motility: DVec3,
}

/// Built-in velocity update: contact potentials, springs, membrane, motility.
pub fn standard_velocity(
    cell: &Cell,
    ctx: &MechanicsContext<'_>,
    rng: &mut dyn RngCore,
    dt: f64,
) -> MechanicsResult {
    let mut result = MechanicsResult::default();
    if let Some(home) = cell.voxel {
        ctx.index.visit_candidates(
            home,
            cell.position,
            cell.interactive_distance(),
            &mut |other| {
                if other != cell.handle {
                    add_potentials(cell, &ctx.cells[other.0], &mut result);
                }
            },
        );
    }
    for partner in &cell.state.spring_attachments {
        if let Some(other) = ctx.cells.get(partner.0) {
            result.velocity +=
                cell.phenotype.mechanics.elastic_constant * (other.position - cell.position);
        }
    }
    add_membrane(cell, ctx, &mut result);
    result.motility = update_motility(cell, ctx.field, rng, dt);
    result.velocity += result.motility;
    result
}

/// Pairwise repulsion and adhesion between `cell` and `other`.
pub fn add_potentials(cell: &Cell, other: &Cell, result: &mut MechanicsResult) {
    let displacement = cell.position - other.position;
    let distance = displacement.length().max(DISTANCE_EPSILON);
    let mine = &cell.phenotype.mechanics;
    let theirs = &other.phenotype.mechanics;

    let mut force = 0.0;
    let contact = cell.radius + other.radius;
    if distance < contact {
        let overlap = 1.0 - distance / contact;
        let overlap_sq = overlap * overlap;
        result.simple_pressure += overlap_sq / SIMPLE_PRESSURE_SCALE;
        force = overlap_sq * (mine.repulsion_strength * theirs.repulsion_strength).sqrt();
    }

    let adhesion_reach = cell.adhesion_distance() + other.adhesion_distance();
    if distance < adhesion_reach {
        let gap = 1.0 - distance / adhesion_reach;
        let strength = (mine.adhesion_strength
            * mine.affinity(other.type_id)
            * theirs.adhesion_strength
            * theirs.affinity(cell.type_id))
        .sqrt();
        force -= gap * gap * strength;
    }
    if distance < contact.max(adhesion_reach) {
        result.neighbors.push(other.handle);
    }

    if force == 0.0 {
        return;
    }
    result.velocity += displacement * (force / distance);
}

fn add_membrane(cell: &Cell, ctx: &MechanicsContext<'_>, result: &mut MechanicsResult) {
    if cell.radius <= 0.0 {
        return;
    }
    let domain = ctx.index.mesh().spec();
    let Some((distance, normal)) = ctx.membrane.probe(cell.position, domain, ctx.planar) else {
        return;
    };
    let mechanics = &cell.phenotype.mechanics;
    let mut force = 0.0;
    if distance < cell.radius {
        let overlap = 1.0 - distance / cell.radius;
        force += overlap * overlap * mechanics.membrane_repulsion;
    }
    let reach = cell.adhesion_distance();
    if reach > 0.0 && distance < reach {
        let gap = 1.0 - distance / reach;
        force -= gap * gap * mechanics.membrane_adhesion;
    }
    result.velocity += normal * force;
}

/// Persistent biased random walk; returns the new locomotive velocity.
pub fn update_motility(
    cell: &Cell,
    field: &dyn Microenvironment,
    rng: &mut dyn RngCore,
    dt: f64,
) -> DVec3 {
    let motility = &cell.phenotype.motility;
    if !motility.is_motile {
        return DVec3::ZERO;
    }
    let redraw =
        motility.persistence_time < dt || rng.random::<f64>() < dt / motility.persistence_time;
    if !redraw {
        return motility.vector;
    }

    let wander = random_unit_vector(rng, motility.restrict_to_2d);
    let bias_direction = match motility.chemotaxis {
        Some(chemotaxis) => {
            field
                .nearest_gradient(chemotaxis.substrate, cell.position)
                .normalize_or_zero()
                * chemotaxis.direction.signum()
        }
        None => motility.bias_direction,
    };
    let mut heading =
        motility.migration_bias * bias_direction + (1.0 - motility.migration_bias) * wander;
    if motility.restrict_to_2d {
        heading.z = 0.0;
    }
    heading.normalize_or_zero() * motility.migration_speed
}

/// Velocity pass over every mechanically active cell.
pub(crate) fn update_velocities(
    cells: &mut [Cell],
    index: &VoxelIndex<AgentHandle>,
    membrane: Membrane,
    field: &dyn Microenvironment,
    seed: u64,
    tick: Tick,
    dt: f64,
) {
    let results: Vec<Option<MechanicsResult>> = {
        let ctx = MechanicsContext {
            cells: &*cells,
            index,
            membrane,
            planar: index.mesh().is_planar(),
            field,
        };
        cells
            .par_iter()
            .map(|cell| {
                if !cell.is_mechanically_active() {
                    return None;
                }
                let mut rng = agent_rng(seed, tick, cell.handle, Stream::Mechanics);
                let update = cell.functions.update_velocity.unwrap_or(standard_velocity);
                Some(update(cell, &ctx, &mut rng, dt))
            })
            .collect()
    };

    for (cell, result) in cells.iter_mut().zip(results) {
        cell.state.neighbors.clear();
        cell.state.simple_pressure = 0.0;
        if let Some(result) = result {
            cell.velocity += result.velocity;
            cell.state.simple_pressure = result.simple_pressure;
            cell.state.neighbors = result.neighbors;
            cell.phenotype.motility.vector = result.motility;
        }
    }
    symmetrize_neighbors(cells);
}

/// Make neighbor relations mutual; cells skipped by the pass still learn who touches
/// them.
fn symmetrize_neighbors(cells: &mut [Cell]) {
    let mut missing = Vec::new();
    for cell in cells.iter() {
        for neighbor in &cell.state.neighbors {
            if !cells[neighbor.0].state.neighbors.contains(&cell.handle) {
                missing.push((*neighbor, cell.handle));
            }
        }
    }
    for (target, neighbor) in missing {
        cells[target.0].state.neighbors.push(neighbor);
    }
}

/// Second-order Adams-Bashforth position update; velocities are consumed.
pub(crate) fn integrate_positions(cells: &mut [Cell], dt: f64) {
    cells.par_iter_mut().for_each(|cell| {
        if cell.is_mechanically_active() {
            cell.position += dt * (1.5 * cell.velocity - 0.5 * cell.previous_velocity);
            cell.previous_velocity = cell.velocity;
        }
        cell.velocity = DVec3::ZERO;
    });
}

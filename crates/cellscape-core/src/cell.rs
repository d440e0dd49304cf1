//! Agent data model: geometry, phenotype blocks, custom data and behaviour hooks.

use crate::AgentHandle;
use crate::catalog::CellTypeId;
use crate::field::Microenvironment;
use crate::mechanics::{MechanicsContext, MechanicsResult};
use crate::phase::{ModelId, PhaseAgent, PhaseState};
use cellscape_index::VoxelId;
use glam::DVec3;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Default total cell volume in cubic microns.
pub const DEFAULT_CELL_VOLUME: f64 = 2494.0;

/// Rule run once per step before mechanics.
pub type CustomRule = fn(&mut Cell, &dyn Microenvironment, f64);
/// Full replacement of the standard mechanics contribution.
pub type VelocityUpdate =
    fn(&Cell, &MechanicsContext<'_>, &mut dyn RngCore, f64) -> MechanicsResult;
/// Full replacement of the standard volume model.
pub type VolumeUpdate = fn(&mut Cell, f64);
/// Picks the direction along which a dividing cell splits.
pub type OrientationSampler = fn(&Cell, &mut dyn RngCore) -> DVec3;
/// Runs on `(parent, child)` right after a division.
pub type DivisionHook = fn(&mut Cell, &mut Cell);

/// Fluid and solid compartments relaxing toward their targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub total: f64,
    pub fluid: f64,
    pub solid: f64,
    pub target_solid: f64,
    pub target_fluid_fraction: f64,
    /// Per-minute relaxation rate of the fluid compartment.
    pub fluid_change_rate: f64,
    /// Per-minute relaxation rate of the solid compartment.
    pub solid_change_rate: f64,
    pub rupture_threshold: f64,
}

impl Volume {
    #[must_use]
    pub fn with_total(total: f64) -> Self {
        let total = total.max(0.0);
        let fluid_fraction = 0.75;
        let fluid = fluid_fraction * total;
        let solid = total - fluid;
        Self {
            total,
            fluid,
            solid,
            target_solid: solid,
            target_fluid_fraction: fluid_fraction,
            fluid_change_rate: 0.05,
            solid_change_rate: 0.0045,
            rupture_threshold: 2.0 * total,
        }
    }

    #[must_use]
    pub fn from_radius(radius: f64) -> Self {
        Self::with_total(sphere_volume(radius))
    }

    /// Radius of the sphere holding `total`.
    #[must_use]
    pub fn radius(&self) -> f64 {
        if self.total <= 0.0 {
            0.0
        } else {
            (0.75 * self.total / PI).cbrt()
        }
    }

    #[must_use]
    pub fn fluid_fraction(&self) -> f64 {
        if self.total > 0.0 {
            self.fluid / self.total
        } else {
            0.0
        }
    }

    /// Explicit Euler step of the compartment relaxation.
    pub fn relax(&mut self, dt: f64) {
        let target_fluid = self.target_fluid_fraction * self.total;
        self.fluid += dt * self.fluid_change_rate * (target_fluid - self.fluid);
        self.fluid = self.fluid.max(0.0);
        self.solid += dt * self.solid_change_rate * (self.target_solid - self.solid);
        self.solid = self.solid.max(0.0);
        self.total = self.fluid + self.solid;
    }

    /// Scale every extensive quantity by `ratio`.
    pub fn multiply_by_ratio(&mut self, ratio: f64) {
        self.total *= ratio;
        self.fluid *= ratio;
        self.solid *= ratio;
        self.target_solid *= ratio;
        self.rupture_threshold *= ratio;
    }

    /// Take up the compartments of an engulfed cell.
    pub fn absorb(&mut self, other: &Volume) {
        self.fluid += other.fluid;
        self.solid += other.solid;
        self.target_solid += other.target_solid;
        self.total = self.fluid + self.solid;
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::with_total(DEFAULT_CELL_VOLUME)
    }
}

/// Volume of a sphere of `radius`.
#[must_use]
pub fn sphere_volume(radius: f64) -> f64 {
    4.0 / 3.0 * PI * radius.max(0.0).powi(3)
}

/// Contact mechanics parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mechanics {
    pub adhesion_strength: f64,
    pub repulsion_strength: f64,
    /// Adhesion affinity toward each cell type, indexed by [`CellTypeId`].
    pub affinities: Vec<f64>,
    /// Adhesion reach as a multiple of the radius.
    pub max_adhesion_multiplier: f64,
    pub membrane_adhesion: f64,
    pub membrane_repulsion: f64,
    pub elastic_constant: f64,
    pub attachment_rate: f64,
    pub detachment_rate: f64,
    pub max_attachments: usize,
}

impl Mechanics {
    #[must_use]
    pub fn affinity(&self, other: CellTypeId) -> f64 {
        self.affinities.get(other.0).copied().unwrap_or(1.0)
    }
}

impl Default for Mechanics {
    fn default() -> Self {
        Self {
            adhesion_strength: 0.4,
            repulsion_strength: 10.0,
            affinities: Vec::new(),
            max_adhesion_multiplier: 1.25,
            membrane_adhesion: 4.0,
            membrane_repulsion: 10.0,
            elastic_constant: 0.01,
            attachment_rate: 0.0,
            detachment_rate: 0.0,
            max_attachments: 12,
        }
    }
}

/// Biased random walk toward a substrate gradient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Chemotaxis {
    pub substrate: usize,
    /// Positive climbs the gradient, negative descends it.
    pub direction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Motility {
    pub is_motile: bool,
    pub persistence_time: f64,
    pub migration_speed: f64,
    pub migration_bias: f64,
    pub bias_direction: DVec3,
    pub chemotaxis: Option<Chemotaxis>,
    pub restrict_to_2d: bool,
    /// Current locomotive velocity.
    pub vector: DVec3,
}

impl Motility {
    pub fn disable(&mut self) {
        self.is_motile = false;
        self.vector = DVec3::ZERO;
    }
}

impl Default for Motility {
    fn default() -> Self {
        Self {
            is_motile: false,
            persistence_time: 1.0,
            migration_speed: 1.0,
            migration_bias: 0.0,
            bias_direction: DVec3::ZERO,
            chemotaxis: None,
            restrict_to_2d: false,
            vector: DVec3::ZERO,
        }
    }
}

/// Exchange rates with the substrate field plus internalized amounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secretion {
    pub secretion_rates: Vec<f64>,
    pub uptake_rates: Vec<f64>,
    pub saturation_densities: Vec<f64>,
    pub net_export_rates: Vec<f64>,
    pub internalized: Vec<f64>,
}

impl Secretion {
    /// Shut secretion down and throttle uptake, as a dying cell does.
    pub fn silence(&mut self) {
        self.secretion_rates.fill(0.0);
        self.net_export_rates.fill(0.0);
        for rate in &mut self.uptake_rates {
            *rate *= 0.1;
        }
    }

    /// Resize every per-substrate vector, padding with zeros.
    pub(crate) fn resize(&mut self, substrates: usize) {
        for rates in [
            &mut self.secretion_rates,
            &mut self.uptake_rates,
            &mut self.saturation_densities,
            &mut self.net_export_rates,
            &mut self.internalized,
        ] {
            rates.resize(substrates, 0.0);
        }
    }
}

/// Contact-driven behaviours toward neighbors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interactions {
    pub dead_phagocytosis_rate: f64,
    pub live_phagocytosis_rates: Vec<f64>,
    pub attack_rates: Vec<f64>,
    pub fusion_rates: Vec<f64>,
    /// Damage delivered per minute of attack.
    pub damage_rate: f64,
}

impl Interactions {
    #[must_use]
    pub fn rate_toward(rates: &[f64], other: CellTypeId) -> f64 {
        rates.get(other.0).copied().unwrap_or(0.0)
    }
}

impl Default for Interactions {
    fn default() -> Self {
        Self {
            dead_phagocytosis_rate: 0.0,
            live_phagocytosis_rates: Vec::new(),
            attack_rates: Vec::new(),
            fusion_rates: Vec::new(),
            damage_rate: 1.0,
        }
    }
}

/// Death models available to a cell and the rates that trigger them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Death {
    pub models: Vec<ModelId>,
    pub rates: Vec<f64>,
    pub dead: bool,
    /// Index into `models` of the death being carried out.
    pub current: Option<usize>,
    pending: Option<usize>,
}

impl Death {
    /// Register a death model with its per-minute rate.
    pub fn add_model(&mut self, model: ModelId, rate: f64) -> usize {
        self.models.push(model);
        self.rates.push(rate);
        self.models.len() - 1
    }

    /// Ask for death model `index` to start at the next phenotype update.
    pub fn request(&mut self, index: usize) {
        if !self.dead && index < self.models.len() {
            self.pending = Some(index);
        }
    }

    pub(crate) fn take_request(&mut self) -> Option<usize> {
        self.pending.take()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phenotype {
    pub volume: Volume,
    pub mechanics: Mechanics,
    pub motility: Motility,
    pub secretion: Secretion,
    pub interactions: Interactions,
    pub death: Death,
    /// Phase state of whichever model currently drives the cell.
    pub cycle: PhaseState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomVariable {
    pub name: String,
    pub value: f64,
    /// Conserved quantities split on division and add up on absorption.
    pub conserved: bool,
}

/// Named per-cell scalars for user rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    variables: Vec<CustomVariable>,
}

impl CustomData {
    /// Add or overwrite a variable, returning its slot.
    pub fn insert(&mut self, name: impl Into<String>, value: f64, conserved: bool) -> usize {
        let name = name.into();
        if let Some(slot) = self.index_of(&name) {
            let variable = &mut self.variables[slot];
            variable.value = value;
            variable.conserved = conserved;
            return slot;
        }
        self.variables.push(CustomVariable {
            name,
            value,
            conserved,
        });
        self.variables.len() - 1
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|variable| variable.name == name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.index_of(name).map(|slot| self.variables[slot].value)
    }

    /// Overwrite an existing variable; returns false if it is unknown.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match self.index_of(name) {
            Some(slot) => {
                self.variables[slot].value = value;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomVariable> {
        self.variables.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub(crate) fn halve_conserved(&mut self) {
        for variable in self.variables.iter_mut().filter(|v| v.conserved) {
            variable.value *= 0.5;
        }
    }

    pub(crate) fn absorb_conserved(&mut self, other: &CustomData) {
        for incoming in other.variables.iter().filter(|v| v.conserved) {
            if let Some(slot) = self.index_of(&incoming.name) {
                self.variables[slot].value += incoming.value;
            }
        }
    }

    pub(crate) fn clear_conserved(&mut self) {
        for variable in self.variables.iter_mut().filter(|v| v.conserved) {
            variable.value = 0.0;
        }
    }
}

/// Relations and accumulators rebuilt or updated during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    /// Cells within adhesion reach at the last mechanics pass.
    pub neighbors: Vec<AgentHandle>,
    pub spring_attachments: Vec<AgentHandle>,
    pub rigid_attachments: Vec<AgentHandle>,
    pub simple_pressure: f64,
    pub damage: f64,
    pub total_attack_time: f64,
    pub nuclei: u32,
}

impl Default for CellState {
    fn default() -> Self {
        Self {
            neighbors: Vec::new(),
            spring_attachments: Vec::new(),
            rigid_attachments: Vec::new(),
            simple_pressure: 0.0,
            damage: 0.0,
            total_attack_time: 0.0,
            nuclei: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFlags {
    pub movable: bool,
    pub out_of_domain: bool,
    pub active: bool,
    pub division_pending: bool,
    pub removal_pending: bool,
}

impl Default for CellFlags {
    fn default() -> Self {
        Self {
            movable: true,
            out_of_domain: false,
            active: true,
            division_pending: false,
            removal_pending: false,
        }
    }
}

/// Optional per-type behaviour overrides; `None` selects the built-in default.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellFunctions {
    pub custom_rule: Option<CustomRule>,
    pub update_velocity: Option<VelocityUpdate>,
    pub update_volume: Option<VolumeUpdate>,
    pub division_orientation: Option<OrientationSampler>,
    pub post_division: Option<DivisionHook>,
}

/// A simulated cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub handle: AgentHandle,
    pub type_id: CellTypeId,
    pub position: DVec3,
    pub velocity: DVec3,
    pub previous_velocity: DVec3,
    /// Unit axis used for polarized division.
    pub orientation: DVec3,
    /// 0 divides isotropically, 1 divides strictly perpendicular to `orientation`.
    pub polarity: f64,
    pub radius: f64,
    pub phenotype: Phenotype,
    pub custom: CustomData,
    pub state: CellState,
    #[serde(skip)]
    pub functions: CellFunctions,
    pub voxel: Option<VoxelId>,
    pub flags: CellFlags,
}

impl Cell {
    /// Unplaced cell with the given phenotype.
    #[must_use]
    pub fn new(type_id: CellTypeId, phenotype: Phenotype) -> Self {
        let radius = phenotype.volume.radius();
        Self {
            handle: AgentHandle::default(),
            type_id,
            position: DVec3::ZERO,
            velocity: DVec3::ZERO,
            previous_velocity: DVec3::ZERO,
            orientation: DVec3::Z,
            polarity: 0.0,
            radius,
            phenotype,
            custom: CustomData::default(),
            state: CellState::default(),
            functions: CellFunctions::default(),
            voxel: None,
            flags: CellFlags::default(),
        }
    }

    /// Rescale the volume so the cell has `radius`.
    pub fn set_radius(&mut self, radius: f64) {
        let volume = &mut self.phenotype.volume;
        let target = sphere_volume(radius);
        if volume.total > 0.0 {
            volume.multiply_by_ratio(target / volume.total);
        } else {
            *volume = Volume::with_total(target);
        }
        self.radius = radius.max(0.0);
    }

    /// Distance out to which this cell adheres to others.
    #[must_use]
    pub fn adhesion_distance(&self) -> f64 {
        self.radius * self.phenotype.mechanics.max_adhesion_multiplier
    }

    /// Distance out to which this cell looks for neighbours. Never less than the
    /// radius, so repulsive contacts are found even when adhesion reaches less far.
    #[must_use]
    pub fn interactive_distance(&self) -> f64 {
        self.adhesion_distance().max(self.radius)
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.phenotype.death.dead
    }

    /// True while the mechanics pass should move this cell.
    #[must_use]
    pub const fn is_mechanically_active(&self) -> bool {
        self.flags.active && self.flags.movable && !self.flags.out_of_domain
    }

    #[must_use]
    pub const fn cycle_model(&self) -> ModelId {
        self.phenotype.cycle.model
    }
}

impl PhaseAgent for Cell {
    fn phase_state(&self) -> &PhaseState {
        &self.phenotype.cycle
    }

    fn phase_state_mut(&mut self) -> &mut PhaseState {
        &mut self.phenotype.cycle
    }

    fn flag_for_division(&mut self) {
        self.flags.division_pending = true;
    }

    fn flag_for_removal(&mut self) {
        self.flags.removal_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_radius_round_trips() {
        let volume = Volume::from_radius(8.4);
        assert!((volume.radius() - 8.4).abs() < 1e-9);
        assert!((volume.fluid_fraction() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn relaxed_volume_stays_at_equilibrium() {
        let mut volume = Volume::default();
        for _ in 0..1000 {
            volume.relax(0.1);
        }
        assert!((volume.total - DEFAULT_CELL_VOLUME).abs() < 1e-6);
    }

    #[test]
    fn doubled_target_grows_the_cell() {
        let mut volume = Volume::default();
        volume.target_solid *= 2.0;
        for _ in 0..10_000 {
            volume.relax(1.0);
        }
        assert!((volume.total - 2.0 * DEFAULT_CELL_VOLUME).abs() < 1.0);
    }

    #[test]
    fn custom_data_conserves_on_halving_and_absorption() {
        let mut data = CustomData::default();
        data.insert("mass", 10.0, true);
        data.insert("label", 3.0, false);
        data.halve_conserved();
        assert_eq!(data.get("mass"), Some(5.0));
        assert_eq!(data.get("label"), Some(3.0));

        let other = data.clone();
        data.absorb_conserved(&other);
        assert_eq!(data.get("mass"), Some(10.0));
        assert_eq!(data.get("label"), Some(3.0));
        assert!(!data.set("missing", 1.0));
        assert_eq!(data.insert("mass", 1.0, true), 0);
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn silenced_secretion_throttles_uptake() {
        let mut secretion = Secretion {
            secretion_rates: vec![2.0],
            uptake_rates: vec![5.0],
            ..Secretion::default()
        };
        secretion.silence();
        assert_eq!(secretion.secretion_rates, vec![0.0]);
        assert!((secretion.uptake_rates[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn set_radius_rescales_volume() {
        let mut cell = Cell::new(CellTypeId(0), Phenotype::default());
        cell.set_radius(8.4);
        assert_eq!(cell.radius, 8.4);
        assert!((cell.phenotype.volume.radius() - 8.4).abs() < 1e-9);
        assert!((cell.interactive_distance() - 10.5).abs() < 1e-12);
    }

    #[test]
    fn neighbour_search_never_reaches_less_than_the_radius() {
        let mut cell = Cell::new(CellTypeId(0), Phenotype::default());
        cell.set_radius(8.0);
        cell.phenotype.mechanics.max_adhesion_multiplier = 0.25;
        assert_eq!(cell.adhesion_distance(), 2.0);
        assert_eq!(cell.interactive_distance(), 8.0);
    }
}

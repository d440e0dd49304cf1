//! Core of the cellscape agent-based multicellular simulator.
//!
//! Cells live in a dense [`CellContainer`] indexed by a voxel mesh. Each
//! [`Simulation::step`] runs custom rules, a parallel mechanics pass, parallel phenotype
//! advancement, then a serial barrier that divides and removes cells before positions
//! are integrated and re-indexed.

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod cell;
pub mod config;
pub mod container;
pub mod division;
pub mod field;
pub mod interactions;
pub mod mechanics;
pub mod phase;
pub mod phenotype;
mod rng;
pub mod simulation;
pub mod standard;

pub use catalog::{Catalog, CatalogBuilder, CellDefinition, CellTypeId};
pub use cell::{
    Cell, CellFlags, CellFunctions, CellState, Chemotaxis, CustomData, Death, Interactions,
    Mechanics, Motility, Phenotype, Secretion, Volume,
};
pub use cellscape_index::{MeshSpec, VoxelId};
pub use config::{ConfigError, SimulationConfig};
pub use container::CellContainer;
pub use field::{Microenvironment, UniformField};
pub use mechanics::{Membrane, MechanicsContext, MechanicsResult};
pub use phase::{LinkTiming, ModelId, PhaseAgent, PhaseModel, PhaseOutcome, PhaseState};
pub use rng::random_unit_vector;
pub use simulation::{Simulation, StepEvents, StepSummary};
pub use standard::StandardModels;

/// Handle of a live cell: its slot in the dense cell array.
///
/// Handles are only stable between structural mutations; removing a cell renames the
/// cell that was last in the array.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AgentHandle(pub usize);

impl AgentHandle {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Simulation tick counter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

//! Simulation-wide configuration and setup errors.

use crate::mechanics::Membrane;
use crate::phase::PhaseModelError;
use cellscape_index::{IndexError, MeshSpec, VoxelMesh};
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors detected while setting a simulation up. The step loop itself never fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid parameters for cell type `{cell_type}`: {reason}")]
    InvalidCellType {
        cell_type: String,
        reason: &'static str,
    },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Phase(#[from] PhaseModelError),
    #[error("unknown cell type `{0}`")]
    UnknownCellType(String),
    #[error("cell type `{0}` is defined more than once")]
    DuplicateCellType(String),
    #[error("cell type `{cell_type}` references a phase model that is not registered")]
    UnknownModel { cell_type: String },
    #[error("cell type `{cell_type}` lists {found} {what}, expected {expected}")]
    VectorLength {
        cell_type: String,
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("cell type `{cell_type}` references substrate {index}, but only {count} exist")]
    UnknownSubstrate {
        cell_type: String,
        index: usize,
        count: usize,
    },
    #[error("catalog was resolved for {expected} substrates, field provides {found}")]
    SubstrateMismatch { expected: usize, found: usize },
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Static configuration for a simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Bounds and resolution of the mechanics voxel mesh.
    pub domain: MeshSpec,
    /// Step length in minutes.
    pub dt: f64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Worker threads for the parallel passes; `None` uses one per core.
    pub worker_threads: Option<usize>,
    /// Boundary that pushes and holds cells.
    pub membrane: Membrane,
    /// Number of step summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            domain: MeshSpec::default(),
            dt: 0.1,
            rng_seed: None,
            worker_threads: None,
            membrane: Membrane::None,
            history_capacity: 256,
        }
    }
}

impl SimulationConfig {
    /// Validates the configuration, returning the derived voxel mesh.
    pub fn validate(&self) -> Result<VoxelMesh, ConfigError> {
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(ConfigError::InvalidConfig("dt must be positive and finite"));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "worker_threads must be non-zero when set",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        if let Membrane::Sphere { center, radius } = self.membrane {
            if !center.is_finite() || !radius.is_finite() || radius <= 0.0 {
                return Err(ConfigError::InvalidConfig(
                    "membrane sphere needs a finite center and positive radius",
                ));
            }
        }
        Ok(VoxelMesh::new(self.domain)?)
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    pub(crate) fn resolved_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }

    pub(crate) fn seeded_rng(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    #[test]
    fn default_config_is_valid() {
        let mesh = SimulationConfig::default().validate().expect("valid config");
        assert_eq!(mesh.dims(), [34, 34, 34]);
    }

    #[test]
    fn rejects_bad_values() {
        let zero_dt = SimulationConfig {
            dt: 0.0,
            ..SimulationConfig::default()
        };
        assert!(matches!(
            zero_dt.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let no_workers = SimulationConfig {
            worker_threads: Some(0),
            ..SimulationConfig::default()
        };
        assert!(no_workers.validate().is_err());

        let bad_mesh = SimulationConfig {
            domain: MeshSpec::cube(10.0, -1.0),
            ..SimulationConfig::default()
        };
        assert!(matches!(bad_mesh.validate(), Err(ConfigError::Index(_))));

        let bad_membrane = SimulationConfig {
            membrane: Membrane::Sphere {
                center: DVec3::ZERO,
                radius: 0.0,
            },
            ..SimulationConfig::default()
        };
        assert!(bad_membrane.validate().is_err());
    }
}

//! Read-only view of the reaction-diffusion field agents sample each step.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Substrate field owned by an external solver.
///
/// The core only samples it; secretion and uptake rates live on each agent and are
/// read back by whoever integrates the field.
pub trait Microenvironment: Send + Sync {
    /// Number of substrates every density vector carries.
    fn substrate_count(&self) -> usize;

    /// Concentrations at the field voxel nearest to `position`.
    fn nearest_density_vector(&self, position: DVec3) -> Vec<f64>;

    /// Gradient of `substrate` at the field voxel nearest to `position`.
    fn nearest_gradient(&self, substrate: usize, position: DVec3) -> DVec3;
}

/// Spatially constant field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformField {
    pub densities: Vec<f64>,
    pub gradients: Vec<DVec3>,
}

impl UniformField {
    /// Field with the given densities and zero gradients.
    #[must_use]
    pub fn new(densities: Vec<f64>) -> Self {
        let gradients = vec![DVec3::ZERO; densities.len()];
        Self {
            densities,
            gradients,
        }
    }

    /// Replace the gradient of one substrate.
    #[must_use]
    pub fn with_gradient(mut self, substrate: usize, gradient: DVec3) -> Self {
        if let Some(slot) = self.gradients.get_mut(substrate) {
            *slot = gradient;
        }
        self
    }
}

impl Microenvironment for UniformField {
    fn substrate_count(&self) -> usize {
        self.densities.len()
    }

    fn nearest_density_vector(&self, _position: DVec3) -> Vec<f64> {
        self.densities.clone()
    }

    fn nearest_gradient(&self, substrate: usize, _position: DVec3) -> DVec3 {
        self.gradients.get(substrate).copied().unwrap_or(DVec3::ZERO)
    }
}

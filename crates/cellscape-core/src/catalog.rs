//! Immutable per-type tables resolved once before the step loop starts.

use crate::cell::{Cell, CellFunctions, CustomData, Phenotype};
use crate::config::ConfigError;
use crate::phase::{ModelId, PhaseModel, PhaseModelError};
use glam::DVec3;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::HashSet;

/// Dense identifier of a cell definition.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CellTypeId(pub usize);

/// Template every cell of a type is instantiated from.
#[derive(Debug, Clone)]
pub struct CellDefinition {
    pub name: String,
    pub cycle_model: ModelId,
    /// Starting phase; the model's default phase when absent.
    pub initial_phase: Option<usize>,
    pub phenotype: Phenotype,
    pub custom: CustomData,
    pub functions: CellFunctions,
    pub polarity: f64,
    pub orientation: DVec3,
}

impl CellDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, cycle_model: ModelId) -> Self {
        Self {
            name: name.into(),
            cycle_model,
            initial_phase: None,
            phenotype: Phenotype::default(),
            custom: CustomData::default(),
            functions: CellFunctions::default(),
            polarity: 0.0,
            orientation: DVec3::Z,
        }
    }
}

/// Collects phase models and cell definitions, then resolves them into a [`Catalog`].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    models: SlotMap<ModelId, PhaseModel<Cell>>,
    definitions: Vec<CellDefinition>,
}

impl CatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_model(&mut self, model: PhaseModel<Cell>) -> ModelId {
        self.models.insert(model)
    }

    #[must_use]
    pub fn model_mut(&mut self, id: ModelId) -> Option<&mut PhaseModel<Cell>> {
        self.models.get_mut(id)
    }

    /// Register a cell definition; ids follow registration order.
    pub fn define(&mut self, definition: CellDefinition) -> CellTypeId {
        self.definitions.push(definition);
        CellTypeId(self.definitions.len() - 1)
    }

    #[must_use]
    pub fn definition_mut(&mut self, id: CellTypeId) -> Option<&mut CellDefinition> {
        self.definitions.get_mut(id.0)
    }

    /// Resolve defaults and check every cross reference against `substrate_count`
    /// substrates.
    pub fn build(self, substrate_count: usize) -> Result<Catalog, ConfigError> {
        for model in self.models.values() {
            model.validate()?;
        }

        let type_count = self.definitions.len();
        let mut seen = HashSet::new();
        let mut definitions = self.definitions;
        for definition in &mut definitions {
            if !seen.insert(definition.name.clone()) {
                return Err(ConfigError::DuplicateCellType(definition.name.clone()));
            }
            resolve_definition(definition, &self.models, type_count, substrate_count)?;
        }

        Ok(Catalog {
            models: self.models,
            definitions,
            substrate_count,
        })
    }
}

fn resolve_definition(
    definition: &mut CellDefinition,
    models: &SlotMap<ModelId, PhaseModel<Cell>>,
    type_count: usize,
    substrate_count: usize,
) -> Result<(), ConfigError> {
    let name = definition.name.clone();
    let invalid = |reason| ConfigError::InvalidCellType {
        cell_type: name.clone(),
        reason,
    };

    let model = models
        .get(definition.cycle_model)
        .ok_or_else(|| ConfigError::UnknownModel {
            cell_type: name.clone(),
        })?;
    let phase = definition.initial_phase.unwrap_or(model.default_phase());
    if model.phase(phase).is_none() {
        return Err(PhaseModelError::PhaseOutOfRange {
            model: model.name().to_owned(),
            index: phase,
        }
        .into());
    }
    definition.phenotype.cycle = model.start_state(definition.cycle_model, phase);

    let death = &mut definition.phenotype.death;
    if death.models.len() != death.rates.len() {
        return Err(ConfigError::VectorLength {
            cell_type: name.clone(),
            what: "death rates",
            expected: death.models.len(),
            found: death.rates.len(),
        });
    }
    if death.models.iter().any(|id| !models.contains_key(*id)) {
        return Err(ConfigError::UnknownModel {
            cell_type: name.clone(),
        });
    }
    if death.rates.iter().any(|rate| !rate.is_finite() || *rate < 0.0) {
        return Err(invalid("death rates must be non-negative"));
    }

    let volume = &definition.phenotype.volume;
    if !(volume.total.is_finite() && volume.total > 0.0) {
        return Err(invalid("total volume must be positive"));
    }
    if volume.fluid_change_rate < 0.0 || volume.solid_change_rate < 0.0 {
        return Err(invalid("volume change rates must be non-negative"));
    }

    let mechanics = &mut definition.phenotype.mechanics;
    if mechanics.max_adhesion_multiplier < 0.0
        || mechanics.adhesion_strength < 0.0
        || mechanics.repulsion_strength < 0.0
        || mechanics.elastic_constant < 0.0
        || mechanics.attachment_rate < 0.0
        || mechanics.detachment_rate < 0.0
    {
        return Err(invalid("mechanics parameters must be non-negative"));
    }
    resolve_table(&mut mechanics.affinities, type_count, 1.0, &name, "affinities")?;

    let motility = &definition.phenotype.motility;
    if motility.persistence_time < 0.0
        || motility.migration_speed < 0.0
        || !(0.0..=1.0).contains(&motility.migration_bias)
    {
        return Err(invalid(
            "motility needs non-negative persistence and speed, bias in [0, 1]",
        ));
    }
    if let Some(chemotaxis) = motility.chemotaxis {
        if chemotaxis.substrate >= substrate_count {
            return Err(ConfigError::UnknownSubstrate {
                cell_type: name.clone(),
                index: chemotaxis.substrate,
                count: substrate_count,
            });
        }
    }

    let interactions = &mut definition.phenotype.interactions;
    resolve_table(
        &mut interactions.live_phagocytosis_rates,
        type_count,
        0.0,
        &name,
        "live phagocytosis rates",
    )?;
    resolve_table(&mut interactions.attack_rates, type_count, 0.0, &name, "attack rates")?;
    resolve_table(&mut interactions.fusion_rates, type_count, 0.0, &name, "fusion rates")?;

    let secretion = &mut definition.phenotype.secretion;
    for (rates, what) in [
        (&secretion.secretion_rates, "secretion rates"),
        (&secretion.uptake_rates, "uptake rates"),
        (&secretion.saturation_densities, "saturation densities"),
        (&secretion.net_export_rates, "net export rates"),
        (&secretion.internalized, "internalized substrates"),
    ] {
        if !rates.is_empty() && rates.len() != substrate_count {
            return Err(ConfigError::VectorLength {
                cell_type: name.clone(),
                what,
                expected: substrate_count,
                found: rates.len(),
            });
        }
    }
    secretion.resize(substrate_count);

    if !(0.0..=1.0).contains(&definition.polarity) {
        return Err(invalid("polarity must lie in [0, 1]"));
    }
    definition.orientation = definition.orientation.try_normalize().unwrap_or(DVec3::Z);
    Ok(())
}

fn resolve_table(
    table: &mut Vec<f64>,
    type_count: usize,
    fill: f64,
    cell_type: &str,
    what: &'static str,
) -> Result<(), ConfigError> {
    if table.is_empty() {
        table.resize(type_count, fill);
        return Ok(());
    }
    if table.len() != type_count {
        return Err(ConfigError::VectorLength {
            cell_type: cell_type.to_owned(),
            what,
            expected: type_count,
            found: table.len(),
        });
    }
    Ok(())
}

/// Fully resolved phase models and cell definitions.
#[derive(Debug, Clone)]
pub struct Catalog {
    models: SlotMap<ModelId, PhaseModel<Cell>>,
    definitions: Vec<CellDefinition>,
    substrate_count: usize,
}

impl Catalog {
    #[must_use]
    pub fn model(&self, id: ModelId) -> Option<&PhaseModel<Cell>> {
        self.models.get(id)
    }

    #[must_use]
    pub fn definition(&self, id: CellTypeId) -> Option<&CellDefinition> {
        self.definitions.get(id.0)
    }

    #[must_use]
    pub fn definitions(&self) -> &[CellDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn type_count(&self) -> usize {
        self.definitions.len()
    }

    #[must_use]
    pub const fn substrate_count(&self) -> usize {
        self.substrate_count
    }

    /// Look a cell type up by name.
    pub fn find_type(&self, name: &str) -> Result<CellTypeId, ConfigError> {
        self.definitions
            .iter()
            .position(|definition| definition.name == name)
            .map(CellTypeId)
            .ok_or_else(|| ConfigError::UnknownCellType(name.to_owned()))
    }

    /// Look a phase up by name within a registered model.
    pub fn find_phase(&self, model: ModelId, phase: &str) -> Result<usize, ConfigError> {
        let model = self.models.get(model).ok_or(ConfigError::InvalidConfig(
            "phase lookup against an unregistered model",
        ))?;
        Ok(model.phase_index(phase)?)
    }

    /// Unplaced cell built from the definition of `type_id`.
    pub fn instantiate(&self, type_id: CellTypeId) -> Result<Cell, ConfigError> {
        let definition = self
            .definition(type_id)
            .ok_or_else(|| ConfigError::UnknownCellType(format!("#{}", type_id.0)))?;
        let mut cell = Cell::new(type_id, definition.phenotype.clone());
        cell.custom = definition.custom.clone();
        cell.functions = definition.functions;
        cell.polarity = definition.polarity;
        cell.orientation = definition.orientation;
        Ok(cell)
    }
}

//! Stock cycle and death models with their entry hooks.

use crate::catalog::CatalogBuilder;
use crate::cell::Cell;
use crate::phase::{LinkTiming, ModelId, PhaseModel, PhaseModelError};

/// Per-minute rate of the single-phase live model.
pub const LIVE_CYCLE_RATE: f64 = 0.0432 / 60.0;
/// Apoptotic bodies persist this many minutes before clearance.
pub const APOPTOSIS_DURATION: f64 = 516.0;
/// Lysed necrotic debris persists this many minutes before clearance.
pub const NECROSIS_LYSED_DURATION: f64 = 60.0 * 24.0 * 60.0;
/// Swollen necrotic cells burst at this multiple of their volume at death.
pub const RELATIVE_RUPTURE_VOLUME: f64 = 2.0;

/// Ids of the stock models registered by [`StandardModels::register`].
#[derive(Debug, Clone, Copy)]
pub struct StandardModels {
    pub live: ModelId,
    pub ki67_basic: ModelId,
    pub ki67_advanced: ModelId,
    pub flow_cytometry: ModelId,
    pub cycling_quiescent: ModelId,
    pub apoptosis: ModelId,
    pub necrosis: ModelId,
}

impl StandardModels {
    /// Register every stock model into `builder`.
    pub fn register(builder: &mut CatalogBuilder) -> Result<Self, PhaseModelError> {
        Ok(Self {
            live: builder.add_model(live()?),
            ki67_basic: builder.add_model(ki67_basic()?),
            ki67_advanced: builder.add_model(ki67_advanced()?),
            flow_cytometry: builder.add_model(flow_cytometry()?),
            cycling_quiescent: builder.add_model(cycling_quiescent()?),
            apoptosis: builder.add_model(apoptosis()?),
            necrosis: builder.add_model(necrosis()?),
        })
    }
}

/// One phase that divides every time it loops back on itself.
pub fn live() -> Result<PhaseModel<Cell>, PhaseModelError> {
    let mut model = PhaseModel::new("live");
    let live = model.add_phase("live");
    model.add_link(live, live, LIVE_CYCLE_RATE, LinkTiming::Stochastic)?;
    let phase = model.phase_mut(live)?;
    phase.entry = Some(double_target_solid);
    phase.division_at_exit = true;
    Ok(model)
}

pub fn ki67_basic() -> Result<PhaseModel<Cell>, PhaseModelError> {
    let mut model = PhaseModel::new("Ki67 (basic)");
    let negative = model.add_phase("Ki67-");
    let positive = model.add_phase("Ki67+");
    model.add_link(negative, positive, 1.0 / (4.59 * 60.0), LinkTiming::Stochastic)?;
    model.add_link(positive, negative, 1.0 / (15.5 * 60.0), LinkTiming::FixedDuration)?;
    let phase = model.phase_mut(positive)?;
    phase.entry = Some(double_target_solid);
    phase.division_at_exit = true;
    Ok(model)
}

pub fn ki67_advanced() -> Result<PhaseModel<Cell>, PhaseModelError> {
    let mut model = PhaseModel::new("Ki67 (advanced)");
    let negative = model.add_phase("Ki67-");
    let premitotic = model.add_phase("Ki67+ (premitotic)");
    let postmitotic = model.add_phase("Ki67+ (postmitotic)");
    model.add_link(negative, premitotic, 1.0 / (3.62 * 60.0), LinkTiming::Stochastic)?;
    model.add_link(premitotic, postmitotic, 1.0 / (13.0 * 60.0), LinkTiming::FixedDuration)?;
    model.add_link(postmitotic, negative, 1.0 / (2.5 * 60.0), LinkTiming::FixedDuration)?;
    let phase = model.phase_mut(premitotic)?;
    phase.entry = Some(double_target_solid);
    phase.division_at_exit = true;
    Ok(model)
}

pub fn flow_cytometry() -> Result<PhaseModel<Cell>, PhaseModelError> {
    let mut model = PhaseModel::new("flow cytometry");
    let g0g1 = model.add_phase("G0/G1");
    let s = model.add_phase("S");
    let g2m = model.add_phase("G2/M");
    model.add_link(g0g1, s, 0.00324, LinkTiming::Stochastic)?;
    model.add_link(s, g2m, 0.00208, LinkTiming::Stochastic)?;
    model.add_link(g2m, g0g1, 0.00333, LinkTiming::Stochastic)?;
    model.phase_mut(s)?.entry = Some(double_target_solid);
    model.phase_mut(g2m)?.division_at_exit = true;
    Ok(model)
}

pub fn cycling_quiescent() -> Result<PhaseModel<Cell>, PhaseModelError> {
    let mut model = PhaseModel::new("cycling-quiescent");
    let quiescent = model.add_phase("quiescent");
    let cycling = model.add_phase("cycling");
    model.add_link(quiescent, cycling, 1.0 / (4.59 * 60.0), LinkTiming::Stochastic)?;
    model.add_link(cycling, quiescent, 1.0 / (15.5 * 60.0), LinkTiming::FixedDuration)?;
    let phase = model.phase_mut(cycling)?;
    phase.entry = Some(double_target_solid);
    phase.division_at_exit = true;
    Ok(model)
}

pub fn apoptosis() -> Result<PhaseModel<Cell>, PhaseModelError> {
    let mut model = PhaseModel::new("apoptosis");
    let apoptotic = model.add_phase("apoptotic");
    let debris = model.add_phase("debris");
    model.add_link(apoptotic, debris, 1.0 / APOPTOSIS_DURATION, LinkTiming::FixedDuration)?;
    let phase = model.phase_mut(apoptotic)?;
    phase.entry = Some(shrink_for_apoptosis);
    phase.removal_at_exit = true;
    Ok(model)
}

pub fn necrosis() -> Result<PhaseModel<Cell>, PhaseModelError> {
    let mut model = PhaseModel::new("necrosis");
    let swelling = model.add_phase("necrotic (swelling)");
    let lysed = model.add_phase("necrotic (lysed)");
    let debris = model.add_phase("debris");
    model
        .add_link(swelling, lysed, 9e9, LinkTiming::FixedDuration)?
        .arrest = Some(not_yet_ruptured);
    model.add_link(lysed, debris, 1.0 / NECROSIS_LYSED_DURATION, LinkTiming::FixedDuration)?;
    model.phase_mut(swelling)?.entry = Some(swell_for_necrosis);
    let phase = model.phase_mut(lysed)?;
    phase.entry = Some(lyse);
    phase.removal_at_exit = true;
    Ok(model)
}

/// Doubling the solid target makes the cell grow toward twice its size before dividing.
pub fn double_target_solid(cell: &mut Cell, _dt: f64) {
    cell.phenotype.volume.target_solid *= 2.0;
}

pub fn shrink_for_apoptosis(cell: &mut Cell, _dt: f64) {
    let volume = &mut cell.phenotype.volume;
    volume.target_solid = 0.0;
    volume.target_fluid_fraction = 0.0;
    volume.fluid_change_rate = 3.0 / 60.0;
    volume.solid_change_rate = 1.0 / 60.0;
}

pub fn swell_for_necrosis(cell: &mut Cell, _dt: f64) {
    let volume = &mut cell.phenotype.volume;
    volume.target_solid = 0.0;
    volume.target_fluid_fraction = 1.0;
    volume.fluid_change_rate = 0.67 / 60.0;
    volume.solid_change_rate = 0.0053 / 60.0;
    volume.rupture_threshold = RELATIVE_RUPTURE_VOLUME * volume.total;
}

pub fn lyse(cell: &mut Cell, _dt: f64) {
    let volume = &mut cell.phenotype.volume;
    volume.target_fluid_fraction = 0.0;
    volume.fluid_change_rate = 0.05 / 60.0;
}

/// Swelling holds until the cell reaches its rupture volume.
pub fn not_yet_ruptured(cell: &Cell, _dt: f64) -> bool {
    cell.phenotype.volume.total < cell.phenotype.volume.rupture_threshold
}

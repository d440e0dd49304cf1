//! Structural mutation at the serial barrier: divisions first, then removals.

use crate::AgentHandle;
use crate::cell::{Cell, CellFlags, CellState};
use crate::container::CellContainer;
use crate::rng::random_unit_vector;
use glam::DVec3;
use rand::RngCore;
use tracing::trace;

/// Default division axis: uniform on the sphere, or on the circle for 2D motility.
pub fn standard_orientation(cell: &Cell, rng: &mut dyn RngCore) -> DVec3 {
    random_unit_vector(rng, cell.phenotype.motility.restrict_to_2d)
}

/// Pull `axis` toward the plane normal to the cell's orientation by its polarity.
fn polarize(axis: DVec3, orientation: DVec3, polarity: f64) -> DVec3 {
    let normal = orientation.normalize_or_zero();
    axis - polarity * axis.dot(normal) * normal
}

/// Split `parent` in two. The daughter is appended, so its handle is the live count
/// before the call. Returns `None` if the handle is stale.
///
/// Mass, internalized substrates and conserved custom data are halved between the
/// two cells. The pair is separated along the division axis by the parent radius.
pub fn divide(
    container: &mut CellContainer,
    parent: AgentHandle,
    rng: &mut dyn RngCore,
) -> Option<AgentHandle> {
    let planar = container.mesh().is_planar();
    let cell = container.get_mut(parent)?;
    cell.flags.division_pending = false;

    let sampler = cell.functions.division_orientation.unwrap_or(standard_orientation);
    let mut axis = polarize(sampler(cell, rng), cell.orientation, cell.polarity);
    if planar {
        axis.z = 0.0;
    }
    let axis = axis.try_normalize().unwrap_or(DVec3::X);
    let offset = 0.5 * cell.radius * axis;

    cell.phenotype.volume.multiply_by_ratio(0.5);
    cell.radius = cell.phenotype.volume.radius();
    for amount in &mut cell.phenotype.secretion.internalized {
        *amount *= 0.5;
    }
    cell.custom.halve_conserved();

    let origin = cell.position;
    let mut daughter = cell.clone();
    daughter.state = CellState::default();
    daughter.flags = CellFlags::default();
    daughter.velocity = DVec3::ZERO;
    daughter.previous_velocity = DVec3::ZERO;
    cell.position = origin - offset;

    if let Some(hook) = cell.functions.post_division {
        hook(cell, &mut daughter);
    }

    let child = container.create(daughter);
    container.assign_position(child, origin + offset);
    container.update_voxel(parent);
    trace!(parent = parent.0, child = child.0, "cell divided");
    Some(child)
}

/// Destroy every listed cell, highest handle first so that no pending handle is
/// renamed before its turn. Duplicates are ignored. Returns the number removed.
pub fn remove_all(container: &mut CellContainer, mut handles: Vec<AgentHandle>) -> usize {
    handles.sort_unstable();
    handles.dedup();
    let mut removed = 0;
    for handle in handles.into_iter().rev() {
        if container.destroy(handle).is_some() {
            trace!(agent = handle.0, "cell removed");
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CellTypeId;
    use crate::cell::Phenotype;
    use cellscape_index::MeshSpec;
    use rand::{SeedableRng, rngs::SmallRng};

    fn container_with(count: usize) -> CellContainer {
        let mut container = CellContainer::new(MeshSpec::cube(200.0, 30.0)).expect("container");
        for i in 0..count {
            let mut phenotype = Phenotype::default();
            phenotype.secretion.internalized = vec![2.0];
            let mut cell = Cell::new(CellTypeId(0), phenotype);
            cell.custom.insert("protein", 8.0, true);
            cell.custom.insert("label", i as f64, false);
            let handle = container.create(cell);
            container.assign_position(handle, DVec3::new(i as f64 * 40.0 - 100.0, 0.0, 0.0));
        }
        container
    }

    #[test]
    fn division_halves_conserved_quantities() {
        let mut container = container_with(1);
        let parent = AgentHandle(0);
        let total = container.get(parent).expect("parent").phenotype.volume.total;
        let mut rng = SmallRng::seed_from_u64(9);

        let child = divide(&mut container, parent, &mut rng).expect("divided");
        assert_eq!(child, AgentHandle(1));
        for handle in [parent, child] {
            let cell = container.get(handle).expect("cell");
            assert!((cell.phenotype.volume.total - total / 2.0).abs() < 1e-9);
            assert_eq!(cell.phenotype.secretion.internalized, vec![1.0]);
            assert_eq!(cell.custom.get("protein"), Some(4.0));
            assert_eq!(cell.custom.get("label"), Some(0.0));
        }
    }

    #[test]
    fn daughters_are_separated_by_the_parent_radius() {
        let mut container = container_with(1);
        let parent = AgentHandle(0);
        let before = container.get(parent).expect("parent");
        let (origin, radius) = (before.position, before.radius);
        let mut rng = SmallRng::seed_from_u64(10);

        let child = divide(&mut container, parent, &mut rng).expect("divided");
        let a = container.get(parent).expect("parent").position;
        let b = container.get(child).expect("child").position;
        assert!(((a - b).length() - radius).abs() < 1e-9);
        assert!(((a + b) * 0.5 - origin).length() < 1e-9);
        assert!(container.get(child).expect("child").voxel.is_some());
    }

    #[test]
    fn polarity_one_keeps_the_axis_in_the_orientation_plane() {
        let mut container = container_with(1);
        let cell = container.get_mut(AgentHandle(0)).expect("cell");
        cell.orientation = DVec3::Z;
        cell.polarity = 1.0;
        let origin = cell.position;
        let mut rng = SmallRng::seed_from_u64(11);
        let child = divide(&mut container, AgentHandle(0), &mut rng).expect("divided");
        let position = container.get(child).expect("child").position;
        assert!((position.z - origin.z).abs() < 1e-9);
    }

    #[test]
    fn removal_order_is_irrelevant_to_the_survivors() {
        let mut container = container_with(6);
        let removed = remove_all(
            &mut container,
            vec![AgentHandle(1), AgentHandle(5), AgentHandle(1), AgentHandle(3)],
        );
        assert_eq!(removed, 3);
        assert_eq!(container.len(), 3);
        let mut labels: Vec<f64> = container
            .cells()
            .iter()
            .map(|cell| cell.custom.get("label").expect("label"))
            .collect();
        labels.sort_by(f64::total_cmp);
        assert_eq!(labels, vec![0.0, 2.0, 4.0]);
        for (slot, cell) in container.cells().iter().enumerate() {
            assert_eq!(cell.handle, AgentHandle(slot));
        }
    }
}

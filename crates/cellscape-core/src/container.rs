//! Dense agent registry paired with the voxel index.
//!
//! A handle is the cell's slot in the dense array. Removal swaps the last cell into
//! the vacated slot, so every relation that names the moved cell (voxel bucket,
//! attachments, neighbor lists) is renamed on the spot.

use crate::AgentHandle;
use crate::cell::Cell;
use crate::config::ConfigError;
use cellscape_index::{MeshSpec, VoxelIndex, VoxelMesh};
use glam::DVec3;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CellContainer {
    cells: Vec<Cell>,
    index: VoxelIndex<AgentHandle>,
}

impl CellContainer {
    /// Create an empty container over the mesh described by `spec`.
    pub fn new(spec: MeshSpec) -> Result<Self, ConfigError> {
        Ok(Self::from_mesh(VoxelMesh::new(spec)?))
    }

    #[must_use]
    pub fn from_mesh(mesh: VoxelMesh) -> Self {
        Self {
            cells: Vec::new(),
            index: VoxelIndex::from_mesh(mesh),
        }
    }

    /// Number of live cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Per-cell mutable access; structural changes go through the container.
    #[must_use]
    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    #[must_use]
    pub fn get(&self, handle: AgentHandle) -> Option<&Cell> {
        self.cells.get(handle.0)
    }

    #[must_use]
    pub fn get_mut(&mut self, handle: AgentHandle) -> Option<&mut Cell> {
        self.cells.get_mut(handle.0)
    }

    #[must_use]
    pub const fn index(&self) -> &VoxelIndex<AgentHandle> {
        &self.index
    }

    #[must_use]
    pub fn mesh(&self) -> &VoxelMesh {
        self.index.mesh()
    }

    pub(crate) fn split(&mut self) -> (&mut [Cell], &VoxelIndex<AgentHandle>) {
        (&mut self.cells, &self.index)
    }

    /// Append `cell` and return its handle. It joins no voxel until a position is
    /// assigned.
    pub fn create(&mut self, mut cell: Cell) -> AgentHandle {
        let handle = AgentHandle(self.cells.len());
        cell.handle = handle;
        cell.voxel = None;
        self.cells.push(cell);
        handle
    }

    /// Place a cell, registering it with the voxel under `position`.
    ///
    /// Positions outside the domain are not an error: the cell leaves its voxel and is
    /// flagged out of domain, inactive and immovable, and `false` is returned.
    pub fn assign_position(&mut self, handle: AgentHandle, position: DVec3) -> bool {
        let Some(cell) = self.cells.get_mut(handle.0) else {
            return false;
        };
        cell.position = position;
        if !self.index.mesh().is_position_valid(position) {
            if let Some(voxel) = cell.voxel.take() {
                self.index.detach(handle, voxel);
            }
            if !cell.flags.out_of_domain {
                warn!(agent = handle.0, ?position, "cell left the domain");
            }
            cell.flags.out_of_domain = true;
            cell.flags.active = false;
            cell.flags.movable = false;
            return false;
        }

        let voxel = self.index.mesh().nearest_voxel(position);
        let reach = cell.interactive_distance();
        match cell.voxel {
            Some(current) => self.index.relocate(handle, current, voxel, reach),
            None => self.index.attach(handle, voxel, reach),
        }
        cell.voxel = Some(voxel);
        true
    }

    /// Re-register a cell at its stored position after it moved or grew.
    pub fn update_voxel(&mut self, handle: AgentHandle) -> bool {
        match self.cells.get(handle.0) {
            Some(cell) if !cell.flags.out_of_domain => {
                let position = cell.position;
                self.assign_position(handle, position)
            }
            _ => false,
        }
    }

    /// Remove a cell, cleaning up every relation on both sides, then compact.
    ///
    /// Only call this outside the parallel passes.
    pub fn destroy(&mut self, handle: AgentHandle) -> Option<Cell> {
        let slot = handle.0;
        if slot >= self.cells.len() {
            return None;
        }

        let state = &mut self.cells[slot].state;
        let springs = std::mem::take(&mut state.spring_attachments);
        let rigid = std::mem::take(&mut state.rigid_attachments);
        let neighbors = std::mem::take(&mut state.neighbors);
        for partner in springs {
            if let Some(other) = self.cells.get_mut(partner.0) {
                other.state.spring_attachments.retain(|h| *h != handle);
            }
        }
        for partner in rigid {
            if let Some(other) = self.cells.get_mut(partner.0) {
                other.state.rigid_attachments.retain(|h| *h != handle);
            }
        }
        for neighbor in neighbors {
            if let Some(other) = self.cells.get_mut(neighbor.0) {
                other.state.neighbors.retain(|h| *h != handle);
            }
        }

        let cell = &mut self.cells[slot];
        cell.phenotype.secretion.internalized.fill(0.0);
        if let Some(voxel) = cell.voxel.take() {
            self.index.detach(handle, voxel);
        }

        let removed = self.cells.swap_remove(slot);
        if slot < self.cells.len() {
            self.rename(AgentHandle(self.cells.len()), handle);
        }
        Some(removed)
    }

    /// The cell formerly at `old` now lives at `new`; rewrite every reference to it.
    fn rename(&mut self, old: AgentHandle, new: AgentHandle) {
        let moved = &mut self.cells[new.0];
        moved.handle = new;
        if let Some(voxel) = moved.voxel {
            self.index.rename(voxel, old, new);
        }
        let springs = moved.state.spring_attachments.clone();
        let rigid = moved.state.rigid_attachments.clone();
        let neighbors = moved.state.neighbors.clone();
        for partner in springs {
            rename_in(&mut self.cells[partner.0].state.spring_attachments, old, new);
        }
        for partner in rigid {
            rename_in(&mut self.cells[partner.0].state.rigid_attachments, old, new);
        }
        for neighbor in neighbors {
            rename_in(&mut self.cells[neighbor.0].state.neighbors, old, new);
        }
    }

    /// Join two cells with a spring; false if either is full or they are already joined.
    pub fn attach_springs(&mut self, a: AgentHandle, b: AgentHandle) -> bool {
        if a == b || a.0 >= self.cells.len() || b.0 >= self.cells.len() {
            return false;
        }
        let (first, second) = (&self.cells[a.0], &self.cells[b.0]);
        if first.state.spring_attachments.contains(&b)
            || first.state.spring_attachments.len() >= first.phenotype.mechanics.max_attachments
            || second.state.spring_attachments.len() >= second.phenotype.mechanics.max_attachments
        {
            return false;
        }
        self.cells[a.0].state.spring_attachments.push(b);
        self.cells[b.0].state.spring_attachments.push(a);
        true
    }

    pub fn detach_springs(&mut self, a: AgentHandle, b: AgentHandle) {
        if let Some(cell) = self.cells.get_mut(a.0) {
            cell.state.spring_attachments.retain(|h| *h != b);
        }
        if let Some(cell) = self.cells.get_mut(b.0) {
            cell.state.spring_attachments.retain(|h| *h != a);
        }
    }

    /// Rigidly bind two cells.
    pub fn attach_rigid(&mut self, a: AgentHandle, b: AgentHandle) -> bool {
        if a == b || a.0 >= self.cells.len() || b.0 >= self.cells.len() {
            return false;
        }
        if self.cells[a.0].state.rigid_attachments.contains(&b) {
            return false;
        }
        self.cells[a.0].state.rigid_attachments.push(b);
        self.cells[b.0].state.rigid_attachments.push(a);
        true
    }

    pub fn detach_rigid(&mut self, a: AgentHandle, b: AgentHandle) {
        if let Some(cell) = self.cells.get_mut(a.0) {
            cell.state.rigid_attachments.retain(|h| *h != b);
        }
        if let Some(cell) = self.cells.get_mut(b.0) {
            cell.state.rigid_attachments.retain(|h| *h != a);
        }
    }
}

fn rename_in(list: &mut [AgentHandle], old: AgentHandle, new: AgentHandle) {
    for entry in list.iter_mut().filter(|h| **h == old) {
        *entry = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CellTypeId;
    use crate::cell::Phenotype;

    fn container() -> CellContainer {
        CellContainer::new(MeshSpec::cube(100.0, 20.0)).expect("container")
    }

    fn sample_cell() -> Cell {
        Cell::new(CellTypeId(0), Phenotype::default())
    }

    fn assert_consistent(container: &CellContainer) {
        for (slot, cell) in container.cells().iter().enumerate() {
            assert_eq!(cell.handle, AgentHandle(slot));
            if let Some(voxel) = cell.voxel {
                assert_eq!(voxel, container.mesh().nearest_voxel(cell.position));
                assert!(container.index().bucket(voxel).contains(&cell.handle));
            }
            for partner in &cell.state.spring_attachments {
                let other = container.get(*partner).expect("spring partner alive");
                assert!(other.state.spring_attachments.contains(&cell.handle));
            }
            for partner in &cell.state.rigid_attachments {
                let other = container.get(*partner).expect("rigid partner alive");
                assert!(other.state.rigid_attachments.contains(&cell.handle));
            }
        }
        let placed = container.cells().iter().filter(|c| c.voxel.is_some()).count();
        assert_eq!(container.index().resident_count(), placed);
    }

    #[test]
    fn create_assigns_dense_handles() {
        let mut container = container();
        let a = container.create(sample_cell());
        let b = container.create(sample_cell());
        assert_eq!((a, b), (AgentHandle(0), AgentHandle(1)));
        assert_eq!(container.get(a).expect("cell").voxel, None);
        assert_eq!(container.index().resident_count(), 0);
    }

    #[test]
    fn assign_position_round_trips() {
        let mut container = container();
        let handle = container.create(sample_cell());
        let position = DVec3::new(12.5, -40.0, 3.0);
        assert!(container.assign_position(handle, position));
        let cell = container.get(handle).expect("cell");
        assert_eq!(cell.position, position);
        assert_eq!(cell.voxel, Some(container.mesh().nearest_voxel(position)));
        assert_consistent(&container);

        assert!(container.assign_position(handle, DVec3::new(90.0, 90.0, 90.0)));
        assert_consistent(&container);
        let voxel = container.get(handle).and_then(|c| c.voxel).expect("voxel");
        assert!(container.index().max_interactive_distance(voxel) > 0.0);
    }

    #[test]
    fn out_of_domain_placement_is_flagged() {
        let mut container = container();
        let handle = container.create(sample_cell());
        assert!(container.assign_position(handle, DVec3::ZERO));
        assert!(!container.assign_position(handle, DVec3::new(500.0, 0.0, 0.0)));
        let cell = container.get(handle).expect("cell");
        assert!(cell.flags.out_of_domain);
        assert!(!cell.flags.active);
        assert!(!cell.flags.movable);
        assert_eq!(cell.voxel, None);
        assert_eq!(container.index().resident_count(), 0);
    }

    #[test]
    fn destroy_compacts_and_renames_the_moved_cell() {
        let mut container = container();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let handle = container.create(sample_cell());
                container.assign_position(handle, DVec3::splat(i as f64 * 30.0 - 45.0));
                handle
            })
            .collect();
        assert!(container.attach_springs(handles[3], handles[0]));
        assert!(container.attach_rigid(handles[3], handles[2]));
        container.cells_mut()[1].state.neighbors.push(handles[3]);
        container.cells_mut()[3].state.neighbors.push(handles[1]);

        let removed = container.destroy(handles[1]).expect("removed");
        assert_eq!(removed.handle, AgentHandle(1));
        assert_eq!(container.len(), 3);
        assert_consistent(&container);

        let moved = container.get(AgentHandle(1)).expect("moved cell");
        assert_eq!(moved.position, DVec3::splat(45.0));
        assert_eq!(moved.state.spring_attachments, vec![AgentHandle(0)]);
        assert_eq!(moved.state.rigid_attachments, vec![AgentHandle(2)]);
        assert!(moved.state.neighbors.is_empty());
        assert_eq!(
            container.get(AgentHandle(0)).expect("cell").state.spring_attachments,
            vec![AgentHandle(1)]
        );
        assert!(container.destroy(AgentHandle(7)).is_none());
    }

    #[test]
    fn destroying_the_last_cell_needs_no_rename() {
        let mut container = container();
        let a = container.create(sample_cell());
        let b = container.create(sample_cell());
        container.assign_position(a, DVec3::ZERO);
        container.assign_position(b, DVec3::ONE);
        assert!(container.attach_springs(a, b));
        container.destroy(b).expect("removed");
        assert_consistent(&container);
        assert!(container.cells()[0].state.spring_attachments.is_empty());
    }

    #[test]
    fn springs_respect_capacity() {
        let mut container = container();
        let a = container.create(sample_cell());
        let b = container.create(sample_cell());
        let c = container.create(sample_cell());
        container.cells_mut()[0].phenotype.mechanics.max_attachments = 1;
        assert!(container.attach_springs(a, b));
        assert!(!container.attach_springs(a, b));
        assert!(!container.attach_springs(c, a));
        assert!(!container.attach_springs(a, a));
        container.detach_springs(b, a);
        assert!(container.attach_springs(c, a));
    }
}

//! Voxelized proximity index backing mechanics neighbor queries.
//!
//! The domain is cut into a coarse mesh of axis-aligned voxels. Every voxel owns a
//! bucket of resident handles and remembers the largest interaction distance any
//! resident has ever carried, which lets neighbor voxels be pruned from a query
//! without touching their residents.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the number of voxels a mesh may allocate.
const MAX_VOXELS: usize = 1 << 26;

/// Errors emitted while building spatial structures.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive voxel size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Dense identifier of a voxel within a [`VoxelMesh`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VoxelId(pub usize);

impl VoxelId {
    /// Returns the dense index of this voxel.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Bounds and resolution of a voxel mesh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MeshSpec {
    /// Lower corner of the domain.
    pub lower: DVec3,
    /// Upper corner of the domain.
    pub upper: DVec3,
    /// Edge length of a voxel along each axis.
    pub voxel_size: DVec3,
}

impl MeshSpec {
    #[must_use]
    pub const fn new(lower: DVec3, upper: DVec3, voxel_size: DVec3) -> Self {
        Self {
            lower,
            upper,
            voxel_size,
        }
    }

    /// Cube centered on the origin with uniform voxels.
    #[must_use]
    pub fn cube(half_width: f64, voxel_edge: f64) -> Self {
        Self::new(
            DVec3::splat(-half_width),
            DVec3::splat(half_width),
            DVec3::splat(voxel_edge),
        )
    }

    /// Square slab one voxel thick, centered on z = 0.
    #[must_use]
    pub fn planar(half_width: f64, voxel_edge: f64) -> Self {
        Self::new(
            DVec3::new(-half_width, -half_width, -0.5 * voxel_edge),
            DVec3::new(half_width, half_width, 0.5 * voxel_edge),
            DVec3::splat(voxel_edge),
        )
    }
}

impl Default for MeshSpec {
    fn default() -> Self {
        Self::cube(500.0, 30.0)
    }
}

/// Immutable voxel geometry: centers and precomputed Moore neighborhoods.
#[derive(Debug, Clone)]
pub struct VoxelMesh {
    spec: MeshSpec,
    dims: [usize; 3],
    centers: Vec<DVec3>,
    moore: Vec<Vec<VoxelId>>,
}

impl VoxelMesh {
    /// Build the mesh described by `spec`.
    pub fn new(spec: MeshSpec) -> Result<Self, IndexError> {
        if !(spec.lower.is_finite() && spec.upper.is_finite() && spec.voxel_size.is_finite()) {
            return Err(IndexError::InvalidConfig("mesh bounds must be finite"));
        }
        if spec.voxel_size.min_element() <= 0.0 {
            return Err(IndexError::InvalidConfig("voxel_size must be positive"));
        }
        if spec.upper.cmplt(spec.lower).any() {
            return Err(IndexError::InvalidConfig(
                "upper mesh bound must not lie below the lower bound",
            ));
        }

        let extent = (spec.upper - spec.lower) / spec.voxel_size;
        let dims = [
            axis_count(extent.x),
            axis_count(extent.y),
            axis_count(extent.z),
        ];
        let total = dims[0]
            .checked_mul(dims[1])
            .and_then(|xy| xy.checked_mul(dims[2]))
            .filter(|count| *count <= MAX_VOXELS)
            .ok_or(IndexError::InvalidConfig("mesh resolution is too fine"))?;

        let mut centers = Vec::with_capacity(total);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let offset = DVec3::new(i as f64 + 0.5, j as f64 + 0.5, k as f64 + 0.5);
                    centers.push(spec.lower + offset * spec.voxel_size);
                }
            }
        }

        let mut moore = Vec::with_capacity(total);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    moore.push(moore_ring(dims, [i, j, k]));
                }
            }
        }

        Ok(Self {
            spec,
            dims,
            centers,
            moore,
        })
    }

    #[must_use]
    pub const fn spec(&self) -> &MeshSpec {
        &self.spec
    }

    /// Voxel counts along x, y and z.
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Total number of voxels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// True when the mesh is a single voxel layer thick along z.
    #[must_use]
    pub const fn is_planar(&self) -> bool {
        self.dims[2] == 1
    }

    /// Inclusive bounds test; non-finite coordinates are never valid.
    #[must_use]
    pub fn is_position_valid(&self, position: DVec3) -> bool {
        position.is_finite()
            && position.cmpge(self.spec.lower).all()
            && position.cmple(self.spec.upper).all()
    }

    /// Voxel containing `position`, clamped onto the mesh when it lies outside.
    #[must_use]
    pub fn nearest_voxel(&self, position: DVec3) -> VoxelId {
        let scaled = ((position - self.spec.lower) / self.spec.voxel_size).floor();
        let i = clamp_axis(scaled.x, self.dims[0]);
        let j = clamp_axis(scaled.y, self.dims[1]);
        let k = clamp_axis(scaled.z, self.dims[2]);
        self.linear([i, j, k])
    }

    /// Integer grid coordinates of `voxel`.
    #[must_use]
    pub const fn coords(&self, voxel: VoxelId) -> [usize; 3] {
        let plane = self.dims[0] * self.dims[1];
        let k = voxel.0 / plane;
        let rem = voxel.0 % plane;
        [rem % self.dims[0], rem / self.dims[0], k]
    }

    #[must_use]
    pub fn center(&self, voxel: VoxelId) -> DVec3 {
        self.centers[voxel.0]
    }

    /// Face, edge and corner adjacent voxels of `voxel`.
    #[must_use]
    pub fn moore_neighbors(&self, voxel: VoxelId) -> &[VoxelId] {
        &self.moore[voxel.0]
    }

    const fn linear(&self, [i, j, k]: [usize; 3]) -> VoxelId {
        VoxelId(i + self.dims[0] * (j + self.dims[1] * k))
    }
}

fn axis_count(extent: f64) -> usize {
    let rounded = extent.ceil();
    if rounded < 1.0 { 1 } else { rounded as usize }
}

fn clamp_axis(scaled: f64, count: usize) -> usize {
    if scaled.is_nan() || scaled <= 0.0 {
        0
    } else {
        (scaled as usize).min(count - 1)
    }
}

fn moore_ring(dims: [usize; 3], at: [usize; 3]) -> Vec<VoxelId> {
    let mut ring = Vec::with_capacity(26);
    for dk in -1_isize..=1 {
        for dj in -1_isize..=1 {
            for di in -1_isize..=1 {
                if di == 0 && dj == 0 && dk == 0 {
                    continue;
                }
                let shifted = [
                    at[0].checked_add_signed(di),
                    at[1].checked_add_signed(dj),
                    at[2].checked_add_signed(dk),
                ];
                let [Some(i), Some(j), Some(k)] = shifted else {
                    continue;
                };
                if i >= dims[0] || j >= dims[1] || k >= dims[2] {
                    continue;
                }
                ring.push(VoxelId(i + dims[0] * (j + dims[1] * k)));
            }
        }
    }
    ring
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex<H> {
    /// Visit every resident that could sit within `reach` of `position`, starting from
    /// the voxel the querying agent lives in. Visitors still filter by exact distance.
    fn visit_candidates(
        &self,
        home: VoxelId,
        position: DVec3,
        reach: f64,
        visitor: &mut dyn FnMut(H),
    );
}

/// Voxel buckets keyed by agent handle.
///
/// The index is the single source of truth for voxel membership: every handle sits
/// in exactly one bucket, and callers move it whenever its recomputed voxel differs.
#[derive(Debug, Clone)]
pub struct VoxelIndex<H> {
    mesh: VoxelMesh,
    buckets: Vec<Vec<H>>,
    max_interactive: Vec<f64>,
}

impl<H: Copy + PartialEq> VoxelIndex<H> {
    /// Create an empty index over the mesh described by `spec`.
    pub fn new(spec: MeshSpec) -> Result<Self, IndexError> {
        Ok(Self::from_mesh(VoxelMesh::new(spec)?))
    }

    #[must_use]
    pub fn from_mesh(mesh: VoxelMesh) -> Self {
        let voxels = mesh.len();
        Self {
            mesh,
            buckets: vec![Vec::new(); voxels],
            max_interactive: vec![0.0; voxels],
        }
    }

    #[must_use]
    pub const fn mesh(&self) -> &VoxelMesh {
        &self.mesh
    }

    /// Residents of `voxel`.
    #[must_use]
    pub fn bucket(&self, voxel: VoxelId) -> &[H] {
        &self.buckets[voxel.0]
    }

    /// Total number of resident handles across all buckets.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Largest interaction distance ever registered in `voxel`.
    #[must_use]
    pub fn max_interactive_distance(&self, voxel: VoxelId) -> f64 {
        self.max_interactive[voxel.0]
    }

    /// Raise the tracked interaction distance of `voxel`; it never decreases.
    pub fn raise_interactive_distance(&mut self, voxel: VoxelId, distance: f64) {
        let slot = &mut self.max_interactive[voxel.0];
        if distance > *slot {
            *slot = distance;
        }
    }

    /// Register `handle` in `voxel`.
    pub fn attach(&mut self, handle: H, voxel: VoxelId, interactive_distance: f64) {
        self.buckets[voxel.0].push(handle);
        self.raise_interactive_distance(voxel, interactive_distance);
    }

    /// Drop `handle` from `voxel`, returning whether it was resident.
    pub fn detach(&mut self, handle: H, voxel: VoxelId) -> bool {
        let bucket = &mut self.buckets[voxel.0];
        match bucket.iter().position(|resident| *resident == handle) {
            Some(slot) => {
                bucket.swap_remove(slot);
                true
            }
            None => false,
        }
    }

    /// Move `handle` between buckets.
    pub fn relocate(&mut self, handle: H, from: VoxelId, to: VoxelId, interactive_distance: f64) {
        if from == to {
            self.raise_interactive_distance(to, interactive_distance);
            return;
        }
        self.detach(handle, from);
        self.attach(handle, to, interactive_distance);
    }

    /// Rename a resident of `voxel` after its owner changed handles.
    pub fn rename(&mut self, voxel: VoxelId, old: H, new: H) -> bool {
        match self.buckets[voxel.0]
            .iter_mut()
            .find(|resident| **resident == old)
        {
            Some(resident) => {
                *resident = new;
                true
            }
            None => false,
        }
    }

    /// Conservative test: could anything resident in `other` lie within reach of an
    /// agent at `position` whose home voxel is `home`?
    ///
    /// Only the voxel centers and `other`'s tracked interaction distance are used.
    /// Face neighbors compare against the shared mid-plane, edge neighbors against the
    /// shared edge line, corner neighbors against the shared corner point.
    #[must_use]
    pub fn could_interact(
        &self,
        position: DVec3,
        interactive_distance: f64,
        home: VoxelId,
        other: VoxelId,
    ) -> bool {
        if home == other {
            return true;
        }
        let reach = interactive_distance + self.max_interactive[other.0];
        let a = self.mesh.center(home).to_array();
        let b = self.mesh.center(other).to_array();
        let p = position.to_array();
        let tolerance = 1e-9 * self.mesh.spec.voxel_size.max_element();

        let mut distance_sq = 0.0;
        let mut shared_axes = 0;
        for axis in 0..3 {
            if (a[axis] - b[axis]).abs() <= tolerance {
                shared_axes += 1;
            } else {
                let midpoint = 0.5 * (a[axis] + b[axis]);
                let delta = p[axis] - midpoint;
                distance_sq += delta * delta;
            }
        }
        if shared_axes == 3 {
            return true;
        }
        distance_sq <= reach * reach
    }

    /// Empty every bucket and reset the tracked distances.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.max_interactive.fill(0.0);
    }
}

impl<H: Copy + PartialEq> NeighborhoodIndex<H> for VoxelIndex<H> {
    fn visit_candidates(
        &self,
        home: VoxelId,
        position: DVec3,
        reach: f64,
        visitor: &mut dyn FnMut(H),
    ) {
        for &resident in &self.buckets[home.0] {
            visitor(resident);
        }
        for &neighbor in self.mesh.moore_neighbors(home) {
            let bucket = &self.buckets[neighbor.0];
            if bucket.is_empty() || !self.could_interact(position, reach, home, neighbor) {
                continue;
            }
            for &resident in bucket {
                visitor(resident);
            }
        }
    }
}

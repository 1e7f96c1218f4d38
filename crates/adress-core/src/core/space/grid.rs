use super::{GridError, PeriodicBox};
use crate::core::models::ids::ParticleId;
use itertools::iproduct;
use nalgebra::{Point3, Vector3};
use std::collections::HashSet;

pub type CellIndex = usize;

/// Neighbour offsets `(dx, dy, dz)` that are lexicographically negative in `(z, y, x)` order.
///
/// Visiting only these from every cell covers each unordered pair of adjacent cells once.
const HALF_SHELL: [[isize; 3]; 13] = [
    [-1, -1, -1],
    [0, -1, -1],
    [1, -1, -1],
    [-1, 0, -1],
    [0, 0, -1],
    [1, 0, -1],
    [-1, 1, -1],
    [0, 1, -1],
    [1, 1, -1],
    [-1, -1, 0],
    [0, -1, 0],
    [1, -1, 0],
    [-1, 0, 0],
];

/// How positions stored in a neighbouring cell relate to positions in the reference cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellImage {
    /// Same periodic image, plain coordinate differences apply.
    Direct,
    /// Add the shift to the neighbour's positions to obtain the image adjacent to the reference.
    Shifted(Vector3<f64>),
    /// The image is ambiguous because the grid wraps onto itself; use the minimum image per pair.
    MinimumImage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborCell {
    pub index: CellIndex,
    pub image: CellImage,
}

/// A regular cell grid over a rectangular region.
///
/// A periodic grid covers the whole box and wraps at its faces. A framed grid covers one
/// subdomain and carries an extra layer of ghost cells on every face; real cells then have
/// coordinates `1..=count` along each axis. Every cell edge is at least the `min_edge` the grid
/// was built with, so only adjacent cells can hold particles closer than that distance.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialGrid {
    origin: Point3<f64>,
    counts: [usize; 3],
    edge: Vector3<f64>,
    frame: usize,
    periodic: bool,
}

impl SpatialGrid {
    pub fn periodic(pbox: &PeriodicBox, min_edge: f64) -> Result<Self, GridError> {
        let (counts, edge) = Self::layout(pbox.lengths(), min_edge)?;
        Ok(Self {
            origin: Point3::origin(),
            counts,
            edge,
            frame: 0,
            periodic: true,
        })
    }

    pub fn framed(
        lower: Point3<f64>,
        upper: Point3<f64>,
        min_edge: f64,
    ) -> Result<Self, GridError> {
        let (counts, edge) = Self::layout(&(upper - lower), min_edge)?;
        Ok(Self {
            origin: lower,
            counts,
            edge,
            frame: 1,
            periodic: false,
        })
    }

    fn layout(extent: &Vector3<f64>, min_edge: f64) -> Result<([usize; 3], Vector3<f64>), GridError> {
        if !(min_edge.is_finite() && min_edge > 0.0) {
            return Err(GridError::InvalidCellSize { size: min_edge });
        }
        let mut counts = [1usize; 3];
        let mut edge = Vector3::zeros();
        for axis in 0..3 {
            let length = extent[axis];
            if !(length.is_finite() && length >= min_edge) {
                return Err(GridError::ExtentTooSmall {
                    axis,
                    length,
                    required: min_edge,
                });
            }
            counts[axis] = ((length / min_edge).floor() as usize).max(1);
            edge[axis] = length / counts[axis] as f64;
        }
        Ok((counts, edge))
    }

    /// Number of real cells along each axis.
    pub fn counts(&self) -> [usize; 3] {
        self.counts
    }

    /// Number of cells along each axis including the ghost frame.
    pub fn frame_counts(&self) -> [usize; 3] {
        self.counts.map(|c| c + 2 * self.frame)
    }

    pub fn edge(&self) -> &Vector3<f64> {
        &self.edge
    }

    pub fn num_cells(&self) -> usize {
        self.frame_counts().iter().product()
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn index(&self, coords: [usize; 3]) -> CellIndex {
        let [fx, fy, _] = self.frame_counts();
        coords[0] + fx * (coords[1] + fy * coords[2])
    }

    pub fn coords(&self, index: CellIndex) -> [usize; 3] {
        let [fx, fy, _] = self.frame_counts();
        [index % fx, (index / fx) % fy, index / (fx * fy)]
    }

    pub fn is_real(&self, index: CellIndex) -> bool {
        let coords = self.coords(index);
        (0..3).all(|axis| {
            coords[axis] >= self.frame && coords[axis] < self.frame + self.counts[axis]
        })
    }

    pub fn real_cells(&self) -> impl Iterator<Item = CellIndex> + '_ {
        let f = self.frame;
        let [nx, ny, nz] = self.counts;
        iproduct!(f..f + nz, f..f + ny, f..f + nx).map(move |(z, y, x)| self.index([x, y, z]))
    }

    fn raw_coords(&self, position: &Point3<f64>) -> [isize; 3] {
        let mut coords = [0isize; 3];
        for axis in 0..3 {
            let offset = (position[axis] - self.origin[axis]) / self.edge[axis];
            coords[axis] = offset.floor() as isize + self.frame as isize;
        }
        coords
    }

    /// Cell containing `position`, or `None` if it lies outside the grid (frame included).
    pub fn cell_of(&self, position: &Point3<f64>) -> Option<CellIndex> {
        let raw = self.raw_coords(position);
        let frame_counts = self.frame_counts();
        let mut coords = [0usize; 3];
        for axis in 0..3 {
            if raw[axis] < 0 || raw[axis] >= frame_counts[axis] as isize {
                return None;
            }
            coords[axis] = raw[axis] as usize;
        }
        Some(self.index(coords))
    }

    /// Cell containing `position`, clamped onto the outermost cells (frame included).
    pub fn clamped_cell_of(&self, position: &Point3<f64>) -> CellIndex {
        let raw = self.raw_coords(position);
        let frame_counts = self.frame_counts();
        let coords: [usize; 3] =
            std::array::from_fn(|axis| raw[axis].clamp(0, frame_counts[axis] as isize - 1) as usize);
        self.index(coords)
    }

    /// Real cell containing `position`, clamped onto the real cells.
    pub fn real_cell_of(&self, position: &Point3<f64>) -> CellIndex {
        let raw = self.raw_coords(position);
        let f = self.frame as isize;
        let coords: [usize; 3] = std::array::from_fn(|axis| {
            raw[axis].clamp(f, f + self.counts[axis] as isize - 1) as usize
        });
        self.index(coords)
    }

    /// For a real cell, whether it touches the low and high face of the grid along each axis.
    pub fn boundary_sides(&self, index: CellIndex) -> [(bool, bool); 3] {
        let coords = self.coords(index);
        std::array::from_fn(|axis| {
            (
                coords[axis] == self.frame,
                coords[axis] == self.frame + self.counts[axis] - 1,
            )
        })
    }

    /// The half of the neighbour shell that lies inside the grid.
    pub fn half_shell(&self, index: CellIndex) -> impl Iterator<Item = CellIndex> + '_ {
        let coords = self.coords(index);
        let frame_counts = self.frame_counts();
        HALF_SHELL.iter().filter_map(move |offset| {
            let mut target = [0usize; 3];
            for axis in 0..3 {
                let c = coords[axis] as isize + offset[axis];
                if c < 0 || c >= frame_counts[axis] as isize {
                    return None;
                }
                target[axis] = c as usize;
            }
            Some(self.index(target))
        })
    }

    /// All cells adjacent to `index` on a periodic grid, the cell itself included.
    ///
    /// When an axis has fewer than three cells the wrapped neighbours coincide; each distinct
    /// cell is then reported once and marked [`CellImage::MinimumImage`].
    pub fn neighbors(&self, index: CellIndex, pbox: &PeriodicBox) -> Vec<NeighborCell> {
        let coords = self.coords(index);
        let collapsed = self.counts.iter().any(|&c| c < 3);
        let mut seen = HashSet::new();
        let mut result = Vec::with_capacity(27);

        for (dz, dy, dx) in iproduct!(-1isize..=1, -1isize..=1, -1isize..=1) {
            let offset = [dx, dy, dz];
            let mut target = [0usize; 3];
            let mut shift = Vector3::zeros();
            for axis in 0..3 {
                let n = self.counts[axis] as isize;
                let mut c = coords[axis] as isize + offset[axis];
                if c < 0 {
                    c += n;
                    shift[axis] = -pbox.length(axis);
                } else if c >= n {
                    c -= n;
                    shift[axis] = pbox.length(axis);
                }
                target[axis] = c as usize;
            }
            let target = self.index(target);
            if !seen.insert(target) {
                continue;
            }
            let image = if collapsed {
                CellImage::MinimumImage
            } else if shift == Vector3::zeros() {
                CellImage::Direct
            } else {
                CellImage::Shifted(shift)
            };
            result.push(NeighborCell {
                index: target,
                image,
            });
        }
        result
    }

    /// Sorts keyed positions into cells in one pass. Positions outside are clamped.
    pub fn bin<K: Copy>(&self, items: impl IntoIterator<Item = (K, Point3<f64>)>) -> Vec<Vec<K>> {
        let mut cells = vec![Vec::new(); self.num_cells()];
        for (key, position) in items {
            cells[self.clamped_cell_of(&position)].push(key);
        }
        cells
    }
}

/// Serial cell-list scan of all unordered pairs within `cutoff` under periodic boundaries.
///
/// Positions must already be folded into the box. Pairs are returned as `(smaller, larger)`.
pub fn periodic_pairs(
    pbox: &PeriodicBox,
    points: &[(ParticleId, Point3<f64>)],
    cutoff: f64,
) -> Result<Vec<(ParticleId, ParticleId)>, GridError> {
    let grid = SpatialGrid::periodic(pbox, cutoff)?;
    let cells = grid.bin(points.iter().enumerate().map(|(i, (_, p))| (i, *p)));
    let cutoff_sq = cutoff * cutoff;
    let mut pairs = Vec::new();

    for cell in 0..grid.num_cells() {
        for neighbor in grid.neighbors(cell, pbox) {
            if neighbor.index < cell {
                continue;
            }
            for &i in &cells[cell] {
                for &j in &cells[neighbor.index] {
                    if neighbor.index == cell && j <= i {
                        continue;
                    }
                    let (id_i, p_i) = points[i];
                    let (id_j, p_j) = points[j];
                    let delta = match neighbor.image {
                        CellImage::Direct => p_j - p_i,
                        CellImage::Shifted(shift) => (p_j + shift) - p_i,
                        CellImage::MinimumImage => pbox.minimum_image(p_j - p_i),
                    };
                    if delta.norm_squared() <= cutoff_sq {
                        pairs.push((id_i.min(id_j), id_i.max(id_j)));
                    }
                }
            }
        }
    }
    Ok(pairs)
}

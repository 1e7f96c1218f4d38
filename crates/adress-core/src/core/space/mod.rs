//! Periodic geometry: the simulation box and cell grids over it.

pub mod boundary;
pub mod grid;

pub use boundary::PeriodicBox;
pub use grid::{CellImage, NeighborCell, SpatialGrid};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    #[error("Box length along axis {axis} must be positive and finite, got {length}")]
    InvalidBoxLength { axis: usize, length: f64 },

    #[error("Region bounds {lower:?}..{upper:?} are not a valid cuboid")]
    InvalidBounds { lower: [f64; 3], upper: [f64; 3] },

    #[error("Cell size must be positive and finite, got {size}")]
    InvalidCellSize { size: f64 },

    #[error(
        "Extent {length} along axis {axis} is smaller than the required interaction range {required}"
    )]
    ExtentTooSmall {
        axis: usize,
        length: f64,
        required: f64,
    },
}

//! # Core Module
//!
//! This module provides the stateless building blocks of the adaptive-resolution engine.
//!
//! ## Overview
//!
//! Nothing in here knows about workers or message passing. The types describe particles,
//! the periodic simulation box, cell grids, pairwise potentials and the bonded bookkeeping
//! (exclusions and coarse-grained tuples) that the [`crate::engine`] layer distributes.
//!
//! ## Architecture
//!
//! - **Particle Representation** ([`models`]) - Particles, stable identifiers and cuboid selections
//! - **Periodic Geometry** ([`space`]) - Orthorhombic periodic box and the cell grid
//! - **Pair Potentials** ([`forcefield`]) - The `PairPotential` interface and energy terms
//! - **Bonded Bookkeeping** ([`topology`]) - Observed bonded lists, exclusions and tuples

pub mod forcefield;
pub mod models;
pub mod space;
pub mod topology;

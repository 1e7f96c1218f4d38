//! # Force Field Module
//!
//! Non-bonded pair potentials and the bookkeeping needed to evaluate them per particle type.
//!
//! ## Overview
//!
//! Every potential implements [`potentials::PairPotential`], which yields the energy and the
//! magnitude of the central force at a given separation together with the potential's own
//! cutoff. The force blender in [`crate::engine::blender`] is generic over two such potentials,
//! one for atomistic and one for coarse-grained interactions, so the inner loop is monomorphic.
//!
//! ## Key Components
//!
//! - [`potentials`] - Lennard-Jones and tabulated potentials behind the `PairPotential` trait
//! - [`interactions`] - Dense symmetric type-pair tables of potentials
//! - [`term`] - Energy split into atomistic and coarse-grained contributions

pub mod interactions;
pub mod potentials;
pub mod term;

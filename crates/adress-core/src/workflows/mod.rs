//! # Workflows Module
//!
//! High-level entry points that drive the adaptive-resolution engine.
//!
//! ## Overview
//!
//! [`simulation::Simulation`] is the facade an integrator or force-field loader talks to. It
//! owns the domain decomposition, the coarse-grained tuples, the exclusion topology, the
//! resolution field and every neighbour list, and keeps them consistent with one another
//! whenever particles move or the topology changes. [`run::run`] sequences complete time
//! steps against an external [`run::Propagator`] and reports progress.
//!
//! ## Architecture
//!
//! - **Simulation Facade** ([`simulation`]) - Setup, decomposition, exclusions, λ and forces
//! - **MD Loop** ([`run`]) - Step sequencing with progress reporting

pub mod run;
pub mod simulation;

pub use run::{Propagator, RunSummary, run};
pub use simulation::{NeighborListId, Simulation};

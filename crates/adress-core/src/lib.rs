//! # ADRESS++ Core Library
//!
//! A parallel molecular-dynamics core for adaptive-resolution simulations, in which a subset of
//! molecules is represented both atomistically and as a single coarse-grained particle, with the
//! two representations blended smoothly in space.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Particle`, `TupleMap`,
//!   `ExclusionSet`), periodic geometry (`PeriodicBox`, `SpatialGrid`), and pure pair-potential
//!   math.
//!
//! - **[`engine`]: The Parallel Machinery.** The stateful layer that owns per-worker particle
//!   storage. It implements the spatial `DomainDecomposition` with ghost exchange, the
//!   `VerletList`, the AdResS `ResolutionField`, and the `AdResSForceBlender`. Every operation
//!   that has to run on all workers goes through an explicit `Collective`.
//!
//! - **[`workflows`]: The Public API.** The `Simulation` facade ties the engine together behind
//!   the operations an integrator or force-field loader needs, and `run` sequences whole steps
//!   against an external propagator.

pub mod core;
pub mod engine;
pub mod workflows;

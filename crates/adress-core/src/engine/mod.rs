//! # Engine Module
//!
//! Stateful parallel machinery of the adaptive-resolution core.
//!
//! ## Overview
//!
//! The engine owns everything that changes while a simulation runs: particle storage split
//! over workers, ghost layers, neighbour lists, resolution weights and the force loop. Workers
//! live in-process inside a [`comm::Collective`]; any code that must run on every worker goes
//! through it, and data crosses workers only as messages routed by [`comm::exchange`].
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Box, worker grid, cutoff and skin, AdResS regions
//! - **Communication** ([`comm`]) - Ranks, envelopes and the per-worker collective
//! - **Worker Storage** ([`worker`]) - Local particles, ghosts and cell lists of one subdomain
//! - **Domain Decomposition** ([`decomposition`]) - Node grid, migration and ghost exchange
//! - **Neighbour Lists** ([`verlet`]) - Distributed Verlet lists honouring exclusions
//! - **Resolution** ([`resolution`]) - Region definitions and the λ switching field
//! - **Force Blending** ([`blender`]) - Atomistic / coarse-grained force interpolation
//! - **Progress Monitoring** ([`progress`]) - Callback based run reporting
//! - **Error Handling** ([`error`]) - Error taxonomy shared by all of the above

pub mod blender;
pub mod comm;
pub mod config;
pub mod decomposition;
pub mod error;
pub mod progress;
pub mod resolution;
pub mod verlet;
pub mod worker;

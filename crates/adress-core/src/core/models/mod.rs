//! # Core Models Module
//!
//! Data structures describing individual particles and groups of particles.
//!
//! ## Key Components
//!
//! - [`particle`] - A single point particle, atomistic or coarse-grained
//! - [`ids`] - Stable global particle ids and worker-local storage keys
//! - [`region`] - Axis-aligned cuboid selections with an optional type filter
//!
//! ## Usage
//!
//! ```ignore
//! use adresspp::core::models::{ids::ParticleId, particle::Particle};
//! use nalgebra::Point3;
//!
//! let water = Particle::new(ParticleId(1), 0, Point3::new(1.0, 2.0, 3.0))
//!     .with_mass(18.0)
//!     .coarse_grained();
//! ```

pub mod ids;
pub mod particle;
pub mod region;

use super::particle::{Particle, ParticleType};
use crate::core::space::GridError;
use nalgebra::Point3;
use std::collections::HashSet;

/// An axis-aligned cuboid selection of particles.
///
/// A particle is inside when every coordinate lies strictly between the lower and upper corner.
/// When the type filter is non-empty, only particles of one of the listed types match.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleRegion {
    lower: Point3<f64>,
    upper: Point3<f64>,
    types: HashSet<ParticleType>,
}

impl ParticleRegion {
    /// Creates a region spanning `lower..upper`.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::InvalidBounds`] if a corner is not finite or `lower` is not
    /// strictly below `upper` along every axis.
    pub fn new(lower: Point3<f64>, upper: Point3<f64>) -> Result<Self, GridError> {
        let valid = (0..3).all(|axis| {
            lower[axis].is_finite() && upper[axis].is_finite() && lower[axis] < upper[axis]
        });
        if !valid {
            return Err(GridError::InvalidBounds {
                lower: [lower.x, lower.y, lower.z],
                upper: [upper.x, upper.y, upper.z],
            });
        }
        Ok(Self {
            lower,
            upper,
            types: HashSet::new(),
        })
    }

    pub fn with_type(mut self, particle_type: ParticleType) -> Self {
        self.types.insert(particle_type);
        self
    }

    pub fn add_type(&mut self, particle_type: ParticleType) {
        self.types.insert(particle_type);
    }

    pub fn remove_type(&mut self, particle_type: ParticleType) -> bool {
        self.types.remove(&particle_type)
    }

    pub fn lower(&self) -> &Point3<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &Point3<f64> {
        &self.upper
    }

    pub fn contains_point(&self, point: &Point3<f64>) -> bool {
        (0..3).all(|axis| point[axis] > self.lower[axis] && point[axis] < self.upper[axis])
    }

    pub fn contains(&self, particle: &Particle) -> bool {
        (self.types.is_empty() || self.types.contains(&particle.particle_type))
            && self.contains_point(&particle.position)
    }
}

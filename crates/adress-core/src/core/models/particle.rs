use super::ids::ParticleId;
use nalgebra::{Point3, Vector3};

/// Numeric particle type, used to index interaction tables.
pub type ParticleType = u32;

/// Represents a point particle in the simulation box.
///
/// A particle is either atomistic or coarse-grained. Coarse-grained particles stand for a
/// whole molecule: their position, velocity and mass are derived from their atomistic
/// constituents and the forces they receive are handed back to those constituents.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    /// Globally unique, stable id.
    pub id: ParticleId,
    /// Interaction type used for potential lookup.
    pub particle_type: ParticleType,
    /// Position inside the periodic box.
    pub position: Point3<f64>,
    pub velocity: Vector3<f64>,
    /// Force accumulated during the current force evaluation.
    pub force: Vector3<f64>,
    /// Mass, always positive.
    pub mass: f64,
    pub charge: f64,
    /// Whether this particle is the coarse-grained representative of a molecule.
    pub coarse_grained: bool,
    /// Resolution weight in `[0, 1]`: 1 is fully atomistic, 0 fully coarse-grained.
    pub lambda: f64,
    /// Radial derivative of `lambda` with respect to the distance from the region centre.
    ///
    /// Not used by the force blender. It is kept current on locals and ghosts for callers that
    /// add a thermodynamic drift force, which is proportional to `dλ/dr`.
    pub lambda_deriv: f64,
    /// Number of box lengths the particle has been folded by along each axis.
    pub image: [i32; 3],
}

impl Particle {
    /// Creates a new atomistic `Particle` at rest with unit mass.
    ///
    /// # Arguments
    ///
    /// * `id` - The global id of the particle.
    /// * `particle_type` - The interaction type of the particle.
    /// * `position` - The initial position.
    pub fn new(id: ParticleId, particle_type: ParticleType, position: Point3<f64>) -> Self {
        Self {
            id,
            particle_type,
            position,
            velocity: Vector3::zeros(),
            force: Vector3::zeros(),
            mass: 1.0,
            charge: 0.0,
            coarse_grained: false,
            lambda: 1.0,
            lambda_deriv: 0.0,
            image: [0; 3],
        }
    }

    pub fn with_mass(mut self, mass: f64) -> Self {
        self.mass = mass;
        self
    }

    pub fn with_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_charge(mut self, charge: f64) -> Self {
        self.charge = charge;
        self
    }

    /// Marks the particle as the coarse-grained representative of a molecule.
    pub fn coarse_grained(mut self) -> Self {
        self.coarse_grained = true;
        self
    }

    /// Returns `true` if position and velocity contain only finite components.
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|c| c.is_finite()) && self.velocity.iter().all(|c| c.is_finite())
    }

    /// Kinetic energy `m v² / 2`.
    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.velocity.norm_squared()
    }
}

use thiserror::Error;

use super::comm::Rank;
use super::config::ConfigError;
use crate::core::forcefield::potentials::PotentialError;
use crate::core::models::ids::ParticleId;
use crate::core::space::GridError;
use crate::core::topology::TopologyError;

/// Broad classification of engine failures. None of them is recoverable within a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid setup, detected before or while the system is assembled.
    Configuration,
    /// Workers disagree about shared state; indicates a bug rather than bad input.
    Consistency,
    /// The trajectory became unstable.
    Numerical,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid geometry: {0}")]
    Grid(#[from] GridError),

    #[error("Invalid topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("Invalid potential: {0}")]
    Potential(#[from] PotentialError),

    #[error("Particle {id} is already stored on worker {rank}")]
    DuplicateParticle { id: ParticleId, rank: Rank },

    #[error("Invalid particle {id}: {reason}")]
    InvalidParticle { id: ParticleId, reason: String },

    #[error("Particle {0} not found")]
    ParticleNotFound(ParticleId),

    #[error("Neighbor list {0} does not exist")]
    UnknownNeighborList(usize),

    #[error("Exclusion set on worker {rank} diverged from worker 0 after broadcast")]
    ExclusionMismatch { rank: Rank },

    #[error("Neighbor list disagrees with reference scan: {missing} pairs missing, {spurious} spurious")]
    PairListMismatch { missing: usize, spurious: usize },

    #[error(
        "Particle {id} moved {displacement:.4} along axis {axis} at step {step}, more than one subdomain width ({limit:.4})"
    )]
    ParticleJumped {
        id: ParticleId,
        step: u64,
        axis: usize,
        displacement: f64,
        limit: f64,
    },

    #[error("Particle {id} has a non-finite position or velocity at step {step}")]
    NonFinitePosition { id: ParticleId, step: u64 },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_)
            | EngineError::Grid(_)
            | EngineError::Topology(_)
            | EngineError::Potential(_)
            | EngineError::DuplicateParticle { .. }
            | EngineError::InvalidParticle { .. }
            | EngineError::ParticleNotFound(_)
            | EngineError::UnknownNeighborList(_) => ErrorKind::Configuration,
            EngineError::ExclusionMismatch { .. }
            | EngineError::PairListMismatch { .. }
            | EngineError::Internal(_) => ErrorKind::Consistency,
            EngineError::ParticleJumped { .. } | EngineError::NonFinitePosition { .. } => {
                ErrorKind::Numerical
            }
        }
    }

    /// Id of the offending particle, if the error concerns a single particle.
    pub fn particle(&self) -> Option<ParticleId> {
        match self {
            EngineError::DuplicateParticle { id, .. }
            | EngineError::InvalidParticle { id, .. }
            | EngineError::ParticleJumped { id, .. }
            | EngineError::NonFinitePosition { id, .. } => Some(*id),
            EngineError::ParticleNotFound(id) => Some(*id),
            _ => None,
        }
    }
}

//! # Topology Module
//!
//! Bonded bookkeeping shared by every worker: bonded lists, non-bonded exclusions derived from
//! them, and the tuples that tie each coarse-grained particle to its atomistic constituents.
//!
//! ## Key Components
//!
//! - [`lists`] - Fixed pair, triple and quadruple lists with a change journal
//! - [`exclusions`] - Reference-counted exclusion set that can observe bonded lists
//! - [`tuples`] - The coarse-grained to atomistic mapping and molecule aggregation

pub mod exclusions;
pub mod lists;
pub mod tuples;

use crate::core::models::ids::{ListId, ParticleId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Particle {0} cannot be paired with itself")]
    SelfPair(ParticleId),

    #[error("Bonded list {0:?} does not exist")]
    UnknownList(ListId),

    #[error("Entry with {found} particles does not fit a list of arity {expected}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("Entry lists particle {0} more than once")]
    RepeatedParticle(ParticleId),

    #[error("Tuple is empty")]
    EmptyTuple,

    #[error("Tuple of {0} lists no atomistic constituents")]
    NoConstituents(ParticleId),

    #[error("Particle {0} is not known")]
    UnknownParticle(ParticleId),

    #[error("Particle {0} is not flagged coarse-grained and cannot head a tuple")]
    NotCoarseGrained(ParticleId),

    #[error("Particle {0} is flagged coarse-grained and cannot be a constituent")]
    CoarseGrainedConstituent(ParticleId),

    #[error("Particle {0} already heads a tuple")]
    DuplicateRepresentative(ParticleId),

    #[error("Particle {id} already belongs to the tuple of {owner}")]
    DuplicateConstituent { id: ParticleId, owner: ParticleId },

    #[error("Coarse-grained particle {0} has no tuple")]
    MissingTuple(ParticleId),

    #[error("Tuples cannot change after the first decomposition")]
    Sealed,
}

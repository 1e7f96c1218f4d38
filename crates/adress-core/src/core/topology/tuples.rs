use super::TopologyError;
use crate::core::models::ids::ParticleId;
use crate::core::models::particle::Particle;
use nalgebra::{Point3, Vector3};
use std::collections::{HashMap, HashSet};

/// Mass-weighted state of a molecule aggregated from its atomistic constituents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoleculeState {
    pub position: Point3<f64>,
    pub velocity: Vector3<f64>,
    pub mass: f64,
}

impl MoleculeState {
    /// Centre of mass, centre-of-mass velocity and total mass of `members`.
    ///
    /// Member positions must be unwrapped so that the molecule is contiguous. Returns `None`
    /// for an empty group or a non-positive total mass.
    pub fn aggregate<'a>(members: impl IntoIterator<Item = &'a Particle>) -> Option<Self> {
        let mut mass = 0.0;
        let mut weighted_position = Vector3::zeros();
        let mut momentum = Vector3::zeros();
        for particle in members {
            mass += particle.mass;
            weighted_position += particle.position.coords * particle.mass;
            momentum += particle.velocity * particle.mass;
        }
        if mass <= 0.0 {
            return None;
        }
        Some(Self {
            position: Point3::from(weighted_position / mass),
            velocity: momentum / mass,
            mass,
        })
    }

    /// Share of a molecular force carried by a constituent of `mass`.
    #[inline]
    pub fn share(&self, mass: f64) -> f64 {
        mass / self.mass
    }
}

/// The mapping from each coarse-grained particle to the atomistic particles it represents.
///
/// Tuples are registered before the first decomposition and are immutable afterwards. Every
/// atomistic particle belongs to at most one tuple.
#[derive(Debug, Clone, Default)]
pub struct TupleMap {
    constituents: HashMap<ParticleId, Vec<ParticleId>>,
    representative: HashMap<ParticleId, ParticleId>,
    order: Vec<ParticleId>,
    sealed: bool,
}

impl TupleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers tuples of the form `[cg, at_1, at_2, ...]`.
    ///
    /// `coarse_grained` reports whether a particle exists and, if so, whether it is flagged
    /// coarse-grained. The batch is applied atomically: on error nothing is registered.
    ///
    /// # Errors
    ///
    /// Fails if the map is sealed, a tuple is empty or lacks constituents, a particle is unknown
    /// or carries the wrong resolution flag, or a particle already belongs to a tuple.
    pub fn add_tuples<F>(
        &mut self,
        tuples: &[Vec<ParticleId>],
        coarse_grained: F,
    ) -> Result<usize, TopologyError>
    where
        F: Fn(ParticleId) -> Option<bool>,
    {
        if self.sealed {
            return Err(TopologyError::Sealed);
        }

        let mut new_heads = HashSet::new();
        let mut new_members: HashMap<ParticleId, ParticleId> = HashMap::new();

        for tuple in tuples {
            let (&cg, members) = tuple.split_first().ok_or(TopologyError::EmptyTuple)?;
            if members.is_empty() {
                return Err(TopologyError::NoConstituents(cg));
            }
            match coarse_grained(cg) {
                None => return Err(TopologyError::UnknownParticle(cg)),
                Some(false) => return Err(TopologyError::NotCoarseGrained(cg)),
                Some(true) => {}
            }
            if self.constituents.contains_key(&cg) || !new_heads.insert(cg) {
                return Err(TopologyError::DuplicateRepresentative(cg));
            }

            for &at in members {
                match coarse_grained(at) {
                    None => return Err(TopologyError::UnknownParticle(at)),
                    Some(true) => return Err(TopologyError::CoarseGrainedConstituent(at)),
                    Some(false) => {}
                }
                if let Some(&owner) = self.representative.get(&at) {
                    return Err(TopologyError::DuplicateConstituent { id: at, owner });
                }
                if let Some(&owner) = new_members.get(&at) {
                    return Err(TopologyError::DuplicateConstituent { id: at, owner });
                }
                new_members.insert(at, cg);
            }
        }

        for tuple in tuples {
            let (&cg, members) = tuple.split_first().ok_or(TopologyError::EmptyTuple)?;
            for &at in members {
                self.representative.insert(at, cg);
            }
            self.constituents.insert(cg, members.to_vec());
            self.order.push(cg);
        }
        Ok(tuples.len())
    }

    pub fn constituents(&self, cg: ParticleId) -> Option<&[ParticleId]> {
        self.constituents.get(&cg).map(Vec::as_slice)
    }

    pub fn representative_of(&self, at: ParticleId) -> Option<ParticleId> {
        self.representative.get(&at).copied()
    }

    #[inline]
    pub fn is_constituent(&self, id: ParticleId) -> bool {
        self.representative.contains_key(&id)
    }

    #[inline]
    pub fn has_tuple(&self, cg: ParticleId) -> bool {
        self.constituents.contains_key(&cg)
    }

    /// Tuples in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ParticleId, &[ParticleId])> + '_ {
        self.order
            .iter()
            .filter_map(|cg| self.constituents.get(cg).map(|m| (*cg, m.as_slice())))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Checks that every coarse-grained particle heads a tuple.
    pub fn check_coverage(
        &self,
        coarse_grained: impl IntoIterator<Item = ParticleId>,
    ) -> Result<(), TopologyError> {
        for id in coarse_grained {
            if !self.has_tuple(id) {
                return Err(TopologyError::MissingTuple(id));
            }
        }
        Ok(())
    }
}

use super::potentials::PairPotential;
use crate::core::models::particle::ParticleType;
use std::collections::HashMap;

/// Symmetric table of pair potentials indexed by particle type.
///
/// Entries are keyed by the ordered type pair `(min, max)`, so any type id is accepted.
#[derive(Debug, Clone)]
pub struct InteractionTable<P> {
    entries: HashMap<(ParticleType, ParticleType), P>,
}

impl<P> Default for InteractionTable<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

#[inline]
fn key(a: ParticleType, b: ParticleType) -> (ParticleType, ParticleType) {
    (a.min(b), a.max(b))
}

impl<P: PairPotential + Clone> InteractionTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `potential` for both `(a, b)` and `(b, a)`, replacing any previous entry.
    pub fn set(&mut self, a: ParticleType, b: ParticleType, potential: P) {
        self.entries.insert(key(a, b), potential);
    }

    #[inline]
    pub fn get(&self, a: ParticleType, b: ParticleType) -> Option<&P> {
        self.entries.get(&key(a, b))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest cutoff of any registered potential, or zero for an empty table.
    pub fn max_cutoff(&self) -> f64 {
        self.entries
            .values()
            .map(PairPotential::cutoff)
            .fold(0.0, f64::max)
    }
}

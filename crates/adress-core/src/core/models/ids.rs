use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// Storage slot of a particle on one worker. Keys are never sent to other workers.
    pub struct ParticleKey;
    pub struct ListId;
}

/// Globally unique particle id, stable for the lifetime of a simulation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticleId(pub u64);

impl From<u64> for ParticleId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particle_ids_order_by_numeric_value() {
        let mut ids = vec![ParticleId(7), ParticleId(2), ParticleId(5)];
        ids.sort();
        assert_eq!(ids, vec![ParticleId(2), ParticleId(5), ParticleId(7)]);
    }

    #[test]
    fn particle_id_displays_with_hash_prefix() {
        assert_eq!(ParticleId(42).to_string(), "#42");
        assert_eq!(ParticleId::from(3), ParticleId(3));
    }
}

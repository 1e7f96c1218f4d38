use super::TopologyError;
use super::lists::{BondedTopology, TopologyChange};
use crate::core::models::ids::{ListId, ParticleId};
use itertools::Itertools;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};

/// An unordered pair of distinct particles, stored smaller id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExclusionPair(ParticleId, ParticleId);

impl ExclusionPair {
    pub fn new(a: ParticleId, b: ParticleId) -> Result<Self, TopologyError> {
        if a == b {
            return Err(TopologyError::SelfPair(a));
        }
        Ok(Self(a.min(b), a.max(b)))
    }

    pub fn first(&self) -> ParticleId {
        self.0
    }

    pub fn second(&self) -> ParticleId {
        self.1
    }
}

/// An explicit exclusion edit, replayed on the other copies of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionOp {
    Exclude(ExclusionPair),
    Unexclude(ExclusionPair),
}

/// Pairs of particles that must not interact through non-bonded potentials.
///
/// Membership has two sources. Explicit exclusions are added and removed by the user. Derived
/// exclusions come from observed bonded lists and are reference counted, so a pair bonded
/// in two lists stays excluded until both bonds are gone. A pair is excluded while either
/// source holds it; `unexclude` only drops the explicit part.
///
/// Every change that alters membership raises the dirty flag, which the neighbour list clears
/// once it has been rebuilt against the new set.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    explicit: HashSet<ExclusionPair>,
    derived: HashMap<ExclusionPair, u32>,
    observed: HashMap<ListId, usize>,
    dirty: bool,
    pending: Vec<ExclusionOp>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn holds(&self, pair: &ExclusionPair) -> bool {
        self.explicit.contains(pair) || self.derived.contains_key(pair)
    }

    #[inline]
    pub fn contains(&self, a: ParticleId, b: ParticleId) -> bool {
        match ExclusionPair::new(a, b) {
            Ok(pair) => self.holds(&pair),
            Err(_) => false,
        }
    }

    /// Explicitly excludes a pair. Returns `true` if the explicit set grew.
    pub fn exclude(&mut self, a: ParticleId, b: ParticleId) -> Result<bool, TopologyError> {
        let pair = ExclusionPair::new(a, b)?;
        let inserted = self.insert_explicit(pair);
        if inserted {
            self.pending.push(ExclusionOp::Exclude(pair));
        }
        Ok(inserted)
    }

    /// Drops an explicit exclusion. Returns `true` if it was present.
    pub fn unexclude(&mut self, a: ParticleId, b: ParticleId) -> Result<bool, TopologyError> {
        let pair = ExclusionPair::new(a, b)?;
        let removed = self.remove_explicit(pair);
        if removed {
            self.pending.push(ExclusionOp::Unexclude(pair));
        }
        Ok(removed)
    }

    fn insert_explicit(&mut self, pair: ExclusionPair) -> bool {
        let was_held = self.holds(&pair);
        let inserted = self.explicit.insert(pair);
        if !was_held {
            self.dirty = true;
        }
        inserted
    }

    fn remove_explicit(&mut self, pair: ExclusionPair) -> bool {
        let removed = self.explicit.remove(&pair);
        if removed && !self.holds(&pair) {
            self.dirty = true;
        }
        removed
    }

    fn add_derived(&mut self, entry: &[ParticleId]) {
        for (&a, &b) in entry.iter().tuple_combinations() {
            let Ok(pair) = ExclusionPair::new(a, b) else {
                continue;
            };
            let count = self.derived.entry(pair).or_insert(0);
            *count += 1;
            if *count == 1 && !self.explicit.contains(&pair) {
                self.dirty = true;
            }
        }
    }

    fn remove_derived(&mut self, entry: &[ParticleId]) {
        for (&a, &b) in entry.iter().tuple_combinations() {
            let Ok(pair) = ExclusionPair::new(a, b) else {
                continue;
            };
            if let Some(count) = self.derived.get_mut(&pair) {
                *count -= 1;
                if *count == 0 {
                    self.derived.remove(&pair);
                    if !self.explicit.contains(&pair) {
                        self.dirty = true;
                    }
                }
            }
        }
    }

    /// Starts deriving exclusions from a bonded list, including every bond it already holds.
    pub fn observe(
        &mut self,
        topology: &BondedTopology,
        list: ListId,
    ) -> Result<(), TopologyError> {
        self.sync(topology);
        if self.observed.contains_key(&list) {
            return Ok(());
        }
        for entry in topology.list(list)?.entries() {
            self.add_derived(entry);
        }
        self.observed.insert(list, topology.journal_len());
        Ok(())
    }

    /// Stops observing a list and withdraws the exclusions it contributed.
    pub fn disconnect(
        &mut self,
        topology: &BondedTopology,
        list: ListId,
    ) -> Result<bool, TopologyError> {
        self.sync(topology);
        if self.observed.remove(&list).is_none() {
            return Ok(false);
        }
        for entry in topology.list(list)?.entries() {
            self.remove_derived(entry);
        }
        Ok(true)
    }

    /// Oldest journal position this set still has to replay, if it observes any list.
    pub fn cursor(&self) -> Option<usize> {
        self.observed.values().min().copied()
    }

    pub fn is_observing(&self, list: ListId) -> bool {
        self.observed.contains_key(&list)
    }

    /// Replays bond additions and removals made to observed lists since the last sync.
    ///
    /// Returns the number of changes applied.
    pub fn sync(&mut self, topology: &BondedTopology) -> usize {
        let end = topology.journal_len();
        let Some(start) = self.cursor() else {
            return 0;
        };
        let start = start.max(topology.journal_start());
        let mut applied = 0;
        for (offset, change) in topology.changes_since(start).iter().enumerate() {
            let index = start + offset;
            let Some(&cursor) = self.observed.get(&change.list()) else {
                continue;
            };
            if index < cursor {
                continue;
            }
            match change {
                TopologyChange::Added { entry, .. } => self.add_derived(entry),
                TopologyChange::Removed { entry, .. } => self.remove_derived(entry),
            }
            applied += 1;
        }
        for cursor in self.observed.values_mut() {
            *cursor = end;
        }
        applied
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Number of distinct excluded pairs.
    pub fn len(&self) -> usize {
        self.explicit.len()
            + self
                .derived
                .keys()
                .filter(|pair| !self.explicit.contains(pair))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && self.derived.is_empty()
    }

    /// All excluded pairs in ascending order.
    pub fn pairs(&self) -> Vec<(ParticleId, ParticleId)> {
        self.explicit
            .iter()
            .chain(self.derived.keys())
            .map(|pair| (pair.first(), pair.second()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Explicit edits made locally since the last call.
    pub fn take_pending(&mut self) -> Vec<ExclusionOp> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Applies edits that originated on another copy without recording them as pending.
    pub fn apply_remote(&mut self, ops: &[ExclusionOp]) {
        for op in ops {
            match *op {
                ExclusionOp::Exclude(pair) => {
                    self.insert_explicit(pair);
                }
                ExclusionOp::Unexclude(pair) => {
                    self.remove_explicit(pair);
                }
            }
        }
    }

    /// Order-independent digest of the membership, equal for sets holding the same pairs.
    pub fn fingerprint(&self) -> u64 {
        let mut digest = self.len() as u64;
        for pair in self.explicit.iter().chain(
            self.derived
                .keys()
                .filter(|pair| !self.explicit.contains(pair)),
        ) {
            let mut hasher = DefaultHasher::new();
            pair.hash(&mut hasher);
            digest = digest.wrapping_add(hasher.finish());
        }
        digest
    }
}

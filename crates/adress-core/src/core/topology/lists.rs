use super::TopologyError;
use crate::core::models::ids::{ListId, ParticleId};
use slotmap::SlotMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Pairs,
    Triples,
    Quadruples,
}

impl ListKind {
    pub fn arity(self) -> usize {
        match self {
            ListKind::Pairs => 2,
            ListKind::Triples => 3,
            ListKind::Quadruples => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    Added { list: ListId, entry: Vec<ParticleId> },
    Removed { list: ListId, entry: Vec<ParticleId> },
}

impl TopologyChange {
    pub fn list(&self) -> ListId {
        match self {
            TopologyChange::Added { list, .. } | TopologyChange::Removed { list, .. } => *list,
        }
    }
}

/// A bonded list of fixed arity. An entry and its reversal are the same bond.
#[derive(Debug, Clone)]
pub struct FixedList {
    kind: ListKind,
    entries: Vec<Vec<ParticleId>>,
    canonical: HashSet<Vec<ParticleId>>,
}

impl FixedList {
    fn new(kind: ListKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            canonical: HashSet::new(),
        }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn entries(&self) -> &[Vec<ParticleId>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn canonical(entry: &[ParticleId]) -> Vec<ParticleId> {
    let forward = entry.to_vec();
    let reversed: Vec<_> = entry.iter().rev().copied().collect();
    forward.min(reversed)
}

/// All bonded lists of a simulation together with a journal of every change made to them.
///
/// Observers (such as an exclusion set) remember a journal position and replay the changes
/// made since. Positions are absolute; [`BondedTopology::compact`] drops a consumed prefix
/// without renumbering the rest.
#[derive(Debug, Clone, Default)]
pub struct BondedTopology {
    lists: SlotMap<ListId, FixedList>,
    journal: Vec<TopologyChange>,
    base: usize,
}

impl BondedTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_list(&mut self, kind: ListKind) -> ListId {
        self.lists.insert(FixedList::new(kind))
    }

    pub fn list(&self, id: ListId) -> Result<&FixedList, TopologyError> {
        self.lists.get(id).ok_or(TopologyError::UnknownList(id))
    }

    pub fn list_ids(&self) -> impl Iterator<Item = ListId> + '_ {
        self.lists.keys()
    }

    fn validate(list: &FixedList, entry: &[ParticleId]) -> Result<(), TopologyError> {
        if entry.len() != list.kind.arity() {
            return Err(TopologyError::ArityMismatch {
                expected: list.kind.arity(),
                found: entry.len(),
            });
        }
        let mut seen = HashSet::with_capacity(entry.len());
        for &id in entry {
            if !seen.insert(id) {
                return Err(TopologyError::RepeatedParticle(id));
            }
        }
        Ok(())
    }

    /// Adds a bond. Returns `false` if the bond (or its reversal) is already present.
    pub fn add(&mut self, id: ListId, entry: &[ParticleId]) -> Result<bool, TopologyError> {
        let list = self.lists.get_mut(id).ok_or(TopologyError::UnknownList(id))?;
        Self::validate(list, entry)?;
        if !list.canonical.insert(canonical(entry)) {
            return Ok(false);
        }
        list.entries.push(entry.to_vec());
        self.journal.push(TopologyChange::Added {
            list: id,
            entry: entry.to_vec(),
        });
        Ok(true)
    }

    /// Removes a bond given in either direction. Returns `false` if it was not present.
    pub fn remove(&mut self, id: ListId, entry: &[ParticleId]) -> Result<bool, TopologyError> {
        let list = self.lists.get_mut(id).ok_or(TopologyError::UnknownList(id))?;
        Self::validate(list, entry)?;
        let key = canonical(entry);
        if !list.canonical.remove(&key) {
            return Ok(false);
        }
        let position = list.entries.iter().position(|e| canonical(e) == key);
        let removed = match position {
            Some(index) => list.entries.remove(index),
            None => entry.to_vec(),
        };
        self.journal.push(TopologyChange::Removed {
            list: id,
            entry: removed,
        });
        Ok(true)
    }

    /// Position one past the last recorded change.
    pub fn journal_len(&self) -> usize {
        self.base + self.journal.len()
    }

    /// Position of the oldest change still retained.
    pub fn journal_start(&self) -> usize {
        self.base
    }

    /// Changes from `cursor` on. A cursor inside the compacted prefix sees the retained part.
    pub fn changes_since(&self, cursor: usize) -> &[TopologyChange] {
        let offset = cursor.saturating_sub(self.base).min(self.journal.len());
        &self.journal[offset..]
    }

    /// Drops every change before position `upto`. Returns the number of changes dropped.
    pub fn compact(&mut self, upto: usize) -> usize {
        let count = upto.saturating_sub(self.base).min(self.journal.len());
        self.journal.drain(..count);
        self.base += count;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<ParticleId> {
        raw.iter().copied().map(ParticleId).collect()
    }

    #[test]
    fn add_rejects_wrong_arity_and_repeated_particles() {
        let mut topology = BondedTopology::new();
        let angles = topology.add_list(ListKind::Triples);

        assert_eq!(
            topology.add(angles, &ids(&[1, 2])),
            Err(TopologyError::ArityMismatch {
                expected: 3,
                found: 2
            })
        );
        assert_eq!(
            topology.add(angles, &ids(&[1, 2, 1])),
            Err(TopologyError::RepeatedParticle(ParticleId(1)))
        );
    }

    #[test]
    fn reversed_entry_is_the_same_bond() {
        let mut topology = BondedTopology::new();
        let bonds = topology.add_list(ListKind::Pairs);

        assert_eq!(topology.add(bonds, &ids(&[1, 2])), Ok(true));
        assert_eq!(topology.add(bonds, &ids(&[2, 1])), Ok(false));
        assert_eq!(topology.list(bonds).unwrap().len(), 1);

        assert_eq!(topology.remove(bonds, &ids(&[2, 1])), Ok(true));
        assert!(topology.list(bonds).unwrap().is_empty());
        assert_eq!(topology.remove(bonds, &ids(&[1, 2])), Ok(false));
    }

    #[test]
    fn journal_records_changes_in_order() {
        let mut topology = BondedTopology::new();
        let bonds = topology.add_list(ListKind::Pairs);
        topology.add(bonds, &ids(&[1, 2])).unwrap();
        let cursor = topology.journal_len();
        topology.add(bonds, &ids(&[3, 4])).unwrap();
        topology.remove(bonds, &ids(&[1, 2])).unwrap();

        let changes = topology.changes_since(cursor);
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], TopologyChange::Added { entry, .. } if *entry == ids(&[3, 4])));
        assert!(matches!(&changes[1], TopologyChange::Removed { entry, .. } if *entry == ids(&[1, 2])));
        assert!(changes.iter().all(|c| c.list() == bonds));
    }

    #[test]
    fn compaction_keeps_positions_stable() {
        let mut topology = BondedTopology::new();
        let bonds = topology.add_list(ListKind::Pairs);
        topology.add(bonds, &ids(&[1, 2])).unwrap();
        topology.add(bonds, &ids(&[3, 4])).unwrap();
        let cursor = topology.journal_len();
        topology.add(bonds, &ids(&[5, 6])).unwrap();

        assert_eq!(topology.compact(cursor), 2);
        assert_eq!(topology.journal_start(), 2);
        assert_eq!(topology.journal_len(), 3);
        let changes = topology.changes_since(cursor);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], TopologyChange::Added { entry, .. } if *entry == ids(&[5, 6])));

        assert_eq!(topology.compact(cursor), 0);
        assert_eq!(topology.compact(100), 1);
        assert_eq!(topology.journal_len(), 3);
        assert!(topology.changes_since(0).is_empty());
        assert_eq!(topology.list(bonds).unwrap().len(), 3);
    }

    #[test]
    fn unknown_list_is_an_error() {
        let mut topology = BondedTopology::new();
        let bonds = topology.add_list(ListKind::Pairs);
        let mut other = BondedTopology::new();
        other.add_list(ListKind::Pairs);
        let foreign = other.add_list(ListKind::Pairs);

        assert_eq!(
            topology.add(foreign, &ids(&[1, 2])),
            Err(TopologyError::UnknownList(foreign))
        );
        assert!(topology.list(bonds).is_ok());
    }
}

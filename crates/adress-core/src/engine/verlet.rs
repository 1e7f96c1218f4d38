use super::comm::{Collective, Rank};
use super::config::ConfigError;
use super::decomposition::DomainDecomposition;
use super::error::EngineError;
use super::worker::{Slot, Worker};
use crate::core::models::ids::{ParticleId, ParticleKey};
use crate::core::space::grid::periodic_pairs;
use crate::core::topology::tuples::TupleMap;
use nalgebra::{Point3, Vector3};
use slotmap::SecondaryMap;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

/// One stored pair of a worker's list. At most one side is a ghost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairRef {
    pub first: Slot,
    pub second: Slot,
}

/// A pair reported by [`VerletList::pairs`], with the separation vector from `first` to
/// `second` under the minimum image convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborPair {
    pub first: ParticleId,
    pub second: ParticleId,
    pub distance: Vector3<f64>,
}

/// The pairs one worker is responsible for, and the positions its representatives had at
/// the last build.
#[derive(Debug, Clone, Default)]
pub struct LocalVerletList {
    pairs: Vec<PairRef>,
    anchors: SecondaryMap<ParticleKey, Point3<f64>>,
}

impl LocalVerletList {
    pub fn pairs(&self) -> &[PairRef] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Scans every real cell against itself and its half shell. Ghost-ghost pairs belong to
    /// other workers and are skipped, as are self pairs and excluded pairs.
    fn rebuild(&mut self, worker: &Worker, range: f64) -> usize {
        self.pairs.clear();
        self.anchors.clear();
        let range_sq = range * range;
        let grid = worker.grid();

        for cell in grid.real_cells() {
            let home = worker.cell(cell);
            for (i, &a) in home.iter().enumerate() {
                if let (Slot::Local(key), Some(p)) = (a, worker.slot_particle(a)) {
                    self.anchors.insert(key, p.position);
                }
                for &b in &home[i + 1..] {
                    self.consider(worker, a, b, range_sq);
                }
            }
            for neighbor in grid.half_shell(cell) {
                for &a in home {
                    for &b in worker.cell(neighbor) {
                        self.consider(worker, a, b, range_sq);
                    }
                }
            }
        }
        self.pairs.len()
    }

    #[inline]
    fn consider(&mut self, worker: &Worker, a: Slot, b: Slot, range_sq: f64) {
        if matches!((a, b), (Slot::Ghost(_), Slot::Ghost(_))) {
            return;
        }
        let (Some(pa), Some(pb)) = (worker.slot_particle(a), worker.slot_particle(b)) else {
            return;
        };
        if pa.id == pb.id || worker.exclusions().contains(pa.id, pb.id) {
            return;
        }
        if (pb.position - pa.position).norm_squared() <= range_sq {
            self.pairs.push(PairRef { first: a, second: b });
        }
    }

    /// Whether any local representative moved more than `limit` since the last build.
    fn exceeds(&self, worker: &Worker, limit: f64) -> bool {
        let limit_sq = limit * limit;
        self.anchors.iter().any(|(key, anchor)| {
            match worker.slot_particle(Slot::Local(key)) {
                Some(p) => !((p.position - *anchor).norm_squared() <= limit_sq),
                None => true,
            }
        })
    }
}

/// Distributed Verlet list over molecule representatives.
///
/// Pairs are stored up to `cutoff + skin` and reported up to `cutoff`. The list stays valid
/// until some representative has moved more than half the skin, the exclusions change, or a
/// decomposition invalidates the stored slots.
#[derive(Debug, Clone)]
pub struct VerletList {
    cutoff: f64,
    skin: f64,
    locals: Collective<LocalVerletList>,
    builds: usize,
    rebuild_requested: bool,
}

impl VerletList {
    pub fn new(cutoff: f64, skin: f64, dd: &DomainDecomposition) -> Result<Self, EngineError> {
        Self::check_range(cutoff, skin, dd)?;
        Ok(Self {
            cutoff,
            skin,
            locals: Collective::from_fn(dd.workers().size(), |_| LocalVerletList::default()),
            builds: 0,
            rebuild_requested: true,
        })
    }

    fn check_range(cutoff: f64, skin: f64, dd: &DomainDecomposition) -> Result<(), ConfigError> {
        if !(cutoff.is_finite() && cutoff > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "cutoff",
                reason: format!("must be positive, got {cutoff}"),
            });
        }
        if !(skin.is_finite() && skin >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "skin",
                reason: format!("must be non-negative, got {skin}"),
            });
        }
        if cutoff + skin > dd.range() {
            return Err(ConfigError::InvalidParameter {
                name: "cutoff",
                reason: format!(
                    "cutoff + skin = {} exceeds the decomposition range {}",
                    cutoff + skin,
                    dd.range()
                ),
            });
        }
        Ok(())
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn skin(&self) -> f64 {
        self.skin
    }

    /// Number of completed rebuilds.
    pub fn builds(&self) -> usize {
        self.builds
    }

    pub fn set_cutoff(&mut self, cutoff: f64, dd: &DomainDecomposition) -> Result<(), EngineError> {
        Self::check_range(cutoff, self.skin, dd)?;
        self.cutoff = cutoff;
        self.rebuild_requested = true;
        Ok(())
    }

    pub fn request_rebuild(&mut self) {
        self.rebuild_requested = true;
    }

    pub fn needs_rebuild(&self, dd: &DomainDecomposition) -> bool {
        if self.rebuild_requested || dd.workers().any(|_, w| w.exclusions().is_dirty()) {
            return true;
        }
        let half_skin = 0.5 * self.skin;
        self.locals
            .iter()
            .zip(dd.workers().iter())
            .any(|((_, local), (_, worker))| local.exceeds(worker, half_skin))
    }

    #[instrument(skip_all, name = "verlet_rebuild")]
    pub fn rebuild(&mut self, dd: &DomainDecomposition) -> Result<usize, EngineError> {
        if self.locals.size() != dd.workers().size() {
            self.locals = Collective::from_fn(dd.workers().size(), |_| LocalVerletList::default());
        }
        let range = self.cutoff + self.skin;
        let sizes = self.locals.try_zip_map_mut(dd.workers(), |rank, local, worker| {
            let size = local.rebuild(worker, range);
            debug!(rank = rank.0, pairs = size, "Local Verlet list rebuilt");
            Ok::<_, EngineError>(size)
        })?;
        let total: usize = sizes.gather().into_iter().sum();
        self.builds += 1;
        self.rebuild_requested = false;
        info!(pairs = total, builds = self.builds, "Verlet list rebuilt");
        Ok(total)
    }

    /// Stored pairs on one worker.
    pub fn local_size(&self, rank: Rank) -> usize {
        self.locals.get(rank).map_or(0, LocalVerletList::len)
    }

    /// Stored pairs summed over all workers.
    pub fn total_size(&self) -> usize {
        self.locals.all_reduce(|_, l| l.len(), 0, |a, b| a + b)
    }

    pub fn locals(&self) -> &Collective<LocalVerletList> {
        &self.locals
    }

    /// Every stored pair currently within the cutoff, in worker order.
    pub fn pairs(&self, dd: &DomainDecomposition) -> Result<Vec<NeighborPair>, EngineError> {
        let cutoff_sq = self.cutoff * self.cutoff;
        let mut result = Vec::new();
        for ((rank, local), (_, worker)) in self.locals.iter().zip(dd.workers().iter()) {
            for pair in local.pairs() {
                let (Some(a), Some(b)) = (
                    worker.slot_particle(pair.first),
                    worker.slot_particle(pair.second),
                ) else {
                    return Err(EngineError::Internal(format!(
                        "Verlet list on worker {rank} refers to a removed particle"
                    )));
                };
                let distance = b.position - a.position;
                if distance.norm_squared() <= cutoff_sq {
                    result.push(NeighborPair {
                        first: a.id,
                        second: b.id,
                        distance,
                    });
                }
            }
        }
        Ok(result)
    }

    /// Ids of every pair within the cutoff as `(smaller, larger)`, sorted.
    pub fn all_pairs(&self, dd: &DomainDecomposition) -> Result<Vec<(ParticleId, ParticleId)>, EngineError> {
        let mut ids: Vec<_> = self
            .pairs(dd)?
            .into_iter()
            .map(|p| (p.first.min(p.second), p.first.max(p.second)))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Compares the reported pairs against a serial scan over all representatives.
    pub fn verify(&self, dd: &DomainDecomposition, tuples: &TupleMap) -> Result<(), EngineError> {
        let points: Vec<(ParticleId, Point3<f64>)> = dd
            .workers()
            .iter()
            .flat_map(|(_, w)| w.locals())
            .filter(|p| !tuples.is_constituent(p.id))
            .map(|p| {
                let mut position = p.position;
                let mut image = p.image;
                dd.pbox().fold(&mut position, &mut image);
                (p.id, position)
            })
            .collect();
        let exclusions = dd
            .workers()
            .get(Rank(0))
            .map(Worker::exclusions)
            .ok_or_else(|| EngineError::Internal("decomposition has no workers".to_string()))?;

        let reference: BTreeSet<(ParticleId, ParticleId)> = periodic_pairs(dd.pbox(), &points, self.cutoff)?
            .into_iter()
            .filter(|&(a, b)| !exclusions.contains(a, b))
            .collect();
        let listed = self.all_pairs(dd)?;
        let duplicates = listed.windows(2).filter(|w| w[0] == w[1]).count();
        let listed: BTreeSet<(ParticleId, ParticleId)> = listed.into_iter().collect();

        let missing = reference.difference(&listed).count();
        let spurious = listed.difference(&reference).count() + duplicates;
        if missing > 0 || spurious > 0 {
            return Err(EngineError::PairListMismatch { missing, spurious });
        }
        Ok(())
    }
}

use super::comm::{Collective, Rank, exchange};
use super::config::ConfigError;
use super::error::EngineError;
use super::worker::{Ghost, Worker};
use crate::core::models::ids::ParticleId;
use crate::core::models::particle::Particle;
use crate::core::space::{PeriodicBox, SpatialGrid};
use crate::core::topology::tuples::TupleMap;
use nalgebra::{Point3, Vector3};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, instrument};

/// Cartesian arrangement of workers over the periodic box.
///
/// Rank `r` sits at node `(x, y, z)` with `r = x + nx * (y + ny * z)`. The node grid is
/// periodic: stepping off one face re-enters at the opposite one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeGrid {
    dims: [usize; 3],
}

impl NodeGrid {
    pub fn new(dims: [usize; 3]) -> Result<Self, ConfigError> {
        if dims.contains(&0) {
            return Err(ConfigError::InvalidParameter {
                name: "node-grid",
                reason: format!("every dimension must be at least 1, got {dims:?}"),
            });
        }
        Ok(Self { dims })
    }

    /// Splits `workers` into a grid by handing each prime factor, largest first, to the axis
    /// whose subdomains are currently longest.
    pub fn factorize(workers: usize, lengths: &Vector3<f64>) -> Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        let mut dims = [1usize; 3];
        for factor in prime_factors(workers).into_iter().rev() {
            let mut axis = 0;
            for candidate in 1..3 {
                if lengths[candidate] / dims[candidate] as f64 > lengths[axis] / dims[axis] as f64 {
                    axis = candidate;
                }
            }
            dims[axis] *= factor;
        }
        Self::new(dims)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn rank_of(&self, node: [usize; 3]) -> Rank {
        let [nx, ny, _] = self.dims;
        Rank(node[0] + nx * (node[1] + ny * node[2]))
    }

    pub fn node_of(&self, rank: Rank) -> [usize; 3] {
        let [nx, ny, _] = self.dims;
        [rank.0 % nx, (rank.0 / nx) % ny, rank.0 / (nx * ny)]
    }

    /// The node reached from `node` by `offset`, and the periodic image a particle sent there
    /// must be shifted by. Wrapping below the grid yields `+1`, wrapping above yields `-1`.
    pub fn neighbor(&self, node: [usize; 3], offset: [isize; 3]) -> ([usize; 3], [i32; 3]) {
        let mut target = [0usize; 3];
        let mut image = [0i32; 3];
        for axis in 0..3 {
            let n = self.dims[axis] as isize;
            let c = node[axis] as isize + offset[axis];
            if c < 0 {
                image[axis] = 1;
            } else if c >= n {
                image[axis] = -1;
            }
            target[axis] = c.rem_euclid(n) as usize;
        }
        (target, image)
    }

    pub fn widths(&self, pbox: &PeriodicBox) -> Vector3<f64> {
        Vector3::from_fn(|axis, _| pbox.length(axis) / self.dims[axis] as f64)
    }

    /// Node owning a folded position. Subdomains are half-open, `[lower, upper)`.
    pub fn node_of_position(&self, position: &Point3<f64>, pbox: &PeriodicBox) -> [usize; 3] {
        let widths = self.widths(pbox);
        std::array::from_fn(|axis| {
            let slot = (position[axis] / widths[axis]).floor();
            if slot.is_finite() && slot > 0.0 {
                (slot as usize).min(self.dims[axis] - 1)
            } else {
                0
            }
        })
    }

    pub fn subdomain(&self, node: [usize; 3], pbox: &PeriodicBox) -> (Point3<f64>, Point3<f64>) {
        let widths = self.widths(pbox);
        let lower = Point3::from(Vector3::from_fn(|axis, _| node[axis] as f64 * widths[axis]));
        let upper = Point3::from(Vector3::from_fn(|axis, _| {
            if node[axis] + 1 == self.dims[axis] {
                pbox.length(axis)
            } else {
                (node[axis] + 1) as f64 * widths[axis]
            }
        }));
        (lower, upper)
    }
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecompositionReport {
    /// Particles that changed owner.
    pub migrated: usize,
    /// Ghost copies held across all workers afterwards.
    pub ghosts: usize,
}

/// Partition of the box into one subdomain per worker.
///
/// Every particle is owned by exactly one worker, the one whose subdomain contains the
/// folded position of its molecule's representative. Each worker additionally holds ghost
/// copies of all molecules within one cell of its faces.
#[derive(Debug, Clone)]
pub struct DomainDecomposition {
    pbox: PeriodicBox,
    grid: NodeGrid,
    range: f64,
    workers: Collective<Worker>,
    regroup: bool,
}

impl DomainDecomposition {
    pub fn new(pbox: PeriodicBox, grid: NodeGrid, range: f64) -> Result<Self, EngineError> {
        let workers = (0..grid.size())
            .map(|i| {
                let rank = Rank(i);
                let node = grid.node_of(rank);
                let (lower, upper) = grid.subdomain(node, &pbox);
                let cells = SpatialGrid::framed(lower, upper, range)?;
                Ok(Worker::new(rank, node, lower, upper, cells))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        info!(
            node_grid = ?grid.dims(),
            workers = workers.len(),
            range,
            "Domain decomposition initialized"
        );
        Ok(Self {
            pbox,
            grid,
            range,
            workers: Collective::from_vec(workers),
            regroup: false,
        })
    }

    pub fn pbox(&self) -> &PeriodicBox {
        &self.pbox
    }

    pub fn node_grid(&self) -> &NodeGrid {
        &self.grid
    }

    pub fn range(&self) -> f64 {
        self.range
    }

    pub fn workers(&self) -> &Collective<Worker> {
        &self.workers
    }

    pub fn workers_mut(&mut self) -> &mut Collective<Worker> {
        &mut self.workers
    }

    /// Validates and distributes new particles to the workers owning their folded positions.
    pub fn add_particles(&mut self, particles: Vec<Particle>) -> Result<usize, EngineError> {
        let mut seen = HashSet::with_capacity(particles.len());
        for p in &particles {
            if !p.is_finite() {
                return Err(EngineError::InvalidParticle {
                    id: p.id,
                    reason: "position and velocity must be finite".to_string(),
                });
            }
            if !(p.mass.is_finite() && p.mass > 0.0) {
                return Err(EngineError::InvalidParticle {
                    id: p.id,
                    reason: format!("mass must be positive, got {}", p.mass),
                });
            }
            if let Some((rank, _)) = self.locate(p.id) {
                return Err(EngineError::DuplicateParticle { id: p.id, rank });
            }
            if !seen.insert(p.id) {
                return Err(EngineError::InvalidParticle {
                    id: p.id,
                    reason: "listed twice in the same batch".to_string(),
                });
            }
        }

        let count = particles.len();
        for mut particle in particles {
            self.pbox.fold(&mut particle.position, &mut particle.image);
            let rank = self
                .grid
                .rank_of(self.grid.node_of_position(&particle.position, &self.pbox));
            let worker = self
                .workers
                .get_mut(rank)
                .ok_or_else(|| EngineError::Internal(format!("no worker with rank {rank}")))?;
            worker.insert_local(particle)?;
        }
        debug!(count, "Particles added");
        Ok(count)
    }

    /// Asks the next decomposition to move stray constituents next to their representative.
    pub fn request_regroup(&mut self) {
        self.regroup = true;
    }

    /// Migrates molecules to the workers owning their representatives, rebuilds the cell
    /// lists and exchanges ghosts. Running it twice without moving particles changes nothing.
    #[instrument(skip_all, name = "decompose", fields(step = step))]
    pub fn decompose(&mut self, tuples: &TupleMap, step: u64) -> Result<DecompositionReport, EngineError> {
        for (_, worker) in self.workers.iter() {
            worker.check_finite(step)?;
        }

        let pbox = self.pbox;
        let grid = self.grid;
        let outboxes = self
            .workers
            .try_map_mut(|_, w| w.emigrate(&pbox, &grid, tuples, step))?;
        let inboxes = exchange(outboxes);
        let received = self
            .workers
            .try_zip_map_mut(&inboxes, |_, w, inbox| w.immigrate(inbox))?;
        let mut migrated: usize = received.gather().into_iter().sum();

        if self.regroup {
            let owners = self.representative_owners(tuples);
            let outboxes = self
                .workers
                .map_mut(|_, w| w.emigrate_strays(tuples, &owners));
            let inboxes = exchange(outboxes);
            let received = self
                .workers
                .try_zip_map_mut(&inboxes, |_, w, inbox| w.immigrate(inbox))?;
            migrated += received.gather().into_iter().sum::<usize>();
            self.workers
                .for_each_mut(|_, w| w.make_molecules_whole(&pbox, tuples));
            self.regroup = false;
        }

        self.workers.for_each_mut(|_, w| w.resort(&pbox, tuples));
        let ghosts = self.exchange_ghosts(tuples)?;
        debug!(migrated, ghosts, "Decomposition finished");
        Ok(DecompositionReport { migrated, ghosts })
    }

    fn representative_owners(&self, tuples: &TupleMap) -> HashMap<ParticleId, Rank> {
        let mut owners = HashMap::new();
        for (rank, worker) in self.workers.iter() {
            for p in worker.locals().filter(|p| tuples.has_tuple(p.id)) {
                owners.insert(p.id, rank);
            }
        }
        owners
    }

    fn exchange_ghosts(&mut self, tuples: &TupleMap) -> Result<usize, EngineError> {
        let pbox = self.pbox;
        let grid = self.grid;
        let outboxes = self
            .workers
            .map_mut(|_, w| w.export_ghosts(&grid, tuples));
        let inboxes = exchange(outboxes);
        let received = self.workers.try_zip_map_mut(&inboxes, |_, w, inbox| {
            Ok::<_, EngineError>(w.import_ghosts(inbox, &pbox, tuples))
        })?;
        Ok(received.gather().into_iter().sum())
    }

    /// Copies current owner state onto every ghost without changing ghost membership.
    pub fn update_ghosts(&mut self, tuples: &TupleMap) -> Result<usize, EngineError> {
        let pbox = self.pbox;
        let outboxes = self.workers.map(|_, w| w.ghost_refresh(tuples));
        let inboxes = exchange(outboxes);
        let refreshed = self
            .workers
            .try_zip_map_mut(&inboxes, |_, w, inbox| w.apply_ghost_refresh(inbox, &pbox))?;
        Ok(refreshed.gather().into_iter().sum())
    }

    /// Adds the forces accumulated on ghosts to their owners' particles and clears them.
    pub fn collect_ghost_forces(&mut self) -> Result<(), EngineError> {
        let outboxes = self.workers.map_mut(|_, w| w.drain_ghost_forces());
        let inboxes = exchange(outboxes);
        self.workers
            .try_zip_map_mut(&inboxes, |_, w, inbox| w.accumulate_forces(inbox))?;
        Ok(())
    }

    pub fn zero_forces(&mut self) {
        self.workers.for_each_mut(|_, w| w.zero_forces());
    }

    pub fn distribute_molecular_forces(&mut self, tuples: &TupleMap) {
        self.workers
            .for_each_mut(|_, w| w.distribute_molecular_forces(tuples));
    }

    /// Recomputes every coarse-grained particle from its constituents. Returns how many were
    /// refreshed.
    pub fn refresh_molecules(&mut self, tuples: &TupleMap) -> usize {
        self.workers
            .map_mut(|_, w| w.refresh_molecules(tuples))
            .gather()
            .into_iter()
            .sum()
    }

    pub fn locate(&self, id: ParticleId) -> Option<(Rank, &Particle)> {
        self.workers
            .iter()
            .find_map(|(rank, w)| w.local(id).map(|p| (rank, p)))
    }

    pub fn particle(&self, id: ParticleId) -> Option<&Particle> {
        self.locate(id).map(|(_, p)| p)
    }

    pub fn particle_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        self.workers
            .iter_mut()
            .find_map(|(_, w)| w.local_mut(id))
    }

    pub fn total_particles(&self) -> usize {
        self.workers.iter().map(|(_, w)| w.local_count()).sum()
    }

    pub fn total_ghosts(&self) -> usize {
        self.workers.iter().map(|(_, w)| w.ghost_count()).sum()
    }

    /// Owner of every particle, in id order.
    pub fn ownership(&self) -> BTreeMap<ParticleId, Rank> {
        self.workers
            .iter()
            .flat_map(|(rank, w)| w.locals().map(move |p| (p.id, rank)))
            .collect()
    }

    /// Ghost `(id, image)` pairs held by every worker.
    pub fn ghost_sets(&self) -> Vec<BTreeSet<(ParticleId, [i32; 3])>> {
        self.workers
            .iter()
            .map(|(_, w)| w.ghosts().map(|g: &Ghost| (g.particle.id, g.image)).collect())
            .collect()
    }

    /// All owned particles in id order.
    pub fn particles(&self) -> Vec<&Particle> {
        let mut all: Vec<&Particle> = self.workers.iter().flat_map(|(_, w)| w.locals()).collect();
        all.sort_by_key(|p| p.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ids::ParticleId;

    fn cube(l: f64) -> PeriodicBox {
        PeriodicBox::new([l, l, l]).unwrap()
    }

    fn particle(id: u64, x: f64, y: f64, z: f64) -> Particle {
        Particle::new(ParticleId(id), 0, Point3::new(x, y, z))
    }

    #[test]
    fn factorize_prefers_the_longest_axis() {
        let cubic = Vector3::new(10.0, 10.0, 10.0);
        assert_eq!(NodeGrid::factorize(1, &cubic).unwrap().dims(), [1, 1, 1]);
        assert_eq!(NodeGrid::factorize(2, &cubic).unwrap().dims(), [2, 1, 1]);
        assert_eq!(NodeGrid::factorize(8, &cubic).unwrap().dims(), [2, 2, 2]);
        assert_eq!(NodeGrid::factorize(12, &cubic).unwrap().dims(), [3, 2, 2]);
        let long = Vector3::new(10.0, 10.0, 40.0);
        assert_eq!(NodeGrid::factorize(4, &long).unwrap().dims(), [1, 1, 4]);
    }

    #[test]
    fn factorize_rejects_zero_workers() {
        assert!(NodeGrid::factorize(0, &Vector3::new(1.0, 1.0, 1.0)).is_err());
        assert!(NodeGrid::new([2, 0, 1]).is_err());
    }

    #[test]
    fn rank_and_node_are_inverse() {
        let grid = NodeGrid::new([3, 2, 2]).unwrap();
        for r in 0..grid.size() {
            assert_eq!(grid.rank_of(grid.node_of(Rank(r))), Rank(r));
        }
        assert_eq!(grid.rank_of([1, 1, 0]), Rank(4));
    }

    #[test]
    fn neighbor_wraps_with_image() {
        let grid = NodeGrid::new([2, 1, 1]).unwrap();
        assert_eq!(grid.neighbor([0, 0, 0], [-1, 0, 0]), ([1, 0, 0], [1, 0, 0]));
        assert_eq!(grid.neighbor([1, 0, 0], [1, 0, 0]), ([0, 0, 0], [-1, 0, 0]));
        assert_eq!(grid.neighbor([0, 0, 0], [1, 0, 0]), ([1, 0, 0], [0, 0, 0]));
        assert_eq!(grid.neighbor([0, 0, 0], [0, 1, 0]), ([0, 0, 0], [0, -1, 0]));
    }

    #[test]
    fn ownership_is_half_open() {
        let pbox = cube(10.0);
        let grid = NodeGrid::new([2, 1, 1]).unwrap();
        assert_eq!(grid.node_of_position(&Point3::new(4.999, 1.0, 1.0), &pbox), [0, 0, 0]);
        assert_eq!(grid.node_of_position(&Point3::new(5.0, 1.0, 1.0), &pbox), [1, 0, 0]);
        assert_eq!(grid.node_of_position(&Point3::new(9.999, 1.0, 1.0), &pbox), [1, 0, 0]);
    }

    #[test]
    fn subdomains_tile_the_box() {
        let pbox = PeriodicBox::new([9.0, 6.0, 3.0]).unwrap();
        let grid = NodeGrid::new([3, 2, 1]).unwrap();
        let (lower, upper) = grid.subdomain([2, 1, 0], &pbox);
        assert_eq!(lower, Point3::new(6.0, 3.0, 0.0));
        assert_eq!(upper, Point3::new(9.0, 6.0, 3.0));
    }

    #[test]
    fn add_particles_assigns_owner_and_rejects_duplicates() {
        let mut dd = DomainDecomposition::new(cube(10.0), NodeGrid::new([2, 1, 1]).unwrap(), 2.0).unwrap();
        dd.add_particles(vec![particle(1, 4.9, 1.0, 1.0), particle(2, 5.1, 1.0, 1.0)])
            .unwrap();
        assert_eq!(dd.locate(ParticleId(1)).unwrap().0, Rank(0));
        assert_eq!(dd.locate(ParticleId(2)).unwrap().0, Rank(1));

        let err = dd.add_particles(vec![particle(1, 1.0, 1.0, 1.0)]).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateParticle { rank: Rank(0), .. }));
        assert_eq!(dd.total_particles(), 2);
    }

    #[test]
    fn add_particles_folds_and_validates() {
        let mut dd = DomainDecomposition::new(cube(10.0), NodeGrid::new([1, 1, 1]).unwrap(), 2.0).unwrap();
        dd.add_particles(vec![particle(1, -1.0, 11.0, 5.0)]).unwrap();
        let p = dd.particle(ParticleId(1)).unwrap();
        assert!((p.position - Point3::new(9.0, 1.0, 5.0)).norm() < 1e-12);
        assert_eq!(p.image, [-1, 1, 0]);

        let bad = particle(2, f64::NAN, 0.0, 0.0);
        assert!(matches!(
            dd.add_particles(vec![bad]),
            Err(EngineError::InvalidParticle { .. })
        ));
        let massless = particle(3, 1.0, 1.0, 1.0).with_mass(0.0);
        assert!(dd.add_particles(vec![massless]).is_err());
    }

    #[test]
    fn decompose_migrates_and_builds_ghosts() {
        let mut dd = DomainDecomposition::new(cube(10.0), NodeGrid::new([2, 1, 1]).unwrap(), 2.0).unwrap();
        let tuples = TupleMap::new();
        dd.add_particles(vec![particle(1, 4.9, 5.0, 5.0), particle(2, 5.1, 5.0, 5.0)])
            .unwrap();
        dd.decompose(&tuples, 0).unwrap();

        let sets = dd.ghost_sets();
        assert!(sets[0].contains(&(ParticleId(2), [0, 0, 0])));
        assert!(sets[1].contains(&(ParticleId(1), [0, 0, 0])));

        dd.particle_mut(ParticleId(1)).unwrap().position.x = 5.2;
        let report = dd.decompose(&tuples, 1).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(dd.locate(ParticleId(1)).unwrap().0, Rank(1));
    }

    #[test]
    fn decompose_is_idempotent() {
        let mut dd = DomainDecomposition::new(cube(12.0), NodeGrid::new([2, 2, 1]).unwrap(), 2.5).unwrap();
        let tuples = TupleMap::new();
        let particles = (0..40)
            .map(|i| {
                let f = i as f64;
                particle(i, (f * 1.7) % 12.0, (f * 2.9) % 12.0, (f * 0.37) % 12.0)
            })
            .collect();
        dd.add_particles(particles).unwrap();
        dd.decompose(&tuples, 0).unwrap();
        let ownership = dd.ownership();
        let ghosts = dd.ghost_sets();

        let report = dd.decompose(&tuples, 0).unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(dd.ownership(), ownership);
        assert_eq!(dd.ghost_sets(), ghosts);
        assert_eq!(dd.total_particles(), 40);
    }

    #[test]
    fn single_worker_holds_periodic_self_images() {
        let mut dd = DomainDecomposition::new(cube(10.0), NodeGrid::new([1, 1, 1]).unwrap(), 2.0).unwrap();
        let tuples = TupleMap::new();
        dd.add_particles(vec![particle(7, 0.5, 5.0, 5.0)]).unwrap();
        dd.decompose(&tuples, 0).unwrap();
        let ghost = dd.workers().get(Rank(0)).unwrap().ghost(ParticleId(7), [1, 0, 0]).unwrap();
        assert!((ghost.particle.position.x - 10.5).abs() < 1e-12);
        assert_eq!(ghost.owner, Rank(0));
    }

    #[test]
    fn jump_beyond_a_subdomain_is_fatal() {
        let mut dd = DomainDecomposition::new(cube(10.0), NodeGrid::new([2, 1, 1]).unwrap(), 2.0).unwrap();
        let tuples = TupleMap::new();
        dd.add_particles(vec![particle(1, 1.0, 5.0, 5.0)]).unwrap();
        dd.decompose(&tuples, 0).unwrap();
        dd.particle_mut(ParticleId(1)).unwrap().position.x = 7.5;
        let err = dd.decompose(&tuples, 3).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ParticleJumped { step: 3, axis: 0, .. }
        ));
    }

    #[test]
    fn non_finite_position_is_reported() {
        let mut dd = DomainDecomposition::new(cube(10.0), NodeGrid::new([1, 1, 1]).unwrap(), 2.0).unwrap();
        let tuples = TupleMap::new();
        dd.add_particles(vec![particle(1, 1.0, 5.0, 5.0)]).unwrap();
        dd.particle_mut(ParticleId(1)).unwrap().position.y = f64::INFINITY;
        assert!(matches!(
            dd.decompose(&tuples, 9),
            Err(EngineError::NonFinitePosition { step: 9, .. })
        ));
    }

    #[test]
    fn ghost_forces_reach_their_owner() {
        let mut dd = DomainDecomposition::new(cube(10.0), NodeGrid::new([2, 1, 1]).unwrap(), 2.0).unwrap();
        let tuples = TupleMap::new();
        dd.add_particles(vec![particle(1, 4.9, 5.0, 5.0), particle(2, 5.1, 5.0, 5.0)])
            .unwrap();
        dd.decompose(&tuples, 0).unwrap();
        dd.zero_forces();

        let worker = dd.workers_mut().get_mut(Rank(0)).unwrap();
        let slot = worker
            .cell(worker.grid().clamped_cell_of(&Point3::new(5.1, 5.0, 5.0)))
            .to_vec();
        for s in slot {
            if let Some(p) = worker.slot_particle_mut(s) {
                if p.id == ParticleId(2) {
                    p.force = Vector3::new(1.0, 0.0, 0.0);
                }
            }
        }
        dd.collect_ghost_forces().unwrap();
        assert_eq!(dd.particle(ParticleId(2)).unwrap().force, Vector3::new(1.0, 0.0, 0.0));
    }
}

use crate::core::forcefield::potentials::PairPotential;
use crate::core::models::ids::{ListId, ParticleId};
use crate::core::models::particle::Particle;
use crate::core::models::region::ParticleRegion;
use crate::core::space::PeriodicBox;
use crate::core::topology::exclusions::{ExclusionOp, ExclusionPair};
use crate::core::topology::lists::{BondedTopology, ListKind};
use crate::core::topology::tuples::{MoleculeState, TupleMap};
use crate::engine::blender::{AdResSForceBlender, ForceReport};
use crate::engine::comm::{Outbox, Rank, exchange};
use crate::engine::config::SimulationConfig;
use crate::engine::decomposition::{DecompositionReport, DomainDecomposition};
use crate::engine::error::EngineError;
use crate::engine::resolution::{Axis, Region, RegionCentre, RegionShape, ResolutionField};
use crate::engine::verlet::{NeighborPair, VerletList};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Handle of a neighbour list created by [`Simulation::build_neighbor_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighborListId(usize);

/// The adaptive-resolution core behind one facade.
///
/// `Simulation` owns the decomposition, the coarse-grained tuples, the bonded topology that
/// drives exclusions, the resolution field and every neighbour list. Positions and velocities
/// are advanced by an external integrator through [`Simulation::integrate`]; everything a
/// force evaluation needs (ghosts, migration, list rebuilds, λ) is brought up to date by
/// [`Simulation::compute_forces`].
#[derive(Debug)]
pub struct Simulation {
    config: SimulationConfig,
    pbox: PeriodicBox,
    dd: DomainDecomposition,
    tuples: TupleMap,
    topology: BondedTopology,
    field: ResolutionField,
    lists: Vec<VerletList>,
    step: u64,
    needs_decompose: bool,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let pbox = config.periodic_box()?;
        let grid = config.resolve_node_grid()?;
        let dd = DomainDecomposition::new(pbox, grid, config.range())?;
        let mut field = ResolutionField::new(config.lambda_update_threshold);
        for region in &config.regions {
            field.define_region(region.clone(), &pbox)?;
        }
        info!(
            box_lengths = ?config.box_lengths,
            workers = config.workers,
            cutoff = config.cutoff,
            skin = config.skin,
            "Simulation created"
        );
        Ok(Self {
            config,
            pbox,
            dd,
            tuples: TupleMap::new(),
            topology: BondedTopology::new(),
            field,
            lists: Vec::new(),
            step: 0,
            needs_decompose: true,
        })
    }

    /// Builds a simulation from a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Self::new(SimulationConfig::load(path)?)
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn pbox(&self) -> &PeriodicBox {
        &self.pbox
    }

    pub fn decomposition(&self) -> &DomainDecomposition {
        &self.dd
    }

    pub fn tuples(&self) -> &TupleMap {
        &self.tuples
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    // --- Particles and tuples -------------------------------------------------------------

    pub fn add_particles(&mut self, particles: Vec<Particle>) -> Result<usize, EngineError> {
        let added = self.dd.add_particles(particles)?;
        self.needs_decompose = true;
        Ok(added)
    }

    /// Registers tuples `[cg, at_1, at_2, ...]`.
    ///
    /// Each molecule is made whole around its first constituent and its coarse-grained
    /// particle is placed at the centre of mass. Constituents move to the worker of their
    /// representative at the next decomposition.
    #[instrument(skip_all, name = "add_tuples")]
    pub fn add_tuples(&mut self, tuples: &[Vec<ParticleId>]) -> Result<usize, EngineError> {
        let dd = &self.dd;
        let added = self
            .tuples
            .add_tuples(tuples, |id| dd.particle(id).map(|p| p.coarse_grained))?;

        for tuple in tuples {
            let Some((&cg, members)) = tuple.split_first() else {
                continue;
            };
            self.assemble_molecule(cg, members)?;
        }
        self.dd.request_regroup();
        self.needs_decompose = true;
        self.field.update(&mut self.dd, &self.tuples)?;
        debug!(tuples = added, "Tuples registered");
        Ok(added)
    }

    fn assemble_molecule(&mut self, cg: ParticleId, members: &[ParticleId]) -> Result<(), EngineError> {
        let first = members.first().copied().ok_or(EngineError::ParticleNotFound(cg))?;
        let anchor = self.dd.particle(first).ok_or(EngineError::ParticleNotFound(first))?;
        let (origin, image) = (anchor.position, anchor.image);

        for &at in &members[1..] {
            let p = self.dd.particle_mut(at).ok_or(EngineError::ParticleNotFound(at))?;
            let whole = origin + self.pbox.displacement(&origin, &p.position);
            for axis in 0..3 {
                let k = ((p.position[axis] - whole[axis]) / self.pbox.length(axis)).round() as i32;
                p.image[axis] += k;
            }
            p.position = whole;
        }

        let state = {
            let particles = members
                .iter()
                .map(|id| self.dd.particle(*id).ok_or(EngineError::ParticleNotFound(*id)))
                .collect::<Result<Vec<_>, _>>()?;
            MoleculeState::aggregate(particles).ok_or_else(|| EngineError::InvalidParticle {
                id: cg,
                reason: "constituents have no mass".to_string(),
            })?
        };
        let rep = self.dd.particle_mut(cg).ok_or(EngineError::ParticleNotFound(cg))?;
        rep.position = state.position;
        rep.velocity = state.velocity;
        rep.mass = state.mass;
        rep.image = image;
        Ok(())
    }

    /// Constituents of `cg` in registration order.
    pub fn constituents(&self, cg: ParticleId) -> Option<&[ParticleId]> {
        self.tuples.constituents(cg)
    }

    /// Centre of mass, velocity and total mass of a molecule, aggregated from its constituents.
    pub fn molecule_state(&self, cg: ParticleId) -> Result<MoleculeState, EngineError> {
        let members = self
            .tuples
            .constituents(cg)
            .ok_or(EngineError::ParticleNotFound(cg))?;
        let particles = members
            .iter()
            .map(|id| self.dd.particle(*id).ok_or(EngineError::ParticleNotFound(*id)))
            .collect::<Result<Vec<_>, _>>()?;
        MoleculeState::aggregate(particles).ok_or_else(|| EngineError::InvalidParticle {
            id: cg,
            reason: "constituents have no mass".to_string(),
        })
    }

    pub fn particle(&self, id: ParticleId) -> Option<&Particle> {
        self.dd.particle(id)
    }

    /// All particles in id order.
    pub fn particles(&self) -> Vec<&Particle> {
        self.dd.particles()
    }

    /// Ids of the particles inside `region`, sorted.
    pub fn particles_in_region(&self, region: &ParticleRegion) -> Vec<ParticleId> {
        let inside: Vec<ParticleId> = self
            .dd
            .particles()
            .into_iter()
            .filter(|p| region.contains(p))
            .map(|p| p.id)
            .collect();
        if inside.is_empty() {
            warn!(lower = ?region.lower(), upper = ?region.upper(), "Particle region is empty");
        }
        inside
    }

    // --- Decomposition --------------------------------------------------------------------

    /// Migrates particles, exchanges ghosts, recomputes λ and rebuilds every neighbour list.
    ///
    /// The first call freezes the tuples and checks that every coarse-grained particle heads
    /// one.
    #[instrument(skip_all, name = "simulation_decompose")]
    pub fn decompose(&mut self) -> Result<DecompositionReport, EngineError> {
        if !self.tuples.is_sealed() {
            let coarse_grained: Vec<ParticleId> = self
                .dd
                .particles()
                .into_iter()
                .filter(|p| p.coarse_grained)
                .map(|p| p.id)
                .collect();
            self.tuples.check_coverage(coarse_grained)?;
            self.tuples.seal();
        }

        self.synchronize_exclusions()?;
        self.dd.refresh_molecules(&self.tuples);
        let report = self.dd.decompose(&self.tuples, self.step)?;
        self.field.update(&mut self.dd, &self.tuples)?;
        self.dd.update_ghosts(&self.tuples)?;
        for list in &mut self.lists {
            list.rebuild(&self.dd)?;
        }
        self.dd
            .workers_mut()
            .for_each_mut(|_, w| w.exclusions_mut().mark_clean());
        self.needs_decompose = false;

        if self.config.verify_pairs {
            for list in &self.lists {
                list.verify(&self.dd, &self.tuples)?;
            }
        }
        for (rank, worker) in self.dd.workers().iter() {
            if worker.local_count() == 0 {
                warn!(rank = rank.0, "Worker owns no particles");
            }
        }
        info!(
            step = self.step,
            migrated = report.migrated,
            ghosts = report.ghosts,
            "Decomposition complete"
        );
        Ok(report)
    }

    /// Brings ghosts, molecules, λ and neighbour lists up to date. Returns `true` if a full
    /// decomposition was needed.
    fn prepare(&mut self) -> Result<bool, EngineError> {
        self.synchronize_exclusions()?;
        self.dd.refresh_molecules(&self.tuples);
        let stale = self.needs_decompose || self.lists.iter().any(|l| l.needs_rebuild(&self.dd));
        if stale {
            self.decompose()?;
        } else {
            self.field.update(&mut self.dd, &self.tuples)?;
            self.dd.update_ghosts(&self.tuples)?;
        }
        Ok(stale)
    }

    // --- Neighbour lists ------------------------------------------------------------------

    /// Creates a Verlet list and builds it against the current configuration.
    pub fn build_neighbor_list(&mut self, cutoff: f64, skin: f64) -> Result<NeighborListId, EngineError> {
        let mut list = VerletList::new(cutoff, skin, &self.dd)?;
        if self.needs_decompose {
            self.lists.push(list);
            self.decompose()?;
        } else {
            list.rebuild(&self.dd)?;
            self.lists.push(list);
        }
        Ok(NeighborListId(self.lists.len() - 1))
    }

    pub fn neighbor_list(&self, id: NeighborListId) -> Result<&VerletList, EngineError> {
        self.lists.get(id.0).ok_or(EngineError::UnknownNeighborList(id.0))
    }

    fn neighbor_list_mut(&mut self, id: NeighborListId) -> Result<&mut VerletList, EngineError> {
        self.lists.get_mut(id.0).ok_or(EngineError::UnknownNeighborList(id.0))
    }

    /// Every pair of the list within its cutoff as sorted `(smaller, larger)` ids.
    pub fn all_pairs(&mut self, id: NeighborListId) -> Result<Vec<(ParticleId, ParticleId)>, EngineError> {
        self.neighbor_list(id)?;
        self.prepare()?;
        self.neighbor_list(id)?.all_pairs(&self.dd)
    }

    /// Every pair of the list within its cutoff together with its separation vector.
    pub fn neighbor_pairs(&mut self, id: NeighborListId) -> Result<Vec<NeighborPair>, EngineError> {
        self.neighbor_list(id)?;
        self.prepare()?;
        self.neighbor_list(id)?.pairs(&self.dd)
    }

    pub fn local_size(&self, id: NeighborListId, rank: Rank) -> Result<usize, EngineError> {
        Ok(self.neighbor_list(id)?.local_size(rank))
    }

    pub fn total_size(&self, id: NeighborListId) -> Result<usize, EngineError> {
        Ok(self.neighbor_list(id)?.total_size())
    }

    pub fn set_cutoff(&mut self, id: NeighborListId, cutoff: f64) -> Result<(), EngineError> {
        let dd = &self.dd;
        let list = self.lists.get_mut(id.0).ok_or(EngineError::UnknownNeighborList(id.0))?;
        list.set_cutoff(cutoff, dd)
    }

    pub fn request_rebuild(&mut self, id: NeighborListId) -> Result<(), EngineError> {
        self.neighbor_list_mut(id)?.request_rebuild();
        Ok(())
    }

    // --- Exclusions -----------------------------------------------------------------------

    /// Excludes `pairs` on every worker and rebuilds all neighbour lists right away.
    pub fn exclude(&mut self, pairs: &[(ParticleId, ParticleId)]) -> Result<usize, EngineError> {
        for &(a, b) in pairs {
            ExclusionPair::new(a, b)?;
        }
        let controller = self
            .dd
            .workers_mut()
            .get_mut(Rank(0))
            .ok_or_else(|| EngineError::Internal("decomposition has no workers".to_string()))?;
        let mut added = 0;
        for &(a, b) in pairs {
            if controller.exclusions_mut().exclude(a, b)? {
                added += 1;
            }
        }
        self.synchronize_exclusions()?;
        if !self.lists.is_empty() {
            self.decompose()?;
        }
        Ok(added)
    }

    /// Drops an explicit exclusion on every worker. Lists pick it up at their next rebuild.
    pub fn unexclude(&mut self, a: ParticleId, b: ParticleId) -> Result<bool, EngineError> {
        let controller = self
            .dd
            .workers_mut()
            .get_mut(Rank(0))
            .ok_or_else(|| EngineError::Internal("decomposition has no workers".to_string()))?;
        let removed = controller.exclusions_mut().unexclude(a, b)?;
        self.synchronize_exclusions()?;
        Ok(removed)
    }

    /// Whether the exclusions changed since the neighbour lists last consumed them.
    pub fn is_dirty(&self) -> bool {
        self.dd.workers().any(|_, w| w.exclusions().is_dirty())
    }

    /// Applies pending bonded-list changes everywhere and broadcasts explicit exclusion edits
    /// made on any worker to all others. Afterwards every copy must hold the same pairs.
    #[instrument(skip_all, name = "exclusion_broadcast")]
    pub fn synchronize_exclusions(&mut self) -> Result<(), EngineError> {
        let topology = &self.topology;
        let size = self.dd.workers().size();
        let outboxes = self.dd.workers_mut().map_mut(|rank, w| {
            w.exclusions_mut().sync(topology);
            let ops = w.exclusions_mut().take_pending();
            let mut outbox: Outbox<Vec<ExclusionOp>> = Outbox::new(rank);
            if !ops.is_empty() {
                for to in (0..size).map(Rank).filter(|&to| to != rank) {
                    outbox.send(to, ops.clone());
                }
            }
            outbox
        });
        let inboxes = exchange(outboxes);
        self.dd.workers_mut().try_zip_map_mut(&inboxes, |_, w, inbox| {
            for envelope in inbox {
                w.exclusions_mut().apply_remote(&envelope.payload);
            }
            Ok::<_, EngineError>(())
        })?;

        let fingerprints = self.dd.workers().map(|_, w| w.exclusions().fingerprint()).gather();
        if let Some(&reference) = fingerprints.first() {
            if let Some(rank) = fingerprints.iter().position(|&f| f != reference) {
                return Err(EngineError::ExclusionMismatch { rank: Rank(rank) });
            }
        }

        let consumed = self
            .dd
            .workers()
            .iter()
            .filter_map(|(_, w)| w.exclusions().cursor())
            .min()
            .unwrap_or_else(|| self.topology.journal_len());
        let dropped = self.topology.compact(consumed);
        if dropped > 0 {
            debug!(dropped, "Compacted bonded topology journal");
        }
        Ok(())
    }

    /// Excluded pairs as seen by the first worker.
    pub fn excluded_pairs(&self) -> Vec<(ParticleId, ParticleId)> {
        self.dd
            .workers()
            .get(Rank(0))
            .map(|w| w.exclusions().pairs())
            .unwrap_or_default()
    }

    // --- Bonded topology ------------------------------------------------------------------

    pub fn add_bonded_list(&mut self, kind: ListKind) -> ListId {
        self.topology.add_list(kind)
    }

    /// Adds a bond and replays it into every observing exclusion set right away.
    pub fn add_bond(&mut self, list: ListId, entry: &[ParticleId]) -> Result<bool, EngineError> {
        let added = self.topology.add(list, entry)?;
        if added {
            self.synchronize_exclusions()?;
        }
        Ok(added)
    }

    pub fn remove_bond(&mut self, list: ListId, entry: &[ParticleId]) -> Result<bool, EngineError> {
        let removed = self.topology.remove(list, entry)?;
        if removed {
            self.synchronize_exclusions()?;
        }
        Ok(removed)
    }

    pub fn topology(&self) -> &BondedTopology {
        &self.topology
    }

    /// Derives exclusions from every entry of `list`, now and as it changes.
    pub fn observe(&mut self, list: ListId) -> Result<(), EngineError> {
        let topology = &self.topology;
        self.dd
            .workers_mut()
            .try_map_mut(|_, w| w.exclusions_mut().observe(topology, list))?;
        Ok(())
    }

    pub fn disconnect(&mut self, list: ListId) -> Result<bool, EngineError> {
        let topology = &self.topology;
        let removed = self
            .dd
            .workers_mut()
            .try_map_mut(|_, w| w.exclusions_mut().disconnect(topology, list))?;
        Ok(removed.gather().into_iter().any(|r| r))
    }

    // --- Resolution -----------------------------------------------------------------------

    /// Adds an adaptive-resolution region around a fixed point or a tracked particle.
    ///
    /// `spherical = false` defines a slab perpendicular to the x axis.
    pub fn define_region(
        &mut self,
        centre: RegionCentre,
        ex_size: f64,
        hy_size: f64,
        spherical: bool,
    ) -> Result<(), EngineError> {
        let shape = if spherical {
            RegionShape::Sphere
        } else {
            RegionShape::Slab(Axis::X)
        };
        let region = Region::new(centre, shape, ex_size, hy_size)?;
        self.field.define_region(region, &self.pbox)?;
        self.field.update(&mut self.dd, &self.tuples)?;
        Ok(())
    }

    pub fn resolution_field(&self) -> &ResolutionField {
        &self.field
    }

    /// Resolution weight of a coarse-grained particle as of the last update.
    pub fn lambda(&self, cg: ParticleId) -> Result<f64, EngineError> {
        self.dd
            .particle(cg)
            .map(|p| p.lambda)
            .ok_or(EngineError::ParticleNotFound(cg))
    }

    // --- Stepping -------------------------------------------------------------------------

    /// Applies `update` to every particle that carries its own degrees of freedom, i.e. all
    /// but the coarse-grained representatives, which follow their constituents.
    pub fn integrate<F>(&mut self, update: F)
    where
        F: Fn(&mut Particle) + Send + Sync,
    {
        let tuples = &self.tuples;
        self.dd.workers_mut().for_each_mut(|_, w| {
            for p in w.locals_mut() {
                if !tuples.has_tuple(p.id) {
                    update(p);
                }
            }
        });
    }

    pub fn kinetic_energy(&self) -> f64 {
        let tuples = &self.tuples;
        self.dd
            .workers()
            .all_reduce(|_, w| w.kinetic_energy(tuples), 0.0, |a, b| a + b)
    }

    /// Refreshes everything a force evaluation depends on and evaluates forces over `list`.
    #[instrument(skip_all, name = "compute_forces", fields(step = self.step))]
    pub fn compute_forces<A, C>(
        &mut self,
        list: NeighborListId,
        blender: &AdResSForceBlender<A, C>,
    ) -> Result<ForceReport, EngineError>
    where
        A: PairPotential + Clone,
        C: PairPotential + Clone,
    {
        self.neighbor_list(list)?;
        self.prepare()?;
        let verlet = self
            .lists
            .get(list.0)
            .ok_or(EngineError::UnknownNeighborList(list.0))?;
        blender.compute(&mut self.dd, verlet, &self.tuples)
    }
}

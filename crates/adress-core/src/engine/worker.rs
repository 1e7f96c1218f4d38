use super::comm::{Envelope, Outbox, Rank};
use super::decomposition::NodeGrid;
use super::error::EngineError;
use crate::core::models::ids::{ParticleId, ParticleKey};
use crate::core::models::particle::Particle;
use crate::core::space::{PeriodicBox, SpatialGrid};
use crate::core::topology::exclusions::ExclusionSet;
use crate::core::topology::tuples::{MoleculeState, TupleMap};
use itertools::iproduct;
use nalgebra::{Point3, Vector3};
use slotmap::SlotMap;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Reference to a particle stored on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Local(ParticleKey),
    Ghost(ParticleKey),
}

/// Read-only copy of a particle owned by another worker (or by this one, seen through a
/// periodic image). The position is already shifted by `image` box lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct Ghost {
    pub particle: Particle,
    pub owner: Rank,
    pub image: [i32; 3],
}

/// A molecule-aware batch of ghost copies travelling with one periodic image shift.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GhostBatch {
    pub image: [i32; 3],
    pub particles: Vec<Particle>,
}

#[derive(Debug, Clone)]
struct GhostRoute {
    to: Rank,
    image: [i32; 3],
    representatives: Vec<ParticleId>,
}

pub(crate) type ForceMessage = Vec<(ParticleId, Vector3<f64>)>;

/// Storage of one worker: the particles it owns, the ghosts it holds and the cell lists over
/// its subdomain.
///
/// Cells hold representatives only, that is coarse-grained particles and particles outside
/// any tuple. Atomistic constituents always live on the worker that owns their
/// representative and travel with it.
#[derive(Debug, Clone)]
pub struct Worker {
    rank: Rank,
    node: [usize; 3],
    lower: Point3<f64>,
    upper: Point3<f64>,
    grid: SpatialGrid,
    locals: SlotMap<ParticleKey, Particle>,
    local_index: HashMap<ParticleId, ParticleKey>,
    ghosts: SlotMap<ParticleKey, Ghost>,
    ghost_index: HashMap<(ParticleId, [i32; 3]), ParticleKey>,
    cells: Vec<Vec<Slot>>,
    routes: Vec<GhostRoute>,
    anchors: HashMap<ParticleId, Point3<f64>>,
    lambda_anchors: HashMap<ParticleId, Point3<f64>>,
    exclusions: ExclusionSet,
}

impl Worker {
    pub(crate) fn new(
        rank: Rank,
        node: [usize; 3],
        lower: Point3<f64>,
        upper: Point3<f64>,
        grid: SpatialGrid,
    ) -> Self {
        let cells = vec![Vec::new(); grid.num_cells()];
        Self {
            rank,
            node,
            lower,
            upper,
            grid,
            locals: SlotMap::with_key(),
            local_index: HashMap::new(),
            ghosts: SlotMap::with_key(),
            ghost_index: HashMap::new(),
            cells,
            routes: Vec::new(),
            anchors: HashMap::new(),
            lambda_anchors: HashMap::new(),
            exclusions: ExclusionSet::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn node(&self) -> [usize; 3] {
        self.node
    }

    pub fn bounds(&self) -> (Point3<f64>, Point3<f64>) {
        (self.lower, self.upper)
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn ghost_count(&self) -> usize {
        self.ghosts.len()
    }

    pub fn locals(&self) -> impl Iterator<Item = &Particle> {
        self.locals.values()
    }

    pub fn ghosts(&self) -> impl Iterator<Item = &Ghost> {
        self.ghosts.values()
    }

    pub fn local(&self, id: ParticleId) -> Option<&Particle> {
        self.local_index.get(&id).and_then(|&k| self.locals.get(k))
    }

    pub fn ghost(&self, id: ParticleId, image: [i32; 3]) -> Option<&Ghost> {
        self.ghost_index
            .get(&(id, image))
            .and_then(|&k| self.ghosts.get(k))
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    pub(crate) fn exclusions_mut(&mut self) -> &mut ExclusionSet {
        &mut self.exclusions
    }

    pub(crate) fn local_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        let key = *self.local_index.get(&id)?;
        self.locals.get_mut(key)
    }

    pub(crate) fn locals_mut(&mut self) -> impl Iterator<Item = &mut Particle> {
        self.locals.values_mut()
    }

    pub(crate) fn cell(&self, index: usize) -> &[Slot] {
        self.cells.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn slot_particle(&self, slot: Slot) -> Option<&Particle> {
        match slot {
            Slot::Local(key) => self.locals.get(key),
            Slot::Ghost(key) => self.ghosts.get(key).map(|g| &g.particle),
        }
    }

    pub(crate) fn slot_particle_mut(&mut self, slot: Slot) -> Option<&mut Particle> {
        match slot {
            Slot::Local(key) => self.locals.get_mut(key),
            Slot::Ghost(key) => self.ghosts.get_mut(key).map(|g| &mut g.particle),
        }
    }

    pub(crate) fn insert_local(&mut self, particle: Particle) -> Result<ParticleKey, EngineError> {
        if self.local_index.contains_key(&particle.id) {
            return Err(EngineError::DuplicateParticle {
                id: particle.id,
                rank: self.rank,
            });
        }
        let id = particle.id;
        let key = self.locals.insert(particle);
        self.local_index.insert(id, key);
        Ok(key)
    }

    fn remove_local(&mut self, id: ParticleId) -> Option<Particle> {
        let key = self.local_index.remove(&id)?;
        self.lambda_anchors.remove(&id);
        self.anchors.remove(&id);
        self.locals.remove(key)
    }

    /// Appends the atomistic constituents of `slot` (or the particle itself if it heads no
    /// tuple) to `out`. Ghost constituents are looked up under the image of their ghost
    /// representative.
    pub(crate) fn collect_members<'a>(
        &'a self,
        slot: Slot,
        tuples: &TupleMap,
        out: &mut Vec<(Slot, &'a Particle)>,
    ) -> Result<(), EngineError> {
        out.clear();
        let particle = self
            .slot_particle(slot)
            .ok_or_else(|| EngineError::Internal(format!("dangling slot {slot:?}")))?;
        let Some(members) = tuples.constituents(particle.id) else {
            out.push((slot, particle));
            return Ok(());
        };
        for &at in members {
            let member = match slot {
                Slot::Local(_) => self.local_index.get(&at).map(|&k| Slot::Local(k)),
                Slot::Ghost(key) => self
                    .ghosts
                    .get(key)
                    .and_then(|g| self.ghost_index.get(&(at, g.image)))
                    .map(|&k| Slot::Ghost(k)),
            };
            let resolved = member.and_then(|s| self.slot_particle(s).map(|p| (s, p)));
            match resolved {
                Some(entry) => out.push(entry),
                None => {
                    return Err(EngineError::Internal(format!(
                        "constituent {at} of {} is not stored with it on worker {}",
                        particle.id, self.rank
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn check_finite(&self, step: u64) -> Result<(), EngineError> {
        match self.locals.values().find(|p| !p.is_finite()) {
            Some(p) => Err(EngineError::NonFinitePosition { id: p.id, step }),
            None => Ok(()),
        }
    }

    /// Kinetic energy of the particles that carry real degrees of freedom, i.e. everything
    /// except the derived coarse-grained representatives.
    pub(crate) fn kinetic_energy(&self, tuples: &TupleMap) -> f64 {
        self.locals
            .values()
            .filter(|p| !tuples.has_tuple(p.id))
            .map(Particle::kinetic_energy)
            .sum()
    }

    pub(crate) fn zero_forces(&mut self) {
        for p in self.locals.values_mut() {
            p.force = Vector3::zeros();
        }
        for g in self.ghosts.values_mut() {
            g.particle.force = Vector3::zeros();
        }
    }

    fn representative_keys(&self, tuples: &TupleMap) -> Vec<(ParticleKey, ParticleId)> {
        self.locals
            .iter()
            .filter(|(_, p)| tuples.has_tuple(p.id))
            .map(|(k, p)| (k, p.id))
            .collect()
    }

    /// Recomputes position, velocity and mass of every local coarse-grained particle from its
    /// constituents. Molecules whose constituents are not all local yet are skipped.
    pub(crate) fn refresh_molecules(&mut self, tuples: &TupleMap) -> usize {
        let mut refreshed = 0;
        for (key, id) in self.representative_keys(tuples) {
            let Some(members) = tuples.constituents(id) else {
                continue;
            };
            let particles: Option<Vec<&Particle>> = members.iter().map(|at| self.local(*at)).collect();
            let Some(state) = particles.and_then(MoleculeState::aggregate) else {
                continue;
            };
            if let Some(rep) = self.locals.get_mut(key) {
                rep.position = state.position;
                rep.velocity = state.velocity;
                rep.mass = state.mass;
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Moves every local constituent to the periodic image closest to its representative.
    pub(crate) fn make_molecules_whole(&mut self, pbox: &PeriodicBox, tuples: &TupleMap) {
        for (key, id) in self.representative_keys(tuples) {
            let Some(anchor) = self.locals.get(key).map(|p| p.position) else {
                continue;
            };
            for &at in tuples.constituents(id).unwrap_or(&[]) {
                let Some(c) = self.local_mut(at) else {
                    continue;
                };
                let whole = anchor + pbox.displacement(&anchor, &c.position);
                for axis in 0..3 {
                    let k = ((c.position[axis] - whole[axis]) / pbox.length(axis)).round() as i32;
                    c.image[axis] += k;
                }
                c.position = whole;
            }
        }
    }

    /// Hands the force accumulated on each local coarse-grained particle to its constituents
    /// in proportion to their mass, then stores the molecule's total force on the
    /// representative.
    pub(crate) fn distribute_molecular_forces(&mut self, tuples: &TupleMap) {
        for (key, id) in self.representative_keys(tuples) {
            let Some(members) = tuples.constituents(id) else {
                continue;
            };
            let Some(force) = self.locals.get(key).map(|p| p.force) else {
                continue;
            };
            let mass: f64 = members
                .iter()
                .filter_map(|at| self.local(*at))
                .map(|p| p.mass)
                .sum();
            let mut total = Vector3::zeros();
            for &at in members {
                if let Some(c) = self.local_mut(at) {
                    if mass > 0.0 {
                        c.force += force * (c.mass / mass);
                    }
                    total += c.force;
                }
            }
            if let Some(rep) = self.locals.get_mut(key) {
                rep.force = total;
            }
        }
    }

    pub(crate) fn lambda_anchor(&self, id: ParticleId) -> Option<Point3<f64>> {
        self.lambda_anchors.get(&id).copied()
    }

    pub(crate) fn set_lambda_anchor(&mut self, id: ParticleId, position: Point3<f64>) {
        self.lambda_anchors.insert(id, position);
    }

    pub(crate) fn set_local_lambda(
        &mut self,
        id: ParticleId,
        lambda: f64,
        deriv: f64,
        tuples: &TupleMap,
    ) {
        let members = tuples.constituents(id).unwrap_or(&[]);
        for &target in std::iter::once(&id).chain(members) {
            if let Some(p) = self.local_mut(target) {
                p.lambda = lambda;
                p.lambda_deriv = deriv;
            }
        }
    }

    pub(crate) fn set_ghost_lambda(
        &mut self,
        id: ParticleId,
        image: [i32; 3],
        lambda: f64,
        deriv: f64,
        tuples: &TupleMap,
    ) {
        let members = tuples.constituents(id).unwrap_or(&[]);
        for &target in std::iter::once(&id).chain(members) {
            let Some(&key) = self.ghost_index.get(&(target, image)) else {
                continue;
            };
            if let Some(g) = self.ghosts.get_mut(key) {
                g.particle.lambda = lambda;
                g.particle.lambda_deriv = deriv;
            }
        }
    }

    fn shift_molecule(&mut self, id: ParticleId, folded: [i32; 3], pbox: &PeriodicBox, tuples: &TupleMap) {
        let shift = pbox.shift(folded);
        for &at in tuples.constituents(id).unwrap_or(&[]) {
            if let Some(c) = self.local_mut(at) {
                c.position -= shift;
                for axis in 0..3 {
                    c.image[axis] += folded[axis];
                }
            }
        }
    }

    /// Folds every local representative back into the box, checks how far it travelled since
    /// the last decomposition, and queues the molecules that now belong to another worker.
    pub(crate) fn emigrate(
        &mut self,
        pbox: &PeriodicBox,
        nodes: &NodeGrid,
        tuples: &TupleMap,
        step: u64,
    ) -> Result<Outbox<Vec<Particle>>, EngineError> {
        let widths = nodes.widths(pbox);
        let representatives: Vec<ParticleKey> = self
            .locals
            .iter()
            .filter(|(_, p)| !tuples.is_constituent(p.id))
            .map(|(k, _)| k)
            .collect();

        let mut leaving: BTreeMap<Rank, Vec<ParticleId>> = BTreeMap::new();
        for key in representatives {
            let Some(particle) = self.locals.get_mut(key) else {
                continue;
            };
            let id = particle.id;
            if let Some(anchor) = self.anchors.get(&id) {
                let unfolded = pbox.unfold(&particle.position, particle.image);
                for axis in 0..3 {
                    let displacement = (unfolded[axis] - anchor[axis]).abs();
                    if displacement > widths[axis] {
                        return Err(EngineError::ParticleJumped {
                            id,
                            step,
                            axis,
                            displacement,
                            limit: widths[axis],
                        });
                    }
                }
            }
            let folded = pbox.fold(&mut particle.position, &mut particle.image);
            let position = particle.position;
            if folded != [0; 3] {
                self.shift_molecule(id, folded, pbox, tuples);
            }
            let target = nodes.rank_of(nodes.node_of_position(&position, pbox));
            if target != self.rank {
                leaving.entry(target).or_default().push(id);
            }
        }

        let mut outbox = Outbox::new(self.rank);
        for (target, ids) in leaving {
            let mut batch = Vec::with_capacity(ids.len());
            for id in ids {
                trace!(particle = id.0, from = self.rank.0, to = target.0, "Migrating molecule");
                batch.extend(self.remove_local(id));
                for &at in tuples.constituents(id).unwrap_or(&[]) {
                    batch.extend(self.remove_local(at));
                }
            }
            outbox.send(target, batch);
        }
        Ok(outbox)
    }

    /// Queues constituents whose representative is owned by another worker.
    pub(crate) fn emigrate_strays(
        &mut self,
        tuples: &TupleMap,
        owners: &HashMap<ParticleId, Rank>,
    ) -> Outbox<Vec<Particle>> {
        let mut leaving: BTreeMap<Rank, Vec<ParticleId>> = BTreeMap::new();
        for p in self.locals.values() {
            let Some(rep) = tuples.representative_of(p.id) else {
                continue;
            };
            if let Some(&owner) = owners.get(&rep) {
                if owner != self.rank {
                    leaving.entry(owner).or_default().push(p.id);
                }
            }
        }
        let mut outbox = Outbox::new(self.rank);
        for (target, ids) in leaving {
            let batch: Vec<Particle> = ids.into_iter().filter_map(|id| self.remove_local(id)).collect();
            outbox.send(target, batch);
        }
        outbox
    }

    pub(crate) fn immigrate(&mut self, inbox: &[Envelope<Vec<Particle>>]) -> Result<usize, EngineError> {
        let mut received = 0;
        for envelope in inbox {
            for particle in &envelope.payload {
                self.insert_local(particle.clone())?;
                received += 1;
            }
        }
        Ok(received)
    }

    /// Rebuilds the cell lists from the local representatives and records their unfolded
    /// positions for the next jump check.
    pub(crate) fn resort(&mut self, pbox: &PeriodicBox, tuples: &TupleMap) {
        self.cells = vec![Vec::new(); self.grid.num_cells()];
        self.anchors.clear();
        for (key, p) in self.locals.iter() {
            if tuples.is_constituent(p.id) {
                continue;
            }
            let cell = self.grid.real_cell_of(&p.position);
            self.cells[cell].push(Slot::Local(key));
            self.anchors.insert(p.id, pbox.unfold(&p.position, p.image));
        }
    }

    fn molecule_snapshot(&self, representatives: &[ParticleId], tuples: &TupleMap) -> Vec<Particle> {
        let mut particles = Vec::with_capacity(representatives.len());
        for &id in representatives {
            let members = tuples.constituents(id).unwrap_or(&[]);
            for &target in std::iter::once(&id).chain(members) {
                if let Some(p) = self.local(target) {
                    particles.push(p.clone());
                }
            }
        }
        particles
    }

    /// Drops all ghosts and queues copies of every boundary-cell molecule for each neighbour
    /// whose ghost frame overlaps that cell.
    pub(crate) fn export_ghosts(&mut self, nodes: &NodeGrid, tuples: &TupleMap) -> Outbox<GhostBatch> {
        self.ghosts.clear();
        self.ghost_index.clear();
        self.routes.clear();

        let mut batches: BTreeMap<(Rank, [i32; 3]), Vec<ParticleId>> = BTreeMap::new();
        for cell in self.grid.real_cells() {
            let sides = self.grid.boundary_sides(cell);
            if sides.iter().all(|&(low, high)| !low && !high) {
                continue;
            }
            let ids: Vec<ParticleId> = self.cells[cell]
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Local(key) => self.locals.get(*key).map(|p| p.id),
                    Slot::Ghost(_) => None,
                })
                .collect();
            if ids.is_empty() {
                continue;
            }
            let choices = sides.map(|(low, high)| {
                let mut directions = vec![0isize];
                if low {
                    directions.push(-1);
                }
                if high {
                    directions.push(1);
                }
                directions
            });
            for (&dx, &dy, &dz) in iproduct!(&choices[0], &choices[1], &choices[2]) {
                if dx == 0 && dy == 0 && dz == 0 {
                    continue;
                }
                let (node, image) = nodes.neighbor(self.node, [dx, dy, dz]);
                batches
                    .entry((nodes.rank_of(node), image))
                    .or_default()
                    .extend(ids.iter().copied());
            }
        }

        let mut outbox = Outbox::new(self.rank);
        for ((to, image), representatives) in batches {
            let particles = self.molecule_snapshot(&representatives, tuples);
            outbox.send(to, GhostBatch { image, particles });
            self.routes.push(GhostRoute {
                to,
                image,
                representatives,
            });
        }
        outbox
    }

    pub(crate) fn import_ghosts(
        &mut self,
        inbox: &[Envelope<GhostBatch>],
        pbox: &PeriodicBox,
        tuples: &TupleMap,
    ) -> usize {
        let mut received = 0;
        for envelope in inbox {
            let image = envelope.payload.image;
            let shift = pbox.shift(image);
            for source in &envelope.payload.particles {
                let mut particle = source.clone();
                particle.position += shift;
                particle.force = Vector3::zeros();
                let id = particle.id;
                let position = particle.position;
                let key = self.ghosts.insert(Ghost {
                    particle,
                    owner: envelope.from,
                    image,
                });
                self.ghost_index.insert((id, image), key);
                if !tuples.is_constituent(id) {
                    let cell = self.grid.clamped_cell_of(&position);
                    self.cells[cell].push(Slot::Ghost(key));
                }
                received += 1;
            }
        }
        received
    }

    /// Queues fresh copies of every molecule sent at the last ghost export.
    pub(crate) fn ghost_refresh(&self, tuples: &TupleMap) -> Outbox<GhostBatch> {
        let mut outbox = Outbox::new(self.rank);
        for route in &self.routes {
            outbox.send(
                route.to,
                GhostBatch {
                    image: route.image,
                    particles: self.molecule_snapshot(&route.representatives, tuples),
                },
            );
        }
        outbox
    }

    pub(crate) fn apply_ghost_refresh(
        &mut self,
        inbox: &[Envelope<GhostBatch>],
        pbox: &PeriodicBox,
    ) -> Result<usize, EngineError> {
        let mut refreshed = 0;
        for envelope in inbox {
            let image = envelope.payload.image;
            let shift = pbox.shift(image);
            for source in &envelope.payload.particles {
                let ghost = self
                    .ghost_index
                    .get(&(source.id, image))
                    .and_then(|&k| self.ghosts.get_mut(k))
                    .ok_or_else(|| {
                        EngineError::Internal(format!(
                            "worker {} received a refresh for unknown ghost {} with image {:?}",
                            self.rank, source.id, image
                        ))
                    })?;
                ghost.particle.position = source.position + shift;
                ghost.particle.velocity = source.velocity;
                ghost.particle.mass = source.mass;
                ghost.particle.lambda = source.lambda;
                ghost.particle.lambda_deriv = source.lambda_deriv;
                ghost.particle.force = Vector3::zeros();
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Queues the forces accumulated on ghosts for their owners and clears them.
    pub(crate) fn drain_ghost_forces(&mut self) -> Outbox<ForceMessage> {
        let mut by_owner: BTreeMap<Rank, ForceMessage> = BTreeMap::new();
        for ghost in self.ghosts.values_mut() {
            if ghost.particle.force != Vector3::zeros() {
                by_owner
                    .entry(ghost.owner)
                    .or_default()
                    .push((ghost.particle.id, ghost.particle.force));
                ghost.particle.force = Vector3::zeros();
            }
        }
        let mut outbox = Outbox::new(self.rank);
        for (owner, forces) in by_owner {
            outbox.send(owner, forces);
        }
        outbox
    }

    pub(crate) fn accumulate_forces(&mut self, inbox: &[Envelope<ForceMessage>]) -> Result<(), EngineError> {
        for envelope in inbox {
            for &(id, force) in &envelope.payload {
                let rank = self.rank;
                let particle = self.local_mut(id).ok_or_else(|| {
                    EngineError::Internal(format!(
                        "worker {rank} received a ghost force for particle {id} it does not own"
                    ))
                })?;
                particle.force += force;
            }
        }
        Ok(())
    }
}

use super::decomposition::DomainDecomposition;
use super::error::EngineError;
use super::verlet::{LocalVerletList, VerletList};
use super::worker::{Slot, Worker};
use crate::core::forcefield::interactions::InteractionTable;
use crate::core::forcefield::potentials::PairPotential;
use crate::core::forcefield::term::EnergyTerm;
use crate::core::models::ids::ParticleKey;
use crate::core::models::particle::{Particle, ParticleType};
use crate::core::topology::tuples::TupleMap;
use nalgebra::Vector3;
use slotmap::SecondaryMap;
use std::ops::{Add, AddAssign};
use tracing::{debug, instrument};

/// Interaction regime of one neighbour pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Regime {
    /// Both ends fully atomistic.
    Atomistic,
    /// Both ends fully coarse-grained.
    CoarseGrained,
    /// Anything in between, blended with `weight = λp · λq` on the atomistic side.
    Hybrid { weight: f64 },
}

impl Regime {
    pub fn classify(lambda_p: f64, lambda_q: f64) -> Self {
        if lambda_p >= 1.0 && lambda_q >= 1.0 {
            Regime::Atomistic
        } else if lambda_p <= 0.0 && lambda_q <= 0.0 {
            Regime::CoarseGrained
        } else {
            Regime::Hybrid {
                weight: (lambda_p * lambda_q).clamp(0.0, 1.0),
            }
        }
    }

    /// Share of the atomistic force in the blend.
    #[inline]
    pub fn weight(&self) -> f64 {
        match self {
            Regime::Atomistic => 1.0,
            Regime::CoarseGrained => 0.0,
            Regime::Hybrid { weight } => *weight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegimeCounts {
    pub atomistic: usize,
    pub coarse_grained: usize,
    pub hybrid: usize,
}

impl RegimeCounts {
    fn record(&mut self, regime: Regime) {
        match regime {
            Regime::Atomistic => self.atomistic += 1,
            Regime::CoarseGrained => self.coarse_grained += 1,
            Regime::Hybrid { .. } => self.hybrid += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.atomistic + self.coarse_grained + self.hybrid
    }
}

impl Add for RegimeCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            atomistic: self.atomistic + rhs.atomistic,
            coarse_grained: self.coarse_grained + rhs.coarse_grained,
            hybrid: self.hybrid + rhs.hybrid,
        }
    }
}

/// Result of one force evaluation, summed over all workers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ForceReport {
    /// Weighted energies: `λ_eff · E_AT` and `(1 − λ_eff) · E_CG` per pair, each pair counted once.
    pub energy: EnergyTerm,
    /// Scalar pair virial `Σ r · F`.
    pub virial: f64,
    pub regimes: RegimeCounts,
}

impl AddAssign for ForceReport {
    fn add_assign(&mut self, rhs: Self) {
        self.energy += rhs.energy;
        self.virial += rhs.virial;
        self.regimes = self.regimes + rhs.regimes;
    }
}

#[derive(Default)]
struct ForceBuffer {
    locals: SecondaryMap<ParticleKey, Vector3<f64>>,
    ghosts: SecondaryMap<ParticleKey, Vector3<f64>>,
}

impl ForceBuffer {
    #[inline]
    fn add(&mut self, slot: Slot, force: Vector3<f64>) {
        let (map, key) = match slot {
            Slot::Local(key) => (&mut self.locals, key),
            Slot::Ghost(key) => (&mut self.ghosts, key),
        };
        match map.get_mut(key) {
            Some(total) => *total += force,
            None => {
                map.insert(key, force);
            }
        }
    }

    fn apply(self, worker: &mut Worker) {
        for (key, force) in self.locals {
            if let Some(p) = worker.slot_particle_mut(Slot::Local(key)) {
                p.force += force;
            }
        }
        for (key, force) in self.ghosts {
            if let Some(p) = worker.slot_particle_mut(Slot::Ghost(key)) {
                p.force += force;
            }
        }
    }
}

/// Evaluates non-bonded forces over a Verlet list, blending atomistic and coarse-grained
/// interactions by the resolution weights of each pair's molecules.
///
/// Atomistic potentials act between every constituent pair of the two molecules, coarse-grained
/// ones between the two representatives. The force applied is
/// `λ_eff · F_AT + (1 − λ_eff) · F_CG` with `λ_eff = λp · λq`.
#[derive(Debug, Clone)]
pub struct AdResSForceBlender<A, C = A> {
    atomistic: InteractionTable<A>,
    coarse_grained: InteractionTable<C>,
}

impl<A: PairPotential + Clone, C: PairPotential + Clone> Default for AdResSForceBlender<A, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PairPotential + Clone, C: PairPotential + Clone> AdResSForceBlender<A, C> {
    pub fn new() -> Self {
        Self {
            atomistic: InteractionTable::new(),
            coarse_grained: InteractionTable::new(),
        }
    }

    pub fn set_atomistic(&mut self, a: ParticleType, b: ParticleType, potential: A) {
        self.atomistic.set(a, b, potential);
    }

    pub fn set_coarse_grained(&mut self, a: ParticleType, b: ParticleType, potential: C) {
        self.coarse_grained.set(a, b, potential);
    }

    pub fn atomistic(&self) -> &InteractionTable<A> {
        &self.atomistic
    }

    pub fn coarse_grained(&self) -> &InteractionTable<C> {
        &self.coarse_grained
    }

    /// Zeroes all forces, evaluates every pair of `list`, returns ghost forces to their
    /// owners and spreads molecular forces onto the constituents.
    #[instrument(skip_all, name = "adress_forces")]
    pub fn compute(
        &self,
        dd: &mut DomainDecomposition,
        list: &VerletList,
        tuples: &TupleMap,
    ) -> Result<ForceReport, EngineError> {
        dd.zero_forces();
        let reports = dd
            .workers_mut()
            .try_zip_map_mut(list.locals(), |_, worker, local| {
                let (report, buffer) = self.evaluate(worker, local, tuples)?;
                buffer.apply(worker);
                Ok::<_, EngineError>(report)
            })?;
        dd.collect_ghost_forces()?;
        dd.distribute_molecular_forces(tuples);

        let mut total = ForceReport::default();
        for report in reports.gather() {
            total += report;
        }
        debug!(
            energy = total.energy.total(),
            atomistic = total.regimes.atomistic,
            hybrid = total.regimes.hybrid,
            coarse_grained = total.regimes.coarse_grained,
            "Forces evaluated"
        );
        Ok(total)
    }

    fn evaluate(
        &self,
        worker: &Worker,
        local: &LocalVerletList,
        tuples: &TupleMap,
    ) -> Result<(ForceReport, ForceBuffer), EngineError> {
        let mut report = ForceReport::default();
        let mut buffer = ForceBuffer::default();
        let mut members_p: Vec<(Slot, &Particle)> = Vec::new();
        let mut members_q: Vec<(Slot, &Particle)> = Vec::new();

        for pair in local.pairs() {
            let (Some(p), Some(q)) = (
                worker.slot_particle(pair.first),
                worker.slot_particle(pair.second),
            ) else {
                return Err(EngineError::Internal(format!(
                    "Verlet list on worker {} refers to a removed particle",
                    worker.rank()
                )));
            };
            let regime = Regime::classify(p.lambda, q.lambda);
            let weight = regime.weight();
            let mut counted = false;

            if weight > 0.0 {
                worker.collect_members(pair.first, tuples, &mut members_p)?;
                worker.collect_members(pair.second, tuples, &mut members_q)?;
                for &(slot_a, a) in &members_p {
                    for &(slot_b, b) in &members_q {
                        if worker.exclusions().contains(a.id, b.id) {
                            continue;
                        }
                        let Some(potential) = self.atomistic.get(a.particle_type, b.particle_type) else {
                            continue;
                        };
                        if let Some((energy, virial)) =
                            apply_pair(potential, a, b, slot_a, slot_b, weight, &mut buffer)
                        {
                            report.energy.atomistic += energy;
                            report.virial += virial;
                            counted = true;
                        }
                    }
                }
            }

            if weight < 1.0 {
                if let Some(potential) = self.coarse_grained.get(p.particle_type, q.particle_type) {
                    if let Some((energy, virial)) = apply_pair(
                        potential,
                        p,
                        q,
                        pair.first,
                        pair.second,
                        1.0 - weight,
                        &mut buffer,
                    ) {
                        report.energy.coarse_grained += energy;
                        report.virial += virial;
                        counted = true;
                    }
                }
            }

            if counted {
                report.regimes.record(regime);
            }
        }
        Ok((report, buffer))
    }
}

/// Adds `scale` times the pair force to both particles. Returns the scaled energy and virial,
/// or `None` when the pair lies outside the potential's range.
#[inline]
fn apply_pair<P: PairPotential>(
    potential: &P,
    a: &Particle,
    b: &Particle,
    slot_a: Slot,
    slot_b: Slot,
    scale: f64,
    buffer: &mut ForceBuffer,
) -> Option<(f64, f64)> {
    let r = b.position - a.position;
    let distance = r.norm();
    if !(distance > 0.0 && distance <= potential.cutoff()) {
        return None;
    }
    let magnitude = scale * potential.force(distance);
    let force = r * (magnitude / distance);
    buffer.add(slot_b, force);
    buffer.add(slot_a, -force);
    Some((scale * potential.energy(distance), magnitude * distance))
}

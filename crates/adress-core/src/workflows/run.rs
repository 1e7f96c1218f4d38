use super::simulation::{NeighborListId, Simulation};
use crate::core::forcefield::potentials::PairPotential;
use crate::core::forcefield::term::EnergyTerm;
use crate::engine::blender::AdResSForceBlender;
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use tracing::{debug, info, instrument};

/// The integrator half of a time step.
///
/// `pre_force` runs before forces are evaluated and typically advances positions;
/// `post_force` runs after and sees the fresh forces.
pub trait Propagator {
    fn pre_force(&mut self, sim: &mut Simulation) -> Result<(), EngineError>;

    fn post_force(&mut self, sim: &mut Simulation) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunSummary {
    pub steps: u64,
    /// Neighbour list rebuilds triggered during the run.
    pub rebuilds: usize,
    pub potential: EnergyTerm,
    pub kinetic: f64,
}

impl RunSummary {
    pub fn total_energy(&self) -> f64 {
        self.potential.total() + self.kinetic
    }
}

/// Advances `sim` by `steps` time steps.
///
/// Forces are evaluated once up front so the first `pre_force` sees a consistent state. Each
/// step then runs `pre_force`, a full force evaluation over `list` and `post_force`.
#[instrument(skip_all, name = "md_run", fields(steps = steps))]
pub fn run<A, C, P>(
    sim: &mut Simulation,
    list: NeighborListId,
    blender: &AdResSForceBlender<A, C>,
    propagator: &mut P,
    steps: u64,
    reporter: &ProgressReporter,
) -> Result<RunSummary, EngineError>
where
    A: PairPotential + Clone,
    C: PairPotential + Clone,
    P: Propagator,
{
    reporter.report(Progress::RunStart { total_steps: steps });
    info!(start = sim.step(), steps, "Starting MD run");

    let builds_at_start = sim.neighbor_list(list)?.builds();
    let mut report = sim.compute_forces(list, blender)?;

    for _ in 0..steps {
        let builds = sim.neighbor_list(list)?.builds();
        propagator.pre_force(sim)?;
        sim.advance();
        report = sim.compute_forces(list, blender)?;
        propagator.post_force(sim)?;

        let rebuilt = sim.neighbor_list(list)?.builds() != builds;
        if rebuilt {
            debug!(step = sim.step(), "Neighbour list rebuilt during step");
        }
        reporter.report(Progress::StepFinished {
            step: sim.step(),
            rebuilt,
            energy: report.energy,
        });
    }

    let summary = RunSummary {
        steps,
        rebuilds: sim.neighbor_list(list)?.builds() - builds_at_start,
        potential: report.energy,
        kinetic: sim.kinetic_energy(),
    };
    reporter.report(Progress::RunFinish);
    info!(
        step = sim.step(),
        rebuilds = summary.rebuilds,
        potential = summary.potential.total(),
        kinetic = summary.kinetic,
        "MD run complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::forcefield::potentials::LennardJones;
    use crate::core::models::ids::ParticleId;
    use crate::core::models::particle::Particle;
    use crate::engine::config::SimulationConfig;
    use crate::engine::error::ErrorKind;
    use crate::engine::resolution::RegionCentre;
    use nalgebra::{Point3, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    struct VelocityVerlet {
        dt: f64,
    }

    impl Propagator for VelocityVerlet {
        fn pre_force(&mut self, sim: &mut Simulation) -> Result<(), EngineError> {
            let dt = self.dt;
            sim.integrate(|p| {
                p.velocity += p.force * (0.5 * dt / p.mass);
                p.position += p.velocity * dt;
            });
            Ok(())
        }

        fn post_force(&mut self, sim: &mut Simulation) -> Result<(), EngineError> {
            let dt = self.dt;
            sim.integrate(|p| p.velocity += p.force * (0.5 * dt / p.mass));
            Ok(())
        }
    }

    fn lattice_system(workers: usize) -> (Simulation, NeighborListId, AdResSForceBlender<LennardJones>) {
        let config = SimulationConfig::builder()
            .box_lengths([6.0, 6.0, 6.0])
            .workers(workers)
            .cutoff(2.5)
            .skin(0.3)
            .build()
            .unwrap();
        let mut sim = Simulation::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut particles = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                for k in 0..4 {
                    let id = (i * 16 + j * 4 + k) as u64;
                    let jitter = |rng: &mut StdRng| rng.gen_range(-0.05..0.05);
                    let position = Point3::new(
                        0.75 + 1.5 * i as f64 + jitter(&mut rng),
                        0.75 + 1.5 * j as f64 + jitter(&mut rng),
                        0.75 + 1.5 * k as f64 + jitter(&mut rng),
                    );
                    particles.push(Particle::new(ParticleId(id), 0, position));
                }
            }
        }
        sim.add_particles(particles).unwrap();
        let list = sim.build_neighbor_list(2.5, 0.3).unwrap();
        let mut blender = AdResSForceBlender::new();
        blender.set_atomistic(0, 0, LennardJones::new(1.0, 1.0, 2.5).unwrap());
        (sim, list, blender)
    }

    #[test]
    fn velocity_verlet_conserves_energy_on_a_lennard_jones_lattice() {
        let (mut sim, list, blender) = lattice_system(2);
        let initial = sim.compute_forces(list, &blender).unwrap().energy.total() + sim.kinetic_energy();

        let mut propagator = VelocityVerlet { dt: 0.002 };
        let summary = run(
            &mut sim,
            list,
            &blender,
            &mut propagator,
            400,
            &ProgressReporter::new(),
        )
        .unwrap();

        assert_eq!(summary.steps, 400);
        assert_eq!(sim.step(), 400);
        assert!(summary.kinetic > 0.0);
        let drift = (summary.total_energy() - initial).abs();
        assert!(drift < 1e-2, "energy drifted by {drift}");
    }

    /// 125 rigid-start diatomics on a 5x5x5 lattice. Atoms are type 0, representatives type 1.
    fn diatomic_system(
        far_region: bool,
    ) -> (Simulation, NeighborListId, AdResSForceBlender<LennardJones>) {
        let config = SimulationConfig::builder()
            .box_lengths([7.5, 7.5, 7.5])
            .workers(2)
            .cutoff(2.7)
            .skin(0.3)
            .build()
            .unwrap();
        let mut sim = Simulation::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut particles = Vec::new();
        let mut tuples = Vec::new();
        for n in 0..125u64 {
            let (i, j, k) = (n / 25, (n / 5) % 5, n % 5);
            let centre = Point3::new(
                0.75 + 1.5 * i as f64 + rng.gen_range(-0.05..0.05),
                0.75 + 1.5 * j as f64 + rng.gen_range(-0.05..0.05),
                0.75 + 1.5 * k as f64 + rng.gen_range(-0.05..0.05),
            );
            let velocity = Vector3::new(
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
            );
            let (rep, a, b) = (1000 + n, 2 * n, 2 * n + 1);
            let half = Vector3::new(0.05, 0.0, 0.0);
            particles.push(Particle::new(ParticleId(rep), 1, centre).coarse_grained());
            particles.push(Particle::new(ParticleId(a), 0, centre - half).with_velocity(velocity));
            particles.push(Particle::new(ParticleId(b), 0, centre + half).with_velocity(velocity));
            tuples.push(vec![ParticleId(rep), ParticleId(a), ParticleId(b)]);
        }
        sim.add_particles(particles).unwrap();
        sim.add_tuples(&tuples).unwrap();
        if far_region {
            // Every representative sits at least 1.2 from the origin.
            sim.define_region(RegionCentre::Fixed(Point3::origin()), 0.3, 0.3, true)
                .unwrap();
        }
        let list = sim.build_neighbor_list(2.7, 0.3).unwrap();

        let mut blender = AdResSForceBlender::new();
        blender.set_atomistic(0, 0, LennardJones::new(1.0, 1.0, 2.5).unwrap());
        blender.set_coarse_grained(1, 1, LennardJones::new(2.0, 1.0, 2.5).unwrap());
        (sim, list, blender)
    }

    fn diatomic_drift(
        sim: &mut Simulation,
        list: NeighborListId,
        blender: &AdResSForceBlender<LennardJones>,
    ) -> f64 {
        let initial =
            sim.compute_forces(list, blender).unwrap().energy.total() + sim.kinetic_energy();
        let mut propagator = VelocityVerlet { dt: 0.002 };
        let summary =
            run(sim, list, blender, &mut propagator, 300, &ProgressReporter::new()).unwrap();
        (summary.total_energy() - initial).abs()
    }

    #[test]
    fn molecules_without_regions_conserve_energy_atomistically() {
        let (mut sim, list, blender) = diatomic_system(false);
        let drift = diatomic_drift(&mut sim, list, &blender);
        assert!(drift < 1e-2, "energy drifted by {drift}");

        assert_eq!(sim.lambda(ParticleId(1000)).unwrap(), 1.0);
        let report = sim.compute_forces(list, &blender).unwrap();
        assert!(report.regimes.atomistic > 0);
        assert_eq!(report.regimes.hybrid, 0);
        assert_eq!(report.regimes.coarse_grained, 0);
        assert_eq!(report.energy.coarse_grained, 0.0);
    }

    #[test]
    fn molecules_outside_every_region_conserve_energy_coarse_grained() {
        let (mut sim, list, blender) = diatomic_system(true);
        let drift = diatomic_drift(&mut sim, list, &blender);
        assert!(drift < 1e-2, "energy drifted by {drift}");

        assert_eq!(sim.lambda(ParticleId(1000)).unwrap(), 0.0);
        let report = sim.compute_forces(list, &blender).unwrap();
        assert!(report.regimes.coarse_grained > 0);
        assert_eq!(report.regimes.hybrid, 0);
        assert_eq!(report.regimes.atomistic, 0);
        assert_eq!(report.energy.atomistic, 0.0);

        // Constituents share one acceleration, so each molecule keeps its shape.
        let a = sim.particle(ParticleId(0)).unwrap().position;
        let b = sim.particle(ParticleId(1)).unwrap().position;
        assert!(((b - a).norm() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn serial_and_decomposed_runs_agree() {
        let mut summaries = Vec::new();
        for workers in [1, 2] {
            let (mut sim, list, blender) = lattice_system(workers);
            let mut propagator = VelocityVerlet { dt: 0.002 };
            let summary = run(
                &mut sim,
                list,
                &blender,
                &mut propagator,
                50,
                &ProgressReporter::new(),
            )
            .unwrap();
            summaries.push((summary, sim.particle(ParticleId(21)).unwrap().position));
        }
        let (serial, serial_position) = summaries[0];
        let (split, split_position) = summaries[1];
        assert!((serial.potential.total() - split.potential.total()).abs() < 1e-8);
        assert!((serial_position - split_position).norm() < 1e-8);
    }

    #[test]
    fn run_reports_every_step_between_start_and_finish() {
        let (mut sim, list, blender) = lattice_system(2);
        let events = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            let tag = match event {
                Progress::RunStart { total_steps } => format!("start {total_steps}"),
                Progress::StepFinished { step, .. } => format!("step {step}"),
                Progress::RunFinish => "finish".to_string(),
                Progress::Message(m) => m,
            };
            events.lock().unwrap().push(tag);
        }));

        let mut propagator = VelocityVerlet { dt: 0.002 };
        run(&mut sim, list, &blender, &mut propagator, 3, &reporter).unwrap();
        drop(reporter);

        assert_eq!(
            events.into_inner().unwrap(),
            vec!["start 3", "step 1", "step 2", "step 3", "finish"]
        );
    }

    struct Kick;

    impl Propagator for Kick {
        fn pre_force(&mut self, sim: &mut Simulation) -> Result<(), EngineError> {
            sim.integrate(|p| {
                if p.id == ParticleId(5) {
                    p.position.y = f64::NAN;
                }
            });
            Ok(())
        }

        fn post_force(&mut self, _sim: &mut Simulation) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn non_finite_position_stops_the_run() {
        let (mut sim, list, blender) = lattice_system(2);
        let err = run(&mut sim, list, &blender, &mut Kick, 10, &ProgressReporter::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Numerical);
        assert_eq!(err.particle(), Some(ParticleId(5)));
        assert!(matches!(err, EngineError::NonFinitePosition { step: 1, .. }));
    }
}

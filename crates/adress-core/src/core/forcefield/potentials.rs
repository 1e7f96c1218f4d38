use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PotentialError {
    #[error("Table needs at least two samples, got {0}")]
    TooFewSamples(usize),

    #[error("Energy and force tables differ in length ({energies} vs {forces})")]
    LengthMismatch { energies: usize, forces: usize },

    #[error("Invalid table grid: start {start}, spacing {spacing}")]
    InvalidGrid { start: f64, spacing: f64 },

    #[error("Invalid potential parameter '{name}': {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

/// A central pair potential between two particles.
pub trait PairPotential: Send + Sync {
    /// Potential energy at separation `r`. Zero beyond the cutoff.
    fn energy(&self, r: f64) -> f64;

    /// Magnitude of the central force `-dU/dr` at separation `r`; positive means repulsive.
    /// Zero beyond the cutoff.
    fn force(&self, r: f64) -> f64;

    fn cutoff(&self) -> f64;
}

#[inline]
pub fn lennard_jones_12_6(dist: f64, sigma: f64, epsilon: f64) -> f64 {
    if dist < 1e-6 {
        return 1e10;
    }
    let rho6 = (sigma / dist).powi(6);
    4.0 * epsilon * (rho6 * rho6 - rho6)
}

#[inline]
pub fn lennard_jones_12_6_force(dist: f64, sigma: f64, epsilon: f64) -> f64 {
    if dist < 1e-6 {
        return 1e10;
    }
    let rho6 = (sigma / dist).powi(6);
    24.0 * epsilon * (2.0 * rho6 * rho6 - rho6) / dist
}

/// Truncated and shifted 12-6 Lennard-Jones potential.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LennardJones {
    pub epsilon: f64,
    pub sigma: f64,
    cutoff: f64,
    shift: f64,
}

impl LennardJones {
    /// Creates a potential whose energy is shifted to vanish at `cutoff`.
    pub fn new(epsilon: f64, sigma: f64, cutoff: f64) -> Result<Self, PotentialError> {
        for (name, value) in [("epsilon", epsilon), ("sigma", sigma), ("cutoff", cutoff)] {
            if !value.is_finite() || value < 0.0 || (name != "epsilon" && value == 0.0) {
                return Err(PotentialError::InvalidParameter { name, value });
            }
        }
        Ok(Self {
            epsilon,
            sigma,
            cutoff,
            shift: -lennard_jones_12_6(cutoff, sigma, epsilon),
        })
    }

    /// Same as [`LennardJones::new`] but without the energy shift.
    pub fn unshifted(epsilon: f64, sigma: f64, cutoff: f64) -> Result<Self, PotentialError> {
        let mut lj = Self::new(epsilon, sigma, cutoff)?;
        lj.shift = 0.0;
        Ok(lj)
    }

    pub fn shift(&self) -> f64 {
        self.shift
    }
}

impl PairPotential for LennardJones {
    #[inline]
    fn energy(&self, r: f64) -> f64 {
        if r > self.cutoff {
            return 0.0;
        }
        lennard_jones_12_6(r, self.sigma, self.epsilon) + self.shift
    }

    #[inline]
    fn force(&self, r: f64) -> f64 {
        if r > self.cutoff {
            return 0.0;
        }
        lennard_jones_12_6_force(r, self.sigma, self.epsilon)
    }

    fn cutoff(&self) -> f64 {
        self.cutoff
    }
}

/// Potential sampled on a uniform radial grid and linearly interpolated.
///
/// Separations below the first sample use the first sample. The cutoff is the last grid point.
#[derive(Debug, Clone, PartialEq)]
pub struct Tabulated {
    start: f64,
    spacing: f64,
    energies: Vec<f64>,
    forces: Vec<f64>,
}

impl Tabulated {
    pub fn new(
        start: f64,
        spacing: f64,
        energies: Vec<f64>,
        forces: Vec<f64>,
    ) -> Result<Self, PotentialError> {
        if energies.len() != forces.len() {
            return Err(PotentialError::LengthMismatch {
                energies: energies.len(),
                forces: forces.len(),
            });
        }
        if energies.len() < 2 {
            return Err(PotentialError::TooFewSamples(energies.len()));
        }
        if !(start.is_finite() && start >= 0.0 && spacing.is_finite() && spacing > 0.0) {
            return Err(PotentialError::InvalidGrid { start, spacing });
        }
        Ok(Self {
            start,
            spacing,
            energies,
            forces,
        })
    }

    /// Tabulates another potential on `samples` points from `start` to its cutoff.
    pub fn sample<P: PairPotential>(
        potential: &P,
        start: f64,
        samples: usize,
    ) -> Result<Self, PotentialError> {
        if samples < 2 {
            return Err(PotentialError::TooFewSamples(samples));
        }
        let spacing = (potential.cutoff() - start) / (samples - 1) as f64;
        let grid = (0..samples).map(|i| start + i as f64 * spacing);
        let energies = grid.clone().map(|r| potential.energy(r)).collect();
        let forces = grid.map(|r| potential.force(r)).collect();
        Self::new(start, spacing, energies, forces)
    }

    fn interpolate(&self, values: &[f64], r: f64) -> f64 {
        if r > self.cutoff() {
            return 0.0;
        }
        let x = ((r - self.start) / self.spacing).max(0.0);
        let i = (x.floor() as usize).min(values.len() - 2);
        let t = (x - i as f64).min(1.0);
        values[i] * (1.0 - t) + values[i + 1] * t
    }
}

impl PairPotential for Tabulated {
    fn energy(&self, r: f64) -> f64 {
        self.interpolate(&self.energies, r)
    }

    fn force(&self, r: f64) -> f64 {
        self.interpolate(&self.forces, r)
    }

    fn cutoff(&self) -> f64 {
        self.start + self.spacing * (self.energies.len() - 1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    #[test]
    fn lennard_jones_minimum_is_at_two_to_the_sixth_sigma() {
        let r_min = 2f64.powf(1.0 / 6.0);
        assert!((lennard_jones_12_6(r_min, 1.0, 1.0) + 1.0).abs() < TOLERANCE);
        assert!(lennard_jones_12_6_force(r_min, 1.0, 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn lennard_jones_force_is_repulsive_inside_minimum() {
        assert!(lennard_jones_12_6_force(0.9, 1.0, 1.0) > 0.0);
        assert!(lennard_jones_12_6_force(1.5, 1.0, 1.0) < 0.0);
    }

    #[test]
    fn lennard_jones_force_matches_energy_derivative() {
        let lj = LennardJones::new(0.7, 1.1, 3.0).unwrap();
        let h = 1e-6;
        for r in [0.95, 1.2, 1.7, 2.5] {
            let numeric = -(lj.energy(r + h) - lj.energy(r - h)) / (2.0 * h);
            assert!((numeric - lj.force(r)).abs() < 1e-5, "r = {r}");
        }
    }

    #[test]
    fn shifted_lennard_jones_vanishes_at_cutoff() {
        let lj = LennardJones::new(1.0, 1.0, 2.5).unwrap();
        assert!(lj.energy(2.5).abs() < TOLERANCE);
        assert_eq!(lj.energy(2.6), 0.0);
        assert_eq!(lj.force(2.6), 0.0);
        assert_eq!(LennardJones::unshifted(1.0, 1.0, 2.5).unwrap().shift(), 0.0);
    }

    #[test]
    fn lennard_jones_rejects_invalid_parameters() {
        assert!(matches!(
            LennardJones::new(1.0, 0.0, 2.5),
            Err(PotentialError::InvalidParameter { name: "sigma", .. })
        ));
        assert!(LennardJones::new(f64::NAN, 1.0, 2.5).is_err());
    }

    #[test]
    fn tabulated_interpolates_linearly_between_samples() {
        let table = Tabulated::new(1.0, 0.5, vec![4.0, 2.0, 0.0], vec![8.0, 4.0, 0.0]).unwrap();
        assert!((table.cutoff() - 2.0).abs() < TOLERANCE);
        assert!((table.energy(1.25) - 3.0).abs() < TOLERANCE);
        assert!((table.force(1.75) - 2.0).abs() < TOLERANCE);
        assert_eq!(table.energy(0.5), 4.0);
        assert_eq!(table.energy(2.1), 0.0);
    }

    #[test]
    fn tabulated_sample_reproduces_source_on_grid_points() {
        let lj = LennardJones::new(1.0, 1.0, 2.5).unwrap();
        let table = Tabulated::sample(&lj, 0.8, 171).unwrap();
        assert!((table.cutoff() - 2.5).abs() < 1e-12);
        assert!((table.energy(1.0) - lj.energy(1.0)).abs() < 1e-9);
        assert!((table.energy(1.23) - lj.energy(1.23)).abs() < 1e-2);
    }

    #[test]
    fn tabulated_rejects_malformed_tables() {
        assert_eq!(
            Tabulated::new(0.0, 0.1, vec![1.0], vec![1.0]),
            Err(PotentialError::TooFewSamples(1))
        );
        assert!(matches!(
            Tabulated::new(0.0, 0.1, vec![1.0, 2.0], vec![1.0]),
            Err(PotentialError::LengthMismatch { .. })
        ));
        assert!(matches!(
            Tabulated::new(0.0, 0.0, vec![1.0, 2.0], vec![1.0, 2.0]),
            Err(PotentialError::InvalidGrid { .. })
        ));
    }
}

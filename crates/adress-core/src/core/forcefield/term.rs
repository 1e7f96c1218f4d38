use std::ops::{Add, AddAssign};

/// Potential energy split by the resolution it was computed at.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyTerm {
    pub atomistic: f64,
    pub coarse_grained: f64,
}

impl EnergyTerm {
    pub fn new(atomistic: f64, coarse_grained: f64) -> Self {
        Self {
            atomistic,
            coarse_grained,
        }
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.atomistic + self.coarse_grained
    }
}

impl Add for EnergyTerm {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            atomistic: self.atomistic + rhs.atomistic,
            coarse_grained: self.coarse_grained + rhs.coarse_grained,
        }
    }
}

impl AddAssign for EnergyTerm {
    fn add_assign(&mut self, rhs: Self) {
        self.atomistic += rhs.atomistic;
        self.coarse_grained += rhs.coarse_grained;
    }
}

impl std::iter::Sum for EnergyTerm {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

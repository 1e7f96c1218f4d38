use super::comm::Rank;
use super::config::ConfigError;
use super::decomposition::DomainDecomposition;
use super::error::EngineError;
use super::worker::Worker;
use crate::core::models::ids::ParticleId;
use crate::core::space::PeriodicBox;
use crate::core::topology::tuples::TupleMap;
use nalgebra::Point3;
use serde::Deserialize;
use std::f64::consts::PI;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionCentre {
    Fixed(Point3<f64>),
    /// Follows the current position of a particle.
    Tracked(ParticleId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionShape {
    Sphere,
    /// Distance is measured along one axis only.
    Slab(Axis),
}

/// An atomistic region surrounded by a hybrid shell.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub centre: RegionCentre,
    pub shape: RegionShape,
    pub ex_size: f64,
    pub hy_size: f64,
}

impl Region {
    pub fn new(
        centre: RegionCentre,
        shape: RegionShape,
        ex_size: f64,
        hy_size: f64,
    ) -> Result<Self, ConfigError> {
        for (name, value) in [("ex-size", ex_size), ("hy-size", hy_size)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("must be non-negative, got {value}"),
                });
            }
        }
        if let RegionCentre::Fixed(point) = centre {
            if !point.iter().all(|c| c.is_finite()) {
                return Err(ConfigError::InvalidParameter {
                    name: "centre",
                    reason: format!("must be finite, got {point:?}"),
                });
            }
        }
        Ok(Self {
            centre,
            shape,
            ex_size,
            hy_size,
        })
    }

    /// Checks that the region does not overlap its own periodic images.
    pub fn check_fits(&self, pbox: &PeriodicBox) -> Result<(), ConfigError> {
        let limit = match self.shape {
            RegionShape::Sphere => 0.5 * pbox.min_length(),
            RegionShape::Slab(axis) => 0.5 * pbox.length(axis.index()),
        };
        let extent = self.ex_size + self.hy_size;
        if extent > limit {
            return Err(ConfigError::RegionTooLarge { extent, limit });
        }
        Ok(())
    }

    /// Minimum-image distance of `position` from the region centre at `centre`.
    pub fn distance(&self, centre: &Point3<f64>, position: &Point3<f64>, pbox: &PeriodicBox) -> f64 {
        let delta = pbox.displacement(centre, position);
        match self.shape {
            RegionShape::Sphere => delta.norm(),
            RegionShape::Slab(axis) => delta[axis.index()].abs(),
        }
    }
}

/// Resolution weight and its radial derivative at `distance` from a region centre.
///
/// λ is 1 inside `ex_size`, 0 beyond `ex_size + hy_size` and follows
/// `cos²(π (d - ex) / (2 hy))` in between, so both λ and dλ/dd are continuous at the zone edges.
#[inline]
pub fn switching_weight(distance: f64, ex_size: f64, hy_size: f64) -> (f64, f64) {
    if distance <= ex_size {
        return (1.0, 0.0);
    }
    if hy_size <= 0.0 || distance >= ex_size + hy_size {
        return (0.0, 0.0);
    }
    let k = PI / (2.0 * hy_size);
    let arg = k * (distance - ex_size);
    let c = arg.cos();
    (c * c, -k * (2.0 * arg).sin())
}

/// The set of regions that assigns a resolution weight to every coarse-grained particle.
#[derive(Debug, Clone, Default)]
pub struct ResolutionField {
    regions: Vec<Region>,
    threshold: f64,
    last_centres: Vec<Point3<f64>>,
}

impl ResolutionField {
    pub fn new(threshold: f64) -> Self {
        Self {
            regions: Vec::new(),
            threshold,
            last_centres: Vec::new(),
        }
    }

    pub fn define_region(&mut self, region: Region, pbox: &PeriodicBox) -> Result<(), ConfigError> {
        region.check_fits(pbox)?;
        info!(
            centre = ?region.centre,
            shape = ?region.shape,
            ex_size = region.ex_size,
            hy_size = region.hy_size,
            "Defined adaptive resolution region"
        );
        self.regions.push(region);
        Ok(())
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// A field without regions leaves every particle at full atomistic resolution.
    pub fn is_active(&self) -> bool {
        !self.regions.is_empty()
    }

    /// Current position of every region centre, tracked ones read from their owning worker.
    pub fn resolve_centres(&self, dd: &DomainDecomposition) -> Result<Vec<Point3<f64>>, EngineError> {
        self.regions
            .iter()
            .map(|region| match region.centre {
                RegionCentre::Fixed(point) => Ok(point),
                RegionCentre::Tracked(id) => dd
                    .particle(id)
                    .map(|p| p.position)
                    .ok_or(EngineError::ParticleNotFound(id)),
            })
            .collect()
    }

    /// λ (maximum over regions) and the derivative belonging to the dominant region.
    pub fn weight_at(
        &self,
        position: &Point3<f64>,
        centres: &[Point3<f64>],
        pbox: &PeriodicBox,
    ) -> (f64, f64) {
        let mut best = (0.0, 0.0);
        for (region, centre) in self.regions.iter().zip(centres) {
            let d = region.distance(centre, position, pbox);
            let weight = switching_weight(d, region.ex_size, region.hy_size);
            if weight.0 > best.0 {
                best = weight;
            }
        }
        best
    }

    /// Recomputes λ on every worker, locals and ghosts alike.
    ///
    /// Local coarse-grained particles that moved less than the update threshold since their
    /// last evaluation keep their λ unless a region centre moved. Returns the number of
    /// particles updated.
    #[instrument(skip_all, name = "resolution_update")]
    pub fn update(&mut self, dd: &mut DomainDecomposition, tuples: &TupleMap) -> Result<usize, EngineError> {
        if !self.is_active() {
            return Ok(0);
        }
        let centres = self.resolve_centres(dd)?;
        let centres_moved = centres != self.last_centres;
        self.last_centres = centres.clone();

        let pbox = *dd.pbox();
        let field = &*self;
        let updated = dd.workers_mut().try_map_mut(|rank, worker| {
            Ok::<_, EngineError>(field.update_worker(rank, worker, &centres, centres_moved, &pbox, tuples))
        })?;
        let total: usize = updated.gather().into_iter().sum();
        debug!(updated = total, centres_moved, "Resolution weights refreshed");
        Ok(total)
    }

    fn update_worker(
        &self,
        rank: Rank,
        worker: &mut Worker,
        centres: &[Point3<f64>],
        refresh_all: bool,
        pbox: &PeriodicBox,
        tuples: &TupleMap,
    ) -> usize {
        let threshold_sq = self.threshold * self.threshold;
        let mut updated = 0;

        let candidates: Vec<(ParticleId, Point3<f64>)> = worker
            .locals()
            .filter(|p| p.coarse_grained && tuples.has_tuple(p.id))
            .map(|p| (p.id, p.position))
            .collect();
        for (id, position) in candidates {
            let stale = refresh_all
                || match worker.lambda_anchor(id) {
                    Some(anchor) => !((position - anchor).norm_squared() <= threshold_sq),
                    None => true,
                };
            if !stale {
                continue;
            }
            let (lambda, deriv) = self.weight_at(&position, centres, pbox);
            worker.set_local_lambda(id, lambda, deriv, tuples);
            worker.set_lambda_anchor(id, position);
            updated += 1;
        }

        let ghosts: Vec<(ParticleId, [i32; 3], Point3<f64>)> = worker
            .ghosts()
            .filter(|g| g.particle.coarse_grained && tuples.has_tuple(g.particle.id))
            .map(|g| (g.particle.id, g.image, g.particle.position))
            .collect();
        for (id, image, position) in ghosts {
            let (lambda, deriv) = self.weight_at(&position, centres, pbox);
            worker.set_ghost_lambda(id, image, lambda, deriv, tuples);
        }

        if updated > 0 {
            tracing::trace!(rank = rank.0, updated, "Local resolution weights recomputed");
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    fn cube(l: f64) -> PeriodicBox {
        PeriodicBox::new([l, l, l]).unwrap()
    }

    fn sphere(ex: f64, hy: f64) -> Region {
        Region::new(RegionCentre::Fixed(Point3::origin()), RegionShape::Sphere, ex, hy).unwrap()
    }

    #[test]
    fn switching_weight_covers_the_three_zones() {
        assert_eq!(switching_weight(2.5, 3.0, 1.0), (1.0, 0.0));
        let (hybrid, _) = switching_weight(3.5, 3.0, 1.0);
        assert!(hybrid > 0.0 && hybrid < 1.0);
        assert!((hybrid - 0.5).abs() < TOLERANCE);
        assert_eq!(switching_weight(4.5, 3.0, 1.0), (0.0, 0.0));
    }

    #[test]
    fn switching_weight_is_continuous_with_continuous_derivative() {
        let (ex, hy) = (3.0, 1.0);
        for edge in [ex, ex + hy] {
            let (below, d_below) = switching_weight(edge - 1e-9, ex, hy);
            let (above, d_above) = switching_weight(edge + 1e-9, ex, hy);
            assert!((below - above).abs() < 1e-6, "jump at {edge}");
            assert!((d_below - d_above).abs() < 1e-6, "kink at {edge}");
        }
    }

    #[test]
    fn switching_weight_is_monotonic_in_the_hybrid_zone() {
        let mut previous = 1.0;
        for i in 0..=100 {
            let d = 3.0 + i as f64 * 0.01;
            let (lambda, deriv) = switching_weight(d, 3.0, 1.0);
            assert!(lambda <= previous + TOLERANCE);
            assert!(deriv <= TOLERANCE);
            previous = lambda;
        }
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let h = 1e-6;
        for d in [3.1, 3.4, 3.75, 3.9] {
            let numeric = (switching_weight(d + h, 3.0, 1.0).0 - switching_weight(d - h, 3.0, 1.0).0)
                / (2.0 * h);
            assert!((numeric - switching_weight(d, 3.0, 1.0).1).abs() < 1e-5);
        }
    }

    #[test]
    fn zero_thickness_hybrid_zone_is_a_step() {
        assert_eq!(switching_weight(1.0, 1.0, 0.0).0, 1.0);
        assert_eq!(switching_weight(1.0 + 1e-12, 1.0, 0.0).0, 0.0);
    }

    #[test]
    fn region_distance_uses_minimum_image() {
        let region = sphere(3.0, 1.0);
        let pbox = cube(10.0);
        let d = region.distance(&Point3::origin(), &Point3::new(9.0, 0.0, 0.0), &pbox);
        assert!((d - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn slab_distance_ignores_other_axes() {
        let region = Region::new(
            RegionCentre::Fixed(Point3::new(5.0, 5.0, 5.0)),
            RegionShape::Slab(Axis::X),
            1.0,
            1.0,
        )
        .unwrap();
        let pbox = cube(10.0);
        let d = region.distance(&Point3::new(5.0, 5.0, 5.0), &Point3::new(6.5, 0.0, 9.0), &pbox);
        assert!((d - 1.5).abs() < TOLERANCE);
    }

    #[test]
    fn region_must_fit_in_half_the_box() {
        let pbox = PeriodicBox::new([10.0, 10.0, 30.0]).unwrap();
        assert!(sphere(3.0, 2.0).check_fits(&pbox).is_ok());
        assert!(matches!(
            sphere(4.0, 1.5).check_fits(&pbox),
            Err(ConfigError::RegionTooLarge { .. })
        ));

        let slab = Region::new(
            RegionCentre::Fixed(Point3::origin()),
            RegionShape::Slab(Axis::Z),
            10.0,
            4.0,
        )
        .unwrap();
        assert!(slab.check_fits(&pbox).is_ok());
    }

    #[test]
    fn negative_sizes_are_rejected() {
        let result = Region::new(RegionCentre::Fixed(Point3::origin()), RegionShape::Sphere, -1.0, 1.0);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { name: "ex-size", .. })
        ));
    }

    #[test]
    fn weight_at_takes_the_maximum_over_regions() {
        let pbox = cube(20.0);
        let mut field = ResolutionField::new(0.0);
        field.define_region(sphere(1.0, 1.0), &pbox).unwrap();
        field
            .define_region(
                Region::new(
                    RegionCentre::Fixed(Point3::new(10.0, 0.0, 0.0)),
                    RegionShape::Sphere,
                    2.0,
                    2.0,
                )
                .unwrap(),
                &pbox,
            )
            .unwrap();
        let centres = vec![Point3::origin(), Point3::new(10.0, 0.0, 0.0)];

        let (near_first, _) = field.weight_at(&Point3::new(0.5, 0.0, 0.0), &centres, &pbox);
        let (near_second, _) = field.weight_at(&Point3::new(7.0, 0.0, 0.0), &centres, &pbox);
        let (far, _) = field.weight_at(&Point3::new(5.0, 5.0, 5.0), &centres, &pbox);

        assert_eq!(near_first, 1.0);
        assert!((near_second - 0.5).abs() < TOLERANCE);
        assert_eq!(far, 0.0);
    }

    #[test]
    fn empty_field_is_inactive() {
        let field = ResolutionField::new(0.1);
        assert!(!field.is_active());
        assert!(field.regions().is_empty());
    }
}

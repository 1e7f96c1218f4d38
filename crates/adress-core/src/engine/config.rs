use super::decomposition::NodeGrid;
use super::resolution::{Axis, Region, RegionCentre, RegionShape};
use crate::core::models::ids::ParticleId;
use crate::core::space::PeriodicBox;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_LAMBDA_UPDATE_THRESHOLD: f64 = 0.0;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Node grid {grid:?} does not tile {workers} workers")]
    NodeGridMismatch { grid: [usize; 3], workers: usize },

    #[error(
        "Subdomain width {width:.4} along axis {axis} is smaller than cutoff + skin = {required:.4}"
    )]
    SubdomainTooSmall {
        axis: usize,
        width: f64,
        required: f64,
    },

    #[error(
        "Box length {length:.4} along axis {axis} is smaller than twice cutoff + skin = {required:.4}"
    )]
    BoxTooSmall {
        axis: usize,
        length: f64,
        required: f64,
    },

    #[error("Region extent ex + hy = {extent:.4} exceeds half the box ({limit:.4})")]
    RegionTooLarge { extent: f64, limit: f64 },

    #[error("Failed to read configuration file {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to parse configuration file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Setup parameters of a simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub box_lengths: [f64; 3],
    pub workers: usize,
    /// Explicit worker grid; factorized from `workers` when absent.
    pub node_grid: Option<[usize; 3]>,
    /// Verlet list cutoff.
    pub cutoff: f64,
    pub skin: f64,
    /// Minimum displacement of a coarse-grained particle before its λ is recomputed.
    pub lambda_update_threshold: f64,
    /// Compare every neighbour list rebuild against a serial reference scan.
    pub verify_pairs: bool,
    pub regions: Vec<Region>,
}

impl SimulationConfig {
    pub fn builder() -> SimulationConfigBuilder {
        SimulationConfigBuilder::new()
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        PartialSimulationConfig::from_file(path.as_ref())?
            .into_builder()?
            .build()
    }

    /// Interaction range every cell and subdomain has to cover.
    pub fn range(&self) -> f64 {
        self.cutoff + self.skin
    }

    pub fn periodic_box(&self) -> Result<PeriodicBox, ConfigError> {
        PeriodicBox::new(self.box_lengths).map_err(|e| ConfigError::InvalidParameter {
            name: "box-lengths",
            reason: e.to_string(),
        })
    }

    /// The worker grid: the explicit one if given, otherwise a factorization of `workers`.
    pub fn resolve_node_grid(&self) -> Result<NodeGrid, ConfigError> {
        let pbox = self.periodic_box()?;
        match self.node_grid {
            Some(dims) => {
                let grid = NodeGrid::new(dims)?;
                if grid.size() != self.workers {
                    return Err(ConfigError::NodeGridMismatch {
                        grid: dims,
                        workers: self.workers,
                    });
                }
                Ok(grid)
            }
            None => NodeGrid::factorize(self.workers, pbox.lengths()),
        }
    }

    /// Runs every setup-time check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pbox = self.periodic_box()?;
        if self.workers == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        if !(self.cutoff.is_finite() && self.cutoff > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "cutoff",
                reason: format!("must be positive, got {}", self.cutoff),
            });
        }
        if !(self.skin.is_finite() && self.skin >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "skin",
                reason: format!("must be non-negative, got {}", self.skin),
            });
        }
        if !(self.lambda_update_threshold.is_finite() && self.lambda_update_threshold >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "lambda-update-threshold",
                reason: format!("must be non-negative, got {}", self.lambda_update_threshold),
            });
        }

        let grid = self.resolve_node_grid()?;
        let range = self.range();
        let widths = grid.widths(&pbox);
        for axis in 0..3 {
            if widths[axis] < range {
                return Err(ConfigError::SubdomainTooSmall {
                    axis,
                    width: widths[axis],
                    required: range,
                });
            }
            if pbox.length(axis) < 2.0 * range {
                return Err(ConfigError::BoxTooSmall {
                    axis,
                    length: pbox.length(axis),
                    required: 2.0 * range,
                });
            }
        }

        for region in &self.regions {
            region.check_fits(&pbox)?;
        }
        debug!(
            node_grid = ?grid.dims(),
            range,
            regions = self.regions.len(),
            "Configuration validated"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct SimulationConfigBuilder {
    box_lengths: Option<[f64; 3]>,
    workers: Option<usize>,
    node_grid: Option<[usize; 3]>,
    cutoff: Option<f64>,
    skin: Option<f64>,
    lambda_update_threshold: Option<f64>,
    verify_pairs: bool,
    regions: Vec<Region>,
}

impl SimulationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn box_lengths(mut self, lengths: [f64; 3]) -> Self {
        self.box_lengths = Some(lengths);
        self
    }
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
    pub fn node_grid(mut self, dims: [usize; 3]) -> Self {
        self.node_grid = Some(dims);
        self
    }
    pub fn cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = Some(cutoff);
        self
    }
    pub fn skin(mut self, skin: f64) -> Self {
        self.skin = Some(skin);
        self
    }
    pub fn lambda_update_threshold(mut self, threshold: f64) -> Self {
        self.lambda_update_threshold = Some(threshold);
        self
    }
    pub fn verify_pairs(mut self, verify: bool) -> Self {
        self.verify_pairs = verify;
        self
    }
    pub fn region(mut self, region: Region) -> Self {
        self.regions.push(region);
        self
    }

    /// Assembles the configuration and validates it.
    pub fn build(self) -> Result<SimulationConfig, ConfigError> {
        let config = SimulationConfig {
            box_lengths: self
                .box_lengths
                .ok_or(ConfigError::MissingParameter("box_lengths"))?,
            workers: self.workers.ok_or(ConfigError::MissingParameter("workers"))?,
            node_grid: self.node_grid,
            cutoff: self.cutoff.ok_or(ConfigError::MissingParameter("cutoff"))?,
            skin: self.skin.ok_or(ConfigError::MissingParameter("skin"))?,
            lambda_update_threshold: self
                .lambda_update_threshold
                .unwrap_or(DEFAULT_LAMBDA_UPDATE_THRESHOLD),
            verify_pairs: self.verify_pairs,
            regions: self.regions,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", tag = "type")]
enum PartialRegionCentre {
    Point { position: [f64; 3] },
    Tracked { particle: u64 },
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", tag = "type")]
enum PartialRegionShape {
    #[default]
    Sphere,
    Slab {
        axis: Axis,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialRegion {
    centre: PartialRegionCentre,
    #[serde(default)]
    shape: PartialRegionShape,
    ex_size: f64,
    hy_size: f64,
}

impl PartialRegion {
    fn into_region(self) -> Result<Region, ConfigError> {
        let centre = match self.centre {
            PartialRegionCentre::Point { position } => RegionCentre::Fixed(position.into()),
            PartialRegionCentre::Tracked { particle } => RegionCentre::Tracked(ParticleId(particle)),
        };
        let shape = match self.shape {
            PartialRegionShape::Sphere => RegionShape::Sphere,
            PartialRegionShape::Slab { axis } => RegionShape::Slab(axis),
        };
        Region::new(centre, shape, self.ex_size, self.hy_size)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialAdressConfig {
    #[serde(default)]
    regions: Vec<PartialRegion>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialSimulationConfig {
    box_lengths: Option<[f64; 3]>,
    workers: Option<usize>,
    node_grid: Option<[usize; 3]>,
    cutoff: Option<f64>,
    skin: Option<f64>,
    lambda_update_threshold: Option<f64>,
    verify_pairs: Option<bool>,
    adress: Option<PartialAdressConfig>,
}

impl PartialSimulationConfig {
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn into_builder(self) -> Result<SimulationConfigBuilder, ConfigError> {
        let mut builder = SimulationConfigBuilder::new();
        if let Some(lengths) = self.box_lengths {
            builder = builder.box_lengths(lengths);
        }
        if let Some(workers) = self.workers {
            builder = builder.workers(workers);
        }
        if let Some(dims) = self.node_grid {
            builder = builder.node_grid(dims);
        }
        if let Some(cutoff) = self.cutoff {
            builder = builder.cutoff(cutoff);
        }
        if let Some(skin) = self.skin {
            builder = builder.skin(skin);
        }
        if let Some(threshold) = self.lambda_update_threshold {
            builder = builder.lambda_update_threshold(threshold);
        }
        builder = builder.verify_pairs(self.verify_pairs.unwrap_or(false));
        for region in self.adress.unwrap_or_default().regions {
            builder = builder.region(region.into_region()?);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use std::io::Write;
    use tempfile::tempdir;

    fn base() -> SimulationConfigBuilder {
        SimulationConfig::builder()
            .box_lengths([10.0, 10.0, 10.0])
            .workers(2)
            .cutoff(1.0)
            .skin(0.2)
    }

    #[test]
    fn build_succeeds_with_all_required_parameters() {
        let config = base().build().unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.lambda_update_threshold, DEFAULT_LAMBDA_UPDATE_THRESHOLD);
        assert!((config.range() - 1.2).abs() < 1e-12);
        assert_eq!(config.resolve_node_grid().unwrap().dims(), [2, 1, 1]);
    }

    #[test]
    fn build_fails_if_required_parameter_is_missing() {
        let result = SimulationConfig::builder()
            .box_lengths([10.0, 10.0, 10.0])
            .workers(1)
            .cutoff(1.0)
            .build();
        assert_eq!(result, Err(ConfigError::MissingParameter("skin")));
    }

    #[test]
    fn explicit_node_grid_must_tile_worker_count() {
        let result = base().node_grid([2, 2, 1]).build();
        assert_eq!(
            result,
            Err(ConfigError::NodeGridMismatch {
                grid: [2, 2, 1],
                workers: 2
            })
        );
    }

    #[test]
    fn subdomains_thinner_than_range_are_rejected() {
        let result = base().workers(16).node_grid([16, 1, 1]).build();
        assert!(matches!(
            result,
            Err(ConfigError::SubdomainTooSmall { axis: 0, .. })
        ));
    }

    #[test]
    fn box_shorter_than_twice_the_range_is_rejected() {
        let result = base()
            .box_lengths([10.0, 10.0, 2.0])
            .workers(1)
            .build();
        assert!(matches!(result, Err(ConfigError::BoxTooSmall { axis: 2, .. })));
    }

    #[test]
    fn oversized_region_is_rejected() {
        let region = Region::new(
            RegionCentre::Fixed(Point3::origin()),
            RegionShape::Sphere,
            4.0,
            1.5,
        )
        .unwrap();
        let result = base().region(region).build();
        assert!(matches!(result, Err(ConfigError::RegionTooLarge { .. })));
    }

    #[test]
    fn non_positive_cutoff_is_rejected() {
        let result = base().cutoff(0.0).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { name: "cutoff", .. })
        ));
    }

    #[test]
    fn load_reads_a_complete_toml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("adress.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
box-lengths = [10.0, 10.0, 10.0]
workers = 4
node-grid = [2, 2, 1]
cutoff = 1.0
skin = 0.2
verify-pairs = true

[[adress.regions]]
centre = {{ type = "point", position = [5.0, 5.0, 5.0] }}
ex-size = 2.0
hy-size = 1.0

[[adress.regions]]
centre = {{ type = "tracked", particle = 7 }}
shape = {{ type = "slab", axis = "z" }}
ex-size = 1.0
hy-size = 0.5
"#
        )
        .unwrap();

        let config = SimulationConfig::load(&path).unwrap();

        assert_eq!(config.node_grid, Some([2, 2, 1]));
        assert!(config.verify_pairs);
        assert_eq!(config.regions.len(), 2);
        assert_eq!(
            config.regions[0].centre,
            RegionCentre::Fixed(Point3::new(5.0, 5.0, 5.0))
        );
        assert_eq!(config.regions[1].centre, RegionCentre::Tracked(ParticleId(7)));
        assert_eq!(config.regions[1].shape, RegionShape::Slab(Axis::Z));
    }

    #[test]
    fn load_rejects_unknown_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "cutof = 1.0\n").unwrap();

        let result = SimulationConfig::load(&path);

        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        let result = SimulationConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}

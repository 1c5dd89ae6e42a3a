use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::galaxy::builder::BuildParams;
use crate::galaxy::index::{IndexParams, Metric};
use crate::galaxy::reducer::LayoutParams;

const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_PROBE: usize = 8;
const DEFAULT_SAMPLE_SIZE: usize = 4096;
const DEFAULT_KMEANS_ITERATIONS: usize = 12;
const DEFAULT_EXHAUSTIVE_FRACTION: f32 = 0.5;
const DEFAULT_INDEX_SEED: u64 = 42;

const DEFAULT_POWER_ITERATIONS: usize = 24;
const DEFAULT_EXTENT: f64 = 100.0;
const DEFAULT_LAYOUT_SEED: u64 = 7;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Similarity index settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub metric: Metric,

    /// Number of coarse buckets, 0 = about sqrt(item count)
    #[serde(default)]
    pub buckets: usize,

    /// Buckets visited per query
    #[serde(default = "default_probe")]
    pub probe: usize,

    /// Vectors sampled to train bucket centroids
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,

    /// Scan every bucket once probe/buckets reaches this fraction
    #[serde(default = "default_exhaustive_fraction")]
    pub exhaustive_fraction: f32,

    #[serde(default = "default_index_seed")]
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            buckets: 0,
            probe: DEFAULT_PROBE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            kmeans_iterations: DEFAULT_KMEANS_ITERATIONS,
            exhaustive_fraction: DEFAULT_EXHAUSTIVE_FRACTION,
            seed: DEFAULT_INDEX_SEED,
        }
    }
}

/// 3D layout settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,

    /// Half the edge of the cube the galaxy is scaled into
    #[serde(default = "default_extent")]
    pub extent: f64,

    #[serde(default = "default_layout_seed")]
    pub seed: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            power_iterations: DEFAULT_POWER_ITERATIONS,
            extent: DEFAULT_EXTENT,
            seed: DEFAULT_LAYOUT_SEED,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

fn default_probe() -> usize {
    DEFAULT_PROBE
}

fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

fn default_kmeans_iterations() -> usize {
    DEFAULT_KMEANS_ITERATIONS
}

fn default_exhaustive_fraction() -> f32 {
    DEFAULT_EXHAUSTIVE_FRACTION
}

fn default_index_seed() -> u64 {
    DEFAULT_INDEX_SEED
}

fn default_power_iterations() -> usize {
    DEFAULT_POWER_ITERATIONS
}

fn default_extent() -> f64 {
    DEFAULT_EXTENT
}

fn default_layout_seed() -> u64 {
    DEFAULT_LAYOUT_SEED
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let index = &self.index;
        if index.probe == 0 {
            bail!("index.probe must be greater than 0");
        }
        if index.sample_size == 0 {
            bail!("index.sample_size must be greater than 0");
        }
        if index.kmeans_iterations == 0 {
            bail!("index.kmeans_iterations must be greater than 0");
        }
        if !(index.exhaustive_fraction > 0.0 && index.exhaustive_fraction <= 1.0) {
            bail!(
                "index.exhaustive_fraction must be in (0.0, 1.0], got {}",
                index.exhaustive_fraction
            );
        }

        let layout = &self.layout;
        if layout.power_iterations == 0 {
            bail!("layout.power_iterations must be greater than 0");
        }
        if !(layout.extent.is_finite() && layout.extent > 0.0) {
            bail!("layout.extent must be a positive number, got {}", layout.extent);
        }

        self.listen_addr()?;

        Ok(())
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !path.exists() {
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)
                .with_context(|| format!("failed to create {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE_NAME), config_str)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.daemon
            .listen
            .parse()
            .with_context(|| format!("daemon.listen is not a socket address: {}", self.daemon.listen))
    }

    pub fn build_params(&self) -> BuildParams {
        BuildParams {
            index: IndexParams {
                metric: self.index.metric,
                buckets: self.index.buckets,
                probe: self.index.probe,
                sample_size: self.index.sample_size,
                kmeans_iterations: self.index.kmeans_iterations,
                exhaustive_fraction: self.index.exhaustive_fraction,
                seed: self.index.seed,
            },
            layout: LayoutParams {
                power_iterations: self.layout.power_iterations,
                extent: self.layout.extent,
                seed: self.layout.seed,
            },
        }
    }
}

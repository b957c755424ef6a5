use std::path::{Path, PathBuf};

use ndarray::{Zip, indices};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Normal, NormalError};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::SyntheticConfig,
    volume::Volume,
    volume_loader::{DecodedSeries, VolumeLoader, VolumeLoaderError},
};

const SOFT_TISSUE: f32 = 50.0;
const DENSE_SHELL: f32 = 800.0;
const SHELL_THICKNESS: f64 = 5.0;
const OFFSET_ORGAN: f32 = 100.0;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Synthetic volume size must be positive")]
    EmptySynthetic,

    #[error("Invalid synthetic noise: {0}")]
    Noise(#[from] NormalError),
}

/// Result of acquiring a volume. Missing or unreadable input is not an
/// error, it selects [`SourceOutcome::Synthesized`].
#[derive(Debug)]
pub enum SourceOutcome {
    Decoded(DecodedSeries),
    Synthesized(Volume),
    Failed(SourceError),
}

pub struct VolumeSource {
    input_dir: PathBuf,
    synthetic: SyntheticConfig,
}

impl VolumeSource {
    pub fn new(input_dir: impl Into<PathBuf>, synthetic: SyntheticConfig) -> Self {
        Self {
            input_dir: input_dir.into(),
            synthetic,
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Decode the slice series in the input directory, or synthesize a
    /// stand-in volume when there is nothing decodable.
    pub fn acquire(&self) -> SourceOutcome {
        if !self.input_dir.is_dir() {
            warn!(
                "No slice directory at {}, using synthetic data instead",
                self.input_dir.display()
            );
            return self.synthesize_outcome();
        }

        self.outcome(VolumeLoader::load_from_directory(&self.input_dir))
    }

    /// Only synthesis can fail the source. Anything wrong on the input side
    /// selects the synthetic volume.
    fn outcome(&self, loaded: Result<DecodedSeries, VolumeLoaderError>) -> SourceOutcome {
        match loaded {
            Ok(series) => {
                info!(
                    "Decoded {} slices from {}",
                    series.slice_count,
                    self.input_dir.display()
                );
                SourceOutcome::Decoded(series)
            }
            Err(VolumeLoaderError::NoValidImages) => {
                warn!(
                    "No decodable slices in {}, using synthetic data instead",
                    self.input_dir.display()
                );
                self.synthesize_outcome()
            }
            Err(err) => {
                warn!(
                    "Could not read slices from {} ({err}), using synthetic data instead",
                    self.input_dir.display()
                );
                self.synthesize_outcome()
            }
        }
    }

    fn synthesize_outcome(&self) -> SourceOutcome {
        match synthesize(&self.synthetic) {
            Ok(volume) => SourceOutcome::Synthesized(volume),
            Err(err) => SourceOutcome::Failed(err),
        }
    }
}

/// Cubic test volume on the Hounsfield scale: a soft tissue sphere wrapped
/// in a dense shell, a smaller offset sphere, and Gaussian noise on every
/// voxel. Spacing is 1 mm on every axis.
pub fn synthesize(config: &SyntheticConfig) -> Result<Volume, SourceError> {
    let size = config.size;
    if size == 0 {
        return Err(SourceError::EmptySynthetic);
    }
    let normal = Normal::new(0.0f32, config.noise_std)?;
    info!("Generating {size}^3 synthetic volume");

    let center = (size / 2) as f64;
    let radius = (size / 4) as f64;
    let small_center = [center + 15.0, center - 10.0, center];
    let small_radius = (size / 8) as f64;

    let mut data = Zip::from(indices((size, size, size))).par_map_collect(|(z, y, x)| {
        let point = [x as f64, y as f64, z as f64];
        if distance(point, small_center) < small_radius {
            OFFSET_ORGAN
        } else {
            let d = distance(point, [center; 3]);
            if d < radius {
                SOFT_TISSUE
            } else if d < radius + SHELL_THICKNESS {
                DENSE_SHELL
            } else {
                0.0
            }
        }
    });

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    // sequential so a seed always gives the same noise
    data.iter_mut().for_each(|v| *v += rng.sample(normal));

    Ok(Volume::new(data, [1.0; 3]))
}

#[inline]
fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{marching_cubes::DEFAULT_ISO_LEVEL, segment::DEFAULT_THRESHOLD};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Artifacts go to `output_dir/<namespace>` when set, isolating
    /// concurrent runs from each other.
    pub run_namespace: Option<String>,
    pub target_spacing: [f64; 3],
    pub threshold: f32,
    pub iso_level: f32,
    /// Raw value marking samples outside the scanner's field of view.
    pub sentinel: i16,
    pub synthetic: SyntheticConfig,
}

/// Parameters of the stand-in volume generated when no slices are found.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub size: usize,
    pub noise_std: f32,
    /// Unset seeds the noise from entropy.
    pub seed: Option<u64>,
}

impl PipelineConfig {
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("Failed to load config, using defaults: {}", err);
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(if path.exists() {
            let file = fs::read(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let string = String::from_utf8_lossy(&file);
            let config = toml::from_str(&string)?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            info!("No config file at {}, using defaults", path.display());
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let string = toml::to_string(self)?;
        fs::write(path, string).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn artifact_dir(&self) -> PathBuf {
        match &self.run_namespace {
            Some(namespace) => self.output_dir.join(namespace),
            None => self.output_dir.clone(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("dicom"),
            output_dir: PathBuf::from("output"),
            run_namespace: None,
            target_spacing: [1.0; 3],
            threshold: DEFAULT_THRESHOLD,
            iso_level: DEFAULT_ISO_LEVEL,
            sentinel: -2000,
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            size: 128,
            noise_std: 10.0,
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            threshold = 150.0
            run_namespace = "job-7"

            [synthetic]
            seed = 42
            "#,
        )
        .unwrap();

        assert_eq!(config.threshold, 150.0);
        assert_eq!(config.synthetic.seed, Some(42));
        assert_eq!(config.synthetic.size, 128);
        assert_eq!(config.input_dir, PathBuf::from("dicom"));
        assert_eq!(config.artifact_dir(), PathBuf::from("output").join("job-7"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.artifact_dir(), PathBuf::from("output"));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        let config = PipelineConfig {
            target_spacing: [0.5, 0.5, 2.0],
            sentinel: -1024,
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(&path, "threshold = \"high\"").unwrap();

        assert!(matches!(
            PipelineConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(PipelineConfig::load_or_default(&path), PipelineConfig::default());
    }
}

use std::{
    any::Any,
    convert::Infallible,
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};
use web_time::Instant;

use crate::{
    config::PipelineConfig,
    enums::{ArtifactKind, SourceKind, Stage},
    interpolator::{Interpolator, ResampleError},
    marching_cubes::{ExtractError, SurfaceExtractor},
    normalize::IntensityNormalizer,
    segment::ThresholdSegmenter,
    source::{SourceError, SourceOutcome, VolumeSource},
    store::{ArtifactStore, ArtifactStoreExt, FsArtifactStore, StoreError},
    volume::Volume,
};

/// A failed pipeline run, naming the stage that failed.
#[derive(Debug, Error)]
#[error("{stage} failed: {cause}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub cause: StageError,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Resample(#[from] ResampleError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unexpected failure: {0}")]
    Panicked(String),
}

impl From<Infallible> for StageError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// Summary of a successful run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub source: SourceKind,
    pub slice_count: usize,
    /// Shape of the resampled volume and mask.
    pub volume_shape: (usize, usize, usize),
    pub spacing: [f64; 3],
    pub foreground_voxels: usize,
    pub vertex_count: usize,
    pub face_count: usize,
    pub timings: Vec<(Stage, Duration)>,
}

impl RunReport {
    pub fn total_time(&self) -> Duration {
        self.timings.iter().map(|(_, elapsed)| *elapsed).sum()
    }
}

struct Downstream {
    volume_shape: (usize, usize, usize),
    spacing: [f64; 3],
    foreground_voxels: usize,
    vertex_count: usize,
    face_count: usize,
}

/// Runs Source, Normalize, Resample, Segment, Extract and Serialize in
/// order, persisting every intermediate artifact to `S`.
///
/// Runs on one `Pipeline` never overlap: each holds the run lock from the
/// first stage to the last. Pipelines in separate processes should use
/// distinct artifact namespaces.
pub struct Pipeline<S> {
    config: PipelineConfig,
    store: S,
    run_lock: Mutex<()>,
}

impl Pipeline<FsArtifactStore> {
    /// Pipeline persisting to `config.artifact_dir()`.
    pub fn from_config(config: PipelineConfig) -> Self {
        let store = FsArtifactStore::new(config.artifact_dir());
        Self::new(config, store)
    }
}

impl<S: ArtifactStore> Pipeline<S> {
    pub fn new(config: PipelineConfig, store: S) -> Self {
        Self {
            config,
            store,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current content of an artifact slot; `None` when it was never
    /// produced.
    pub fn fetch(&self, kind: ArtifactKind) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(kind)
    }

    /// Full run from the configured input directory.
    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let _guard = self.run_lock.lock();
        let mut stages = StageRunner::default();
        info!("Starting pipeline run on {}", self.config.input_dir.display());

        let source = VolumeSource::new(&self.config.input_dir, self.config.synthetic.clone());
        let (source_kind, slice_count, raw, rescale) =
            stages.run(Stage::Source, || match source.acquire() {
                SourceOutcome::Decoded(series) => {
                    let kind = if series.joined {
                        SourceKind::Decoded
                    } else {
                        SourceKind::Degraded
                    };
                    Ok((kind, series.slice_count, series.volume, Some(series.rescale)))
                }
                SourceOutcome::Synthesized(volume) => {
                    let slices = volume.dim().0;
                    Ok((SourceKind::Synthesized, slices, volume, None))
                }
                SourceOutcome::Failed(err) => Err(err),
            })?;
        info!(
            "Acquired {source_kind} volume {:?} with spacing {:?}",
            raw.dim(),
            raw.spacing
        );

        let normalized = match rescale {
            Some(rescale) => stages.run(Stage::Normalize, || {
                let normalizer = IntensityNormalizer::new(rescale, self.config.sentinel);
                Ok::<_, Infallible>(normalizer.normalize(&raw))
            })?,
            None => {
                debug!("Synthetic volume is already in Hounsfield units");
                raw
            }
        };

        let target = self.config.target_spacing;
        let resampled = stages.run(Stage::Resample, || {
            let resampled = Interpolator::resample(&normalized, target)?;
            self.store.put_volume(&resampled)?;
            Ok::<_, StageError>(resampled)
        })?;
        drop(normalized);
        info!(
            "Resampled to {:?} with spacing {:?}",
            resampled.dim(),
            resampled.spacing
        );

        let downstream = self.segment_and_extract(&resampled, &mut stages)?;
        Ok(stages.report(source_kind, slice_count, downstream))
    }

    /// Re-run segmentation and extraction against the persisted volume
    /// and spacing, without touching the input directory.
    pub fn run_from_persisted(&self) -> Result<RunReport, PipelineError> {
        let _guard = self.run_lock.lock();
        let mut stages = StageRunner::default();
        info!("Starting pipeline run from persisted volume");

        let volume = stages.run(Stage::Segment, || {
            self.store
                .get_volume()?
                .ok_or(StoreError::Missing(ArtifactKind::Volume))
        })?;
        let slice_count = volume.dim().0;

        let downstream = self.segment_and_extract(&volume, &mut stages)?;
        Ok(stages.report(SourceKind::Persisted, slice_count, downstream))
    }

    fn segment_and_extract(
        &self,
        volume: &Volume,
        stages: &mut StageRunner,
    ) -> Result<Downstream, PipelineError> {
        let mask = stages.run(Stage::Segment, || {
            let mask = ThresholdSegmenter::new(self.config.threshold).segment(volume);
            self.store.put_mask(&mask)?;
            Ok::<_, StoreError>(mask)
        })?;
        let foreground_voxels = mask.foreground_count();
        info!(
            "Segmented {foreground_voxels} of {} voxels above {}",
            volume.voxel_count(),
            self.config.threshold
        );

        let mesh = stages.run(Stage::Extract, || {
            SurfaceExtractor::new(self.config.iso_level).extract(&mask)
        })?;
        info!(
            "Extracted {} vertices and {} faces",
            mesh.vertex_count(),
            mesh.face_count()
        );

        stages.run(Stage::Serialize, || self.store.put_mesh(&mesh))?;
        info!(
            "Wrote mesh to {}",
            self.store.location(ArtifactKind::Mesh)
        );

        Ok(Downstream {
            volume_shape: mask.dim(),
            spacing: mask.spacing,
            foreground_voxels,
            vertex_count: mesh.vertex_count(),
            face_count: mesh.face_count(),
        })
    }
}

/// Times stages and turns their failures, including panics, into
/// [`PipelineError`]s.
#[derive(Default)]
struct StageRunner {
    timings: Vec<(Stage, Duration)>,
}

impl StageRunner {
    fn run<T, E>(
        &mut self,
        stage: Stage,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, PipelineError>
    where
        E: Into<StageError>,
    {
        debug!("Starting {stage}");
        let start = Instant::now();
        let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result.map_err(Into::into),
            Err(payload) => Err(StageError::Panicked(panic_message(payload.as_ref()))),
        };
        let elapsed = start.elapsed();
        self.timings.push((stage, elapsed));

        match result {
            Ok(value) => {
                debug!("Finished {stage} in {elapsed:?}");
                Ok(value)
            }
            Err(cause) => {
                let err = PipelineError { stage, cause };
                error!("{err}");
                Err(err)
            }
        }
    }

    fn report(self, source: SourceKind, slice_count: usize, downstream: Downstream) -> RunReport {
        let report = RunReport {
            source,
            slice_count,
            volume_shape: downstream.volume_shape,
            spacing: downstream.spacing,
            foreground_voxels: downstream.foreground_voxels,
            vertex_count: downstream.vertex_count,
            face_count: downstream.face_count,
            timings: self.timings,
        };
        info!("Pipeline finished in {:?}", report.total_time());
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic without message".to_string()
    }
}

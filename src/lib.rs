//! # DICOM-surface library
//!
//! This crate turns a stack of DICOM slices into a triangulated surface.
//!
//! It builds on the dicom-rs ecosystem to read a slice series into a volume
//! and runs it through a linear chain of stages:
//!  - Volume source: decode the first series in a directory, or synthesize a
//!    test volume when there is nothing to decode
//!  - Intensity normalization to Hounsfield units
//!  - Isotropic resampling with trilinear interpolation
//!  - Threshold segmentation into a binary mask
//!  - Marching cubes surface extraction
//!  - Binary STL serialization
//!
//! Every stage persists its output to an [`ArtifactStore`] before the next
//! one runs, so later stages can be re-run from the stored volume. Per-voxel
//! stages run in parallel using rayon.
//!
//! DICOM files are assumed to have the following attributes:
//!   - Axial data set
//!   - No multiframe (always the first frame is used)
//!   - Slices of one series share rows and columns; otherwise only the
//!     first slice is kept
//!
//! # Examples
//!
//! ## Running the pipeline
//!
//! Read the slices in the dicom/ directory, write the artifacts to output/
//! and report the size of the extracted surface.
//!
//! ```no_run
//! # use dicom_surface::{Pipeline, PipelineConfig};
//! let pipeline = Pipeline::from_config(PipelineConfig::default());
//! let report = pipeline.run().expect("pipeline should have succeeded");
//! println!("{} faces from a {} volume", report.face_count, report.source);
//! ```
//!
//! ## Previewing a slice
//!
//! ```no_run
//! # use dicom_surface::{ArtifactStoreExt, FsArtifactStore, Orientation, Window};
//! let store = FsArtifactStore::new("output");
//! let volume = store
//!     .get_volume()
//!     .expect("should have read the volume")
//!     .expect("pipeline should have run before");
//! let image = volume
//!     .slice_image(volume.dim().0 / 2, Orientation::Axial, Window::default())
//!     .expect("should have returned image at center of volume");
//! image.save("result.png").expect("should have written the image");
//! ```
//!
//! [`ArtifactStore`]: store::ArtifactStore

pub mod config;
pub mod enums;
pub mod interpolator;
pub mod marching_cubes;
mod mc_tables;
pub mod mesh;
pub mod normalize;
pub mod npy;
pub mod pipeline;
pub mod segment;
pub mod source;
pub mod store;
pub mod volume;
pub mod volume_loader;

pub use config::{PipelineConfig, SyntheticConfig};
pub use enums::{ArtifactKind, Orientation, SourceKind, Stage};
pub use mesh::Mesh;
pub use pipeline::{Pipeline, PipelineError, RunReport};
pub use store::{ArtifactStore, ArtifactStoreExt, FsArtifactStore, MemoryArtifactStore};
pub use volume::{MaskVolume, Volume, Window};

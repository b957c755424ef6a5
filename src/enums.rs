use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Metadata fields a slice can be ordered by, in order of preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceOrderKey {
    /// Third component of Image Position (Patient)
    ImagePosition,
    SliceLocation,
    InstanceNumber,
}

impl SliceOrderKey {
    /// Strategies tried per slice; the first one yielding a value wins.
    pub const PRIORITY: [SliceOrderKey; 3] = [
        SliceOrderKey::ImagePosition,
        SliceOrderKey::SliceLocation,
        SliceOrderKey::InstanceNumber,
    ];
}

/// The singleton artifact slots a pipeline run writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    Volume,
    Spacing,
    Mask,
    Mesh,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Volume,
        ArtifactKind::Spacing,
        ArtifactKind::Mask,
        ArtifactKind::Mesh,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Volume => "volume.npy",
            ArtifactKind::Spacing => "spacing.npy",
            ArtifactKind::Mask => "segmented_volume.npy",
            ArtifactKind::Mesh => "organ_model.stl",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Volume => "volume",
            ArtifactKind::Spacing => "spacing",
            ArtifactKind::Mask => "mask",
            ArtifactKind::Mesh => "mesh",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Source,
    Normalize,
    Resample,
    Segment,
    Extract,
    Serialize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Source => "volume source",
            Stage::Normalize => "intensity normalization",
            Stage::Resample => "isotropic resampling",
            Stage::Segment => "segmentation",
            Stage::Extract => "surface extraction",
            Stage::Serialize => "mesh serialization",
        })
    }
}

/// Where the volume of a run came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Decoded,
    /// Slices could not be stacked, only the first one was kept.
    Degraded,
    Synthesized,
    /// Loaded from a previously persisted volume artifact.
    Persisted,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Decoded => "decoded",
            SourceKind::Degraded => "degraded single slice",
            SourceKind::Synthesized => "synthesized",
            SourceKind::Persisted => "persisted",
        })
    }
}

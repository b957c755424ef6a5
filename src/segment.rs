use crate::volume::{MaskVolume, Volume};

use ndarray::Zip;

/// Default cutoff in Hounsfield units, above soft tissue and below bone or
/// contrast.
pub const DEFAULT_THRESHOLD: f32 = 200.0;

/// Fixed-threshold segmentation: a voxel is foreground when its intensity
/// strictly exceeds the threshold.
#[derive(Clone, Copy, Debug)]
pub struct ThresholdSegmenter {
    pub threshold: f32,
}

impl Default for ThresholdSegmenter {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl ThresholdSegmenter {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn segment(&self, volume: &Volume) -> MaskVolume {
        let threshold = self.threshold;
        let data = Zip::from(&volume.data).par_map_collect(|&v| u8::from(v > threshold));
        MaskVolume::new(data, volume.spacing)
    }
}

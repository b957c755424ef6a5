use crate::volume::Volume;

use ndarray::Zip;

/// Linear modality transform from stored sample values to Hounsfield units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

/// Maps raw samples onto the signed 16-bit Hounsfield scale and replaces the
/// outside-field-of-view sentinel with 0.
#[derive(Clone, Copy, Debug)]
pub struct IntensityNormalizer {
    rescale: Rescale,
    sentinel: i16,
}

impl IntensityNormalizer {
    pub fn new(rescale: Rescale, sentinel: i16) -> Self {
        Self { rescale, sentinel }
    }

    #[inline]
    pub fn normalize_sample(&self, raw: f32) -> f32 {
        let value = f64::from(raw).mul_add(self.rescale.slope, self.rescale.intercept);
        // saturating; NaN lands on 0
        let hu = value.trunc() as i16;
        if hu == self.sentinel { 0.0 } else { f32::from(hu) }
    }

    pub fn normalize(&self, volume: &Volume) -> Volume {
        let data = Zip::from(&volume.data).par_map_collect(|&raw| self.normalize_sample(raw));
        Volume::new(data, volume.spacing).with_origin(volume.origin)
    }
}

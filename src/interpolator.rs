use crate::volume::{Volume, is_valid_spacing};

use ndarray::{Array3, ArrayView3, Axis, CowArray, Zip, indices};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("Target spacing must be positive and finite, got {0:?}")]
    InvalidTarget([f64; 3]),

    #[error("Source spacing must be positive and finite, got {0:?}")]
    InvalidSpacing([f64; 3]),

    #[error("Resizing axis {axis} ({count} voxels) gives a non-positive voxel count")]
    NonPositiveCount { axis: usize, count: usize },
}

pub struct Interpolator;

impl Interpolator {
    /// Voxel counts and the spacing they actually realize when resampling a
    /// grid of `dim` voxels at `spacing` towards `target`.
    ///
    /// Counts are rounded half-to-even; the returned spacing reflects the
    /// rounded grid exactly rather than the requested target.
    pub fn isotropic_dimensions(
        spacing: [f64; 3],
        dim: [usize; 3],
        target: [f64; 3],
    ) -> Result<([usize; 3], [f64; 3]), ResampleError> {
        if !is_valid_spacing(&target) {
            return Err(ResampleError::InvalidTarget(target));
        }
        if !is_valid_spacing(&spacing) {
            return Err(ResampleError::InvalidSpacing(spacing));
        }

        let mut new_dim = [0; 3];
        let mut new_spacing = [0.0; 3];
        for axis in 0..3 {
            let count = dim[axis];
            let resize_factor = spacing[axis] / target[axis];
            let new_count = (count as f64 * resize_factor).round_ties_even();
            if !(new_count >= 1.0) {
                return Err(ResampleError::NonPositiveCount { axis, count });
            }

            new_dim[axis] = new_count as usize;
            let real_resize_factor = new_count / count as f64;
            new_spacing[axis] = spacing[axis] / real_resize_factor;
        }

        Ok((new_dim, new_spacing))
    }

    /// Resample `volume` towards `target` spacing with separable linear
    /// interpolation. Samples past the last voxel clamp to it.
    pub fn resample(volume: &Volume, target: [f64; 3]) -> Result<Volume, ResampleError> {
        let (depth, height, width) = volume.dim();
        let (new_dim, new_spacing) =
            Self::isotropic_dimensions(volume.spacing, [depth, height, width], target)?;

        let mut data = CowArray::from(volume.data.view());
        for (axis, &new_len) in new_dim.iter().enumerate() {
            if data.len_of(Axis(axis)) != new_len {
                let resized = Self::resample_axis(data.view(), axis, new_len);
                data = CowArray::from(resized);
            }
        }

        Ok(Volume::new(data.into_owned(), new_spacing).with_origin(volume.origin))
    }

    fn resample_axis(source: ArrayView3<'_, f32>, axis: usize, new_len: usize) -> Array3<f32> {
        let weights = Self::linear_weights(source.len_of(Axis(axis)), new_len);
        let mut shape = source.raw_dim();
        shape[axis] = new_len;

        Zip::from(indices(shape)).par_map_collect(|(z, y, x)| {
            let mut index = [z, y, x];
            let (i0, i1, t) = weights[index[axis]];
            index[axis] = i0;
            let v0 = source[index];
            index[axis] = i1;
            let v1 = source[index];

            v0.mul_add(1.0 - t, v1 * t)
        })
    }

    /// For every output position: the two source neighbours and the weight of
    /// the second one. Output endpoints align with input endpoints.
    pub(crate) fn linear_weights(len: usize, new_len: usize) -> Vec<(usize, usize, f32)> {
        let last = len.saturating_sub(1);
        (0..new_len)
            .map(|j| {
                let position = if new_len > 1 {
                    (j * last) as f64 / (new_len - 1) as f64
                } else {
                    0.0
                };
                let i0 = (position.floor() as usize).min(last);
                let i1 = (i0 + 1).min(last);
                (i0, i1, (position - i0 as f64) as f32)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rounding_consistency_law_holds() {
        let cases = [
            ([2.5, 0.7, 0.7], [40, 512, 512]),
            ([3.0, 0.976, 0.976], [17, 64, 33]),
            ([1.25, 1.0, 0.5], [9, 9, 9]),
        ];
        let target = [1.0, 1.0, 1.0];

        for (spacing, dim) in cases {
            let (new_dim, new_spacing) =
                Interpolator::isotropic_dimensions(spacing, dim, target).unwrap();
            for axis in 0..3 {
                let expected = (dim[axis] as f64 * spacing[axis] / target[axis]).round_ties_even();
                assert_eq!(new_dim[axis] as f64, expected);
                let ratio = spacing[axis] / new_spacing[axis];
                assert!((ratio - expected / dim[axis] as f64).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn ties_round_to_even() {
        let (dim, spacing) =
            Interpolator::isotropic_dimensions([0.5, 1.0, 1.0], [5, 3, 3], [1.0; 3]).unwrap();
        assert_eq!(dim, [2, 3, 3]);
        assert!((spacing[0] - 1.25).abs() < 1e-12);
    }

    #[test]
    fn non_positive_count_is_rejected() {
        let result = Interpolator::isotropic_dimensions([0.1, 1.0, 1.0], [2, 4, 4], [1.0; 3]);
        assert!(matches!(
            result,
            Err(ResampleError::NonPositiveCount { axis: 0, count: 2 })
        ));
    }

    #[test]
    fn invalid_target_is_rejected() {
        let result = Interpolator::isotropic_dimensions([1.0; 3], [2, 2, 2], [1.0, 0.0, 1.0]);
        assert!(matches!(result, Err(ResampleError::InvalidTarget(_))));
    }

    #[test]
    fn isotropic_volume_is_unchanged() {
        let volume = Volume::new(array![[[1.0, 2.0], [3.0, 4.0]], [[5.0, 6.0], [7.0, 8.0]]], [1.0; 3]);
        let resampled = Interpolator::resample(&volume, [1.0; 3]).unwrap();

        assert_eq!(resampled.data, volume.data);
        assert_eq!(resampled.spacing, [1.0; 3]);
    }

    #[test]
    fn upsampling_interpolates_linearly() {
        let volume = Volume::new(array![[[0.0, 30.0]]], [1.0, 1.0, 1.5]);
        let resampled = Interpolator::resample(&volume, [1.0, 1.0, 0.5]).unwrap();

        assert_eq!(resampled.dim(), (1, 1, 6));
        let row: Vec<f32> = resampled.data.iter().copied().collect();
        for (value, expected) in row.iter().zip([0.0, 6.0, 12.0, 18.0, 24.0, 30.0]) {
            assert!((value - expected).abs() < 1e-4, "{row:?}");
        }
        assert!((resampled.spacing[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn interpolated_range_is_preserved() {
        let data = Array3::from_shape_fn((5, 4, 3), |(z, y, x)| {
            ((z * 7 + y * 3 + x) % 5) as f32 * 100.0 - 200.0
        });
        let volume = Volume::new(data, [2.3, 0.8, 1.7]);
        let resampled = Interpolator::resample(&volume, [1.0; 3]).unwrap();

        let min = resampled.data.iter().copied().fold(f32::INFINITY, f32::min);
        let max = resampled.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert!(min >= -200.0 - 1e-3);
        assert!(max <= 200.0 + 1e-3);
        assert_eq!(resampled.data[[0, 0, 0]], volume.data[[0, 0, 0]]);
        assert_eq!(resampled.dim(), (12, 3, 5));
    }

    #[test]
    fn resampling_back_restores_counts_up_to_rounding() {
        let volume = Volume::new(Array3::zeros((13, 21, 8)), [2.7, 0.65, 1.3]);
        let there = Interpolator::resample(&volume, [1.0; 3]).unwrap();
        let back = Interpolator::resample(&there, volume.spacing).unwrap();

        let (d0, h0, w0) = volume.dim();
        let (d1, h1, w1) = back.dim();
        for (a, b) in [(d0, d1), (h0, h1), (w0, w1)] {
            assert!(a.abs_diff(b) <= 1, "{:?} vs {:?}", volume.dim(), back.dim());
        }
    }

    #[test]
    fn weights_clamp_at_the_last_sample() {
        let weights = Interpolator::linear_weights(1, 3);
        assert!(weights.iter().all(|&(i0, i1, _)| i0 == 0 && i1 == 0));

        let weights = Interpolator::linear_weights(3, 5);
        assert_eq!(weights[0], (0, 1, 0.0));
        assert_eq!(weights[4], (2, 2, 0.0));
        assert_eq!(weights[1], (0, 1, 0.5));
    }
}

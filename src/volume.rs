use crate::enums::Orientation;

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

pub type GrayImage = ImageBuffer<Luma<u8>, Vec<u8>>;

/// Dense scalar grid in (depth, row, column) order with its physical spacing
/// in millimeters per voxel along the same axes.
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: [f64; 3],
    pub origin: Option<[f64; 3]>,
}

/// Binary occupancy grid derived from a [`Volume`]. Every element is 0 or 1.
#[derive(Clone, Debug)]
pub struct MaskVolume {
    pub data: Array3<u8>,
    pub spacing: [f64; 3],
}

/// Display window on the intensity scale, in Hounsfield units.
#[derive(Clone, Copy, Debug)]
pub struct Window {
    pub center: f32,
    pub width: f32,
}

impl Default for Window {
    fn default() -> Self {
        // soft tissue
        Self {
            center: 40.0,
            width: 400.0,
        }
    }
}

impl Window {
    #[inline]
    fn apply(&self, value: f32) -> u8 {
        let low = self.center - self.width / 2.0;
        (((value - low) / self.width.max(f32::EPSILON)) * 255.0).clamp(0.0, 255.0) as u8
    }
}

/// True when all three spacing components are finite and strictly positive.
pub fn is_valid_spacing(spacing: &[f64; 3]) -> bool {
    spacing.iter().all(|s| s.is_finite() && *s > 0.0)
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: [f64; 3]) -> Self {
        Self {
            data,
            spacing,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<[f64; 3]>) -> Self {
        self.origin = origin;
        self
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// Renders one slice through the volume with the given intensity window.
    ///
    /// Returns `None` when `index` lies outside the volume along the axis
    /// normal to `orientation`.
    pub fn slice_image(
        &self,
        index: usize,
        orientation: Orientation,
        window: Window,
    ) -> Option<GrayImage> {
        let slice = slice_along(&self.data, index, orientation)?;
        slice_to_image(&slice, |v| window.apply(v))
    }
}

impl MaskVolume {
    pub fn new(data: Array3<u8>, spacing: [f64; 3]) -> Self {
        Self { data, spacing }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Number of voxels classified as foreground.
    pub fn foreground_count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// True when no element falls outside {0, 1}.
    pub fn is_binary(&self) -> bool {
        self.data.iter().all(|&v| v <= 1)
    }

    pub fn slice_image(&self, index: usize, orientation: Orientation) -> Option<GrayImage> {
        let slice = slice_along(&self.data, index, orientation)?;
        slice_to_image(&slice, |v| if v != 0 { 255 } else { 0 })
    }
}

fn slice_along<T>(
    data: &Array3<T>,
    index: usize,
    orientation: Orientation,
) -> Option<ArrayView2<'_, T>> {
    let (depth, height, width) = data.dim();
    let max_index = match orientation {
        Orientation::Axial => depth,
        Orientation::Coronal => height,
        Orientation::Sagittal => width,
    };
    if index >= max_index {
        return None;
    }

    Some(match orientation {
        Orientation::Axial => data.slice(s![index, .., ..]),
        Orientation::Coronal => data.slice(s![.., index, ..]),
        Orientation::Sagittal => data.slice(s![.., .., index]),
    })
}

fn slice_to_image<T, F>(slice: &ArrayView2<'_, T>, to_gray: F) -> Option<GrayImage>
where
    T: Copy + Sync,
    F: Fn(T) -> u8 + Sync,
{
    let (height, width) = slice.dim();
    let pixel_data: Vec<u8> = (0..height)
        .into_par_iter()
        .flat_map_iter(|y| {
            let row = slice.row(y);
            let to_gray = &to_gray;
            (0..width).map(move |x| to_gray(row[x]))
        })
        .collect();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_maps_bounds_to_black_and_white() {
        let window = Window::default();
        assert_eq!(window.apply(-1000.0), 0);
        assert_eq!(window.apply(1000.0), 255);
        assert_eq!(window.apply(40.0), 127);
    }

    #[test]
    fn slice_image_dimensions_follow_orientation() {
        let volume = Volume::new(Array3::zeros((4, 5, 6)), [1.0; 3]);

        let axial = volume
            .slice_image(0, Orientation::Axial, Window::default())
            .unwrap();
        assert_eq!(axial.dimensions(), (6, 5));

        let coronal = volume
            .slice_image(4, Orientation::Coronal, Window::default())
            .unwrap();
        assert_eq!(coronal.dimensions(), (6, 4));

        let sagittal = volume
            .slice_image(5, Orientation::Sagittal, Window::default())
            .unwrap();
        assert_eq!(sagittal.dimensions(), (5, 4));

        assert!(
            volume
                .slice_image(6, Orientation::Sagittal, Window::default())
                .is_none()
        );
    }

    #[test]
    fn mask_slice_is_row_major() {
        let mut data = Array3::zeros((1, 2, 3));
        data[[0, 1, 2]] = 1;
        let mask = MaskVolume::new(data, [1.0; 3]);

        let image = mask.slice_image(0, Orientation::Axial).unwrap();
        assert_eq!(image.get_pixel(2, 1).0, [255]);
        assert_eq!(image.get_pixel(1, 1).0, [0]);
        assert_eq!(mask.foreground_count(), 1);
        assert!(mask.is_binary());
    }

    #[test]
    fn spacing_validation() {
        assert!(is_valid_spacing(&[1.0, 0.5, 2.5]));
        assert!(!is_valid_spacing(&[1.0, 0.0, 1.0]));
        assert!(!is_valid_spacing(&[f64::NAN, 1.0, 1.0]));
    }
}

use crate::{enums::SliceOrderKey, normalize::Rescale, volume::Volume};

use dicom::{
    object::{DefaultDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, Axis, s};
use rayon::prelude::*;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Pixel data error: {0}")]
    PixelData(String),
}

/// One decoded slice and the metadata needed to place it in a stack.
#[derive(Clone, Debug)]
pub struct DecodedSlice {
    pub path: PathBuf,
    pub series_uid: Option<String>,
    pub order: Option<f64>,
    /// Image Position (Patient) as (x, y, z)
    pub position: Option<[f64; 3]>,
    /// (row spacing, column spacing)
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    pub spacing_between_slices: Option<f64>,
    pub rescale: Rescale,
    pub pixels: Array2<f32>,
}

impl DecodedSlice {
    fn order_key(&self) -> f64 {
        self.order.unwrap_or(0.0)
    }
}

/// Raw (not yet normalized) samples of one slice series.
#[derive(Debug)]
pub struct DecodedSeries {
    pub volume: Volume,
    pub rescale: Rescale,
    pub slice_count: usize,
    /// False when the slices could not be stacked and only the first one
    /// was kept.
    pub joined: bool,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load the first slice series found in `path`.
    ///
    /// Files that fail to decode are skipped. If every candidate fails, or
    /// there are none, [`VolumeLoaderError::NoValidImages`] is returned.
    pub fn load_from_directory(path: impl AsRef<Path>) -> Result<DecodedSeries, VolumeLoaderError> {
        let paths = Self::candidate_files(path.as_ref())?;
        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        info!("Found {} candidate slice files", paths.len());

        Self::load_from_file_paths(&paths)
    }

    /// Load a series from explicit file paths. Files are decoded in parallel
    /// and undecodable ones are skipped.
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
    ) -> Result<DecodedSeries, VolumeLoaderError> {
        let slices: Vec<_> = paths
            .par_iter()
            .filter_map(|path| match Self::decode_file(path.as_ref()) {
                Ok(slice) => Some(slice),
                Err(err) => {
                    warn!("Skipping {}: {err}", path.as_ref().display());
                    None
                }
            })
            .collect();

        Self::assemble(slices)
    }

    /// Regular files with a `.dcm`/`.dicom` extension or no extension at
    /// all, in path order.
    pub fn candidate_files(path: &Path) -> Result<Vec<PathBuf>, VolumeLoaderError> {
        let mut paths: Vec<_> = fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::is_candidate(path))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn is_candidate(path: &Path) -> bool {
        match path.extension().and_then(|s| s.to_str()) {
            None => true,
            Some(ext) => ext.eq_ignore_ascii_case("dcm") || ext.eq_ignore_ascii_case("dicom"),
        }
    }

    pub fn decode_file(path: &Path) -> Result<DecodedSlice, VolumeLoaderError> {
        let dicom_object = open_file(path)?;
        let pixels = Self::decode_image(&dicom_object)?;

        let position = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .and_then(|v| <[f64; 3]>::try_from(v.as_slice()).ok());
        let pixel_spacing = dicom_object
            .element(tags::PIXEL_SPACING)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .and_then(|v| <[f64; 2]>::try_from(v.as_slice()).ok());

        Ok(DecodedSlice {
            path: path.to_path_buf(),
            series_uid: Self::get_string(&dicom_object, tags::SERIES_INSTANCE_UID),
            order: SliceOrderKey::PRIORITY
                .iter()
                .find_map(|key| key.extract(&dicom_object)),
            position,
            pixel_spacing,
            slice_thickness: Self::get_float(&dicom_object, tags::SLICE_THICKNESS),
            spacing_between_slices: Self::get_float(&dicom_object, tags::SPACING_BETWEEN_SLICES),
            rescale: Rescale {
                slope: Self::get_float(&dicom_object, tags::RESCALE_SLOPE).unwrap_or(1.0),
                intercept: Self::get_float(&dicom_object, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
            },
            pixels,
        })
    }

    /// Stack decoded slices into a single series.
    ///
    /// Picks the first series by UID, orders its slices and joins them. When
    /// the slices disagree on their in-plane shape the first ordered slice is
    /// returned on its own as a one-slice volume.
    pub fn assemble(slices: Vec<DecodedSlice>) -> Result<DecodedSeries, VolumeLoaderError> {
        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        let mut series = Self::select_series(slices);
        if series.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        Self::sort_slices(&mut series);

        let origin = series[0].position.map(|[x, y, z]| [z, y, x]);
        let rescale = series[0].rescale;
        let slice_count = series.len();

        let (data, joined) = match Self::build_volume_array(&series) {
            Ok(data) => (data, true),
            Err(err) => {
                warn!("Could not join {slice_count} slices ({err}), keeping the first slice only");
                (series[0].pixels.clone().insert_axis(Axis(0)), false)
            }
        };
        let spacing = if joined {
            Self::get_spacing(&series)
        } else {
            Self::get_spacing(&series[..1])
        };
        debug!("Assembled volume {:?} with spacing {spacing:?}", data.dim());

        Ok(DecodedSeries {
            volume: Volume::new(data, spacing).with_origin(origin),
            rescale,
            slice_count: if joined { slice_count } else { 1 },
            joined,
        })
    }

    fn select_series(slices: Vec<DecodedSlice>) -> Vec<DecodedSlice> {
        if slices.iter().all(|slice| slice.series_uid.is_none()) {
            debug!("No series UID present, ordering {} slices directly", slices.len());
            return slices;
        }

        let mut by_series: BTreeMap<String, Vec<DecodedSlice>> = BTreeMap::new();
        for slice in slices {
            if let Some(uid) = slice.series_uid.clone() {
                by_series.entry(uid).or_default().push(slice);
            }
        }
        if by_series.len() > 1 {
            info!("Found {} series, using the first", by_series.len());
        }

        by_series.into_values().next().unwrap_or_default()
    }

    fn sort_slices(slices: &mut [DecodedSlice]) {
        slices.sort_by(|a, b| a.order_key().total_cmp(&b.order_key()));
    }

    fn build_volume_array(slices: &[DecodedSlice]) -> Result<Array3<f32>, VolumeLoaderError> {
        let (height, width) = slices[0].pixels.dim();
        if slices.iter().any(|slice| slice.pixels.dim() != (height, width)) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }

        let mut volume = Array3::<f32>::zeros((slices.len(), height, width));
        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }

        Ok(volume)
    }

    /// Spacing in (depth, row, column) order.
    fn get_spacing(slices: &[DecodedSlice]) -> [f64; 3] {
        let first = &slices[0];
        let position_delta = match slices {
            [a, b, ..] => a.position.zip(b.position).map(|(a, b)| {
                a.iter()
                    .zip(b.iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt()
            }),
            _ => None,
        };

        let depth = [
            position_delta,
            first.spacing_between_slices,
            first.slice_thickness,
        ]
        .into_iter()
        .flatten()
        .find(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(1.0);

        let [row, column] = first
            .pixel_spacing
            .unwrap_or([1.0, 1.0])
            .map(|v| if v.is_finite() && v > 0.0 { v } else { 1.0 });
        [depth, row, column]
    }

    fn decode_image(dicom_object: &DefaultDicomObject) -> Result<Array2<f32>, VolumeLoaderError> {
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|err| VolumeLoaderError::PixelData(err.to_string()))?;
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::None)
            .with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
            .map_err(|err| VolumeLoaderError::PixelData(err.to_string()))
    }

    fn get_float(dicom_object: &DefaultDicomObject, tag: dicom::core::Tag) -> Option<f64> {
        dicom_object.element(tag).ok()?.to_float64().ok()
    }

    fn get_string(dicom_object: &DefaultDicomObject, tag: dicom::core::Tag) -> Option<String> {
        let value = dicom_object.element(tag).ok()?.to_str().ok()?;
        let value = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        (!value.is_empty()).then(|| value.to_string())
    }
}

impl SliceOrderKey {
    pub(crate) fn extract(self, dicom_object: &DefaultDicomObject) -> Option<f64> {
        match self {
            SliceOrderKey::ImagePosition => dicom_object
                .element(tags::IMAGE_POSITION_PATIENT)
                .ok()?
                .to_multi_float64()
                .ok()?
                .get(2)
                .copied(),
            SliceOrderKey::SliceLocation => dicom_object
                .element(tags::SLICE_LOCATION)
                .ok()?
                .to_float64()
                .ok(),
            SliceOrderKey::InstanceNumber => dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(f64::from),
        }
    }
}

//! Minimal reader and writer for NumPy `.npy` arrays.
//!
//! Only C-ordered arrays of a single plain element type are supported, which
//! covers every array artifact the pipeline persists.

use std::borrow::Cow;

use bytemuck::Pod;
use ndarray::{Array, ArrayBase, Data, Dimension, IxDyn, ShapeError};
use thiserror::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const ALIGNMENT: usize = 64;

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("Missing .npy magic string")]
    BadMagic,

    #[error("Unsupported .npy format version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("Truncated .npy data")]
    Truncated,

    #[error("Malformed .npy header: {0}")]
    MalformedHeader(String),

    #[error("Expected element type {expected}, found {found}")]
    DtypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,

    #[error("Payload holds {found} bytes, shape {shape:?} needs {expected}")]
    LengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Element types with a fixed `.npy` type descriptor.
pub trait NpyElement: Pod {
    /// Descriptor in native byte order, e.g. `<f4`.
    const DESCR: &'static str;
}

macro_rules! npy_element {
    ($ty:ty, $code:literal) => {
        impl NpyElement for $ty {
            const DESCR: &'static str = if cfg!(target_endian = "little") {
                concat!("<", $code)
            } else {
                concat!(">", $code)
            };
        }
    };
}

npy_element!(f32, "f4");
npy_element!(f64, "f8");

impl NpyElement for u8 {
    const DESCR: &'static str = "|u1";
}

/// Encode `array` as a version 1.0 `.npy` file.
pub fn encode<T, S, D>(array: &ArrayBase<S, D>) -> Vec<u8>
where
    T: NpyElement,
    S: Data<Elem = T>,
    D: Dimension,
{
    let values: Cow<'_, [T]> = match array.as_slice() {
        Some(values) => Cow::Borrowed(values),
        None => Cow::Owned(array.iter().copied().collect()),
    };
    let payload = bytemuck::cast_slice::<T, u8>(&values);

    let header = header_text(T::DESCR, array.shape());
    let mut bytes = Vec::with_capacity(10 + header.len() + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&[1, 0]);
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Decode a `.npy` file into an array of dimensionality `D`.
pub fn decode<T, D>(bytes: &[u8]) -> Result<Array<T, D>, NpyError>
where
    T: NpyElement,
    D: Dimension,
{
    let (header, payload) = split_header(bytes)?;
    let (descr, fortran_order, shape) = parse_header(header)?;

    if !descr_matches::<T>(&descr) {
        return Err(NpyError::DtypeMismatch {
            expected: T::DESCR,
            found: descr,
        });
    }
    if fortran_order {
        return Err(NpyError::FortranOrder);
    }

    let element_size = size_of::<T>();
    let expected = shape
        .iter()
        .try_fold(element_size, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| NpyError::MalformedHeader(format!("shape {shape:?} is too large")))?;
    if payload.len() != expected {
        return Err(NpyError::LengthMismatch {
            shape,
            expected,
            found: payload.len(),
        });
    }

    let values: Vec<T> = payload
        .chunks_exact(element_size)
        .map(bytemuck::pod_read_unaligned)
        .collect();

    Ok(Array::from_shape_vec(IxDyn(&shape), values)?.into_dimensionality::<D>()?)
}

fn header_text(descr: &str, shape: &[usize]) -> String {
    let shape = match shape {
        [single] => format!("({single},)"),
        _ => {
            let dims: Vec<String> = shape.iter().map(ToString::to_string).collect();
            format!("({})", dims.join(", "))
        }
    };
    let mut header = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");

    // magic + version + length + header + newline is a multiple of 64
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    header.extend(std::iter::repeat_n(' ', padding));
    header.push('\n');
    header
}

fn split_header(bytes: &[u8]) -> Result<(&str, &[u8]), NpyError> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let (header_start, header_len) = match (bytes[6], bytes[7]) {
        (1, 0) => (10, u16::from_le_bytes([bytes[8], bytes[9]]) as usize),
        (2 | 3, 0) => {
            let len = bytes.get(8..12).ok_or(NpyError::Truncated)?;
            (12, u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize)
        }
        (major, minor) => return Err(NpyError::UnsupportedVersion(major, minor)),
    };

    let header_end = header_start + header_len;
    let header = bytes
        .get(header_start..header_end)
        .ok_or(NpyError::Truncated)?;
    let header = std::str::from_utf8(header)
        .map_err(|_| NpyError::MalformedHeader("header is not valid text".into()))?;

    Ok((header, &bytes[header_end..]))
}

fn parse_header(header: &str) -> Result<(String, bool, Vec<usize>), NpyError> {
    let descr = dict_value(header, "descr")?;
    let quote = descr
        .chars()
        .next()
        .filter(|c| matches!(c, '\'' | '"'))
        .ok_or_else(|| NpyError::MalformedHeader("descr is not a string".into()))?;
    let descr = descr[1..]
        .split(quote)
        .next()
        .unwrap_or_default()
        .to_string();

    let fortran_order = match dict_value(header, "fortran_order")? {
        v if v.starts_with("True") => true,
        v if v.starts_with("False") => false,
        _ => return Err(NpyError::MalformedHeader("fortran_order is not a bool".into())),
    };

    let shape = dict_value(header, "shape")?;
    let shape = shape
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .ok_or_else(|| NpyError::MalformedHeader("shape is not a tuple".into()))?;
    let shape = shape
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|_| NpyError::MalformedHeader(format!("bad dimension {dim:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((descr, fortran_order, shape))
}

/// Text following `'key':` in the header dictionary.
fn dict_value<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let pattern = format!("'{key}':");
    let start = header
        .find(&pattern)
        .ok_or_else(|| NpyError::MalformedHeader(format!("missing key {key}")))?;
    Ok(header[start + pattern.len()..].trim_start())
}

fn descr_matches<T: NpyElement>(descr: &str) -> bool {
    // byte order is irrelevant for single byte types
    descr == T::DESCR || (size_of::<T>() == 1 && descr.get(1..) == T::DESCR.get(1..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3, Ix1, Ix3, array};

    #[test]
    fn header_is_padded_to_alignment() {
        let bytes = encode(&Array3::<f32>::zeros((2, 3, 4)));
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;

        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(bytes.len(), 10 + header_len + 2 * 3 * 4 * 4);

        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.starts_with("{'descr': '<f4', 'fortran_order': False, 'shape': (2, 3, 4), }"));
    }

    #[test]
    fn one_dimensional_shape_has_trailing_comma() {
        let bytes = encode(&Array1::from(vec![2.5f64, 1.0, 0.5]));
        let header = String::from_utf8_lossy(&bytes);
        assert!(header.contains("'shape': (3,)"));
        assert!(header.contains("'descr': '<f8'"));

        let spacing: Array1<f64> = decode::<f64, Ix1>(&bytes).unwrap();
        assert_eq!(spacing.to_vec(), vec![2.5, 1.0, 0.5]);
    }

    #[test]
    fn mask_uses_byte_descriptor() {
        let mask = array![[[0u8, 1], [1, 0]]];
        let bytes = encode(&mask);
        assert!(String::from_utf8_lossy(&bytes).contains("'|u1'"));

        let decoded = decode::<u8, Ix3>(&bytes).unwrap();
        assert_eq!(decoded, mask);
    }

    #[test]
    fn non_standard_layout_is_written_in_c_order() {
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 12 + y * 4 + x) as f32);
        let permuted = data.view().permuted_axes([2, 1, 0]);
        let decoded = decode::<f32, Ix3>(&encode(&permuted)).unwrap();

        assert_eq!(decoded.dim(), (4, 3, 2));
        assert_eq!(decoded, permuted);
    }

    #[test]
    fn accepts_version_two_headers() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (2,), }\n";
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[2, 0]);
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-3.0f32).to_le_bytes());

        let decoded = decode::<f32, Ix1>(&bytes).unwrap();
        assert_eq!(decoded.to_vec(), vec![1.5, -3.0]);
    }

    #[test]
    fn oversized_shape_is_malformed() {
        let header = format!(
            "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}, 2), }}\n",
            usize::MAX,
            usize::MAX
        );
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&[0; 8]);

        assert!(matches!(
            decode::<f32, Ix3>(&bytes),
            Err(NpyError::MalformedHeader(_))
        ));
    }

    #[test]
    fn rejects_mismatched_input() {
        let volume = encode(&Array3::<f32>::zeros((1, 2, 2)));

        assert!(matches!(
            decode::<u8, Ix3>(&volume),
            Err(NpyError::DtypeMismatch { .. })
        ));
        assert!(matches!(
            decode::<f32, Ix1>(&volume),
            Err(NpyError::Shape(_))
        ));
        assert!(matches!(
            decode::<f32, Ix3>(&volume[..volume.len() - 1]),
            Err(NpyError::LengthMismatch { .. })
        ));
        assert!(matches!(
            decode::<f32, Ix3>(b"not an array"),
            Err(NpyError::BadMagic)
        ));

        let mut fortran = volume.clone();
        let at = fortran.windows(5).position(|w| w == b"False").unwrap();
        fortran[at..at + 5].copy_from_slice(b"True ");
        assert!(matches!(
            decode::<f32, Ix3>(&fortran),
            Err(NpyError::FortranOrder)
        ));
    }
}

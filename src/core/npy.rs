//! Reading and writing of per-item descriptor files.
//!
//! Two layouts are understood: NumPy `.npy` arrays (2-D, C order,
//! little-endian `f4`/`f8`/`u1`) and `.json` arrays of equal-length rows.

use crate::core::algorithm::DescriptorAlgorithm;
use crate::core::descriptor::{DescriptorError, DescriptorSet, pack_bits, unpack_bits};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGNMENT: usize = 64;

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a NumPy array file")]
    BadMagic,

    #[error("Malformed header: {message}")]
    MalformedHeader { message: String },

    #[error("Unsupported dtype {descr}")]
    UnsupportedDtype { descr: String },

    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,

    #[error("Expected a 2-D array, got shape {shape:?}")]
    UnsupportedShape { shape: Vec<usize> },

    #[error("Array payload has {got} bytes, expected {expected}")]
    Truncated { expected: usize, got: usize },

    #[error("Unsupported descriptor file extension: {extension}")]
    UnsupportedExtension { extension: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F4,
    F8,
    U1,
}

impl Dtype {
    fn parse(descr: &str) -> Result<Self, NpyError> {
        match descr {
            "<f4" => Ok(Dtype::F4),
            "<f8" => Ok(Dtype::F8),
            "|u1" | "<u1" | "u1" => Ok(Dtype::U1),
            other => Err(NpyError::UnsupportedDtype {
                descr: other.to_string(),
            }),
        }
    }

    fn size(self) -> usize {
        match self {
            Dtype::F4 => 4,
            Dtype::F8 => 8,
            Dtype::U1 => 1,
        }
    }
}

/// Load the reference descriptors for one item. `u1` arrays are cast to
/// float for gradient descriptors and unpacked to bits for binary ones.
pub fn read_descriptor_file(path: &Path, algorithm: DescriptorAlgorithm) -> Result<DescriptorSet, NpyError> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "npy" => read_npy(&fs::read(path)?, algorithm),
        "json" => {
            let rows: Vec<Vec<f32>> = serde_json::from_slice(&fs::read(path)?)?;
            Ok(DescriptorSet::from_rows(rows)?)
        }
        _ => Err(NpyError::UnsupportedExtension { extension }),
    }
}

fn read_npy(bytes: &[u8], algorithm: DescriptorAlgorithm) -> Result<DescriptorSet, NpyError> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(NpyError::BadMagic);
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => {
            return Err(NpyError::MalformedHeader {
                message: format!("unknown format version {}", v),
            });
        }
    };

    let payload_start = header_start + header_len;
    let header = bytes
        .get(header_start..payload_start)
        .ok_or_else(|| NpyError::MalformedHeader {
            message: "header runs past end of file".to_string(),
        })?;
    let header = String::from_utf8_lossy(header);

    let dtype = Dtype::parse(header_value(&header, "descr")?.trim_matches(['\'', '"']))?;
    if header_value(&header, "fortran_order")?.trim() == "True" {
        return Err(NpyError::FortranOrder);
    }
    let shape = parse_shape(&header)?;

    let (rows, cols) = match shape.as_slice() {
        [rows, cols] => (*rows, *cols),
        [0] => (0, 0),
        _ => return Err(NpyError::UnsupportedShape { shape: shape.clone() }),
    };

    let payload = &bytes[payload_start..];
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(dtype.size()))
        .ok_or_else(|| NpyError::MalformedHeader {
            message: format!("shape ({}, {}) is too large", rows, cols),
        })?;
    if payload.len() < expected {
        return Err(NpyError::Truncated {
            expected,
            got: payload.len(),
        });
    }
    let payload = &payload[..expected];

    let set = match dtype {
        Dtype::U1 if algorithm == DescriptorAlgorithm::Akaze => unpack_bits(cols, payload)?,
        Dtype::U1 => DescriptorSet::new(cols, payload.iter().map(|&b| b as f32).collect())?,
        Dtype::F4 => DescriptorSet::new(
            cols,
            payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )?,
        Dtype::F8 => DescriptorSet::new(
            cols,
            payload
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
        )?,
    };
    Ok(set)
}

/// Raw text following `'key':` in the header dictionary, up to the next
/// top-level comma.
fn header_value<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let missing = || NpyError::MalformedHeader {
        message: format!("missing key {}", key),
    };
    let quoted = format!("'{}'", key);
    let start = header.find(&quoted).ok_or_else(missing)? + quoted.len();
    let rest = header[start..].trim_start().strip_prefix(':').ok_or_else(missing)?;
    let end = rest.find(',').unwrap_or(rest.len());
    Ok(rest[..end].trim())
}

fn parse_shape(header: &str) -> Result<Vec<usize>, NpyError> {
    let malformed = |message: &str| NpyError::MalformedHeader {
        message: message.to_string(),
    };
    let start = header.find("'shape'").ok_or_else(|| malformed("missing key shape"))?;
    let open = header[start..].find('(').ok_or_else(|| malformed("shape is not a tuple"))? + start;
    let close = header[open..].find(')').ok_or_else(|| malformed("shape is not a tuple"))? + open;

    header[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<usize>().map_err(|_| malformed("shape is not numeric")))
        .collect()
}

/// Write the descriptor set as a version 1 `.npy` file: `f4` for gradient
/// descriptors, packed `u1` for binary ones.
pub fn write_descriptor_file(
    path: &Path,
    algorithm: DescriptorAlgorithm,
    set: &DescriptorSet,
) -> Result<(), NpyError> {
    let (descr, cols, payload) = match algorithm {
        DescriptorAlgorithm::Sift => (
            "<f4",
            set.dims(),
            set.as_slice().iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>(),
        ),
        DescriptorAlgorithm::Akaze => {
            let (bytes_per_row, packed) = pack_bits(set);
            ("|u1", bytes_per_row, packed)
        }
    };

    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({}, {}), }}",
        descr,
        set.len(),
        cols
    );
    // magic + version + length field + header + newline must be 64-byte aligned
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let header_len = u16::try_from(header.len()).map_err(|_| NpyError::MalformedHeader {
        message: "header too long".to_string(),
    })?;

    let mut file = fs::File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&[1, 0])?;
    file.write_all(&header_len.to_le_bytes())?;
    file.write_all(header.as_bytes())?;
    file.write_all(&payload)?;
    Ok(())
}

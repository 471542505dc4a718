use crate::core::algorithm::DescriptorAlgorithm;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use imageproc::contrast::equalize_histogram;
use imageproc::corners::{Corner, corners_fast9};
use imageproc::filter::gaussian_blur_f32;
use std::f32::consts::TAU;
use std::sync::OnceLock;
use thiserror::Error;

/// Size crops are normalised to before keypoint detection.
const FEATURE_INPUT_WIDTH: u32 = 300;
const FEATURE_INPUT_HEIGHT: u32 = 418;

const FAST_THRESHOLD: u8 = 20;
const MAX_KEYPOINTS: usize = 500;
/// Keypoints closer than this to the border cannot be described.
const KEYPOINT_MARGIN: u32 = 16;

const GRADIENT_PATCH: i32 = 16;
const GRADIENT_CELLS: i32 = 4;
const ORIENTATION_BINS: usize = 8;
const GRADIENT_CLIP: f32 = 0.2;
const GRADIENT_SCALE: f32 = 512.0;

const BINARY_PATCH_RADIUS: i32 = 15;
const BINARY_SMOOTHING_SIGMA: f32 = 2.0;

#[derive(Debug, Error, PartialEq)]
pub enum DescriptorError {
    #[error("Descriptor data of length {len} does not divide into rows of width {dims}")]
    RaggedData { len: usize, dims: usize },

    #[error("Row {row} has width {got}, expected {expected}")]
    RaggedRows { row: usize, expected: usize, got: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Non-finite distance between descriptors")]
    NonFiniteDistance,
}

/// Row-major matrix of fixed-width feature vectors, one row per keypoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescriptorSet {
    dims: usize,
    data: Vec<f32>,
}

impl DescriptorSet {
    pub fn new(dims: usize, data: Vec<f32>) -> Result<Self, DescriptorError> {
        if (dims == 0 && !data.is_empty()) || (dims > 0 && data.len() % dims != 0) {
            return Err(DescriptorError::RaggedData { len: data.len(), dims });
        }
        Ok(Self { dims, data })
    }

    pub fn empty(dims: usize) -> Self {
        Self { dims, data: Vec::new() }
    }

    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, DescriptorError> {
        let Some(dims) = rows.first().map(Vec::len) else {
            return Ok(Self::default());
        };
        let mut data = Vec::with_capacity(rows.len() * dims);
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != dims {
                return Err(DescriptorError::RaggedRows {
                    row,
                    expected: dims,
                    got: values.len(),
                });
            }
            data.extend(values);
        }
        Self::new(dims, data)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        if self.dims == 0 { 0 } else { self.data.len() / self.dims }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.len() {
            return None;
        }
        self.data.get(index * self.dims..(index + 1) * self.dims)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on a zero chunk size
        self.data.chunks_exact(self.dims.max(1))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Grayscale, resized and histogram-equalised crop ready for keypoint detection.
pub fn prepare_gray(image: &DynamicImage) -> GrayImage {
    let gray = image.to_luma8();
    let resized = image::imageops::resize(
        &gray,
        FEATURE_INPUT_WIDTH,
        FEATURE_INPUT_HEIGHT,
        FilterType::Triangle,
    );
    equalize_histogram(&resized)
}

/// Detect keypoints and describe them with `algorithm`.
pub fn compute_descriptors(gray: &GrayImage, algorithm: DescriptorAlgorithm) -> DescriptorSet {
    let keypoints = detect_keypoints(gray);
    if keypoints.is_empty() {
        return DescriptorSet::empty(algorithm.dimensions());
    }

    let data = match algorithm {
        DescriptorAlgorithm::Sift => keypoints
            .iter()
            .flat_map(|kp| gradient_descriptor(gray, kp))
            .collect(),
        DescriptorAlgorithm::Akaze => {
            let smoothed = gaussian_blur_f32(gray, BINARY_SMOOTHING_SIGMA);
            keypoints
                .iter()
                .flat_map(|kp| binary_descriptor(&smoothed, kp))
                .collect()
        }
    };

    DescriptorSet {
        dims: algorithm.dimensions(),
        data,
    }
}

/// Strongest FAST-9 corners away from the border, in a deterministic order.
fn detect_keypoints(gray: &GrayImage) -> Vec<Corner> {
    let (width, height) = gray.dimensions();
    if width <= 2 * KEYPOINT_MARGIN || height <= 2 * KEYPOINT_MARGIN {
        return Vec::new();
    }

    let mut corners: Vec<Corner> = corners_fast9(gray, FAST_THRESHOLD)
        .into_iter()
        .filter(|c| {
            c.x >= KEYPOINT_MARGIN
                && c.y >= KEYPOINT_MARGIN
                && c.x < width - KEYPOINT_MARGIN
                && c.y < height - KEYPOINT_MARGIN
        })
        .collect();

    corners.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    corners.truncate(MAX_KEYPOINTS);
    corners
}

/// 4×4 cells × 8 orientation bins of gradient magnitude over a 16×16 patch.
fn gradient_descriptor(gray: &GrayImage, kp: &Corner) -> Vec<f32> {
    let cell_size = GRADIENT_PATCH / GRADIENT_CELLS;
    let half = GRADIENT_PATCH / 2;
    let sigma = half as f32;
    let pixel = |x: i32, y: i32| gray.get_pixel(x as u32, y as u32)[0] as f32;

    let mut hist = vec![0.0f32; (GRADIENT_CELLS * GRADIENT_CELLS) as usize * ORIENTATION_BINS];
    for dy in -half..half {
        for dx in -half..half {
            let x = kp.x as i32 + dx;
            let y = kp.y as i32 + dy;
            let gx = pixel(x + 1, y) - pixel(x - 1, y);
            let gy = pixel(x, y + 1) - pixel(x, y - 1);
            let magnitude = (gx * gx + gy * gy).sqrt();
            if magnitude == 0.0 {
                continue;
            }

            let angle = gy.atan2(gx).rem_euclid(TAU);
            let bin = ((angle / TAU * ORIENTATION_BINS as f32) as usize).min(ORIENTATION_BINS - 1);
            let cell = ((dy + half) / cell_size * GRADIENT_CELLS + (dx + half) / cell_size) as usize;
            let weight = (-((dx * dx + dy * dy) as f32) / (2.0 * sigma * sigma)).exp();
            hist[cell * ORIENTATION_BINS + bin] += magnitude * weight;
        }
    }

    normalize(&mut hist);
    for value in hist.iter_mut() {
        *value = value.min(GRADIENT_CLIP);
    }
    normalize(&mut hist);
    hist.iter().map(|v| v * GRADIENT_SCALE).collect()
}

fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// 256 pairwise intensity comparisons on the smoothed patch, one 0/1 value per bit.
fn binary_descriptor(smoothed: &GrayImage, kp: &Corner) -> Vec<f32> {
    let pixel = |dx: i32, dy: i32| smoothed.get_pixel((kp.x as i32 + dx) as u32, (kp.y as i32 + dy) as u32)[0];

    binary_pattern()
        .iter()
        .map(|&(x1, y1, x2, y2)| if pixel(x1, y1) < pixel(x2, y2) { 1.0 } else { 0.0 })
        .collect()
}

/// Fixed comparison pairs inside the patch, generated once from a constant seed.
fn binary_pattern() -> &'static [(i32, i32, i32, i32)] {
    static PATTERN: OnceLock<Vec<(i32, i32, i32, i32)>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut state: u32 = 0x9e37_79b9;
        let mut next = || {
            // xorshift32
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % (2 * BINARY_PATCH_RADIUS as u32 + 1)) as i32 - BINARY_PATCH_RADIUS
        };
        (0..DescriptorAlgorithm::Akaze.dimensions())
            .map(|_| (next(), next(), next(), next()))
            .collect()
    })
}

/// Pack 0/1 rows into bytes, most significant bit first.
pub fn pack_bits(set: &DescriptorSet) -> (usize, Vec<u8>) {
    let bytes_per_row = set.dims().div_ceil(8);
    let mut packed = Vec::with_capacity(set.len() * bytes_per_row);
    for row in set.rows() {
        for chunk in row.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, v)| if *v > 0.5 { acc | (0x80 >> i) } else { acc });
            packed.push(byte);
        }
    }
    (bytes_per_row, packed)
}

/// Inverse of [`pack_bits`].
pub fn unpack_bits(bytes_per_row: usize, packed: &[u8]) -> Result<DescriptorSet, DescriptorError> {
    let data = packed
        .iter()
        .flat_map(|byte| (0..8).map(move |i| if byte & (0x80 >> i) != 0 { 1.0 } else { 0.0 }))
        .collect();
    DescriptorSet::new(bytes_per_row * 8, data)
}

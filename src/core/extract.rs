use crate::core::algorithm::{DescriptorAlgorithm, HashAlgorithm};
use crate::core::descriptor::{DescriptorSet, compute_descriptors, prepare_gray};
use crate::core::hash::{HashSignatures, compute_hash_signatures};
use crate::core::types::RegionBox;
use image::{DynamicImage, GenericImageView};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Feature extraction failed: {0}")]
    Failed(String),
}

/// Turns a cropped region into query signatures.
pub trait QueryExtractor: Send + Sync {
    fn hash_signatures(
        &self,
        crop: &DynamicImage,
        algorithms: &[HashAlgorithm],
    ) -> Result<HashSignatures, ExtractError>;

    fn descriptors(&self, crop: &DynamicImage, algorithm: DescriptorAlgorithm) -> Result<DescriptorSet, ExtractError>;
}

/// Extractor backed by the built-in hash and keypoint code.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFeatureExtractor;

impl ImageFeatureExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl QueryExtractor for ImageFeatureExtractor {
    fn hash_signatures(
        &self,
        crop: &DynamicImage,
        algorithms: &[HashAlgorithm],
    ) -> Result<HashSignatures, ExtractError> {
        Ok(compute_hash_signatures(crop, algorithms))
    }

    fn descriptors(&self, crop: &DynamicImage, algorithm: DescriptorAlgorithm) -> Result<DescriptorSet, ExtractError> {
        let gray = prepare_gray(crop);
        Ok(compute_descriptors(&gray, algorithm))
    }
}

/// Pixels of `region` clamped to the image bounds, or `None` when nothing
/// of the box lies inside the image.
pub fn crop_region(image: &DynamicImage, region: &RegionBox) -> Option<DynamicImage> {
    let (width, height) = image.dimensions();
    let (x, y, w, h) = region.clamp_to(width, height)?;
    Some(image.crop_imm(x, y, w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, GrayImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| Luma([((x + y) % 256) as u8])))
    }

    #[test]
    fn test_crop_region_clamps_to_bounds() {
        let img = gradient(50, 40);

        let crop = crop_region(&img, &RegionBox::new(-10, 5, 20, 100)).unwrap();
        assert_eq!(crop.dimensions(), (20, 35));
        assert_eq!(crop.get_pixel(0, 0), img.get_pixel(0, 5));
    }

    #[test]
    fn test_crop_outside_image_is_none() {
        let img = gradient(50, 40);
        assert!(crop_region(&img, &RegionBox::new(60, 0, 80, 10)).is_none());
        assert!(crop_region(&img, &RegionBox::new(10, 10, 10, 20)).is_none());
    }

    #[test]
    fn test_extractor_produces_requested_signatures() {
        let extractor = ImageFeatureExtractor::new();
        let img = gradient(64, 88);

        let hashes = extractor
            .hash_signatures(&img, &[HashAlgorithm::PHash, HashAlgorithm::WHash])
            .unwrap();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains_key(&HashAlgorithm::PHash));

        let sift = extractor.descriptors(&img, DescriptorAlgorithm::Sift).unwrap();
        assert_eq!(sift.dims(), DescriptorAlgorithm::Sift.dimensions());
    }
}

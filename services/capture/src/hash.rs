//! Perceptual average hash for spotting reused photos.

use image::imageops::{self, FilterType};

use crate::analyzer::{load_image_data, AnalyzeError, DecodedImage};
use crate::gate::PoseImage;
use bodyscan_common::Pose;

const HASH_SIDE: u32 = 8;

/// Hash an encoded photo. See [`hash_image`].
pub fn compute_image_hash(bytes: &[u8]) -> Result<String, AnalyzeError> {
    Ok(hash_image(&load_image_data(bytes)?))
}

/// 64-bit average hash as 16 lowercase hex characters.
///
/// The photo is downsampled to 8x8 grayscale and every pixel brighter than the
/// mean sets its bit. Bits are packed four per nibble, most significant first.
pub fn hash_image(image: &DecodedImage) -> String {
    let gray = imageops::grayscale(&image.pixels);
    let small = imageops::resize(&gray, HASH_SIDE, HASH_SIDE, FilterType::Triangle);

    let values: Vec<f64> = small.pixels().map(|p| f64::from(p.0[0])).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    values
        .chunks(4)
        .map(|nibble| {
            let bits = nibble
                .iter()
                .fold(0u32, |acc, &v| (acc << 1) | u32::from(v > mean));
            char::from_digit(bits, 16).unwrap_or('0')
        })
        .collect()
}

/// Number of differing bits between two hashes, or `None` if either is not a
/// 16-character hex hash.
pub fn hamming_distance(a: &str, b: &str) -> Option<u32> {
    if a.len() != 16 || b.len() != 16 {
        return None;
    }
    let a = u64::from_str_radix(a, 16).ok()?;
    let b = u64::from_str_radix(b, 16).ok()?;
    Some((a ^ b).count_ones())
}

/// Pairs of poses whose photos hash within `max_distance` bits of each other.
pub fn find_duplicate_photos(
    images: &[PoseImage],
    max_distance: u32,
) -> Result<Vec<(Pose, Pose)>, AnalyzeError> {
    let hashes = images
        .iter()
        .map(|image| Ok((image.pose, compute_image_hash(&image.blob)?)))
        .collect::<Result<Vec<_>, AnalyzeError>>()?;

    let mut duplicates = Vec::new();
    for (i, (pose_a, hash_a)) in hashes.iter().enumerate() {
        for (pose_b, hash_b) in &hashes[i + 1..] {
            if hamming_distance(hash_a, hash_b).is_some_and(|d| d <= max_distance) {
                duplicates.push((*pose_a, *pose_b));
            }
        }
    }

    Ok(duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::fixtures;
    use image::{Rgb, RgbImage};

    fn decoded(img: RgbImage) -> DecodedImage {
        DecodedImage::from_rgb(img).unwrap()
    }

    #[test]
    fn test_hash_shape() {
        let hash = hash_image(&decoded(fixtures::standing_figure(64, 128)));
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_uniform_image_hashes_to_zero() {
        let hash = hash_image(&decoded(RgbImage::from_pixel(16, 16, Rgb([90; 3]))));
        assert_eq!(hash, "0000000000000000");
    }

    #[test]
    fn test_left_half_bright() {
        let img = RgbImage::from_fn(16, 16, |x, _| {
            if x < 8 {
                Rgb([255; 3])
            } else {
                Rgb([0; 3])
            }
        });
        // each row is 11110000
        assert_eq!(hash_image(&decoded(img)), "f0f0f0f0f0f0f0f0");
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance("0000000000000000", "000000000000000f"), Some(4));
        assert_eq!(hamming_distance("ffffffffffffffff", "ffffffffffffffff"), Some(0));
        assert_eq!(hamming_distance("abc", "0000000000000000"), None);
        assert_eq!(hamming_distance("zzzzzzzzzzzzzzzz", "0000000000000000"), None);
    }

    #[test]
    fn test_find_duplicate_photos() {
        let figure = bytes::Bytes::from(fixtures::encode_png(&fixtures::standing_figure(64, 128)));
        let inverted = {
            let mut img = fixtures::standing_figure(64, 128);
            image::imageops::invert(&mut img);
            bytes::Bytes::from(fixtures::encode_png(&img))
        };

        let images = vec![
            PoseImage::new(Pose::Front, figure.clone()).unwrap(),
            PoseImage::new(Pose::Back, inverted).unwrap(),
            PoseImage::new(Pose::Left, figure).unwrap(),
        ];

        let duplicates = find_duplicate_photos(&images, 4).unwrap();
        assert_eq!(duplicates, vec![(Pose::Front, Pose::Left)]);
    }
}

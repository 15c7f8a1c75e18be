//! Registration of two stitched images into a common pixel frame.
//!
//! FAST-9 corners with oriented BRIEF descriptors, Hamming matching, then a
//! RANSAC homography. When there is not enough texture to register (too few
//! matches, or a low inlier ratio) the aligner falls back to cropping both
//! inputs to their common minimal dimensions; the rest of the pipeline keeps
//! working on the unaligned pair, it just sees more noise.

use image::imageops;
use image::{GrayImage, RgbImage};
use imageproc::corners::{Corner, corners_fast9};
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use nalgebra::DMatrix;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

const MAX_KEYPOINTS: usize = 5000;
const FAST_THRESHOLD: u8 = 20;
const DESCRIPTOR_BITS: usize = 256;
const PATCH_RADIUS: i32 = 15;
/// Keypoints closer than this to the border cannot be described.
const BORDER_MARGIN: u32 = 2 * PATCH_RADIUS as u32 + 2;
/// Fraction of raw matches kept, best Hamming distance first.
const GOOD_MATCH_FRACTION: f64 = 0.20;
const RANSAC_ITERATIONS: usize = 1000;
const MIN_INLIER_RATIO: f64 = 0.30;

/// Output of `ImageAligner::align`. `img1` and `img2` always have equal
/// dimensions; `aligned` reports whether a homography was applied.
#[derive(Debug, Clone)]
pub struct AlignmentResult {
    pub img1: RgbImage,
    pub img2: RgbImage,
    pub aligned: bool,
    pub inlier_ratio: Option<f64>,
    /// Offset of the output frame's origin within img1's original frame,
    /// needed to keep img1's pixel-to-geo transform valid after cropping.
    pub offset: (u32, u32),
}

#[derive(Clone)]
pub struct ImageAligner {
    min_matches: usize,
    ransac_reproj_px: f64,
}

impl ImageAligner {
    pub fn new(min_matches: usize, ransac_reproj_px: f64) -> Self {
        Self {
            min_matches,
            ransac_reproj_px,
        }
    }

    pub fn align(&self, img1: &RgbImage, img2: &RgbImage) -> AlignmentResult {
        let gray1 = gaussian_blur_f32(&imageops::grayscale(img1), 2.0);
        let gray2 = gaussian_blur_f32(&imageops::grayscale(img2), 2.0);

        let kp1 = detect_keypoints(&gray1);
        let kp2 = detect_keypoints(&gray2);
        let desc1 = describe(&gray1, &kp1);
        let desc2 = describe(&gray2, &kp2);

        let matches = match_descriptors(&desc1, &desc2);
        if matches.len() < self.min_matches {
            debug!(
                matches = matches.len(),
                min = self.min_matches,
                "too few feature matches, returning unaligned crop"
            );
            return fallback(img1, img2);
        }

        let pairs: Vec<(PointF, PointF)> = matches
            .iter()
            .map(|&(i, j, _)| {
                (
                    PointF {
                        x: desc2[j].x,
                        y: desc2[j].y,
                    },
                    PointF {
                        x: desc1[i].x,
                        y: desc1[i].y,
                    },
                )
            })
            .collect();

        let Some((homography, inliers)) = ransac_homography(&pairs, self.ransac_reproj_px) else {
            debug!("homography estimation failed, returning unaligned crop");
            return fallback(img1, img2);
        };

        let inlier_ratio = inliers as f64 / pairs.len() as f64;
        if inlier_ratio < MIN_INLIER_RATIO {
            debug!(
                inlier_ratio,
                "inlier ratio below threshold, returning unaligned crop"
            );
            return fallback(img1, img2);
        }

        let Some(result) = warp_and_crop(img1, img2, &homography, inlier_ratio) else {
            return fallback(img1, img2);
        };
        info!(
            inlier_ratio,
            width = result.img1.width(),
            height = result.img1.height(),
            "registered image pair"
        );
        result.into()
    }
}

struct Warped {
    img1: RgbImage,
    img2: RgbImage,
    inlier_ratio: f64,
    offset: (u32, u32),
}

impl From<Warped> for AlignmentResult {
    fn from(w: Warped) -> Self {
        AlignmentResult {
            img1: w.img1,
            img2: w.img2,
            aligned: true,
            inlier_ratio: Some(w.inlier_ratio),
            offset: w.offset,
        }
    }
}

/// Crop both inputs to their common minimal dimensions, unwarped.
fn fallback(img1: &RgbImage, img2: &RgbImage) -> AlignmentResult {
    let width = img1.width().min(img2.width());
    let height = img1.height().min(img2.height());
    AlignmentResult {
        img1: imageops::crop_imm(img1, 0, 0, width, height).to_image(),
        img2: imageops::crop_imm(img2, 0, 0, width, height).to_image(),
        aligned: false,
        inlier_ratio: None,
        offset: (0, 0),
    }
}

#[derive(Debug, Clone, Copy)]
struct PointF {
    x: f32,
    y: f32,
}

struct Descriptor {
    bits: [u128; 2],
    x: f32,
    y: f32,
}

fn detect_keypoints(gray: &GrayImage) -> Vec<Corner> {
    let mut corners = corners_fast9(gray, FAST_THRESHOLD);
    corners.retain(|c| {
        c.x >= BORDER_MARGIN
            && c.y >= BORDER_MARGIN
            && c.x + BORDER_MARGIN < gray.width()
            && c.y + BORDER_MARGIN < gray.height()
    });
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));
    corners.truncate(MAX_KEYPOINTS);
    corners
}

/// Fixed BRIEF sampling pattern, generated once from a constant seed so
/// descriptors are reproducible across processes.
static TEST_PAIRS: Lazy<Vec<(i32, i32, i32, i32)>> = Lazy::new(|| {
    let mut rng = StdRng::seed_from_u64(0x0BD1_F00D);
    (0..DESCRIPTOR_BITS)
        .map(|_| {
            (
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
            )
        })
        .collect()
});

/// Oriented BRIEF: the sampling pattern is rotated by the patch's intensity
/// centroid angle, which makes the descriptor rotation-invariant.
fn describe(gray: &GrayImage, corners: &[Corner]) -> Vec<Descriptor> {
    corners
        .iter()
        .map(|corner| {
            let angle = patch_orientation(gray, corner.x as i32, corner.y as i32);
            let (sin, cos) = angle.sin_cos();
            let mut bits = [0u128; 2];
            for (bit, &(ax, ay, bx, by)) in TEST_PAIRS.iter().enumerate() {
                let pa = rotated_sample(gray, corner.x as i32, corner.y as i32, ax, ay, sin, cos);
                let pb = rotated_sample(gray, corner.x as i32, corner.y as i32, bx, by, sin, cos);
                if pa < pb {
                    bits[bit / 128] |= 1u128 << (bit % 128);
                }
            }
            Descriptor {
                bits,
                x: corner.x as f32,
                y: corner.y as f32,
            }
        })
        .collect()
}

fn rotated_sample(gray: &GrayImage, cx: i32, cy: i32, dx: i32, dy: i32, sin: f32, cos: f32) -> u8 {
    let rx = (dx as f32 * cos - dy as f32 * sin).round() as i32;
    let ry = (dx as f32 * sin + dy as f32 * cos).round() as i32;
    let x = (cx + rx).clamp(0, gray.width() as i32 - 1) as u32;
    let y = (cy + ry).clamp(0, gray.height() as i32 - 1) as u32;
    gray.get_pixel(x, y).0[0]
}

fn patch_orientation(gray: &GrayImage, cx: i32, cy: i32) -> f32 {
    let mut m01 = 0f32;
    let mut m10 = 0f32;
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > PATCH_RADIUS * PATCH_RADIUS {
                continue;
            }
            let x = (cx + dx).clamp(0, gray.width() as i32 - 1) as u32;
            let y = (cy + dy).clamp(0, gray.height() as i32 - 1) as u32;
            let value = f32::from(gray.get_pixel(x, y).0[0]);
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

fn hamming(a: &[u128; 2], b: &[u128; 2]) -> u32 {
    (a[0] ^ b[0]).count_ones() + (a[1] ^ b[1]).count_ones()
}

/// Brute-force nearest match per query, keeping the best 20% by distance.
/// Returns `(index in desc1, index in desc2, distance)` triples.
fn match_descriptors(desc1: &[Descriptor], desc2: &[Descriptor]) -> Vec<(usize, usize, u32)> {
    if desc1.is_empty() || desc2.is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<(usize, usize, u32)> = desc1
        .iter()
        .enumerate()
        .map(|(i, d1)| {
            let (j, dist) = desc2
                .iter()
                .enumerate()
                .map(|(j, d2)| (j, hamming(&d1.bits, &d2.bits)))
                .min_by_key(|&(_, dist)| dist)
                .expect("desc2 is non-empty");
            (i, j, dist)
        })
        .collect();

    matches.sort_by_key(|&(_, _, dist)| dist);
    let keep = ((matches.len() as f64 * GOOD_MATCH_FRACTION).ceil() as usize).max(1);
    matches.truncate(keep);
    matches
}

/// RANSAC over 4-point DLT homographies. `pairs` maps img2 points to img1
/// points. Returns the best model (as a row-major 3x3) and its inlier count.
fn ransac_homography(pairs: &[(PointF, PointF)], reproj_px: f64) -> Option<([f64; 9], usize)> {
    if pairs.len() < 4 {
        return None;
    }

    // Constant seed keeps alignment deterministic for identical inputs.
    let mut rng = StdRng::seed_from_u64(0x4A11_6E);
    let mut best: Option<([f64; 9], usize)> = None;

    for _ in 0..RANSAC_ITERATIONS {
        let mut sample = [0usize; 4];
        for slot in sample.iter_mut() {
            *slot = rng.gen_range(0..pairs.len());
        }
        if sample.iter().collect::<std::collections::HashSet<_>>().len() < 4 {
            continue;
        }

        let subset: Vec<(PointF, PointF)> = sample.iter().map(|&i| pairs[i]).collect();
        let Some(h) = estimate_homography(&subset) else {
            continue;
        };

        let inliers = pairs
            .iter()
            .filter(|(from, to)| reprojection_error(&h, *from, *to) < reproj_px)
            .count();

        if best.map(|(_, count)| inliers > count).unwrap_or(true) {
            best = Some((h, inliers));
        }
    }

    best.filter(|&(_, inliers)| inliers >= 4)
}

/// Direct linear transform with Hartley normalization.
fn estimate_homography(pairs: &[(PointF, PointF)]) -> Option<[f64; 9]> {
    let (t_from, from_norm) = normalize_points(pairs.iter().map(|p| p.0));
    let (t_to, to_norm) = normalize_points(pairs.iter().map(|p| p.1));

    let n = pairs.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (row, (from, to)) in from_norm.iter().zip(to_norm.iter()).enumerate() {
        let (x, y) = (from.0, from.1);
        let (u, v) = (to.0, to.1);
        let r = 2 * row;
        a[(r, 0)] = -x;
        a[(r, 1)] = -y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = u * x;
        a[(r, 7)] = u * y;
        a[(r, 8)] = u;
        a[(r + 1, 3)] = -x;
        a[(r + 1, 4)] = -y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = v * x;
        a[(r + 1, 7)] = v * y;
        a[(r + 1, 8)] = v;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t.as_ref()?;
    let singular = &svd.singular_values;
    let min_index = (0..singular.len()).min_by(|&i, &j| singular[i].total_cmp(&singular[j]))?;
    let h_row = v_t.row(min_index);

    // Denormalize: H = T_to^-1 * Hn * T_from
    let hn = nalgebra::Matrix3::new(
        h_row[0], h_row[1], h_row[2], h_row[3], h_row[4], h_row[5], h_row[6], h_row[7], h_row[8],
    );
    let h = t_to.try_inverse()? * hn * t_from;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 {
        return None;
    }
    let h = h / scale;

    Some([
        h[(0, 0)],
        h[(0, 1)],
        h[(0, 2)],
        h[(1, 0)],
        h[(1, 1)],
        h[(1, 2)],
        h[(2, 0)],
        h[(2, 1)],
        h[(2, 2)],
    ])
}

type Normalization = (nalgebra::Matrix3<f64>, Vec<(f64, f64)>);

fn normalize_points(points: impl Iterator<Item = PointF>) -> Normalization {
    let raw: Vec<(f64, f64)> = points.map(|p| (f64::from(p.x), f64::from(p.y))).collect();
    let n = raw.len().max(1) as f64;
    let cx = raw.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = raw.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = raw
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let transform = nalgebra::Matrix3::new(
        scale,
        0.0,
        -scale * cx,
        0.0,
        scale,
        -scale * cy,
        0.0,
        0.0,
        1.0,
    );
    let normalized = raw
        .iter()
        .map(|p| (scale * (p.0 - cx), scale * (p.1 - cy)))
        .collect();
    (transform, normalized)
}

fn apply_homography(h: &[f64; 9], p: PointF) -> (f64, f64) {
    let x = f64::from(p.x);
    let y = f64::from(p.y);
    let w = h[6] * x + h[7] * y + h[8];
    ((h[0] * x + h[1] * y + h[2]) / w, (h[3] * x + h[4] * y + h[5]) / w)
}

fn reprojection_error(h: &[f64; 9], from: PointF, to: PointF) -> f64 {
    let (px, py) = apply_homography(h, from);
    ((px - f64::from(to.x)).powi(2) + (py - f64::from(to.y)).powi(2)).sqrt()
}

/// Warp img2 into img1's frame and crop both to the overlapping rectangle.
fn warp_and_crop(
    img1: &RgbImage,
    img2: &RgbImage,
    h: &[f64; 9],
    inlier_ratio: f64,
) -> Option<Warped> {
    let matrix = [
        h[0] as f32,
        h[1] as f32,
        h[2] as f32,
        h[3] as f32,
        h[4] as f32,
        h[5] as f32,
        h[6] as f32,
        h[7] as f32,
        h[8] as f32,
    ];
    let projection = Projection::from_matrix(matrix)?;

    let mut warped = RgbImage::new(img1.width(), img1.height());
    warp_into(
        img2,
        &projection,
        Interpolation::Bilinear,
        image::Rgb([0, 0, 0]),
        &mut warped,
    );

    // Overlap: img2's corners mapped into img1's frame, intersected with img1.
    let corners = [
        PointF { x: 0.0, y: 0.0 },
        PointF {
            x: img2.width() as f32,
            y: 0.0,
        },
        PointF {
            x: 0.0,
            y: img2.height() as f32,
        },
        PointF {
            x: img2.width() as f32,
            y: img2.height() as f32,
        },
    ];
    let projected: Vec<(f64, f64)> = corners.iter().map(|&c| apply_homography(h, c)).collect();
    let min_x = projected.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let min_y = projected.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_x = projected
        .iter()
        .map(|p| p.0)
        .fold(f64::NEG_INFINITY, f64::max);
    let max_y = projected
        .iter()
        .map(|p| p.1)
        .fold(f64::NEG_INFINITY, f64::max);

    let x0 = min_x.max(0.0).floor() as u32;
    let y0 = min_y.max(0.0).floor() as u32;
    let x1 = (max_x.min(f64::from(img1.width())).ceil() as u32).min(img1.width());
    let y1 = (max_y.min(f64::from(img1.height())).ceil() as u32).min(img1.height());
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let width = x1 - x0;
    let height = y1 - y0;
    Some(Warped {
        img1: imageops::crop_imm(img1, x0, y0, width, height).to_image(),
        img2: imageops::crop_imm(&warped, x0, y0, width, height).to_image(),
        inlier_ratio,
        offset: (x0, y0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic high-texture test raster.
    fn textured(width: u32, height: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut img = RgbImage::from_pixel(width, height, image::Rgb([30, 30, 30]));
        for _ in 0..120 {
            let x = rng.gen_range(0..width.saturating_sub(12));
            let y = rng.gen_range(0..height.saturating_sub(12));
            let w = rng.gen_range(3..12);
            let h = rng.gen_range(3..12);
            let shade: u8 = rng.gen_range(90..255);
            for py in y..(y + h).min(height) {
                for px in x..(x + w).min(width) {
                    img.put_pixel(px, py, image::Rgb([shade, shade, shade]));
                }
            }
        }
        img
    }

    #[test]
    fn flat_images_fall_back_to_min_dimensions() {
        let a = RgbImage::from_pixel(200, 160, image::Rgb([100, 100, 100]));
        let b = RgbImage::from_pixel(180, 190, image::Rgb([100, 100, 100]));
        let aligner = ImageAligner::new(10, 3.0);

        let result = aligner.align(&a, &b);
        assert!(!result.aligned);
        assert_eq!(result.inlier_ratio, None);
        assert_eq!(result.img1.dimensions(), (180, 160));
        assert_eq!(result.img2.dimensions(), (180, 160));
    }

    #[test]
    fn identical_images_register() {
        let img = textured(320, 320, 7);
        let aligner = ImageAligner::new(10, 3.0);

        let result = aligner.align(&img, &img);
        assert!(result.aligned, "textured identical pair must register");
        assert!(result.inlier_ratio.unwrap() >= MIN_INLIER_RATIO);
        assert_eq!(result.img1.dimensions(), result.img2.dimensions());
    }

    #[test]
    fn translated_copy_registers_with_matching_content() {
        let base = textured(360, 360, 21);
        // Second view: the same scene shifted by (12, 7).
        let shifted = imageops::crop_imm(&base, 12, 7, 320, 320).to_image();
        let reference = imageops::crop_imm(&base, 0, 0, 320, 320).to_image();

        let aligner = ImageAligner::new(10, 3.0);
        let result = aligner.align(&reference, &shifted);
        assert!(result.aligned, "pure translation must register");
        assert_eq!(result.img1.dimensions(), result.img2.dimensions());

        // After warping, overlapping content should agree almost everywhere.
        let (width, height) = result.img1.dimensions();
        let mut agreeing = 0u64;
        let mut total = 0u64;
        for y in 0..height {
            for x in 0..width {
                let a = result.img1.get_pixel(x, y).0[0] as i32;
                let b = result.img2.get_pixel(x, y).0[0] as i32;
                total += 1;
                if (a - b).abs() <= 8 {
                    agreeing += 1;
                }
            }
        }
        assert!(
            agreeing as f64 / total as f64 > 0.90,
            "only {agreeing}/{total} pixels agree after registration"
        );
    }

    #[test]
    fn homography_recovers_known_translation() {
        let pairs: Vec<(PointF, PointF)> = [(10.0, 10.0), (100.0, 20.0), (40.0, 90.0), (80.0, 70.0)]
            .iter()
            .map(|&(x, y)| {
                (
                    PointF { x, y },
                    PointF {
                        x: x + 12.0,
                        y: y + 7.0,
                    },
                )
            })
            .collect();

        let h = estimate_homography(&pairs).expect("four clean points");
        let (px, py) = apply_homography(&h, PointF { x: 55.0, y: 45.0 });
        assert!((px - 67.0).abs() < 0.1, "got {px}");
        assert!((py - 52.0).abs() < 0.1, "got {py}");
    }

    #[test]
    fn hamming_distance_counts_bits() {
        let a = [0u128, 0u128];
        let b = [0b1011u128, 1u128 << 100];
        assert_eq!(hamming(&a, &b), 4);
    }
}

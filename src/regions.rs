//! Candidate parking-region proposal.
//!
//! Two interchangeable implementations sit behind `RegionProposer`: a
//! model-free heuristic (edge density + morphology + component analysis)
//! and an ONNX vehicle detector. Candidate identity within an image pair is
//! positional: candidates are sorted by `(y_center, x_center)` and indexed,
//! then paired across the two years by bounding-box IoU in the shared,
//! aligned pixel frame.

use anyhow::{Context, Result};
use image::{GrayImage, RgbImage, imageops};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{close, open};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::tiles::GeoTransform;

/// Minimum IoU for a year1 candidate to pair with a year2 candidate.
const PAIR_IOU: f64 = 0.3;

/// Oriented aspect-ratio band for parked passenger vehicles.
const MIN_ASPECT: f64 = 1.3;
const MAX_ASPECT: f64 = 3.5;

/// Ground-area band in square meters. A passenger car occupies ~8 m^2;
/// the upper bound leaves room for trucks and vans.
const MIN_AREA_M2: f64 = 4.0;
const MAX_AREA_M2: f64 = 40.0;

/// Axis-aligned box in the aligned pixel frame; `w`/`h` are always > 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BBox {
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.w) / 2.0,
            f64::from(self.y) + f64::from(self.h) / 2.0,
        )
    }

    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }

    pub fn iou(&self, other: &BBox) -> f64 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.w).min(other.x + other.w);
        let y1 = (self.y + self.h).min(other.y + other.h);
        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }
        let intersection = u64::from(x1 - x0) * u64::from(y1 - y0);
        let union = self.area() + other.area() - intersection;
        intersection as f64 / union as f64
    }
}

/// One proposed region in a single image.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Position-derived index, stable within one image.
    pub region_id: usize,
    pub bbox: BBox,
    /// Class label when the proposer is a classifier, e.g. "small-vehicle".
    pub label: Option<String>,
}

/// A year1/year2 candidate pair sharing a pixel frame.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub region_id: usize,
    pub bbox1: BBox,
    pub bbox2: BBox,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    pub label: Option<String>,
}

pub trait RegionProposer: Send + Sync {
    /// Propose candidate regions on one image. `gsd_m` is the ground sample
    /// distance in meters per pixel of the aligned frame.
    fn propose(&self, image: &RgbImage, gsd_m: f64) -> Result<Vec<Candidate>>;
}

/// Sort by `(y_center, x_center)` and assign positional region ids.
fn index_candidates(mut boxes: Vec<(BBox, Option<String>)>) -> Vec<Candidate> {
    boxes.sort_by(|(a, _), (b, _)| {
        let (ax, ay) = a.center();
        let (bx, by) = b.center();
        ay.total_cmp(&by).then(ax.total_cmp(&bx))
    });
    boxes
        .into_iter()
        .enumerate()
        .map(|(region_id, (bbox, label))| Candidate {
            region_id,
            bbox,
            label,
        })
        .collect()
}

/// Pair candidates across the two years by IoU, greedily taking the best
/// overlap first. Unmatched candidates are dropped: with imagery from only
/// one year there is nothing to compare.
pub fn pair_candidates(
    year1: &[Candidate],
    year2: &[Candidate],
    transform: &GeoTransform,
) -> Vec<CandidatePair> {
    let mut scored: Vec<(f64, usize, usize)> = Vec::new();
    for (i, c1) in year1.iter().enumerate() {
        for (j, c2) in year2.iter().enumerate() {
            let iou = c1.bbox.iou(&c2.bbox);
            if iou >= PAIR_IOU {
                scored.push((iou, i, j));
            }
        }
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut used1 = vec![false; year1.len()];
    let mut used2 = vec![false; year2.len()];
    let mut pairs = Vec::new();
    for (_, i, j) in scored {
        if used1[i] || used2[j] {
            continue;
        }
        used1[i] = true;
        used2[j] = true;

        let c1 = &year1[i];
        let c2 = &year2[j];
        let (cx, cy) = c1.bbox.center();
        let (centroid_lat, centroid_lon) = transform.pixel_to_geo(cx, cy);
        pairs.push(CandidatePair {
            region_id: c1.region_id,
            bbox1: c1.bbox,
            bbox2: c2.bbox,
            centroid_lat,
            centroid_lon,
            label: c1.label.clone().or_else(|| c2.label.clone()),
        });
    }

    // Deterministic processing order downstream.
    pairs.sort_by_key(|p| p.region_id);
    pairs
}

/// Model-free proposer: edge density thresholding, morphological cleanup
/// sized for the ground sample distance, then per-component shape filters.
pub struct HeuristicProposer {
    edge_threshold: u16,
}

impl Default for HeuristicProposer {
    fn default() -> Self {
        Self { edge_threshold: 40 }
    }
}

impl RegionProposer for HeuristicProposer {
    fn propose(&self, image: &RgbImage, gsd_m: f64) -> Result<Vec<Candidate>> {
        if gsd_m <= 0.0 {
            anyhow::bail!("ground sample distance must be positive, got {gsd_m}");
        }

        let gray = imageops::grayscale(image);
        let mask = edge_mask(&gray, self.edge_threshold);

        // Close with half a car width so the edge response of a vehicle
        // merges into one solid blob (uniform roofs only produce edges at
        // their outline), then open with a quarter width to drop speckle.
        let car_width_px = 1.8 / gsd_m;
        let close_element = ((car_width_px / 2.0).round() as u8).clamp(1, 20);
        let open_element = ((car_width_px / 4.0).round() as u8).clamp(1, 15);
        let mask = close(&mask, Norm::LInf, close_element);
        let mask = open(&mask, Norm::LInf, open_element);

        let labels = connected_components(&mask, Connectivity::Eight, image::Luma([0u8]));

        let mut components: HashMap<u32, ComponentStats> = HashMap::new();
        for (x, y, pixel) in labels.enumerate_pixels() {
            let label = pixel.0[0];
            if label == 0 {
                continue;
            }
            components.entry(label).or_default().push(x, y);
        }

        let min_area_px = MIN_AREA_M2 / (gsd_m * gsd_m);
        let max_area_px = MAX_AREA_M2 / (gsd_m * gsd_m);

        let boxes: Vec<(BBox, Option<String>)> = components
            .into_values()
            .filter_map(|stats| {
                let area = stats.count as f64;
                if area < min_area_px || area > max_area_px {
                    return None;
                }
                let aspect = stats.oriented_aspect();
                if !(MIN_ASPECT..=MAX_ASPECT).contains(&aspect) {
                    return None;
                }
                Some((stats.bbox(), None))
            })
            .collect();

        debug!(candidates = boxes.len(), gsd_m, "heuristic proposal complete");
        Ok(index_candidates(boxes))
    }
}

/// Binary gradient-magnitude mask (255 where edges are strong).
fn edge_mask(gray: &GrayImage, threshold: u16) -> GrayImage {
    let (width, height) = gray.dimensions();
    let mut mask = GrayImage::new(width, height);
    if width < 3 || height < 3 {
        return mask;
    }
    let at = |x: u32, y: u32| i32::from(gray.get_pixel(x, y).0[0]);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = -at(x - 1, y - 1) - 2 * at(x - 1, y) - at(x - 1, y + 1)
                + at(x + 1, y - 1)
                + 2 * at(x + 1, y)
                + at(x + 1, y + 1);
            let gy = -at(x - 1, y - 1) - 2 * at(x, y - 1) - at(x + 1, y - 1)
                + at(x - 1, y + 1)
                + 2 * at(x, y + 1)
                + at(x + 1, y + 1);
            let magnitude = (((gx * gx + gy * gy) as f64).sqrt() / 4.0) as u16;
            if magnitude > threshold {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
    }
    mask
}

#[derive(Default)]
struct ComponentStats {
    count: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
}

impl ComponentStats {
    fn push(&mut self, x: u32, y: u32) {
        if self.count == 0 {
            self.min_x = x;
            self.min_y = y;
            self.max_x = x;
            self.max_y = y;
        } else {
            self.min_x = self.min_x.min(x);
            self.min_y = self.min_y.min(y);
            self.max_x = self.max_x.max(x);
            self.max_y = self.max_y.max(y);
        }
        self.count += 1;
        let (xf, yf) = (f64::from(x), f64::from(y));
        self.sum_x += xf;
        self.sum_y += yf;
        self.sum_xx += xf * xf;
        self.sum_yy += yf * yf;
        self.sum_xy += xf * yf;
    }

    fn bbox(&self) -> BBox {
        BBox {
            x: self.min_x,
            y: self.min_y,
            w: self.max_x - self.min_x + 1,
            h: self.max_y - self.min_y + 1,
        }
    }

    /// Ratio of the component's principal extents (always >= 1), from the
    /// eigenvalues of the pixel covariance. Orientation-independent, so a
    /// diagonally parked car passes the same filter as an axis-aligned one.
    fn oriented_aspect(&self) -> f64 {
        let n = self.count as f64;
        let mean_x = self.sum_x / n;
        let mean_y = self.sum_y / n;
        let cov_xx = self.sum_xx / n - mean_x * mean_x;
        let cov_yy = self.sum_yy / n - mean_y * mean_y;
        let cov_xy = self.sum_xy / n - mean_x * mean_y;

        let trace = cov_xx + cov_yy;
        let det = cov_xx * cov_yy - cov_xy * cov_xy;
        let half = trace / 2.0;
        let disc = (half * half - det).max(0.0).sqrt();
        let major = (half + disc).max(1e-9);
        let minor = (half - disc).max(1e-9);
        (major / minor).sqrt()
    }
}

/// ONNX vehicle detector. The model takes a `1x3x640x640` RGB tensor scaled
/// to [0, 1] and emits `1xNx6` rows of `(cx, cy, w, h, confidence, class)`
/// in input pixels, classes indexed into `CLASS_LABELS`.
pub struct OnnxDetectorProposer {
    model: tract_onnx::prelude::TypedRunnableModel<tract_onnx::prelude::TypedModel>,
    confidence_threshold: f32,
    nms_iou: f32,
}

const DETECTOR_INPUT: u32 = 640;
const CLASS_LABELS: [&str; 3] = ["small-vehicle", "large-vehicle", "truck"];

impl OnnxDetectorProposer {
    pub fn load(path: &Path, confidence_threshold: f32, nms_iou: f32) -> Result<Self> {
        use tract_onnx::prelude::*;

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to read detector model {}", path.display()))?
            .with_input_fact(
                0,
                f32::fact([1, 3, DETECTOR_INPUT as usize, DETECTOR_INPUT as usize]).into(),
            )?
            .into_optimized()?
            .into_runnable()?;
        Ok(Self {
            model,
            confidence_threshold,
            nms_iou,
        })
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<(BBox, f32, usize)>> {
        use tract_onnx::prelude::*;

        let resized = imageops::resize(
            image,
            DETECTOR_INPUT,
            DETECTOR_INPUT,
            imageops::FilterType::Triangle,
        );
        let mut input = tract_ndarray::Array4::<f32>::zeros((
            1,
            3,
            DETECTOR_INPUT as usize,
            DETECTOR_INPUT as usize,
        ));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = f32::from(pixel.0[c]) / 255.0;
            }
        }

        let outputs = self.model.run(tvec!(Tensor::from(input).into()))?;
        let view = outputs[0].to_array_view::<f32>()?;
        let flat: Vec<f32> = view.iter().copied().collect();

        let scale_x = f64::from(image.width()) / f64::from(DETECTOR_INPUT);
        let scale_y = f64::from(image.height()) / f64::from(DETECTOR_INPUT);

        let mut detections = Vec::new();
        for row in flat.chunks_exact(6) {
            let confidence = row[4];
            if confidence < self.confidence_threshold {
                continue;
            }
            let class = row[5].round() as usize;
            if class >= CLASS_LABELS.len() {
                continue;
            }
            let cx = f64::from(row[0]) * scale_x;
            let cy = f64::from(row[1]) * scale_y;
            let w = f64::from(row[2]) * scale_x;
            let h = f64::from(row[3]) * scale_y;
            if w < 1.0 || h < 1.0 {
                continue;
            }
            let x = (cx - w / 2.0).max(0.0) as u32;
            let y = (cy - h / 2.0).max(0.0) as u32;
            let w = (w as u32).min(image.width().saturating_sub(x)).max(1);
            let h = (h as u32).min(image.height().saturating_sub(y)).max(1);
            detections.push((BBox { x, y, w, h }, confidence, class));
        }

        Ok(class_aware_nms(detections, self.nms_iou))
    }
}

impl RegionProposer for OnnxDetectorProposer {
    fn propose(&self, image: &RgbImage, _gsd_m: f64) -> Result<Vec<Candidate>> {
        let detections = self.detect(image)?;
        let boxes = detections
            .into_iter()
            .map(|(bbox, _, class)| (bbox, Some(CLASS_LABELS[class].to_string())))
            .collect();
        Ok(index_candidates(boxes))
    }
}

/// Greedy non-maximum suppression within each class.
fn class_aware_nms(mut detections: Vec<(BBox, f32, usize)>, iou_threshold: f32) -> Vec<(BBox, f32, usize)> {
    detections.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<(BBox, f32, usize)> = Vec::new();
    for detection in detections {
        let suppressed = kept.iter().any(|kept_det| {
            kept_det.2 == detection.2
                && kept_det.0.iou(&detection.0) > f64::from(iou_threshold)
        });
        if !suppressed {
            kept.push(detection);
        }
    }
    kept
}

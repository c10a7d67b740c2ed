//! Local Binary Pattern Histogram (LBPH) face classifier.
//!
//! Each training patch is reduced to a grid of circular-LBP histograms; a
//! query is assigned the label of the nearest training sample under the
//! alternative chi-square distance. Distances are on the same scale as
//! OpenCV's `LBPHFaceRecognizer`, so thresholds in the 30 to 150 range behave
//! the same way.

use crate::types::{Label, Prediction};
use image::GrayImage;

// --- Named constants ---
const LBPH_DEFAULT_RADIUS: u32 = 2;
const LBPH_DEFAULT_NEIGHBORS: u32 = 8;
const LBPH_DEFAULT_GRID: u32 = 8;
const LBPH_MAX_NEIGHBORS: u32 = 16;

/// LBPH operator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: LBPH_DEFAULT_RADIUS,
            neighbors: LBPH_DEFAULT_NEIGHBORS,
            grid_x: LBPH_DEFAULT_GRID,
            grid_y: LBPH_DEFAULT_GRID,
        }
    }
}

impl LbphParams {
    fn num_patterns(&self) -> usize {
        1usize << self.neighbors.min(LBPH_MAX_NEIGHBORS)
    }
}

/// Trained LBPH model: one spatial histogram per training patch.
#[derive(Debug, Clone)]
pub struct LbphModel {
    params: LbphParams,
    samples: Vec<(Label, Vec<f32>)>,
}

impl LbphModel {
    /// Build histograms for every `(label, patch)` pair.
    ///
    /// Patches are expected to be normalized (same size, equalized).
    pub fn train(params: LbphParams, samples: &[(Label, GrayImage)]) -> Self {
        let samples = samples
            .iter()
            .map(|(label, patch)| (*label, spatial_histogram(patch, &params)))
            .collect();
        Self { params, samples }
    }

    /// Nearest training sample. `None` only for an empty model.
    ///
    /// Ties resolve to the first sample in training order.
    pub fn predict(&self, patch: &GrayImage) -> Option<Prediction> {
        let query = spatial_histogram(patch, &self.params);
        let mut best: Option<Prediction> = None;

        for (label, hist) in &self.samples {
            let distance = chi_square_alt(hist, &query);
            let is_better = match &best {
                None => true,
                Some(prev) => distance < prev.distance,
            };
            if is_better {
                best = Some(Prediction {
                    label: *label,
                    distance,
                });
            }
        }

        best
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Circular LBP codes with bilinear sampling.
///
/// Returns the code image (row-major) and its dimensions, which are the input
/// dimensions shrunk by `radius` on each side.
fn lbp_codes(src: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, usize, usize) {
    let (w, h) = (src.width() as usize, src.height() as usize);
    let r = radius as usize;
    if w <= 2 * r || h <= 2 * r {
        return (Vec::new(), 0, 0);
    }
    let (out_w, out_h) = (w - 2 * r, h - 2 * r);
    let mut codes = vec![0u32; out_w * out_h];
    let px = src.as_raw();
    let at = |y: i64, x: i64| px[y as usize * w + x as usize] as f32;

    let n_points = neighbors.min(LBPH_MAX_NEIGHBORS);
    for n in 0..n_points {
        let angle = 2.0 * std::f32::consts::PI * n as f32 / n_points as f32;
        let sx = radius as f32 * angle.cos();
        let sy = -(radius as f32) * angle.sin();

        let (fx, fy) = (sx.floor(), sy.floor());
        let (cx, cy) = (sx.ceil(), sy.ceil());
        let (tx, ty) = (sx - fx, sy - fy);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;
        let (fx, fy, cx, cy) = (fx as i64, fy as i64, cx as i64, cy as i64);

        for y in r..h - r {
            for x in r..w - r {
                let (yi, xi) = (y as i64, x as i64);
                let t = w1 * at(yi + fy, xi + fx)
                    + w2 * at(yi + fy, xi + cx)
                    + w3 * at(yi + cy, xi + fx)
                    + w4 * at(yi + cy, xi + cx);
                let c = at(yi, xi);
                if t > c || (t - c).abs() < f32::EPSILON {
                    codes[(y - r) * out_w + (x - r)] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Concatenated per-cell histograms, each normalized by its cell area.
fn spatial_histogram(patch: &GrayImage, params: &LbphParams) -> Vec<f32> {
    let (codes, w, h) = lbp_codes(patch, params.radius, params.neighbors);
    let bins = params.num_patterns();
    let (gx, gy) = (params.grid_x.max(1) as usize, params.grid_y.max(1) as usize);
    let mut result = vec![0.0f32; gx * gy * bins];

    let cell_w = w / gx;
    let cell_h = h / gy;
    if cell_w == 0 || cell_h == 0 {
        return result;
    }
    let area = (cell_w * cell_h) as f32;

    for row in 0..gy {
        for col in 0..gx {
            let hist = &mut result[(row * gx + col) * bins..(row * gx + col + 1) * bins];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    hist[codes[y * w + x] as usize] += 1.0;
                }
            }
            for v in hist.iter_mut() {
                *v /= area;
            }
        }
    }

    result
}

/// Alternative chi-square distance: `2 * Σ (a - b)² / (a + b)`.
fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    let mut sum = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let diff = (x - y) as f64;
        let total = (x + y) as f64;
        if total.abs() > f64::EPSILON {
            sum += diff * diff / total;
        }
    }
    2.0 * sum
}

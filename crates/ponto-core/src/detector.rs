//! Haar-cascade face detector.
//!
//! Viola-Jones evaluation over integral images: every window position and
//! scale is run through a cascade of boosted stages, and raw hits are
//! grouped into final boxes with the `min_neighbors` rule.
//!
//! Cascades are read from OpenCV's `CascadeClassifier` XML format
//! (`haarcascade_frontalface_default.xml` and friends): a `<cascade>` with
//! `<width>`/`<height>`, `<stages>` of boosted trees whose `<internalNodes>`
//! hold `left right feature threshold` quadruples, and a shared `<features>`
//! table of weighted rectangles. Only upright (non-tilted) HAAR features are
//! supported.

use crate::types::Rect;
use image::GrayImage;
use roxmltree::{Document, Node};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_SCALE_FACTOR: f32 = 1.1;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
const GROUP_EPS: f32 = 0.2;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cascade parse failed: {0}")]
    Parse(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// Face detection backend.
///
/// Implementations are stateless between calls and shared by every pipeline.
pub trait FaceDetector: Send + Sync {
    /// Detect faces in a grayscale image, dropping boxes smaller than
    /// `min_size` on either side. Order is the detector's scan order.
    fn detect(&self, gray: &GrayImage, min_size: u32) -> Vec<Rect>;
}

/// Rectangle of a Haar-like feature, in window coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Where a tree node sends the window next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Branch {
    Node(usize),
    Leaf(usize),
}

impl Branch {
    /// OpenCV encodes leaves as `-leaf_index` and inner nodes as positive
    /// indices, so `0` is always leaf 0.
    fn decode(raw: i64) -> Self {
        if raw > 0 {
            Branch::Node(raw as usize)
        } else {
            Branch::Leaf(raw.unsigned_abs() as usize)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub feature: usize,
    pub threshold: f32,
    /// Taken when the normalized feature value is below `threshold`.
    pub left: Branch,
    pub right: Branch,
}

/// Boosted decision tree; a stump when it has a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeStage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<CascadeStage>,
    pub features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Parse an OpenCV cascade XML document.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = Document::parse(xml)?;
        let cascade = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| invalid("no <cascade> element (old-style cascades are not supported)"))?;

        if let Some(kind) = child(cascade, "featureType") {
            let kind = text(kind);
            if kind != "HAAR" {
                return Err(invalid(format!("unsupported feature type {kind}")));
            }
        }

        let window_width = number(required(cascade, "width")?, "width")?;
        let window_height = number(required(cascade, "height")?, "height")?;
        let stages = items(required(cascade, "stages")?)
            .enumerate()
            .map(|(i, n)| parse_stage(n, i))
            .collect::<Result<Vec<_>, _>>()?;
        let features = items(required(cascade, "features")?)
            .enumerate()
            .map(|(i, n)| parse_feature(n, i))
            .collect::<Result<Vec<_>, _>>()?;

        let cascade = HaarCascade {
            window_width,
            window_height,
            stages,
            features,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_xml(&xml)
    }

    fn validate(&self) -> Result<(), CascadeError> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(invalid("window size must be non-zero"));
        }
        if self.stages.is_empty() {
            return Err(invalid("cascade has no stages"));
        }
        for (fi, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() {
                return Err(invalid(format!("feature {fi} has no rectangles")));
            }
            for r in &feature.rects {
                if r.width == 0
                    || r.height == 0
                    || r.x + r.width > self.window_width
                    || r.y + r.height > self.window_height
                {
                    return Err(invalid(format!(
                        "feature {fi}: rect {}x{}+{}+{} outside {}x{} window",
                        r.width, r.height, r.x, r.y, self.window_width, self.window_height
                    )));
                }
            }
        }
        for (si, stage) in self.stages.iter().enumerate() {
            for (ci, weak) in stage.classifiers.iter().enumerate() {
                let bad = |what: String| invalid(format!("stage {si} classifier {ci}: {what}"));
                if weak.nodes.is_empty() {
                    return Err(bad("empty tree".into()));
                }
                for (ni, node) in weak.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        return Err(bad(format!("feature {} out of range", node.feature)));
                    }
                    for branch in [node.left, node.right] {
                        match branch {
                            // Children come after their parent, so evaluation terminates.
                            Branch::Node(i) if i <= ni || i >= weak.nodes.len() => {
                                return Err(bad(format!("node {ni} links to node {i}")))
                            }
                            Branch::Leaf(i) if i >= weak.leaves.len() => {
                                return Err(bad(format!("leaf {i} out of range")))
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> CascadeError {
    CascadeError::Invalid(msg.into())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn required<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
    child(node, name).ok_or_else(|| invalid(format!("missing <{name}>")))
}

/// Element children of an OpenCV sequence (`<_>` entries).
fn items<'a, 'i: 'a>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn number<T: FromStr>(node: Node<'_, '_>, what: &str) -> Result<T, CascadeError> {
    let raw = text(node);
    raw.parse()
        .map_err(|_| invalid(format!("<{what}>: {raw:?} is not a number")))
}

fn numbers<T: FromStr>(node: Node<'_, '_>, what: &str) -> Result<Vec<T>, CascadeError> {
    text(node)
        .split_whitespace()
        .map(|tok| {
            tok.parse()
                .map_err(|_| invalid(format!("<{what}>: {tok:?} is not a number")))
        })
        .collect()
}

fn parse_stage(node: Node<'_, '_>, index: usize) -> Result<CascadeStage, CascadeError> {
    let threshold = number(required(node, "stageThreshold")?, "stageThreshold")?;
    let classifiers = items(required(node, "weakClassifiers")?)
        .map(|weak| {
            let raw: Vec<f64> = numbers(required(weak, "internalNodes")?, "internalNodes")?;
            if raw.is_empty() || raw.len() % 4 != 0 {
                return Err(invalid(format!(
                    "stage {index}: internalNodes length {} is not a multiple of 4",
                    raw.len()
                )));
            }
            let nodes = raw
                .chunks_exact(4)
                .map(|q| TreeNode {
                    left: Branch::decode(q[0] as i64),
                    right: Branch::decode(q[1] as i64),
                    feature: q[2].max(0.0) as usize,
                    threshold: q[3] as f32,
                })
                .collect();
            let leaves = numbers(required(weak, "leafValues")?, "leafValues")?;
            Ok(WeakClassifier { nodes, leaves })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CascadeStage {
        threshold,
        classifiers,
    })
}

fn parse_feature(node: Node<'_, '_>, index: usize) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = child(node, "tilted") {
        if text(tilted) != "0" {
            return Err(invalid(format!("feature {index} is tilted")));
        }
    }
    let rects = items(required(node, "rects")?)
        .map(|r| {
            let v: Vec<f32> = numbers(r, "rects")?;
            match v.as_slice() {
                &[x, y, w, h, weight] if x >= 0.0 && y >= 0.0 && w >= 0.0 && h >= 0.0 => {
                    Ok(WeightedRect {
                        x: x as u32,
                        y: y as u32,
                        width: w as u32,
                        height: h as u32,
                        weight,
                    })
                }
                _ => Err(invalid(format!("feature {index}: malformed rect {v:?}"))),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HaarFeature { rects })
}

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    /// Window growth between scales (> 1.0).
    pub scale_factor: f32,
    /// Raw hits a group needs to be reported. 0 reports raw hits ungrouped.
    pub min_neighbors: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
        }
    }
}

/// Sliding-window detector over a [`HaarCascade`].
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Self {
        let params = DetectorParams {
            scale_factor: if params.scale_factor > 1.0 {
                params.scale_factor
            } else {
                DEFAULT_SCALE_FACTOR
            },
            ..params
        };
        Self { cascade, params }
    }

    pub fn load(path: impl AsRef<Path>, params: DetectorParams) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        let cascade = HaarCascade::load(path)?;
        tracing::info!(
            path = %path.display(),
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(Self::new(cascade, params))
    }

    /// Raw window hits across all scales, before grouping.
    fn scan(&self, integral: &IntegralImage, min_size: u32) -> Vec<Rect> {
        let (img_w, img_h) = (integral.width, integral.height);
        let (base_w, base_h) = (self.cascade.window_width, self.cascade.window_height);
        let mut hits = Vec::new();

        let mut scale = 1.0f32;
        loop {
            let win_w = (base_w as f32 * scale).round() as u32;
            let win_h = (base_h as f32 * scale).round() as u32;
            if win_w > img_w || win_h > img_h {
                break;
            }
            if win_w >= min_size && win_h >= min_size {
                let step = ((scale * 2.0).round() as usize).max(1);
                let scaled = self.scaled_features(scale);
                for y in (0..=img_h - win_h).step_by(step) {
                    for x in (0..=img_w - win_w).step_by(step) {
                        if self.evaluate_window(integral, &scaled, x, y, win_w, win_h) {
                            hits.push(Rect::new(x, y, win_w, win_h));
                        }
                    }
                }
            }
            scale *= self.params.scale_factor;
        }

        hits
    }

    /// Feature rectangles scaled to the current window, with the first
    /// weight corrected so the scaled feature keeps its zero-sum balance.
    fn scaled_features(&self, scale: f32) -> Vec<Vec<(Rect, f32)>> {
        self.cascade
            .features
            .iter()
            .map(|feature| {
                let mut rects: Vec<(Rect, f32)> = feature
                    .rects
                    .iter()
                    .map(|r| {
                        let rect = Rect::new(
                            (r.x as f32 * scale).round() as u32,
                            (r.y as f32 * scale).round() as u32,
                            ((r.width as f32 * scale).round() as u32).max(1),
                            ((r.height as f32 * scale).round() as u32).max(1),
                        );
                        (rect, r.weight)
                    })
                    .collect();
                if rects.len() > 1 {
                    let rest: f32 = rects[1..].iter().map(|(r, w)| w * r.area() as f32).sum();
                    let area0 = rects[0].0.area() as f32;
                    rects[0].1 = -rest / area0;
                }
                rects
            })
            .collect()
    }

    fn evaluate_window(
        &self,
        integral: &IntegralImage,
        scaled: &[Vec<(Rect, f32)>],
        x: u32,
        y: u32,
        win_w: u32,
        win_h: u32,
    ) -> bool {
        let window = Rect::new(x, y, win_w, win_h);
        let inv_area = 1.0 / window.area() as f64;
        let mean = integral.sum(window) as f64 * inv_area;
        let variance = integral.sq_sum(window) as f64 * inv_area - mean * mean;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        let feature_value = |index: usize| -> f64 {
            let mut value = 0.0f64;
            for (r, weight) in &scaled[index] {
                // Rounding can push a scaled rect past the window edge.
                let Some(clipped) = Rect::new(x + r.x, y + r.y, r.width, r.height)
                    .clamp_to(x + win_w, y + win_h)
                else {
                    continue;
                };
                value += integral.sum(clipped) as f64 * *weight as f64;
            }
            value * inv_area
        };

        for stage in &self.cascade.stages {
            let mut stage_sum = 0.0f32;
            for weak in &stage.classifiers {
                let mut node = &weak.nodes[0];
                let leaf = loop {
                    let next = if feature_value(node.feature) < node.threshold as f64 * norm {
                        node.left
                    } else {
                        node.right
                    };
                    match next {
                        Branch::Leaf(i) => break i,
                        Branch::Node(i) => node = &weak.nodes[i],
                    }
                };
                stage_sum += weak.leaves[leaf];
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage, min_size: u32) -> Vec<Rect> {
        let integral = IntegralImage::new(gray);
        let hits = self.scan(&integral, min_size);
        let raw = hits.len();
        let faces: Vec<Rect> = group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS)
            .into_iter()
            .filter(|r| r.width >= min_size && r.height >= min_size)
            .collect();
        tracing::trace!(raw, faces = faces.len(), "cascade scan");
        faces
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    width: u32,
    height: u32,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = gray.dimensions();
        let stride = w as usize + 1;
        let mut sum = vec![0u64; stride * (h as usize + 1)];
        let mut sq = vec![0u64; stride * (h as usize + 1)];
        let raw = gray.as_raw();

        for y in 0..h as usize {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w as usize {
                let p = raw[y * w as usize + x] as u64;
                row_sum += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sq[idx] = sq[idx - stride] + row_sq;
            }
        }

        Self {
            width: w,
            height: h,
            sum,
            sq,
        }
    }

    fn lookup(table: &[u64], stride: usize, r: Rect) -> u64 {
        let (x0, y0) = (r.x as usize, r.y as usize);
        let (x1, y1) = (x0 + r.width as usize, y0 + r.height as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y1 * stride + x0]
            - table[y0 * stride + x1]
    }

    fn sum(&self, r: Rect) -> u64 {
        Self::lookup(&self.sum, self.width as usize + 1, r)
    }

    fn sq_sum(&self, r: Rect) -> u64 {
        Self::lookup(&self.sq, self.width as usize + 1, r)
    }
}

/// Two rectangles belong together when every edge is within
/// `eps * mean(min side)` of its counterpart.
fn similar(a: &Rect, b: &Rect, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw hits, average each cluster, and keep clusters with at least
/// `min_neighbors` members. Small clusters lying inside a stronger one are
/// dropped. Output order follows each cluster's first hit.
fn group_rectangles(rects: &[Rect], min_neighbors: u32, eps: f32) -> Vec<Rect> {
    if min_neighbors == 0 {
        return rects.to_vec();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    // Keep the earlier index as root so cluster order follows scan order.
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    // Accumulate per root, in order of first appearance.
    let mut order: Vec<usize> = Vec::new();
    let mut acc: std::collections::HashMap<usize, ([u64; 4], u32)> = Default::default();
    for (i, r) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        let entry = acc.entry(root).or_insert_with(|| {
            order.push(root);
            ([0; 4], 0)
        });
        entry.0[0] += r.x as u64;
        entry.0[1] += r.y as u64;
        entry.0[2] += r.width as u64;
        entry.0[3] += r.height as u64;
        entry.1 += 1;
    }

    let clusters: Vec<(Rect, u32)> = order
        .iter()
        .filter_map(|root| acc.get(root))
        .filter(|(_, count)| *count >= min_neighbors)
        .map(|(s, count)| {
            let c = *count as u64;
            let avg = |v: u64| ((v + c / 2) / c) as u32;
            (Rect::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3])), *count)
        })
        .collect();

    clusters
        .iter()
        .enumerate()
        .filter(|(i, (r1, n1))| {
            !clusters.iter().enumerate().any(|(j, (r2, n2))| {
                if *i == j {
                    return false;
                }
                let dx = (r2.width as f32 * eps).round() as i64;
                let dy = (r2.height as f32 * eps).round() as i64;
                let inside = r1.x as i64 >= r2.x as i64 - dx
                    && r1.y as i64 >= r2.y as i64 - dy
                    && (r1.x + r1.width) as i64 <= (r2.x + r2.width) as i64 + dx
                    && (r1.y + r1.height) as i64 <= (r2.y + r2.height) as i64 + dy;
                inside && r1.area() < r2.area() && (*n2 > (*n1).max(3) || *n1 < 3)
            })
        })
        .map(|(_, (r, _))| *r)
        .collect()
}

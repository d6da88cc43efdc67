//! Boosted Haar cascade: OpenCV XML model files, integral images, window
//! evaluation.
//!
//! Models use the `opencv_traincascade` layout shipped in OpenCV's
//! `data/haarcascades` directory (`haarcascade_frontalface_default.xml` and
//! friends). Evaluation follows OpenCV's detector: rectangle weights are
//! divided by the area of the window's inner rectangle (the window minus a
//! one-pixel border), the first rectangle of each feature is rebalanced so
//! the feature stays zero-mean after rounding, and every node threshold is
//! multiplied by the standard deviation of the inner rectangle.

use image::GrayImage;
use quick_xml::{events::Event, Reader};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}; install haarcascade_frontalface_default.xml from OpenCV's data/haarcascades")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("failed to parse cascade: {0}")]
    Parse(String),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// One weighted rectangle of a Haar-like feature, in base window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub rects: Vec<WeightedRect>,
}

/// Split node of a weak classifier tree.
///
/// A positive child is the index of another node of the same tree; zero or
/// a negative child `-i` selects leaf `i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub left: i32,
    pub right: i32,
    pub feature: usize,
    /// Go left when the feature value is below this (times sigma).
    pub threshold: f32,
}

/// Regression tree over Haar features; a stump has one node and two leaves.
#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<Node>,
    pub leaves: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// The window is rejected when the leaf sum falls below this.
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// A trained cascade with its base window size.
#[derive(Debug, Clone, PartialEq)]
pub struct Cascade {
    pub width: u32,
    pub height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<Feature>,
}

impl Cascade {
    /// Load and validate a cascade from an OpenCV XML file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&raw)?;

        tracing::info!(
            path = %path.display(),
            window = ?(cascade.width, cascade.height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded face cascade"
        );

        Ok(cascade)
    }

    /// Parse the `<opencv_storage><cascade>` document written by
    /// `opencv_traincascade`. Only BOOST stages over upright HAAR features
    /// are accepted.
    pub fn from_xml(raw: &str) -> Result<Self, CascadeError> {
        let doc = parse_tree(raw)?;
        let storage = doc.child("opencv_storage")?;
        let node = storage.child("cascade").map_err(|_| {
            CascadeError::Parse(
                "no <cascade> element; legacy haartraining files must be converted first".into(),
            )
        })?;

        let stage_type = node.child("stageType")?.text.as_str();
        if stage_type != "BOOST" {
            return Err(CascadeError::Invalid(format!("unsupported stage type {stage_type}")));
        }
        let feature_type = node.child("featureType")?.text.as_str();
        if feature_type != "HAAR" {
            return Err(CascadeError::Invalid(format!("unsupported feature type {feature_type}")));
        }

        let features = node
            .child("features")?
            .items()
            .map(parse_feature)
            .collect::<Result<Vec<_>, _>>()?;
        let stages = node
            .child("stages")?
            .items()
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(declared) = node.find("stageNum") {
            let declared: usize = parse_number(&declared.text, "stageNum")?;
            if declared != stages.len() {
                return Err(CascadeError::Parse(format!(
                    "stageNum is {declared} but {} stages are listed",
                    stages.len()
                )));
            }
        }

        let cascade = Cascade {
            width: node.number("width")?,
            height: node.number("height")?,
            stages,
            features,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Reject cascades that would index outside the base window, reference
    /// missing features or leaves, or loop inside a tree.
    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.width == 0 || self.height == 0 {
            return Err(CascadeError::Invalid("window size must be non-zero".into()));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        for (fi, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() {
                return Err(CascadeError::Invalid(format!("feature {fi} has no rectangles")));
            }
            for r in &feature.rects {
                let fits = r.width > 0
                    && r.height > 0
                    && r.x.checked_add(r.width).is_some_and(|right| right <= self.width)
                    && r.y.checked_add(r.height).is_some_and(|bottom| bottom <= self.height);
                if !fits {
                    return Err(CascadeError::Invalid(format!(
                        "feature {fi}: rect {:?} outside {}x{} window",
                        (r.x, r.y, r.width, r.height),
                        self.width,
                        self.height
                    )));
                }
            }
        }

        for (si, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(CascadeError::Invalid(format!("stage {si} has no classifiers")));
            }
            for tree in &stage.classifiers {
                self.validate_tree(si, tree)?;
            }
        }
        Ok(())
    }

    fn validate_tree(&self, si: usize, tree: &WeakClassifier) -> Result<(), CascadeError> {
        if tree.nodes.is_empty() {
            return Err(CascadeError::Invalid(format!("stage {si}: classifier has no nodes")));
        }
        for (ni, node) in tree.nodes.iter().enumerate() {
            if node.feature >= self.features.len() {
                return Err(CascadeError::Invalid(format!(
                    "stage {si}: node uses feature {} of {}",
                    node.feature,
                    self.features.len()
                )));
            }
            for child in [node.left, node.right] {
                // Children must point forward so evaluation always ends on a leaf.
                let ok = if child > 0 {
                    (child as usize) > ni && (child as usize) < tree.nodes.len()
                } else {
                    (child.unsigned_abs() as usize) < tree.leaves.len()
                };
                if !ok {
                    return Err(CascadeError::Invalid(format!(
                        "stage {si}: node {ni} has bad child {child}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rescale every feature for a window `scale` times the base size.
    pub(crate) fn scaled(&self, scale: f64, window_w: u32, window_h: u32) -> ScaledCascade<'_> {
        let (nx, nw) = scale_span(1, self.width.saturating_sub(2), scale, window_w);
        let (ny, nh) = scale_span(1, self.height.saturating_sub(2), scale, window_h);
        let inv_area = 1.0 / (nw as f64 * nh as f64);

        let features = self
            .features
            .iter()
            .map(|f| ScaledFeature::new(f, scale, window_w, window_h, inv_area))
            .collect();

        ScaledCascade {
            cascade: self,
            norm: ScaledRect {
                x: nx,
                y: ny,
                w: nw,
                h: nh,
                weight: 1.0,
            },
            inv_area,
            features,
        }
    }
}

/// Scale a `(start, length)` span, keeping it non-empty and inside `limit`.
fn scale_span(start: u32, len: u32, scale: f64, limit: u32) -> (u32, u32) {
    let s = ((start as f64 * scale).round() as u32).min(limit.saturating_sub(1));
    let l = ((len as f64 * scale).round() as u32).max(1).min(limit - s);
    (s, l)
}

#[derive(Debug, Clone)]
struct ScaledRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    weight: f64,
}

impl ScaledRect {
    fn area(&self) -> f64 {
        self.w as f64 * self.h as f64
    }
}

#[derive(Debug, Clone)]
struct ScaledFeature {
    rects: Vec<ScaledRect>,
}

impl ScaledFeature {
    fn new(feature: &Feature, scale: f64, window_w: u32, window_h: u32, inv_area: f64) -> Self {
        let mut rects: Vec<ScaledRect> = feature
            .rects
            .iter()
            .map(|r| {
                let (x, w) = scale_span(r.x, r.width, scale, window_w);
                let (y, h) = scale_span(r.y, r.height, scale, window_h);
                ScaledRect {
                    x,
                    y,
                    w,
                    h,
                    weight: r.weight as f64 * inv_area,
                }
            })
            .collect();

        // Rounding changes rectangle areas; rebalance the first weight so a
        // flat window still scores zero.
        if let Some((first, rest)) = rects.split_first_mut() {
            if !rest.is_empty() {
                let balance: f64 = rest.iter().map(|r| r.weight * r.area()).sum();
                first.weight = -balance / first.area();
            }
        }

        Self { rects }
    }

    fn value(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * integral.sum(x + r.x, y + r.y, r.w, r.h) as f64)
            .sum()
    }
}

/// A cascade with features pre-scaled to one window size.
#[derive(Debug, Clone)]
pub(crate) struct ScaledCascade<'a> {
    cascade: &'a Cascade,
    /// Inner rectangle used for the variance normalization.
    norm: ScaledRect,
    inv_area: f64,
    features: Vec<ScaledFeature>,
}

impl ScaledCascade<'_> {
    /// Standard deviation of the inner rectangle at `(x, y)`; 1 for flat windows.
    fn sigma(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        let n = &self.norm;
        let sum = integral.sum(x + n.x, y + n.y, n.w, n.h) as f64;
        let sq = integral.sq_sum(x + n.x, y + n.y, n.w, n.h) as f64;
        let mean = sum * self.inv_area;
        let var = sq * self.inv_area - mean * mean;
        if var > 0.0 {
            var.sqrt()
        } else {
            1.0
        }
    }

    fn leaf(&self, tree: &WeakClassifier, integral: &IntegralImage, x: u32, y: u32, sigma: f64) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &tree.nodes[idx];
            let value = self.features[node.feature].value(integral, x, y);
            let next = if value < node.threshold as f64 * sigma {
                node.left
            } else {
                node.right
            };
            if next > 0 {
                idx = next as usize;
            } else {
                return tree.leaves[next.unsigned_abs() as usize] as f64;
            }
        }
    }

    /// Run every stage on the window at `(x, y)`. Returns true if all stages pass.
    pub(crate) fn accepts(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let sigma = self.sigma(integral, x, y);
        for stage in &self.cascade.stages {
            let total: f64 = stage
                .classifiers
                .iter()
                .map(|tree| self.leaf(tree, integral, x, y, sigma))
                .sum();
            if total < stage.threshold as f64 {
                return false;
            }
        }
        true
    }
}

// --- XML reading ---

/// Minimal element tree; the cascade format uses no attributes we need.
#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child(&self, name: &str) -> Result<&Element, CascadeError> {
        self.find(name)
            .ok_or_else(|| CascadeError::Parse(format!("<{}> has no <{name}>", self.name)))
    }

    /// Sequence entries, written as `<_>` elements.
    fn items(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter(|c| c.name == "_")
    }

    fn number<T: FromStr>(&self, name: &str) -> Result<T, CascadeError> {
        parse_number(&self.child(name)?.text, name)
    }
}

fn parse_number<T: FromStr>(token: &str, what: &str) -> Result<T, CascadeError> {
    token
        .trim()
        .parse()
        .map_err(|_| CascadeError::Parse(format!("<{what}>: bad number {token:?}")))
}

fn parse_numbers<T: FromStr>(text: &str, what: &str) -> Result<Vec<T>, CascadeError> {
    text.split_whitespace().map(|t| parse_number(t, what)).collect()
}

fn parse_tree(raw: &str) -> Result<Element, CascadeError> {
    let mut reader = Reader::from_str(raw);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack = vec![Element::default()];

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => stack.push(Element {
                name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                ..Element::default()
            }),
            Event::Empty(e) => {
                let element = Element {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ..Element::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Event::End(_) => {
                let Some(element) = stack.pop() else {
                    return Err(CascadeError::Parse("unbalanced closing tag".into()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Err(CascadeError::Parse("unbalanced closing tag".into())),
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    match (stack.pop(), stack.is_empty()) {
        (Some(root), true) => Ok(root),
        _ => Err(CascadeError::Parse("unclosed element".into())),
    }
}

fn parse_feature(el: &Element) -> Result<Feature, CascadeError> {
    if let Some(tilted) = el.find("tilted") {
        if tilted.text.trim() != "0" {
            return Err(CascadeError::Invalid("tilted features are not supported".into()));
        }
    }

    let rects = el
        .child("rects")?
        .items()
        .map(|r| -> Result<WeightedRect, CascadeError> {
            let tokens: Vec<&str> = r.text.split_whitespace().collect();
            let [x, y, width, height, weight] = tokens[..] else {
                return Err(CascadeError::Parse(format!("rect {:?} needs five values", r.text)));
            };
            Ok(WeightedRect {
                x: parse_number(x, "rects")?,
                y: parse_number(y, "rects")?,
                width: parse_number(width, "rects")?,
                height: parse_number(height, "rects")?,
                weight: parse_number(weight, "rects")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Feature { rects })
}

fn parse_stage(el: &Element) -> Result<Stage, CascadeError> {
    let classifiers = el
        .child("weakClassifiers")?
        .items()
        .map(|w| -> Result<WeakClassifier, CascadeError> {
            let raw = &w.child("internalNodes")?.text;
            let tokens: Vec<&str> = raw.split_whitespace().collect();
            if tokens.is_empty() || tokens.len() % 4 != 0 {
                return Err(CascadeError::Parse(format!(
                    "internalNodes {raw:?} is not a list of (left right feature threshold)"
                )));
            }
            let nodes = tokens
                .chunks(4)
                .map(|n| -> Result<Node, CascadeError> {
                    Ok(Node {
                        left: parse_number(n[0], "internalNodes")?,
                        right: parse_number(n[1], "internalNodes")?,
                        feature: parse_number(n[2], "internalNodes")?,
                        threshold: parse_number(n[3], "internalNodes")?,
                    })
                })
                .collect::<Result<Vec<_>, CascadeError>>()?;
            let leaves = parse_numbers(&w.child("leafValues")?.text, "leafValues")?;
            Ok(WeakClassifier { nodes, leaves })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;

    Ok(Stage {
        threshold: el.number("stageThreshold")?,
        classifiers,
    })
}

/// Summed-area tables of pixel values and squared pixel values.
pub(crate) struct IntegralImage {
    width: u32,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl IntegralImage {
    pub(crate) fn new(gray: &GrayImage) -> Self {
        let (w, h) = gray.dimensions();
        let stride = (w + 1) as usize;
        let mut sum = vec![0u64; stride * (h + 1) as usize];
        let mut sq = vec![0u64; stride * (h + 1) as usize];

        for y in 0..h as usize {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w as usize {
                let v = gray.get_pixel(x as u32, y as u32)[0] as u64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }

        Self { width: w, sum, sq }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = ((x + w) as usize, (y + h) as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }

    pub(crate) fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, (self.width + 1) as usize, x, y, w, h)
    }

    pub(crate) fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq, (self.width + 1) as usize, x, y, w, h)
    }
}

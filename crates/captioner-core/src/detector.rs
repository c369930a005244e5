//! SCRFD face landmark extractor via ONNX Runtime.
//!
//! Runs the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS, keeps the
//! most confident face and reports its five keypoints:
//! left eye, right eye, nose, left mouth corner, right mouth corner.

use crate::fingerprint::Image;
use crate::frame::Frame;
use crate::landmarks::{LandmarkError, LandmarkExtractor};
use crate::types::{LandmarkRecord, LandmarkSchema, Point};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const CONFIDENCE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const KEYPOINTS: usize = 5;

/// Schema tag for five-point face landmarks.
pub const FACE5_SCHEMA_VERSION: &str = "face5/v1";

/// Default model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
enum ScrfdError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ScrfdError> for LandmarkError {
    fn from(e: ScrfdError) -> Self {
        LandmarkError::Backend(e.to_string())
    }
}

/// A face candidate in source frame coordinates.
#[derive(Debug, Clone)]
struct Detection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    keypoints: [Point; KEYPOINTS],
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Mapping between source frame and the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    new_w: u32,
    new_h: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            new_w,
            new_h,
            pad_x: (INPUT_SIZE - new_w) / 2,
            pad_y: (INPUT_SIZE - new_h) / 2,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> Point {
        Point::new(
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-backed [`LandmarkExtractor`].
pub struct ScrfdExtractor {
    session: Mutex<Session>,
    outputs: [StrideOutputs; 3],
}

impl ScrfdExtractor {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, LandmarkError> {
        Ok(Self::open(model_path.as_ref())?)
    }

    fn open(model_path: &Path) -> Result<Self, ScrfdError> {
        if !model_path.exists() {
            return Err(ScrfdError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(ScrfdError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }

        let outputs = output_layout(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "SCRFD landmark model loaded");

        Ok(Self {
            session: Mutex::new(session),
            outputs,
        })
    }

    /// Detect faces in a frame, most confident first.
    fn detect(&self, frame: Frame) -> Result<Vec<Detection>, ScrfdError> {
        let (input, letterbox) = preprocess(frame)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ScrfdError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.outputs[pos];
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| ScrfdError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = tensor(score_idx, "scores")?;
            let bboxes = tensor(bbox_idx, "bboxes")?;
            let kps = tensor(kps_idx, "kps")?;
            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        Ok(nms(candidates, NMS_THRESHOLD))
    }
}

impl LandmarkExtractor for ScrfdExtractor {
    fn schema(&self) -> LandmarkSchema {
        LandmarkSchema::new(FACE5_SCHEMA_VERSION, KEYPOINTS)
    }

    fn extract_landmarks(&self, image: &Image) -> Result<LandmarkRecord, LandmarkError> {
        let frame =
            Frame::decode(image.bytes()).map_err(|e| LandmarkError::InvalidImage(e.to_string()))?;
        let bounds = frame.bounds();

        let face = self
            .detect(frame)?
            .into_iter()
            .next()
            .ok_or(LandmarkError::NoLandmarksFound)?;

        tracing::debug!(
            fingerprint = %image.fingerprint().short(),
            score = face.score,
            "face selected"
        );

        let points = face.keypoints.iter().map(|p| bounds.clamp(*p)).collect();
        LandmarkRecord::new(image.fingerprint(), points, &self.schema(), Some(bounds))
    }
}

/// Letterbox a frame into a normalized 1×3×640×640 tensor.
///
/// Padding is left at zero, which is the normalized value of `PIXEL_MEAN`.
fn preprocess(frame: Frame) -> Result<(Array4<f32>, Letterbox), ScrfdError> {
    let letterbox = Letterbox::fit(frame.width, frame.height);
    let gray = frame
        .into_gray_image()
        .ok_or_else(|| ScrfdError::InferenceFailed("frame buffer does not match dimensions".into()))?;
    let resized = imageops::resize(&gray, letterbox.new_w, letterbox.new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        // Grayscale replicated into all three channels
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = value;
        }
    }

    Ok((tensor, letterbox))
}

/// Map output tensors to strides by name ("score_8", "bbox_16", "kps_32", ...),
/// falling back to the standard positional export order
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position =
        |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));

    let named: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

/// Decode candidates above the confidence threshold for one stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let grid = INPUT_SIZE as usize / stride;
    let s = stride as f32;

    scores
        .iter()
        .take(grid * grid * ANCHORS_PER_CELL)
        .enumerate()
        .filter(|(_, &score)| score > CONFIDENCE_THRESHOLD)
        .filter_map(|(idx, &score)| {
            let cell = idx / ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;

            let b = bboxes.get(idx * 4..idx * 4 + 4)?;
            let k = kps.get(idx * 2 * KEYPOINTS..(idx + 1) * 2 * KEYPOINTS)?;

            let top_left = letterbox.to_frame(ax - b[0] * s, ay - b[1] * s);
            let bottom_right = letterbox.to_frame(ax + b[2] * s, ay + b[3] * s);
            let keypoints = std::array::from_fn(|i| {
                letterbox.to_frame(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s)
            });

            Some(Detection {
                x1: top_left.x,
                y1: top_left.y,
                x2: bottom_right.x,
                y2: bottom_right.y,
                score,
                keypoints,
            })
        })
        .collect()
}

/// Non-Maximum Suppression. Output is sorted by descending score.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    Detector, ModelHandle, ModelKind, ModelLoadError, ModelLoader,
    preprocess::{INPUT_SIZE, frame_to_nchw},
};
use crate::{
    model_download::{ensure_model_ready, model_path},
    types::{Frame, Point, RawDetection},
};

const TINY_VOC_ANCHORS: &[(f32, f32)] = &[
    (1.08, 1.19),
    (3.42, 4.41),
    (6.63, 11.38),
    (9.42, 5.11),
    (16.62, 10.52),
];

const COCO_ANCHORS: &[(f32, f32)] = &[
    (0.572_73, 0.677_385),
    (1.874_46, 2.062_53),
    (3.338_43, 5.474_34),
    (7.882_82, 3.527_78),
    (9.770_52, 9.168_28),
];

/// Region-layer layout of a YOLOv2 export: anchors in grid units, class
/// count and the byte → input scaling the network was trained with.
#[derive(Clone, Debug)]
pub struct YoloSpec {
    pub kind: ModelKind,
    pub anchors: &'static [(f32, f32)],
    pub num_classes: usize,
    pub pixel_scale: f32,
}

impl YoloSpec {
    pub fn for_kind(kind: ModelKind) -> Self {
        match kind {
            // The tiny VOC export normalizes internally and takes raw bytes.
            ModelKind::Fast => Self {
                kind,
                anchors: TINY_VOC_ANCHORS,
                num_classes: kind.classes().len(),
                pixel_scale: 1.0,
            },
            ModelKind::Full => Self {
                kind,
                anchors: COCO_ANCHORS,
                num_classes: kind.classes().len(),
                pixel_scale: 1.0 / 255.0,
            },
        }
    }

    fn channels_per_anchor(&self) -> usize {
        5 + self.num_classes
    }
}

const INTRA_THREADS: usize = 2;

/// Loads ONNX YOLOv2 weights from `models_dir`, downloading them first if
/// they are missing.
#[derive(Clone, Debug)]
pub struct OrtLoader {
    models_dir: PathBuf,
}

impl OrtLoader {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }
}

impl ModelLoader for OrtLoader {
    fn load(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError> {
        let path = model_path(&self.models_dir, kind);
        ensure_model_ready(kind, &path, |_evt| {})
            .map_err(|source| ModelLoadError::Fetch { kind, source })?;

        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.with_intra_threads(INTRA_THREADS))
            .and_then(|builder| builder.commit_from_file(&path))
            .map_err(|source| ModelLoadError::Session { kind, source })?;

        let detector = YoloDetector::new(session, YoloSpec::for_kind(kind))?;
        log::info!("loaded {kind} session from {}", path.display());
        Ok(ModelHandle::new(kind, detector))
    }
}

pub struct YoloDetector {
    session: Session,
    spec: YoloSpec,
}

impl YoloDetector {
    pub fn new(session: Session, spec: YoloSpec) -> Result<Self, ModelLoadError> {
        if session.inputs.len() != 1 {
            return Err(ModelLoadError::Shape {
                kind: spec.kind,
                reason: format!("expected one input, found {}", session.inputs.len()),
            });
        }
        if session.outputs.is_empty() {
            return Err(ModelLoadError::Shape {
                kind: spec.kind,
                reason: "model declares no outputs".to_string(),
            });
        }
        Ok(Self { session, spec })
    }
}

impl Detector for YoloDetector {
    fn infer(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<RawDetection>> {
        let input = frame_to_nchw(frame, INPUT_SIZE, self.spec.pixel_scale)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run ORT session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("model returned no outputs"));
        }

        let region = outputs[0].try_extract_array::<f32>()?;
        let shape = region.shape().to_vec();
        let data = region
            .as_slice()
            .ok_or_else(|| anyhow!("region output not contiguous"))?;

        decode_region(data, &shape, &self.spec, threshold)
    }
}

/// Decode a `[1, anchors * (5 + classes), grid_h, grid_w]` region tensor into
/// normalized boxes whose class-weighted confidence reaches `threshold`.
pub(crate) fn decode_region(
    data: &[f32],
    shape: &[usize],
    spec: &YoloSpec,
    threshold: f32,
) -> Result<Vec<RawDetection>> {
    let &[_, channels, grid_h, grid_w] = shape else {
        return Err(anyhow!(
            "unexpected region shape {:?}, need [batch, channels, h, w]",
            shape
        ));
    };

    let per_anchor = spec.channels_per_anchor();
    if channels != spec.anchors.len() * per_anchor {
        return Err(anyhow!(
            "region has {channels} channels, {} anchors x {per_anchor} expected",
            spec.anchors.len()
        ));
    }
    let cells = grid_h * grid_w;
    if data.len() < channels * cells {
        return Err(anyhow!(
            "region buffer too small: got {}, expected {}",
            data.len(),
            channels * cells
        ));
    }

    let at = |channel: usize, cy: usize, cx: usize| data[channel * cells + cy * grid_w + cx];

    let mut detections = Vec::new();
    let mut class_scores = vec![0.0f32; spec.num_classes];
    for cy in 0..grid_h {
        for cx in 0..grid_w {
            for (anchor_idx, &(anchor_w, anchor_h)) in spec.anchors.iter().enumerate() {
                let base = anchor_idx * per_anchor;
                let objectness = sigmoid(at(base + 4, cy, cx));
                if objectness < threshold {
                    continue;
                }

                for (class_id, score) in class_scores.iter_mut().enumerate() {
                    *score = at(base + 5 + class_id, cy, cx);
                }
                softmax_in_place(&mut class_scores);
                let Some((class_id, class_prob)) = class_scores
                    .iter()
                    .copied()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                else {
                    continue;
                };

                let confidence = objectness * class_prob;
                if confidence < threshold {
                    continue;
                }

                let center_x = (cx as f32 + sigmoid(at(base, cy, cx))) / grid_w as f32;
                let center_y = (cy as f32 + sigmoid(at(base + 1, cy, cx))) / grid_h as f32;
                let half_w = anchor_w * at(base + 2, cy, cx).exp() / grid_w as f32 / 2.0;
                let half_h = anchor_h * at(base + 3, cy, cx).exp() / grid_h as f32 / 2.0;

                let top_left = Point::new(
                    (center_x - half_w).clamp(0.0, 1.0),
                    (center_y - half_h).clamp(0.0, 1.0),
                );
                let bottom_right = Point::new(
                    (center_x + half_w).clamp(0.0, 1.0),
                    (center_y + half_h).clamp(0.0, 1.0),
                );
                if bottom_right.x <= top_left.x || bottom_right.y <= top_left.y {
                    continue;
                }

                detections.push(RawDetection {
                    class_id,
                    confidence,
                    top_left,
                    bottom_right,
                });
            }
        }
    }

    Ok(detections)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

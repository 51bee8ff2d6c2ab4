//! Greedy non-max suppression over raw model output.
//!
//! The highest-confidence box is kept, every remaining box overlapping it by
//! more than [`IOU_THRESHOLD`] is dropped, and the process repeats on what is
//! left. Suppression is purely geometric: boxes of different classes suppress
//! each other. Among equal confidences the earliest input wins, so the output
//! is deterministic and ordered by descending confidence.

use crate::types::{Detection, RawDetection};

use super::engine::ClassTable;

pub const IOU_THRESHOLD: f32 = 0.5;

/// Suppress duplicates and attach labels and colors from `classes`.
pub fn dedupe(detections: Vec<RawDetection>, classes: &ClassTable) -> Vec<Detection> {
    label_all(suppress(detections), classes)
}

/// Label raw detections without suppression, preserving input order.
pub fn label_all(detections: Vec<RawDetection>, classes: &ClassTable) -> Vec<Detection> {
    detections
        .into_iter()
        .map(|det| classes.detection(det))
        .collect()
}

pub fn suppress(mut remaining: Vec<RawDetection>) -> Vec<RawDetection> {
    let mut kept = Vec::with_capacity(remaining.len());

    while let Some(best_idx) = index_of_most_confident(&remaining) {
        let best = remaining.remove(best_idx);
        remaining.retain(|other| iou(&best, other) <= IOU_THRESHOLD);
        kept.push(best);
    }

    kept
}

fn index_of_most_confident(detections: &[RawDetection]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, det) in detections.iter().enumerate() {
        match best {
            Some((_, confidence)) if det.confidence <= confidence => {}
            // NaN never beats an existing pick, but is still drained.
            Some(_) if det.confidence.is_nan() => {}
            _ => best = Some((idx, det.confidence)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Intersection over union of two boxes. Non-overlapping boxes yield 0.
pub fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let left = a.top_left.x.max(b.top_left.x);
    let top = a.top_left.y.max(b.top_left.y);
    let right = a.bottom_right.x.min(b.bottom_right.x);
    let bottom = a.bottom_right.y.min(b.bottom_right.y);

    let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
    if inter <= 0.0 {
        return 0.0;
    }

    let union = a.area() + b.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

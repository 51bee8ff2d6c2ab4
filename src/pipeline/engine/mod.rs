mod classes;
mod preprocess;
mod yolo;

use std::{fmt, str::FromStr, sync::Arc};

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};

use crate::types::{Color, Detection, Frame, RawDetection};

pub use self::{
    preprocess::INPUT_SIZE,
    yolo::{OrtLoader, YoloDetector, YoloSpec},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Tiny YOLOv2 trained on the 20 VOC classes.
    Fast,
    /// YOLOv2 trained on the 80 COCO classes.
    Full,
}

impl ModelKind {
    pub fn label(&self) -> &'static str {
        match self {
            ModelKind::Fast => "Tiny YOLO",
            ModelKind::Full => "YOLO",
        }
    }

    pub fn classes(&self) -> ClassTable {
        match self {
            ModelKind::Fast => ClassTable::new(classes::VOC_CLASSES),
            ModelKind::Full => ClassTable::new(classes::COCO_CLASSES),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "tiny" | "tiny-yolo" => Ok(ModelKind::Fast),
            "full" | "yolo" => Ok(ModelKind::Full),
            other => Err(anyhow!("unknown model kind `{other}`, expected fast or full")),
        }
    }
}

/// Index → label table of a model family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassTable {
    names: &'static [&'static str],
}

impl ClassTable {
    pub const fn new(names: &'static [&'static str]) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn label(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("class {class_id}"))
    }

    pub fn detection(&self, raw: RawDetection) -> Detection {
        let label = self.label(raw.class_id);
        Detection {
            color: Color::for_label(&label),
            label,
            confidence: raw.confidence,
            top_left: raw.top_left,
            bottom_right: raw.bottom_right,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("failed to fetch {kind} weights")]
    Fetch {
        kind: ModelKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create {kind} inference session")]
    Session {
        kind: ModelKind,
        #[source]
        source: ort::Error,
    },
    #[error("{kind} model is not usable: {reason}")]
    Shape { kind: ModelKind, reason: String },
}

/// Runs one model over one frame. Implementations return boxes normalized to
/// `[0, 1]` relative to the frame.
pub trait Detector: Send + 'static {
    fn infer(&mut self, frame: &Frame, threshold: f32) -> anyhow::Result<Vec<RawDetection>>;
}

pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError>;
}

/// A loaded model with its class table. Resources are released when the last
/// reference is dropped, which lets an in-flight inference outlive a swap.
pub struct ModelHandle {
    kind: ModelKind,
    classes: ClassTable,
    detector: Mutex<Box<dyn Detector>>,
}

impl ModelHandle {
    pub fn new(kind: ModelKind, detector: impl Detector) -> Self {
        Self::with_classes(kind, kind.classes(), detector)
    }

    pub fn with_classes(kind: ModelKind, classes: ClassTable, detector: impl Detector) -> Self {
        Self {
            kind,
            classes,
            detector: Mutex::new(Box::new(detector)),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn classes(&self) -> ClassTable {
        self.classes
    }

    /// Only detections at or above `threshold` with a non-degenerate box are
    /// returned, whatever the underlying detector does.
    pub fn infer(&self, frame: &Frame, threshold: f32) -> anyhow::Result<Vec<RawDetection>> {
        let mut detections = self.detector.lock().infer(frame, threshold)?;
        detections.retain(|det| {
            det.confidence >= threshold
                && det.top_left.x < det.bottom_right.x
                && det.top_left.y < det.bottom_right.y
        });
        Ok(detections)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("kind", &self.kind)
            .field("classes", &self.classes.len())
            .finish_non_exhaustive()
    }
}

/// Holds the active model and swaps it on request.
pub struct DetectionEngine {
    loader: Arc<dyn ModelLoader>,
    active: RwLock<Option<Arc<ModelHandle>>>,
}

impl DetectionEngine {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            active: RwLock::new(None),
        }
    }

    /// Load `kind` and make it active. On failure the previous model, if
    /// any, stays active.
    pub fn load(&self, kind: ModelKind) -> Result<(), ModelLoadError> {
        let handle = match self.loader.load(kind) {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                log::error!("failed to load {kind} model: {err:?}");
                return Err(err);
            }
        };

        let previous = self.active.write().replace(handle);
        match previous {
            Some(previous) => log::info!("switched detector from {} to {kind}", previous.kind()),
            None => log::info!("{kind} detector ready"),
        }
        Ok(())
    }

    /// Snapshot of the active model. Holding it keeps that model alive even
    /// if a swap happens meanwhile.
    pub fn active(&self) -> Option<Arc<ModelHandle>> {
        self.active.read().clone()
    }

    pub fn active_kind(&self) -> Option<ModelKind> {
        self.active.read().as_ref().map(|handle| handle.kind())
    }

    /// Run the active model, or return nothing if no model has loaded yet.
    pub fn infer(&self, frame: &Frame, threshold: f32) -> anyhow::Result<Vec<RawDetection>> {
        match self.active() {
            Some(model) => model.infer(frame, threshold),
            None => Ok(Vec::new()),
        }
    }

    pub fn unload(&self) {
        if let Some(previous) = self.active.write().take() {
            log::info!("released {} detector", previous.kind());
        }
    }
}

impl fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("active", &self.active_kind())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::types::Point;

    fn frame() -> Frame {
        Frame::new(vec![0; 4 * 4 * 4], 4, 4, 1)
    }

    #[test]
    fn parses_model_kind() {
        assert_eq!("fast".parse::<ModelKind>().unwrap(), ModelKind::Fast);
        assert_eq!("YOLO".parse::<ModelKind>().unwrap(), ModelKind::Full);
        assert!("huge".parse::<ModelKind>().is_err());
    }

    #[test]
    fn class_tables_match_model_families() {
        assert_eq!(ModelKind::Fast.classes().len(), 20);
        assert_eq!(ModelKind::Full.classes().len(), 80);
        assert_eq!(ModelKind::Full.classes().label(2), "Car");
        assert_eq!(ModelKind::Fast.classes().label(99), "class 99");
    }

    #[test]
    fn infer_without_model_is_empty() {
        let engine = DetectionEngine::new(Arc::new(FakeLoader::default()));
        assert!(engine.infer(&frame(), 0.5).unwrap().is_empty());
        assert_eq!(engine.active_kind(), None);
    }

    #[test]
    fn failed_switch_keeps_previous_model() {
        let loader = Arc::new(FakeLoader {
            fail_full: true,
            ..Default::default()
        });
        let engine = DetectionEngine::new(loader);
        engine.load(ModelKind::Fast).unwrap();

        let err = engine.load(ModelKind::Full).unwrap_err();
        assert!(matches!(err, ModelLoadError::Shape { kind: ModelKind::Full, .. }));
        assert_eq!(engine.active_kind(), Some(ModelKind::Fast));
    }

    #[test]
    fn failed_first_load_leaves_engine_unset() {
        let engine = DetectionEngine::new(Arc::new(FakeLoader {
            fail_full: true,
            ..Default::default()
        }));
        assert!(engine.load(ModelKind::Full).is_err());
        assert_eq!(engine.active_kind(), None);
    }

    #[test]
    fn snapshot_survives_swap() {
        let engine = DetectionEngine::new(Arc::new(FakeLoader::default()));
        engine.load(ModelKind::Fast).unwrap();
        let in_flight = engine.active().unwrap();

        engine.load(ModelKind::Full).unwrap();
        let old = in_flight.infer(&frame(), 0.1).unwrap();
        assert_eq!(old[0].class_id, 6);
        let new = engine.infer(&frame(), 0.1).unwrap();
        assert_eq!(new[0].class_id, 2);
    }

    #[test]
    fn handle_enforces_threshold_and_box_validity() {
        let degenerate = RawDetection {
            class_id: 0,
            confidence: 0.99,
            top_left: Point::new(0.5, 0.5),
            bottom_right: Point::new(0.5, 0.7),
        };
        let handle = ModelHandle::new(
            ModelKind::Fast,
            FixedDetector {
                detections: vec![boxed(1, 0.3), boxed(2, 0.6), degenerate],
            },
        );
        let kept = handle.infer(&frame(), 0.6).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_id, 2);
    }
}

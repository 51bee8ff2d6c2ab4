use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::{
    controls::Controls,
    dedup,
    engine::{DetectionEngine, ModelKind},
    latest::Latest,
};
use crate::types::{Detection, Frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Loading(ModelKind),
    Running,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => f.write_str("idle"),
            LoopState::Loading(kind) => write!(f, "loading {kind}"),
            LoopState::Running => f.write_str("running"),
            LoopState::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InferenceConfig {
    /// Pause between iterations that found nothing to do. `None` spins.
    pub idle_backoff: Option<Duration>,
    /// Skip inference when neither the latest frame nor the threshold and
    /// filter settings changed since the last run.
    pub skip_repeated_frames: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Some(Duration::from_millis(1)),
            skip_repeated_frames: false,
        }
    }
}

enum Command {
    SwitchModel(ModelKind),
}

/// Shared cells the inference thread reads from and writes to.
#[derive(Clone)]
pub struct InferenceIo {
    pub frames: Arc<Latest<Frame>>,
    pub results: Arc<Latest<Vec<Detection>>>,
    pub controls: Arc<Controls>,
}

/// Handle to the inference thread. Model switches are queued and applied
/// between iterations, never during one.
pub struct InferenceLoop {
    stop: Arc<AtomicBool>,
    commands: Sender<Command>,
    state: Arc<Mutex<LoopState>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl InferenceLoop {
    pub fn start(
        engine: Arc<DetectionEngine>,
        initial: ModelKind,
        io: InferenceIo,
        config: InferenceConfig,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(LoopState::Idle));
        let (commands, command_rx) = unbounded();

        let worker = Worker {
            engine,
            io,
            config,
            stop: stop.clone(),
            state: state.clone(),
            commands: command_rx,
        };
        let handle = thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || worker.run(initial))?;

        Ok(Self {
            stop,
            commands,
            state,
            handle: Some(handle),
        })
    }

    /// Queue a model switch. The running inference, if any, finishes on the
    /// current model first.
    pub fn switch_model(&self, kind: ModelKind) {
        if self.commands.send(Command::SwitchModel(kind)).is_err() {
            log::warn!("inference loop is gone, ignoring switch to {kind}");
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InferenceLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    engine: Arc<DetectionEngine>,
    io: InferenceIo,
    config: InferenceConfig,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<LoopState>>,
    commands: Receiver<Command>,
}

impl Worker {
    fn run(self, initial: ModelKind) {
        self.load(initial);

        // Sequence, threshold bits and filter flag of the last processed input.
        let mut last_input: Option<(u64, u32, bool)> = None;
        let mut published_empty = false;

        while !self.stop.load(Ordering::Relaxed) {
            if let Some(kind) = self.pending_switch() {
                if self.load(kind) {
                    last_input = None;
                }
            }

            let Some(frame) = self.io.frames.read_latest() else {
                self.idle();
                continue;
            };

            let threshold = self.io.controls.threshold();
            let filter_duplicates = self.io.controls.filter_duplicates();
            let input = (frame.sequence, threshold.to_bits(), filter_duplicates);
            if self.config.skip_repeated_frames && last_input == Some(input) {
                self.idle();
                continue;
            }

            let Some(model) = self.engine.active() else {
                if !published_empty {
                    self.io.results.publish(Vec::new());
                    published_empty = true;
                }
                self.idle();
                continue;
            };

            let detections = match model.infer(&frame, threshold) {
                Ok(raw) if filter_duplicates => dedup::dedupe(raw, &model.classes()),
                Ok(raw) => dedup::label_all(raw, &model.classes()),
                Err(err) => {
                    log::warn!("{} inference failed: {err:?}", model.kind());
                    Vec::new()
                }
            };
            published_empty = detections.is_empty();
            self.io.results.publish(detections);
            last_input = Some(input);
        }

        self.engine.unload();
        self.set_state(LoopState::Stopped);
        log::info!("inference stopped");
    }

    /// Drain queued switches; only the most recent one matters.
    fn pending_switch(&self) -> Option<ModelKind> {
        self.commands
            .try_iter()
            .map(|command| match command {
                Command::SwitchModel(kind) => kind,
            })
            .last()
    }

    /// Returns `true` when `kind` became the active model.
    fn load(&self, kind: ModelKind) -> bool {
        if self.engine.active_kind() == Some(kind) {
            self.set_state(LoopState::Running);
            return false;
        }

        self.set_state(LoopState::Loading(kind));
        let loaded = match self.engine.load(kind) {
            // Boxes from the previous model's class table must not linger.
            Ok(()) => {
                self.io.results.clear();
                true
            }
            Err(_) => {
                match self.engine.active_kind() {
                    Some(current) => log::warn!("keeping {current} after failed switch to {kind}"),
                    None => log::warn!("no detector loaded, publishing empty results"),
                }
                false
            }
        };
        self.set_state(LoopState::Running);
        loaded
    }

    fn set_state(&self, state: LoopState) {
        *self.state.lock() = state;
    }

    fn idle(&self) {
        match self.config.idle_backoff {
            Some(backoff) => thread::sleep(backoff),
            None => thread::yield_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Instant};

    use crossbeam_channel::bounded;

    use super::*;
    use crate::{
        pipeline::engine::{
            Detector, ModelHandle, ModelLoadError, ModelLoader,
            testing::{FakeLoader, FixedDetector, boxed},
        },
        types::{Point, RawDetection},
    };

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn io() -> InferenceIo {
        InferenceIo {
            frames: Arc::new(Latest::new()),
            results: Arc::new(Latest::new()),
            controls: Arc::new(Controls::new(0.3)),
        }
    }

    fn publish_frame(io: &InferenceIo, sequence: u64) {
        io.frames
            .publish(Frame::new(vec![0; 8 * 8 * 4], 8, 8, sequence));
    }

    fn labels(io: &InferenceIo) -> Option<Vec<String>> {
        io.results
            .read_latest()
            .map(|dets| dets.iter().map(|d| d.label.clone()).collect())
    }

    #[test]
    fn publishes_nothing_until_a_frame_arrives() {
        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(FakeLoader::default())));
        let inference = InferenceLoop::start(
            engine.clone(),
            ModelKind::Fast,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();

        assert!(wait_for(|| inference.state() == LoopState::Running));
        thread::sleep(Duration::from_millis(20));
        assert!(io.results.read_latest().is_none());

        publish_frame(&io, 1);
        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));

        let state = inference.state.clone();
        inference.stop();
        assert_eq!(*state.lock(), LoopState::Stopped);
        assert_eq!(engine.active_kind(), None);
    }

    #[test]
    fn failed_switch_keeps_running_on_previous_model() {
        let io = io();
        let loader = Arc::new(FakeLoader {
            fail_full: true,
            ..Default::default()
        });
        let engine = Arc::new(DetectionEngine::new(loader.clone()));
        let inference = InferenceLoop::start(
            engine.clone(),
            ModelKind::Fast,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();
        publish_frame(&io, 1);
        assert!(wait_for(|| labels(&io).is_some()));

        inference.switch_model(ModelKind::Full);
        assert!(wait_for(|| loader.loads.load(Ordering::SeqCst) == 2));
        assert!(wait_for(|| inference.state() == LoopState::Running));
        assert_eq!(engine.active_kind(), Some(ModelKind::Fast));
        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));
    }

    #[test]
    fn first_load_failure_yields_empty_results() {
        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(FakeLoader {
            fail_full: true,
            ..Default::default()
        })));
        let _inference = InferenceLoop::start(
            engine,
            ModelKind::Full,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();
        publish_frame(&io, 1);
        assert!(wait_for(|| labels(&io) == Some(Vec::new())));
    }

    #[test]
    fn filter_toggle_controls_suppression() {
        struct Overlapping;
        impl ModelLoader for Overlapping {
            fn load(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError> {
                Ok(ModelHandle::new(
                    kind,
                    FixedDetector {
                        detections: vec![boxed(14, 0.9), boxed(14, 0.8)],
                    },
                ))
            }
        }

        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(Overlapping)));
        let _inference = InferenceLoop::start(
            engine,
            ModelKind::Fast,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();
        publish_frame(&io, 1);
        assert!(wait_for(|| labels(&io).is_some_and(|l| l.len() == 1)));

        io.controls.set_filter_duplicates(false);
        assert!(wait_for(|| labels(&io).is_some_and(|l| l.len() == 2)));
    }

    #[test]
    fn threshold_is_read_every_iteration() {
        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(FakeLoader::default())));
        let _inference = InferenceLoop::start(
            engine,
            ModelKind::Fast,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();
        publish_frame(&io, 1);
        assert!(wait_for(|| labels(&io).is_some_and(|l| l.len() == 1)));

        io.controls.set_threshold(0.95);
        assert!(wait_for(|| labels(&io).is_some_and(|l| l.is_empty())));
    }

    #[test]
    fn preloaded_engine_still_reports_running() {
        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(FakeLoader::default())));
        engine.load(ModelKind::Fast).unwrap();

        let inference = InferenceLoop::start(
            engine.clone(),
            ModelKind::Fast,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();
        publish_frame(&io, 1);
        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));
        assert!(wait_for(|| inference.state() == LoopState::Running));
    }

    #[test]
    fn skipping_repeats_still_follows_settings_and_switches() {
        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(FakeLoader::default())));
        let inference = InferenceLoop::start(
            engine.clone(),
            ModelKind::Fast,
            io.clone(),
            InferenceConfig {
                skip_repeated_frames: true,
                ..Default::default()
            },
        )
        .unwrap();
        // One frame only, as with a paused camera.
        publish_frame(&io, 1);
        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));

        io.controls.set_threshold(0.95);
        assert!(wait_for(|| labels(&io) == Some(Vec::new())));
        io.controls.set_threshold(0.3);
        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));

        inference.switch_model(ModelKind::Full);
        assert!(wait_for(|| engine.active_kind() == Some(ModelKind::Full)));
        // The switch clears results; the same frame must be run again.
        thread::sleep(Duration::from_millis(30));
        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));
    }

    #[test]
    fn inference_errors_publish_empty_and_keep_going() {
        struct Flaky {
            fail: Arc<AtomicBool>,
            calls: Arc<AtomicUsize>,
        }

        impl Detector for Flaky {
            fn infer(&mut self, _frame: &Frame, _threshold: f32) -> anyhow::Result<Vec<RawDetection>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail.load(Ordering::SeqCst) {
                    anyhow::bail!("session run failed");
                }
                Ok(vec![boxed(6, 0.9)])
            }
        }

        struct FlakyLoader {
            fail: Arc<AtomicBool>,
            calls: Arc<AtomicUsize>,
        }

        impl ModelLoader for FlakyLoader {
            fn load(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError> {
                Ok(ModelHandle::new(
                    kind,
                    Flaky {
                        fail: self.fail.clone(),
                        calls: self.calls.clone(),
                    },
                ))
            }
        }

        let fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(FlakyLoader {
            fail: fail.clone(),
            calls: calls.clone(),
        })));
        let inference = InferenceLoop::start(
            engine,
            ModelKind::Fast,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();
        publish_frame(&io, 1);

        assert!(wait_for(|| labels(&io) == Some(Vec::new())));
        // Failures repeat without ending the loop.
        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 3));
        assert_eq!(inference.state(), LoopState::Running);

        fail.store(false, Ordering::SeqCst);
        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));

        fail.store(true, Ordering::SeqCst);
        assert!(wait_for(|| labels(&io) == Some(Vec::new())));
        assert_eq!(inference.state(), LoopState::Running);
    }

    /// Fast model blocks inside `infer` until released; Full answers at once.
    struct GatedLoader {
        entered: Sender<()>,
        release: Receiver<()>,
        fast_calls: Arc<AtomicUsize>,
    }

    struct GatedDetector {
        entered: Sender<()>,
        release: Receiver<()>,
        calls: Arc<AtomicUsize>,
    }

    impl Detector for GatedDetector {
        fn infer(&mut self, _frame: &Frame, _threshold: f32) -> anyhow::Result<Vec<RawDetection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(vec![RawDetection {
                class_id: 14,
                confidence: 0.9,
                top_left: Point::new(0.1, 0.1),
                bottom_right: Point::new(0.4, 0.4),
            }])
        }
    }

    impl ModelLoader for GatedLoader {
        fn load(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError> {
            Ok(match kind {
                ModelKind::Fast => ModelHandle::new(
                    kind,
                    GatedDetector {
                        entered: self.entered.clone(),
                        release: self.release.clone(),
                        calls: self.fast_calls.clone(),
                    },
                ),
                ModelKind::Full => ModelHandle::new(
                    kind,
                    FixedDetector {
                        detections: vec![boxed(2, 0.8)],
                    },
                ),
            })
        }
    }

    #[test]
    fn switch_during_inference_finishes_on_old_model() {
        let (entered_tx, entered_rx) = bounded(8);
        let (release_tx, release_rx) = bounded(8);
        let fast_calls = Arc::new(AtomicUsize::new(0));
        let loader = GatedLoader {
            entered: entered_tx,
            release: release_rx,
            fast_calls: fast_calls.clone(),
        };

        let io = io();
        let engine = Arc::new(DetectionEngine::new(Arc::new(loader)));
        let inference = InferenceLoop::start(
            engine.clone(),
            ModelKind::Fast,
            io.clone(),
            InferenceConfig::default(),
        )
        .unwrap();
        publish_frame(&io, 1);

        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("fast inference never started");
        inference.switch_model(ModelKind::Full);
        // Still mid-flight on the fast model.
        assert_eq!(engine.active_kind(), Some(ModelKind::Fast));
        release_tx.send(()).unwrap();

        assert!(wait_for(|| labels(&io) == Some(vec!["Car".to_string()])));
        assert_eq!(engine.active_kind(), Some(ModelKind::Full));
        assert_eq!(fast_calls.load(Ordering::SeqCst), 1);
        assert_eq!(inference.state(), LoopState::Running);
    }
}

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Result, anyhow};
use crossbeam_channel::bounded;

use super::{controls::Controls, latest::Latest, rgba_converter::RgbaFrame};
use crate::types::Frame;

/// An opened camera. Dropping it releases the device.
pub trait FrameGrabber {
    /// Current frame, or `None` if the device has nothing new yet.
    fn grab(&mut self) -> Result<Option<RgbaFrame>>;

    fn close(&mut self) {}
}

/// Something that can open a camera. Opening happens on the capture thread,
/// so the grabber itself never has to cross threads.
pub trait CameraSource: Send + 'static {
    type Grabber: FrameGrabber;

    fn name(&self) -> String;

    fn open(&self) -> Result<Self::Grabber>;
}

/// Handle to a running capture thread.
#[derive(Debug)]
pub struct FrameSource {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FrameSource {
    /// Open the camera and start publishing frames into `frames`. Fails fast
    /// if the device cannot be opened.
    pub fn start<S: CameraSource>(
        source: S,
        frames: Arc<Latest<Frame>>,
        controls: Arc<Controls>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let name = source.name();

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let mut grabber = match source.open() {
                    Ok(grabber) => {
                        let _ = ready_tx.send(Ok(()));
                        grabber
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                run_capture_loop(&mut grabber, &frames, &controls, &stop_flag);
                grabber.close();
                log::info!("capture stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("capturing from {name}");
                Ok(Self {
                    stop,
                    handle: Some(handle),
                })
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err.context(format!("failed to open {name}")))
            }
            Err(_) => {
                let _ = handle.join();
                Err(anyhow!("capture thread for {name} exited before opening"))
            }
        }
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

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_capture_loop<G: FrameGrabber>(
    grabber: &mut G,
    frames: &Latest<Frame>,
    controls: &Controls,
    stop: &AtomicBool,
) {
    let mut sequence: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let frame_start = Instant::now();
        let image = match grabber.grab() {
            Ok(Some(image)) => image,
            Ok(None) => {
                thread::yield_now();
                continue;
            }
            Err(err) => {
                log::warn!(
                    "camera frame read failed (after {:?}): {err:?}",
                    frame_start.elapsed()
                );
                continue;
            }
        };

        sequence += 1;

        // Keep draining the device while paused so it stays warm.
        if controls.paused() {
            continue;
        }

        frames.publish(Frame::new(image.rgba, image.width, image.height, sequence));
    }
}

#[cfg(feature = "camera-nokhwa")]
pub use self::nokhwa_camera::{NokhwaCamera, NokhwaGrabber};

#[cfg(feature = "camera-nokhwa")]
mod nokhwa_camera {
    use anyhow::{Result, anyhow};
    use nokhwa::{
        Camera,
        pixel_format::RgbFormat,
        utils::{CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    };

    use super::{CameraSource, FrameGrabber};
    use crate::pipeline::rgba_converter::{self, RgbaFrame};

    // Prefer pixel formats that are widely supported on macOS (the built-in cameras
    // often reject YUYV even though Nokhwa reports it).
    const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
        FrameFormat::RAWRGB,
        FrameFormat::RAWBGR,
        FrameFormat::GRAY,
        FrameFormat::YUYV,
        FrameFormat::NV12,
        FrameFormat::MJPEG,
    ];

    fn requested_formats() -> [RequestedFormat<'static>; 3] {
        [
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestResolution,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestFrameRate,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ]
    }

    /// Camera addressed by its system index.
    #[derive(Clone, Debug)]
    pub struct NokhwaCamera {
        index: u32,
    }

    impl NokhwaCamera {
        pub fn new(index: u32) -> Self {
            Self { index }
        }
    }

    impl CameraSource for NokhwaCamera {
        type Grabber = NokhwaGrabber;

        fn name(&self) -> String {
            format!("camera #{}", self.index)
        }

        fn open(&self) -> Result<NokhwaGrabber> {
            let index = CameraIndex::Index(self.index);
            let mut last_err = None;

            for requested in requested_formats() {
                match Camera::new(index.clone(), requested) {
                    Ok(mut camera) => match camera.open_stream() {
                        Ok(()) => {
                            log::info!(
                                "{} opened at {:?}",
                                camera.info().human_name(),
                                camera.camera_format()
                            );
                            return Ok(NokhwaGrabber { camera });
                        }
                        Err(err) => last_err = Some(err.into()),
                    },
                    Err(err) => last_err = Some(err.into()),
                }
            }

            Err(last_err
                .unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
        }
    }

    pub struct NokhwaGrabber {
        camera: Camera,
    }

    impl FrameGrabber for NokhwaGrabber {
        fn grab(&mut self) -> Result<Option<RgbaFrame>> {
            let buffer = self.camera.frame()?;
            rgba_converter::convert_camera_frame(&buffer).map(Some)
        }

        fn close(&mut self) {
            if let Err(err) = self.camera.stop_stream() {
                log::warn!("failed to stop camera stream: {err:?}");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::VecDeque, sync::atomic::AtomicUsize};

    use anyhow::anyhow;

    use super::*;

    /// Scripted camera: each step yields a frame, nothing, or an error.
    #[derive(Clone)]
    pub enum Step {
        Frame(u32, u32),
        Nothing,
        Fail,
    }

    #[derive(Default)]
    pub struct ScriptedCamera {
        pub steps: Vec<Step>,
        pub fail_open: bool,
        pub closed: Arc<AtomicBool>,
        /// Frames handed out so far.
        pub grabbed: Arc<AtomicUsize>,
    }

    pub struct ScriptedGrabber {
        steps: VecDeque<Step>,
        closed: Arc<AtomicBool>,
        grabbed: Arc<AtomicUsize>,
    }

    impl CameraSource for ScriptedCamera {
        type Grabber = ScriptedGrabber;

        fn name(&self) -> String {
            "scripted camera".to_string()
        }

        fn open(&self) -> Result<ScriptedGrabber> {
            if self.fail_open {
                return Err(anyhow!("device busy"));
            }
            Ok(ScriptedGrabber {
                steps: self.steps.iter().cloned().collect(),
                closed: self.closed.clone(),
                grabbed: self.grabbed.clone(),
            })
        }
    }

    impl FrameGrabber for ScriptedGrabber {
        fn grab(&mut self) -> Result<Option<RgbaFrame>> {
            match self.steps.pop_front() {
                Some(Step::Frame(width, height)) => {
                    self.grabbed.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(RgbaFrame {
                        rgba: vec![128; (width * height * 4) as usize],
                        width,
                        height,
                    }))
                }
                Some(Step::Fail) => Err(anyhow!("device hiccup")),
                Some(Step::Nothing) | None => Ok(None),
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

use std::{
    io::BufReader,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{bounded, select, tick, unbounded};
use yolocam::{
    config::AppConfig,
    console::{self, ConsoleCommand, HELP},
    pipeline::{
        Controls, DetectionEngine, FrameSource, InferenceConfig, InferenceIo, InferenceLoop,
        Latest, OrtLoader, RenderLoop, render,
    },
    types::{Detection, Frame},
};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    env_logger::init();

    let config = AppConfig::from_env();
    log::info!("starting with {config:?}");

    let controls = Arc::new(Controls::new(config.threshold));
    controls.set_filter_duplicates(config.filter_duplicates);
    let frames: Arc<Latest<Frame>> = Arc::new(Latest::new());
    let results: Arc<Latest<Vec<Detection>>> = Arc::new(Latest::new());

    let (interrupt_tx, interrupt_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;

    let source = open_camera(&config, frames.clone(), controls.clone())?;

    let loader = OrtLoader::new(config.models_dir.clone());
    log::info!("model weights live in {}", loader.models_dir().display());
    let engine = Arc::new(DetectionEngine::new(Arc::new(loader)));
    let inference = InferenceLoop::start(
        engine.clone(),
        config.model,
        InferenceIo {
            frames: frames.clone(),
            results: results.clone(),
            controls: controls.clone(),
        },
        InferenceConfig::default(),
    )?;

    // `command_tx` stays alive here so a closed stdin leaves the channel open
    // and the pipeline keeps running until `quit` or Ctrl-C.
    let (command_tx, command_rx) = unbounded();
    // Detached: the reader blocks on stdin and dies with the process.
    let _console = console::spawn_reader(BufReader::new(std::io::stdin()), command_tx.clone())?;
    println!("{HELP}");

    let ticker = tick(Duration::from_secs(1) / config.fps);
    let mut render = RenderLoop::new(frames.clone(), results.clone());
    let mut last_status = Instant::now();
    let mut ticks: u64 = 0;
    let mut fresh: u64 = 0;

    loop {
        select! {
            recv(ticker) -> _ => {
                let output = render.tick(config.canvas);
                ticks += 1;
                if output.fresh_results {
                    fresh += 1;
                    for inst in &output.instructions {
                        log::debug!("{} at {:?}", inst.label, inst.rect);
                    }
                }
                if last_status.elapsed() >= STATUS_INTERVAL {
                    log::info!(
                        "{ticks} render ticks, {fresh} fresh results, {} boxes on screen",
                        output.instructions.len()
                    );
                    last_status = Instant::now();
                    ticks = 0;
                    fresh = 0;
                }
            }
            recv(command_rx) -> command => {
                let command = command.unwrap_or(ConsoleCommand::Quit);
                if command.apply(&controls) {
                    continue;
                }
                match command {
                    ConsoleCommand::SwitchModel(kind) => inference.switch_model(kind),
                    ConsoleCommand::Snapshot(path) => {
                        let path = path.unwrap_or_else(|| config.snapshot_path.clone());
                        match save_snapshot(&frames, &results, &path) {
                            Ok(()) => println!("saved {}", path.display()),
                            Err(err) => log::error!("snapshot failed: {err:#}"),
                        }
                    }
                    ConsoleCommand::Status => {
                        let frame = frames.read_latest();
                        println!(
                            "state: {}, model: {}, threshold: {:.2}, paused: {}, filter duplicates: {}, frame: {} ({}), detections: {}",
                            inference.state(),
                            engine
                                .active_kind()
                                .map_or_else(|| "none".to_string(), |kind| kind.to_string()),
                            controls.threshold(),
                            controls.paused(),
                            controls.filter_duplicates(),
                            frame.as_ref().map_or(0, |frame| frame.sequence),
                            frame.as_ref().map_or_else(
                                || "none yet".to_string(),
                                |frame| format!("{:?} old", frame.timestamp.elapsed()),
                            ),
                            results.read_latest().map_or(0, |dets| dets.len()),
                        );
                    }
                    ConsoleCommand::Quit => break,
                    _ => {}
                }
            }
            recv(interrupt_rx) -> _ => {
                log::info!("interrupted");
                break;
            }
        }
    }

    drop(command_tx);
    inference.stop();
    source.stop();
    Ok(())
}

fn save_snapshot(
    frames: &Latest<Frame>,
    results: &Latest<Vec<Detection>>,
    path: &Path,
) -> Result<()> {
    let frame = frames
        .read_latest()
        .ok_or_else(|| anyhow!("no frame captured yet"))?;
    let detections = results.read_latest().unwrap_or_default();
    let instructions = render::draw_instructions(&detections, frame.width, frame.height);
    render::save_snapshot(&frame, &instructions, path)
}

#[cfg(feature = "camera-nokhwa")]
fn open_camera(
    config: &AppConfig,
    frames: Arc<Latest<Frame>>,
    controls: Arc<Controls>,
) -> Result<FrameSource> {
    use yolocam::pipeline::NokhwaCamera;

    FrameSource::start(NokhwaCamera::new(config.camera_index), frames, controls)
}

#[cfg(not(feature = "camera-nokhwa"))]
fn open_camera(
    _config: &AppConfig,
    _frames: Arc<Latest<Frame>>,
    _controls: Arc<Controls>,
) -> Result<FrameSource> {
    anyhow::bail!("built without camera support; enable the `camera-nokhwa` feature")
}

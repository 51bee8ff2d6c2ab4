use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};

use crate::{
    model_download::DEFAULT_MODELS_DIR,
    pipeline::{DEFAULT_THRESHOLD, ModelKind},
};

pub const MODELS_DIR_ENV: &str = "YOLOCAM_MODELS_DIR";
pub const DEFAULT_FPS: u32 = 30;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(name = "yolocam", version, about = "Live camera object detection")]
pub struct AppConfig {
    /// System index of the camera to open.
    #[arg(long = "camera", default_value_t = 0)]
    pub camera_index: u32,
    /// Model to start with: fast (tiny YOLOv2, VOC) or full (YOLOv2, COCO).
    #[arg(long, default_value = "fast", value_parser = parse_model)]
    pub model: ModelKind,
    /// Minimum confidence for a detection to be shown.
    #[arg(long, default_value_t = DEFAULT_THRESHOLD, value_parser = parse_threshold)]
    pub threshold: f32,
    /// Where ONNX weights are cached.
    #[arg(long, env = MODELS_DIR_ENV, default_value = DEFAULT_MODELS_DIR)]
    pub models_dir: PathBuf,
    /// Render ticks per second.
    #[arg(long, default_value_t = DEFAULT_FPS, value_parser = clap::value_parser!(u32).range(1..))]
    pub fps: u32,
    /// Display size for draw instructions, e.g. 640x480. Follows the camera
    /// when unset.
    #[arg(long, value_parser = parse_size)]
    pub canvas: Option<(u32, u32)>,
    /// Where the `snapshot` console command writes when given no path.
    #[arg(long = "snapshot", default_value = "snapshot.png")]
    pub snapshot_path: PathBuf,
    /// Show overlapping boxes instead of suppressing duplicates.
    #[arg(long = "no-filter", action = ArgAction::SetFalse)]
    pub filter_duplicates: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            model: ModelKind::Fast,
            threshold: DEFAULT_THRESHOLD,
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            fps: DEFAULT_FPS,
            canvas: None,
            snapshot_path: PathBuf::from("snapshot.png"),
            filter_duplicates: true,
        }
    }
}

impl AppConfig {
    /// Parse the process arguments, exiting with usage on error.
    pub fn from_env() -> Self {
        Self::parse()
    }

    /// Parse `--flag value` pairs, program name excluded.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let argv = std::iter::once("yolocam".to_string()).chain(args.iter().cloned());
        Ok(Self::try_parse_from(argv)?)
    }
}

fn parse_model(raw: &str) -> Result<ModelKind, String> {
    raw.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn parse_threshold(raw: &str) -> Result<f32, String> {
    let threshold: f32 = raw
        .parse()
        .map_err(|_| format!("`{raw}` is not a number"))?;
    if !(0.0..=1.0).contains(&threshold) {
        return Err("must be between 0 and 1".to_string());
    }
    Ok(threshold)
}

fn parse_size(raw: &str) -> Result<(u32, u32), String> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| "must look like 640x480".to_string())?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| format!("invalid width `{w}`"))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| format!("invalid height `{h}`"))?;
    if width == 0 || height == 0 {
        return Err("dimensions must be non-zero".to_string());
    }
    Ok((width, height))
}

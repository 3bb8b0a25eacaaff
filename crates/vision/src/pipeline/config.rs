//! Configuration parsing for the segmentation pipeline.
//!
//! CLI arguments are layered over an optional TOML file and resolved once into
//! a [`SegmentationConfig`], which downstream stages share without re-parsing
//! flags. Precedence is CLI flag, then file value, then built-in default.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use ml_core::InputMode;
use serde::Deserialize;

use crate::synchronizer::PreprocessOptions;

/// Per-channel means (B, G, R order) of the dataset the networks were trained on.
pub const DEFAULT_PIXEL_MEANS: [f32; 3] = [102.9801, 115.9465, 122.7717];
pub const DEFAULT_PAD_ALIGNMENT: u32 = 16;
pub const DEFAULT_SYNC_SLOP_MS: u64 = 100;
pub const DEFAULT_SYNC_QUEUE_SIZE: usize = 1;
pub const DEFAULT_IDLE_SLEEP_MS: u64 = 5;
pub const DEFAULT_SINK_CAPACITY: usize = 4;

/// Which sensor rig is recorded; decides stream names and the frame id only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CameraProfile {
    #[default]
    D415,
    Azure,
    /// Kinect-style driver namespace, e.g. `kinect1`.
    Kinect(String),
}

impl CameraProfile {
    pub fn color_topic(&self) -> String {
        match self {
            CameraProfile::D415 => "/camera/color/image_raw".into(),
            CameraProfile::Azure => "/k4a/rgb/image_raw".into(),
            CameraProfile::Kinect(name) => format!("/{name}/rgb/image_color"),
        }
    }

    pub fn depth_topic(&self) -> String {
        match self {
            CameraProfile::D415 => "/camera/aligned_depth_to_color/image_raw".into(),
            CameraProfile::Azure => "/k4a/depth_to_rgb/image_raw".into(),
            CameraProfile::Kinect(name) => format!("/{name}/depth_registered/image"),
        }
    }

    pub fn camera_info_topic(&self) -> String {
        match self {
            CameraProfile::D415 => "/camera/color/camera_info".into(),
            CameraProfile::Azure => "/k4a/rgb/camera_info".into(),
            CameraProfile::Kinect(name) => format!("/{name}/rgb/camera_info"),
        }
    }

    /// Optical frame the color images are expressed in.
    pub fn frame_id(&self) -> String {
        match self {
            CameraProfile::D415 => "measured/camera_color_optical_frame".into(),
            CameraProfile::Azure => "rgb_camera_link".into(),
            CameraProfile::Kinect(name) => format!("{name}_rgb_optical_frame"),
        }
    }
}

impl FromStr for CameraProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        if name.is_empty() {
            bail!("camera profile must not be empty");
        }
        if name.contains('/') {
            bail!("camera profile {name:?} must be a bare name, not a topic");
        }
        Ok(match name.to_ascii_lowercase().as_str() {
            "d415" => CameraProfile::D415,
            "azure" => CameraProfile::Azure,
            _ => CameraProfile::Kinect(name.to_string()),
        })
    }
}

impl fmt::Display for CameraProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraProfile::D415 => f.write_str("D415"),
            CameraProfile::Azure => f.write_str("Azure"),
            CameraProfile::Kinect(name) => f.write_str(name),
        }
    }
}

/// Channel order of the color tensor handed to the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    #[default]
    Bgr,
}

impl FromStr for ChannelOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(ChannelOrder::Rgb),
            "bgr" => Ok(ChannelOrder::Bgr),
            other => bail!("unknown channel order {other:?} (expected rgb or bgr)"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log level to `debug`.
    pub verbose: bool,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct SegmentationConfig {
    /// Directory holding the recorded session.
    pub recording_root: PathBuf,
    pub camera: CameraProfile,
    /// TorchScript primary network.
    pub model_path: PathBuf,
    /// TorchScript crop refinement network; absent means primary only.
    pub refinement_model_path: Option<PathBuf>,
    pub input_mode: InputMode,
    /// Resize factor applied to both images before inference.
    pub im_scale: f64,
    pub pixel_means: [f32; 3],
    pub channel_order: ChannelOrder,
    pub pad_alignment: u32,
    pub sync_slop: Duration,
    pub sync_queue_size: usize,
    /// Dispatcher back-off when no new frame is available.
    pub idle_sleep: Duration,
    /// Run inference again on a frame that was already processed.
    pub rerun_stale_frames: bool,
    /// Pace playback by the recorded stamps.
    pub realtime_playback: bool,
    /// Force CPU inference.
    pub use_cpu: bool,
    /// Bound of each channel-backed output sink.
    pub sink_capacity: usize,
    pub telemetry: TelemetryOptions,
}

impl SegmentationConfig {
    /// Defaults for everything but the recording and the primary network.
    pub fn new(recording_root: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            recording_root: recording_root.into(),
            camera: CameraProfile::default(),
            model_path: model_path.into(),
            refinement_model_path: None,
            input_mode: InputMode::default(),
            im_scale: 1.0,
            pixel_means: DEFAULT_PIXEL_MEANS,
            channel_order: ChannelOrder::default(),
            pad_alignment: DEFAULT_PAD_ALIGNMENT,
            sync_slop: Duration::from_millis(DEFAULT_SYNC_SLOP_MS),
            sync_queue_size: DEFAULT_SYNC_QUEUE_SIZE,
            idle_sleep: Duration::from_millis(DEFAULT_IDLE_SLEEP_MS),
            rerun_stale_frames: false,
            realtime_playback: true,
            use_cpu: false,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            telemetry: TelemetryOptions::default(),
        }
    }

    pub fn preprocess(&self) -> PreprocessOptions {
        PreprocessOptions {
            im_scale: self.im_scale,
            pad_alignment: self.pad_alignment,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.im_scale.is_finite() && self.im_scale > 0.0) {
            bail!("--scale must be a positive number, got {}", self.im_scale);
        }
        if self.pad_alignment == 0 {
            bail!("--pad-alignment must be at least 1");
        }
        if self.sync_queue_size == 0 {
            bail!("--queue-size must be at least 1");
        }
        if self.sink_capacity == 0 {
            bail!("--sink-capacity must be at least 1");
        }
        if self.pixel_means.iter().any(|m| !m.is_finite()) {
            bail!("--pixel-means must be finite numbers");
        }
        Ok(())
    }
}

/// Values accepted from a `--config` TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub recording: Option<PathBuf>,
    pub camera: Option<String>,
    pub model: Option<PathBuf>,
    pub refine_model: Option<PathBuf>,
    pub input: Option<InputMode>,
    pub scale: Option<f64>,
    pub pixel_means: Option<Vec<f32>>,
    pub channel_order: Option<ChannelOrder>,
    pub pad_alignment: Option<u32>,
    pub slop_ms: Option<u64>,
    pub queue_size: Option<usize>,
    pub idle_sleep_ms: Option<u64>,
    pub rerun_stale: Option<bool>,
    pub realtime: Option<bool>,
    pub cpu: Option<bool>,
    pub verbose: Option<bool>,
    pub sink_capacity: Option<usize>,
    pub chrome_trace: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// CLI arguments accepted by the `segment` subcommand.
#[derive(Debug, Default, Args)]
pub struct SegmentCliArgs {
    /// Recorded session directory.
    #[arg(value_name = "RECORDING")]
    pub recording: Option<PathBuf>,
    /// TOML file supplying defaults for any flag below.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Camera profile: d415, azure, or a kinect driver namespace.
    #[arg(long = "camera", value_name = "NAME")]
    pub camera: Option<CameraProfile>,
    /// TorchScript primary segmentation network.
    #[arg(long = "model", value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// TorchScript crop refinement network.
    #[arg(long = "refine-model", value_name = "PATH")]
    pub refine_model: Option<PathBuf>,
    /// Network input modality: COLOR, DEPTH or RGBD.
    #[arg(long = "input", value_name = "MODE")]
    pub input: Option<InputMode>,
    /// Resize factor applied before inference.
    #[arg(long = "scale", value_name = "FACTOR")]
    pub scale: Option<f64>,
    /// Per-channel means subtracted after normalisation, in network channel order.
    #[arg(long = "pixel-means", value_name = "C0,C1,C2", value_delimiter = ',')]
    pub pixel_means: Option<Vec<f32>>,
    /// Color channel order expected by the network (rgb or bgr).
    #[arg(long = "channel-order", value_name = "ORDER")]
    pub channel_order: Option<ChannelOrder>,
    /// Working dimensions are padded to a multiple of this.
    #[arg(long = "pad-alignment", value_name = "PX")]
    pub pad_alignment: Option<u32>,
    /// Largest stamp difference still paired, in milliseconds.
    #[arg(long = "slop-ms", value_name = "MS")]
    pub slop_ms: Option<u64>,
    /// Per-stream look-ahead of the pairing queues.
    #[arg(long = "queue-size", value_name = "N")]
    pub queue_size: Option<usize>,
    /// Dispatcher sleep when no new frame is available, in milliseconds.
    #[arg(long = "idle-sleep-ms", value_name = "MS")]
    pub idle_sleep_ms: Option<u64>,
    /// Re-run inference on a frame that was already processed.
    #[arg(long = "rerun-stale", action = clap::ArgAction::SetTrue)]
    pub rerun_stale: bool,
    /// Replay as fast as possible instead of at the recorded rate.
    #[arg(long = "no-realtime", action = clap::ArgAction::SetTrue)]
    pub no_realtime: bool,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Queue bound of each in-process output sink.
    #[arg(long = "sink-capacity", value_name = "N")]
    pub sink_capacity: Option<usize>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<SegmentCliArgs> for SegmentationConfig {
    type Error = anyhow::Error;

    fn try_from(args: SegmentCliArgs) -> Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::layered(args, file)
    }
}

impl SegmentationConfig {
    /// Resolve CLI flags over file values over defaults.
    pub fn layered(args: SegmentCliArgs, file: FileConfig) -> Result<Self> {
        let recording_root = args.recording.or(file.recording).ok_or_else(|| {
            anyhow!("Missing recording. Provide <RECORDING> or `recording` in the config file.")
        })?;
        let model_path = args.model.or(file.model).ok_or_else(|| {
            anyhow!("Missing model path. Provide --model <path> or `model` in the config file.")
        })?;

        let mut config = Self::new(recording_root, model_path);

        if let Some(camera) = args.camera {
            config.camera = camera;
        } else if let Some(name) = file.camera.as_deref() {
            config.camera = name.parse()?;
        }
        config.refinement_model_path = args.refine_model.or(file.refine_model);
        if let Some(mode) = args.input.or(file.input) {
            config.input_mode = mode;
        }
        if let Some(scale) = args.scale.or(file.scale) {
            config.im_scale = scale;
        }
        if let Some(means) = args.pixel_means.or(file.pixel_means) {
            config.pixel_means = <[f32; 3]>::try_from(means.as_slice()).map_err(|_| {
                anyhow!("--pixel-means takes exactly three values, got {}", means.len())
            })?;
        }
        if let Some(order) = args.channel_order.or(file.channel_order) {
            config.channel_order = order;
        }
        if let Some(alignment) = args.pad_alignment.or(file.pad_alignment) {
            config.pad_alignment = alignment;
        }
        if let Some(ms) = args.slop_ms.or(file.slop_ms) {
            config.sync_slop = Duration::from_millis(ms);
        }
        if let Some(size) = args.queue_size.or(file.queue_size) {
            config.sync_queue_size = size;
        }
        if let Some(ms) = args.idle_sleep_ms.or(file.idle_sleep_ms) {
            config.idle_sleep = Duration::from_millis(ms);
        }
        if let Some(capacity) = args.sink_capacity.or(file.sink_capacity) {
            config.sink_capacity = capacity;
        }

        // Boolean flags can only switch a file value on, never off.
        config.rerun_stale_frames = args.rerun_stale || file.rerun_stale.unwrap_or(false);
        config.realtime_playback = !args.no_realtime && file.realtime.unwrap_or(true);
        config.use_cpu = args.use_cpu || file.cpu.unwrap_or(false);
        config.telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace.or(file.chrome_trace),
            verbose: args.verbose || file.verbose.unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }
}

//! Consumer side of the pipeline: snapshot the latest frame, run inference,
//! project the labels back and publish them.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use ml_core::{InputMode, ModelInput, SegmentationOutput, Segmenter};
use ndarray::{Array4, Axis};
use tracing::{debug, warn};

use crate::{
    frame::{PipelineContext, SensorFrame},
    geometry::{CameraIntrinsics, backproject_depth},
    pipeline::{
        config::{ChannelOrder, SegmentationConfig},
        telemetry::LogThrottle,
        watchdog::{HealthComponent, StreamHealth},
    },
    projector::Projector,
    publisher::{PublishReport, Publisher},
};

/// Model input settings fixed at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOptions {
    pub input_mode: InputMode,
    /// Means in 0..255 units, listed in `channel_order`.
    pub pixel_means: [f32; 3],
    pub channel_order: ChannelOrder,
    pub rerun_stale_frames: bool,
    pub idle_sleep: Duration,
}

impl From<&SegmentationConfig> for DispatchOptions {
    fn from(config: &SegmentationConfig) -> Self {
        Self {
            input_mode: config.input_mode,
            pixel_means: config.pixel_means,
            channel_order: config.channel_order,
            rerun_stale_frames: config.rerun_stale_frames,
            idle_sleep: config.idle_sleep,
        }
    }
}

/// What a single dispatch cycle did.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// Nothing has been paired yet.
    NoFrame,
    /// The latest frame was already processed.
    Stale { sequence: u64 },
    Published { sequence: u64, report: PublishReport },
    /// The engine failed or panicked; nothing was published.
    InferenceFailed { sequence: u64 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub cycles: u64,
    pub no_frame: u64,
    pub stale: u64,
    pub published: u64,
    pub failed: u64,
}

/// Build the `[1, 3, H, W]` network input for `frame`.
///
/// Color becomes `v / 255 − mean / 255` in the configured channel order. The
/// point map is added only when the input mode needs geometry.
pub fn build_model_input(
    frame: &SensorFrame,
    intrinsics: &CameraIntrinsics,
    options: &DispatchOptions,
) -> ModelInput {
    let (width, height) = frame.working_size();
    let source_channel = match options.channel_order {
        ChannelOrder::Rgb => [0, 1, 2],
        ChannelOrder::Bgr => [2, 1, 0],
    };
    let means = options.pixel_means.map(|m| m / 255.0);
    let color = Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| {
            let value = frame.color.get_pixel(x as u32, y as u32).0[source_channel[c]];
            value as f32 / 255.0 - means[c]
        },
    );

    let geometry = options.input_mode.requires_geometry().then(|| {
        backproject_depth(&frame.depth, intrinsics)
            .permuted_axes([2, 0, 1])
            .insert_axis(Axis(0))
            .as_standard_layout()
            .into_owned()
    });

    ModelInput { color, geometry }
}

/// Drives one frame at a time from the slot through inference to the sinks.
pub struct Dispatcher {
    context: PipelineContext,
    segmenter: Segmenter,
    projector: Projector,
    publisher: Publisher,
    options: DispatchOptions,
    last_sequence: Option<u64>,
    health: Option<Arc<StreamHealth>>,
    failure_log: LogThrottle,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        context: PipelineContext,
        segmenter: Segmenter,
        projector: Projector,
        publisher: Publisher,
        options: DispatchOptions,
    ) -> Self {
        Self {
            context,
            segmenter,
            projector,
            publisher,
            options,
            last_sequence: None,
            health: None,
            failure_log: LogThrottle::new(Duration::from_secs(1)),
            stats: DispatchStats::default(),
        }
    }

    pub fn with_health(mut self, health: Arc<StreamHealth>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Sequence of the last frame taken from the slot.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn idle_sleep(&self) -> Duration {
        self.options.idle_sleep
    }

    /// Run one cycle. Never fails; engine errors become `InferenceFailed`.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        let _cycle = tracing::debug_span!("dispatch.cycle").entered();
        let started = Instant::now();
        if let Some(health) = &self.health {
            health.beat(HealthComponent::Dispatcher);
        }
        self.stats.cycles += 1;

        let Some(frame) = self.context.slot.latest() else {
            self.stats.no_frame += 1;
            return CycleOutcome::NoFrame;
        };
        let sequence = frame.sequence;
        if !self.options.rerun_stale_frames && self.last_sequence == Some(sequence) {
            self.stats.stale += 1;
            return CycleOutcome::Stale { sequence };
        }
        self.last_sequence = Some(sequence);

        let output = match self.infer(&frame) {
            Ok(output) => output,
            Err(err) => {
                self.stats.failed += 1;
                metrics::counter!("seg_inference_failures_total").increment(1);
                if let Some(suppressed) = self.failure_log.ready() {
                    warn!(
                        "inference failed on frame {sequence}: {err:#} ({suppressed} similar suppressed)"
                    );
                }
                return CycleOutcome::InferenceFailed { sequence };
            }
        };

        let (width, height) = (frame.original_width, frame.original_height);
        let primary = self.projector.project(&output.primary, width, height);
        let refined = output
            .refined
            .as_ref()
            .map(|labels| self.projector.project(labels, width, height));
        let report = self.publisher.publish(&frame, &primary, refined.as_ref());

        self.stats.published += 1;
        metrics::histogram!("seg_cycle_seconds").record(started.elapsed().as_secs_f64());
        debug!(sequence, stamp_ns = frame.stamp_ns, "frame published");
        CycleOutcome::Published { sequence, report }
    }

    /// Cycle until `stop` returns true, sleeping when there is nothing new.
    pub fn run_until(&mut self, mut stop: impl FnMut(&Self) -> bool) {
        while !self.context.is_shutting_down() && !stop(self) {
            match self.run_cycle() {
                CycleOutcome::NoFrame | CycleOutcome::Stale { .. } => {
                    thread::sleep(self.options.idle_sleep)
                }
                CycleOutcome::Published { .. } | CycleOutcome::InferenceFailed { .. } => {}
            }
        }
    }

    fn infer(&mut self, frame: &SensorFrame) -> Result<SegmentationOutput> {
        let input = build_model_input(frame, &self.context.intrinsics, &self.options);
        let _span = tracing::debug_span!("dispatch.inference", mode = %self.options.input_mode)
            .entered();
        let started = Instant::now();
        let segmenter = &mut self.segmenter;
        let result = panic::catch_unwind(AssertUnwindSafe(|| segmenter.run(&input)))
            .map_err(|payload| anyhow!("inference panicked: {}", panic_message(payload.as_ref())))
            .and_then(|result| result);
        metrics::histogram!("seg_inference_seconds").record(started.elapsed().as_secs_f64());
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

//! Pipeline wiring: playback → ingest thread → frame slot → dispatcher.
//!
//! The ingest thread owns the [`FrameSynchronizer`] and multiplexes both
//! playback receivers with `select!`. The dispatcher runs on the calling
//! thread. A run ends on Ctrl+C, or once playback is exhausted and the last
//! stored frame has been taken by the dispatcher.

pub mod config;
pub mod telemetry;
pub mod watchdog;

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, never, select};
use ml_core::Segmenter;
use rgbd_ingest::{
    ImageMessage, IngestError, PlaybackOptions, StreamKind, SyncStats, load_camera_info,
    spawn_playback_reader,
};
use tracing::{info, warn};

use crate::{
    dispatcher::{DispatchOptions, DispatchStats, Dispatcher},
    frame::PipelineContext,
    geometry::CameraIntrinsics,
    projector::Projector,
    publisher::{ImageSink, Publisher},
    synchronizer::FrameSynchronizer,
};
use config::SegmentationConfig;
use watchdog::{HealthComponent, StreamHealth, spawn_watchdog};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install the process-wide Ctrl+C handler once.
pub fn install_interrupt_handler() {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(|| {
        if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

/// Whether Ctrl+C was received since the handler was installed.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Counters gathered over one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sync: SyncStats,
    /// Frames written to the slot.
    pub frames_stored: u64,
    /// Pairs dropped by decoding or conversion.
    pub pairs_rejected: u64,
    pub dispatch: DispatchStats,
    pub interrupted: bool,
}

struct IngestReport {
    sync: SyncStats,
    stored: u64,
    rejected: u64,
}

type PlaybackRx = Receiver<Result<ImageMessage, IngestError>>;

/// Run the pipeline over the configured recording until it is exhausted or interrupted.
///
/// Startup failures (missing camera info, degenerate intrinsics, missing
/// topics) are returned as errors; nothing after startup is fatal.
pub fn run(
    config: Arc<SegmentationConfig>,
    segmenter: Segmenter,
    sinks: Vec<Box<dyn ImageSink>>,
) -> Result<RunSummary> {
    let _pipeline = tracing::info_span!("seg.pipeline", camera = %config.camera).entered();
    install_interrupt_handler();

    let root = config.recording_root.as_path();
    let camera = &config.camera;
    let info_topic = camera.camera_info_topic();
    let camera_info = load_camera_info(root, &info_topic)
        .with_context(|| format!("no camera info for {info_topic} under {}", root.display()))?;
    let intrinsics = CameraIntrinsics::from_camera_info(&camera_info)?.scaled(config.im_scale);
    info!(
        "intrinsics fx={:.2} fy={:.2} px={:.2} py={:.2} at scale {}",
        intrinsics.fx, intrinsics.fy, intrinsics.px, intrinsics.py, config.im_scale
    );

    let playback = PlaybackOptions {
        realtime: config.realtime_playback,
        frame_id: camera.frame_id(),
        ..PlaybackOptions::default()
    };
    let color_topic = camera.color_topic();
    let depth_topic = camera.depth_topic();
    let color_rx = spawn_playback_reader(root, &color_topic, StreamKind::Color, playback.clone())
        .with_context(|| format!("cannot replay {color_topic}"))?;
    let depth_rx = spawn_playback_reader(root, &depth_topic, StreamKind::Depth, playback)
        .with_context(|| format!("cannot replay {depth_topic}"))?;

    let context = PipelineContext::new(intrinsics);
    let health = Arc::new(StreamHealth::new());
    let ingest_done = Arc::new(AtomicBool::new(false));

    let synchronizer = FrameSynchronizer::new(
        context.slot.clone(),
        config.preprocess(),
        config.sync_queue_size,
        config.sync_slop,
    )
    .with_fallback_frame_id(camera.frame_id());
    let ingest = {
        let health = health.clone();
        let shutdown = context.shutdown.clone();
        let done = ingest_done.clone();
        telemetry::spawn_thread("seg-ingest", move || {
            let report = ingest_loop(color_rx, depth_rx, synchronizer, &health, &shutdown);
            done.store(true, Ordering::SeqCst);
            report
        })
        .context("failed to spawn ingest thread")?
    };
    let watchdog = spawn_watchdog(health.clone(), context.shutdown.clone())
        .context("failed to spawn watchdog thread")?;

    if segmenter.has_refinement() {
        info!("publishing primary and refined outputs");
    }
    let mut dispatcher = Dispatcher::new(
        context.clone(),
        segmenter,
        Projector::new(config.im_scale),
        Publisher::new(sinks),
        DispatchOptions::from(config.as_ref()),
    )
    .with_health(health);

    info!("segmenting {} (press Ctrl+C to stop)", root.display());
    let started = Instant::now();
    let slot = context.slot.clone();
    dispatcher.run_until(|dispatcher| {
        if interrupted() {
            return true;
        }
        // Drained: no more pairs can arrive and the newest one was taken.
        ingest_done.load(Ordering::SeqCst)
            && (slot.replacements() == 0 || dispatcher.last_sequence() == Some(slot.replacements()))
    });
    let was_interrupted = interrupted();
    context.request_shutdown();

    let report = ingest
        .join()
        .map_err(|_| anyhow!("ingest thread panicked"))?;
    if watchdog.join().is_err() {
        warn!("watchdog thread panicked");
    }

    let summary = RunSummary {
        sync: report.sync,
        frames_stored: report.stored,
        pairs_rejected: report.rejected,
        dispatch: dispatcher.stats(),
        interrupted: was_interrupted,
    };
    info!(
        "finished in {:.1}s: {} pairs, {} frames stored, {} published, {} inference failures",
        started.elapsed().as_secs_f64(),
        summary.sync.paired,
        summary.frames_stored,
        summary.dispatch.published,
        summary.dispatch.failed
    );
    Ok(summary)
}

fn ingest_loop(
    color_rx: PlaybackRx,
    depth_rx: PlaybackRx,
    mut synchronizer: FrameSynchronizer,
    health: &StreamHealth,
    shutdown: &AtomicBool,
) -> IngestReport {
    let closed: PlaybackRx = never();
    let mut color = Some(color_rx);
    let mut depth = Some(depth_rx);

    while color.is_some() || depth.is_some() {
        if shutdown.load(Ordering::Relaxed) || interrupted() {
            break;
        }
        let event = select! {
            recv(color.as_ref().unwrap_or(&closed)) -> msg => Some((StreamKind::Color, msg)),
            recv(depth.as_ref().unwrap_or(&closed)) -> msg => Some((StreamKind::Depth, msg)),
            default(Duration::from_millis(100)) => None,
        };
        let Some((stream, msg)) = event else {
            continue;
        };

        match (stream, msg) {
            (StreamKind::Color, Ok(Ok(msg))) => {
                health.beat(HealthComponent::ColorStream);
                synchronizer.on_color(msg);
            }
            (StreamKind::Depth, Ok(Ok(msg))) => {
                health.beat(HealthComponent::DepthStream);
                synchronizer.on_depth(msg);
            }
            (stream, Ok(Err(err))) => {
                metrics::counter!("seg_messages_invalid_total", "stream" => stream.label())
                    .increment(1);
                warn!("skipping {stream} message: {err}");
            }
            (StreamKind::Color, Err(_)) => color = None,
            (StreamKind::Depth, Err(_)) => depth = None,
        }
    }

    synchronizer.finish();
    IngestReport {
        sync: synchronizer.sync_stats(),
        stored: synchronizer.stored(),
        rejected: synchronizer.rejected(),
    }
}

//! The `segment` subcommand: load the networks, wire the sinks, run the pipeline.

use std::{sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use ml_core::Segmenter;
use tracing::{info, warn};
use vision::{
    ChannelSink, DirectorySink, ImageSink, SegmentationConfig,
    pipeline::{self, telemetry},
};

use crate::{
    cli::SegmentArgs,
    preview::{PreviewBoard, spawn_board_feeder, spawn_preview_server},
};

pub fn run_from_args(args: SegmentArgs) -> Result<()> {
    let SegmentArgs {
        pipeline: pipeline_args,
        preview,
        dump_dir,
    } = args;
    let config = Arc::new(SegmentationConfig::try_from(pipeline_args)?);
    let _telemetry = telemetry::enter_runtime(&config.telemetry);
    telemetry::init_metrics_recorder();

    info!(
        "camera {} | input {} | scale {} | slop {:?} | queue {}",
        config.camera, config.input_mode, config.im_scale, config.sync_slop, config.sync_queue_size
    );
    let segmenter = load_segmenter(&config)?;

    let mut sinks: Vec<Box<dyn ImageSink>> = Vec::new();
    let mut preview_parts = None;
    if let Some(addr) = preview {
        let board = Arc::new(PreviewBoard::new());
        let (sink, rx) = ChannelSink::new(config.sink_capacity);
        let feeder = spawn_board_feeder(board.clone(), rx)
            .context("failed to spawn preview feeder thread")?;
        let server = spawn_preview_server(addr, board)?;
        sinks.push(Box::new(sink));
        preview_parts = Some((feeder, server));
    }
    if let Some(dir) = dump_dir {
        let sink = DirectorySink::create(&dir)?;
        info!("writing outputs under {}", sink.root().display());
        sinks.push(Box::new(sink));
    }
    if sinks.is_empty() {
        warn!("no --preview or --dump-dir given; outputs are only logged and counted");
    }

    let summary = pipeline::run(config.clone(), segmenter, sinks)?;
    info!(
        "paired {} | dropped color {} depth {} | out of order {} | rejected {}",
        summary.sync.paired,
        summary.sync.dropped_first,
        summary.sync.dropped_second,
        summary.sync.out_of_order,
        summary.pairs_rejected
    );

    if let Some((feeder, server)) = preview_parts {
        if feeder.join().is_err() {
            warn!("preview feeder thread panicked");
        }
        if !summary.interrupted {
            info!("playback finished; preview stays up until Ctrl+C");
            while !pipeline::interrupted() {
                thread::sleep(Duration::from_millis(200));
            }
        }
        server.stop();
    }
    Ok(())
}

#[cfg(feature = "with-tch")]
fn load_segmenter(config: &SegmentationConfig) -> Result<Segmenter> {
    use ml_core::tch::{Cuda, Device};

    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    info!(
        "CUDA available: {} (devices: {})",
        Cuda::is_available(),
        Cuda::device_count()
    );
    ml_core::torch::load_segmenter(
        &config.model_path,
        config.refinement_model_path.as_deref(),
        device,
    )
}

#[cfg(not(feature = "with-tch"))]
fn load_segmenter(config: &SegmentationConfig) -> Result<Segmenter> {
    Err(anyhow::anyhow!(
        "cannot load {}: rgbd-seg was built without the `with-tch` feature \
         (rebuild with `--features with-tch` and a libtorch installation)",
        config.model_path.display()
    ))
}

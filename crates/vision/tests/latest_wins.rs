use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use image::Luma;
use ml_core::{InputMode, LabelMap, ModelInput, SegmentationModel, Segmenter};
use rgbd_ingest::{Header, ImageMessage, encodings};
use vision::{
    ChannelOrder, ChannelSink, CycleOutcome, DispatchOptions, Dispatcher, FrameSynchronizer,
    OutputChannel, PipelineContext, PreprocessOptions, Projector, Publisher,
    geometry::CameraIntrinsics,
};

const MS: i64 = 1_000_000;

/// Records the red channel of the first pixel of every frame it is given.
struct Recorder(Arc<Mutex<Vec<f32>>>);

impl SegmentationModel for Recorder {
    fn segment(&mut self, input: &ModelInput) -> Result<LabelMap> {
        self.0.lock().unwrap().push(input.color[[0, 0, 0, 0]]);
        let (h, w) = input.size();
        Ok(LabelMap::from_pixel(w as u32, h as u32, Luma([1])))
    }
}

fn color(stamp_ms: i64, red: u8) -> ImageMessage {
    ImageMessage::new(
        Header::new(stamp_ms * MS, "cam"),
        2,
        2,
        encodings::RGB8,
        [red, 0, 0].repeat(4),
    )
}

fn depth(stamp_ms: i64) -> ImageMessage {
    ImageMessage::new(
        Header::new(stamp_ms * MS, "cam"),
        2,
        2,
        encodings::TYPE_32FC1,
        1.5f32.to_le_bytes().repeat(4),
    )
}

#[test]
fn only_the_newest_of_many_pairings_is_dispatched() {
    let context = PipelineContext::new(CameraIntrinsics {
        fx: 1.0,
        fy: 1.0,
        px: 1.0,
        py: 1.0,
    });
    let mut synchronizer = FrameSynchronizer::new(
        context.slot.clone(),
        PreprocessOptions::default(),
        1,
        Duration::from_millis(100),
    );
    for i in 0..20u8 {
        let stamp = i as i64 * 33;
        synchronizer.on_color(color(stamp, i * 10));
        synchronizer.on_depth(depth(stamp + 2));
    }
    assert_eq!(synchronizer.stored(), 20);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (sink, rx) = ChannelSink::new(16);
    let mut dispatcher = Dispatcher::new(
        context.clone(),
        Segmenter::primary_only(Recorder(seen.clone())),
        Projector::new(1.0),
        Publisher::new(vec![Box::new(sink)]),
        DispatchOptions {
            input_mode: InputMode::Color,
            pixel_means: [0.0; 3],
            channel_order: ChannelOrder::Rgb,
            rerun_stale_frames: false,
            idle_sleep: Duration::from_millis(1),
        },
    );

    assert!(matches!(
        dispatcher.run_cycle(),
        CycleOutcome::Published { sequence: 20, .. }
    ));
    assert_eq!(dispatcher.run_cycle(), CycleOutcome::Stale { sequence: 20 });

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!((seen[0] - 190.0 / 255.0).abs() < 1e-6);

    let stamps: Vec<i64> = rx
        .try_iter()
        .filter(|(channel, _)| *channel == OutputChannel::Label)
        .map(|(_, msg)| msg.header.stamp_ns)
        .collect();
    assert_eq!(stamps, vec![19 * 33 * MS]);
}

#[test]
fn rerun_mode_processes_the_same_frame_again() {
    let context = PipelineContext::new(CameraIntrinsics {
        fx: 1.0,
        fy: 1.0,
        px: 0.0,
        py: 0.0,
    });
    let mut synchronizer = FrameSynchronizer::new(
        context.slot.clone(),
        PreprocessOptions::default(),
        1,
        Duration::from_millis(100),
    );
    synchronizer.on_color(color(0, 50));
    synchronizer.on_depth(depth(0));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = Dispatcher::new(
        context,
        Segmenter::primary_only(Recorder(seen.clone())),
        Projector::new(1.0),
        Publisher::new(Vec::new()),
        DispatchOptions {
            input_mode: InputMode::Rgbd,
            pixel_means: [0.0; 3],
            channel_order: ChannelOrder::Rgb,
            rerun_stale_frames: true,
            idle_sleep: Duration::from_millis(1),
        },
    );
    for _ in 0..3 {
        assert!(matches!(
            dispatcher.run_cycle(),
            CycleOutcome::Published { sequence: 1, .. }
        ));
    }
    assert_eq!(seen.lock().unwrap().len(), 3);
}

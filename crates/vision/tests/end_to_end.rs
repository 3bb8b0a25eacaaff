use std::{fs, path::Path, sync::Arc};

use anyhow::Result;
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use ml_core::{LabelMap, ModelInput, RefinementModel, SegmentationModel, Segmenter};
use rgbd_ingest::{ImageMessage, encodings};
use vision::{
    CameraProfile, ChannelSink, OutputChannel, SegmentationConfig, count_objects, run,
};

const STAMP_NS: i64 = 1_700_000_000_000_000_000;

/// Two objects: the top-left and bottom-right quadrants.
struct TwoObjects;

impl SegmentationModel for TwoObjects {
    fn segment(&mut self, input: &ModelInput) -> Result<LabelMap> {
        let (h, w) = input.size();
        let (h, w) = (h as u32, w as u32);
        Ok(LabelMap::from_fn(w, h, |x, y| {
            let id = match (x < w / 2, y < h / 2) {
                (true, true) => 1,
                (false, false) => 2,
                _ => 0,
            };
            Luma([id])
        }))
    }
}

struct Passthrough;

impl RefinementModel for Passthrough {
    fn refine(&mut self, _input: &ModelInput, initial: &LabelMap) -> Result<LabelMap> {
        Ok(initial.clone())
    }
}

fn write_recording(root: &Path, camera: &CameraProfile) {
    let topic_dir = |topic: String| root.join(topic.trim_start_matches('/'));

    let color_dir = topic_dir(camera.color_topic());
    fs::create_dir_all(&color_dir).unwrap();
    RgbImage::from_fn(64, 64, |x, y| Rgb([x as u8 * 4, y as u8 * 4, 90]))
        .save(color_dir.join(format!("{STAMP_NS}.png")))
        .unwrap();

    let depth_dir = topic_dir(camera.depth_topic());
    fs::create_dir_all(&depth_dir).unwrap();
    ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(64, 64, Luma([1200]))
        .save(depth_dir.join(format!("{}.png", STAMP_NS + 4_000_000)))
        .unwrap();

    let info_path = root.join(format!(
        "{}.json",
        camera.camera_info_topic().trim_start_matches('/')
    ));
    fs::create_dir_all(info_path.parent().unwrap()).unwrap();
    fs::write(
        info_path,
        r#"{"frame_id":"optical","width":64,"height":64,
            "K":[60.0,0.0,32.0,0.0,60.0,32.0,0.0,0.0,1.0]}"#,
    )
    .unwrap();
}

fn segment_recording(
    im_scale: f64,
    segmenter: Segmenter,
) -> (vision::RunSummary, Vec<(OutputChannel, ImageMessage)>) {
    let dir = tempfile::tempdir().unwrap();
    let camera = CameraProfile::default();
    write_recording(dir.path(), &camera);

    let mut config = SegmentationConfig::new(dir.path(), "unused.pt");
    config.realtime_playback = false;
    config.im_scale = im_scale;

    let (sink, rx) = ChannelSink::new(16);
    let summary = run(Arc::new(config), segmenter, vec![Box::new(sink)]).unwrap();
    (summary, rx.try_iter().collect())
}

fn assert_tagged(messages: &[(OutputChannel, ImageMessage)]) {
    for (channel, msg) in messages {
        assert_eq!(msg.header.stamp_ns, STAMP_NS, "{}", channel.topic());
        assert_eq!(msg.header.frame_id, CameraProfile::default().frame_id());
        assert_eq!((msg.width, msg.height), (64, 64));
        assert_eq!(msg.encoding, channel.encoding());
        let channels = if msg.encoding == encodings::MONO8 { 1 } else { 3 };
        assert_eq!(msg.data.len(), 64 * 64 * channels);
    }
}

fn labels_of(msg: &ImageMessage) -> LabelMap {
    LabelMap::from_raw(msg.width, msg.height, msg.data.clone()).unwrap()
}

#[test]
fn refined_run_publishes_on_all_four_channels() {
    let (summary, messages) = segment_recording(
        1.0,
        Segmenter::with_refinement(TwoObjects, Passthrough),
    );

    assert_eq!(summary.sync.paired, 1);
    assert_eq!(summary.dispatch.published, 1);
    let channels: Vec<_> = messages.iter().map(|(c, _)| *c).collect();
    assert_eq!(
        channels,
        vec![
            OutputChannel::Label,
            OutputChannel::Overlay,
            OutputChannel::LabelRefined,
            OutputChannel::OverlayRefined,
        ]
    );
    assert_tagged(&messages);
    assert_eq!(count_objects(&labels_of(&messages[0].1)), 2);
    assert_eq!(count_objects(&labels_of(&messages[2].1)), 2);
}

#[test]
fn primary_only_run_publishes_two_channels() {
    let (summary, messages) = segment_recording(1.0, Segmenter::primary_only(TwoObjects));

    assert_eq!(summary.frames_stored, 1);
    let channels: Vec<_> = messages.iter().map(|(c, _)| *c).collect();
    assert_eq!(channels, vec![OutputChannel::Label, OutputChannel::Overlay]);
    assert_tagged(&messages);
}

#[test]
fn scaled_run_projects_labels_back_to_capture_size() {
    let (_, messages) = segment_recording(0.5, Segmenter::primary_only(TwoObjects));

    assert_tagged(&messages);
    let labels = labels_of(&messages[0].1);
    assert_eq!(count_objects(&labels), 2);
    assert_eq!(labels.get_pixel(0, 0).0[0], 1);
    assert_eq!(labels.get_pixel(63, 63).0[0], 2);
    assert_eq!(labels.get_pixel(63, 0).0[0], 0);
}

#[test]
fn missing_camera_info_is_a_startup_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SegmentationConfig::new(dir.path(), "unused.pt");
    config.realtime_playback = false;
    let err = run(
        Arc::new(config),
        Segmenter::primary_only(TwoObjects),
        Vec::new(),
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("camera info"));
}

//! Latest-wins RGB-D instance segmentation.
//!
//! Color and depth arrive on independent streams and are paired by
//! approximate timestamp. Each pair is scaled and padded for the network and
//! stored in a single [`FrameSlot`]; the newest pair always replaces the
//! previous one. The [`Dispatcher`] repeatedly snapshots that slot, runs the
//! [`Segmenter`](ml_core::Segmenter), maps the labels back to capture
//! resolution with the [`Projector`] and hands label maps and overlays to the
//! [`Publisher`].

pub mod dispatcher;
pub mod frame;
pub mod geometry;
pub mod palette;
pub mod pipeline;
pub mod projector;
pub mod publisher;
pub mod resample;
pub mod synchronizer;

pub use dispatcher::{CycleOutcome, DispatchOptions, DispatchStats, Dispatcher, build_model_input};
pub use frame::{DepthImage, FrameSlot, PipelineContext, SensorFrame};
pub use geometry::{CameraIntrinsics, GeometryMap, backproject_depth};
pub use pipeline::{
    RunSummary,
    config::{CameraProfile, ChannelOrder, SegmentCliArgs, SegmentationConfig, TelemetryOptions},
    run,
};
pub use projector::Projector;
pub use publisher::{
    ChannelSink, DirectorySink, ImageSink, OutputChannel, PublishReport, Publisher, count_objects,
};
pub use synchronizer::{FrameError, FrameSynchronizer, PreprocessOptions, prepare_frame};

//! Output side: label maps and their overlays fanned out to image sinks.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use image::ExtendedColorType;
use ml_core::LabelMap;
use rgbd_ingest::{Header, ImageMessage, encodings};
use tracing::{info, warn};

use crate::{frame::SensorFrame, palette::render_overlay};

/// The four output streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputChannel {
    Label,
    LabelRefined,
    Overlay,
    OverlayRefined,
}

impl OutputChannel {
    pub const ALL: [OutputChannel; 4] = [
        OutputChannel::Label,
        OutputChannel::LabelRefined,
        OutputChannel::Overlay,
        OutputChannel::OverlayRefined,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            OutputChannel::Label => "seg_label",
            OutputChannel::LabelRefined => "seg_label_refined",
            OutputChannel::Overlay => "seg_image",
            OutputChannel::OverlayRefined => "seg_image_refined",
        }
    }

    pub fn encoding(self) -> &'static str {
        match self {
            OutputChannel::Label | OutputChannel::LabelRefined => encodings::MONO8,
            OutputChannel::Overlay | OutputChannel::OverlayRefined => encodings::RGB8,
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.topic() == topic)
    }
}

/// Destination for published images. Implementations must not block.
pub trait ImageSink: Send {
    fn publish(&mut self, channel: OutputChannel, msg: ImageMessage) -> Result<()>;
}

/// In-process sink backed by a bounded channel; drops the message when full.
pub struct ChannelSink {
    tx: Sender<(OutputChannel, ImageMessage)>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<(OutputChannel, ImageMessage)>) {
        let (tx, rx) = bounded(capacity.max(1));
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Shared counter of messages dropped because the receiver lagged.
    pub fn dropped(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl ImageSink for ChannelSink {
    fn publish(&mut self, channel: OutputChannel, msg: ImageMessage) -> Result<()> {
        match self.tx.try_send((channel, msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("seg_sink_dropped_total", "topic" => channel.topic())
                    .increment(1);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(anyhow!("receiver for {} went away", channel.topic()))
            }
        }
    }
}

/// Writes every message as `<root>/<topic>/<stamp_ns>.png`.
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for channel in OutputChannel::ALL {
            let dir = root.join(channel.topic());
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create dump directory {}", dir.display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageSink for DirectorySink {
    fn publish(&mut self, channel: OutputChannel, msg: ImageMessage) -> Result<()> {
        let color_type = match msg.encoding.as_str() {
            encodings::MONO8 => ExtendedColorType::L8,
            encodings::RGB8 => ExtendedColorType::Rgb8,
            other => return Err(anyhow!("cannot write {other} images as png")),
        };
        let path = self
            .root
            .join(channel.topic())
            .join(format!("{}.png", msg.header.stamp_ns));
        image::save_buffer(&path, &msg.data, msg.width, msg.height, color_type)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Number of distinct non-background labels.
pub fn count_objects(labels: &LabelMap) -> usize {
    labels
        .pixels()
        .map(|p| p.0[0])
        .filter(|&id| id != 0)
        .collect::<BTreeSet<_>>()
        .len()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub objects: usize,
    pub refined_objects: Option<usize>,
    /// Messages handed to sinks (per sink, not counting failures).
    pub messages: usize,
}

/// Renders and fans projected label maps out to every sink.
pub struct Publisher {
    sinks: Vec<Box<dyn ImageSink>>,
}

impl Publisher {
    pub fn new(sinks: Vec<Box<dyn ImageSink>>) -> Self {
        Self { sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Publish the primary outputs and, when present, the refined ones.
    ///
    /// Every message carries the source frame's stamp and frame id.
    pub fn publish(
        &mut self,
        frame: &SensorFrame,
        primary: &LabelMap,
        refined: Option<&LabelMap>,
    ) -> PublishReport {
        let _span = tracing::debug_span!("publish", stamp_ns = frame.stamp_ns).entered();
        let header = Header::new(frame.stamp_ns, frame.frame_id.clone());

        let mut report = PublishReport {
            objects: count_objects(primary),
            ..PublishReport::default()
        };
        info!("{} objects", report.objects);
        metrics::gauge!("seg_objects").set(report.objects as f64);
        report.messages += self.emit_pair(
            &header,
            frame,
            primary,
            OutputChannel::Label,
            OutputChannel::Overlay,
        );

        if let Some(refined) = refined {
            let objects = count_objects(refined);
            info!("{objects} objects after refinement");
            metrics::gauge!("seg_objects_refined").set(objects as f64);
            report.refined_objects = Some(objects);
            report.messages += self.emit_pair(
                &header,
                frame,
                refined,
                OutputChannel::LabelRefined,
                OutputChannel::OverlayRefined,
            );
        }
        report
    }

    fn emit_pair(
        &mut self,
        header: &Header,
        frame: &SensorFrame,
        labels: &LabelMap,
        label_channel: OutputChannel,
        overlay_channel: OutputChannel,
    ) -> usize {
        let (width, height) = labels.dimensions();
        let label_msg = ImageMessage::new(
            header.clone(),
            width,
            height,
            label_channel.encoding(),
            labels.as_raw().clone(),
        );
        let overlay = render_overlay(&frame.original_color, labels);
        let overlay_msg = ImageMessage::new(
            header.clone(),
            overlay.width(),
            overlay.height(),
            overlay_channel.encoding(),
            overlay.into_raw(),
        );
        self.emit(label_channel, label_msg) + self.emit(overlay_channel, overlay_msg)
    }

    fn emit(&mut self, channel: OutputChannel, msg: ImageMessage) -> usize {
        let mut delivered = 0;
        for sink in &mut self.sinks {
            match sink.publish(channel, msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    metrics::counter!("seg_published_total", "topic" => channel.topic())
                        .increment(1);
                }
                Err(err) => warn!("failed to publish {}: {err:#}", channel.topic()),
            }
        }
        delivered
    }
}

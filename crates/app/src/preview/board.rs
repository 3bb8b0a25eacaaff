//! Latest published image per output channel, pre-encoded for HTTP.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use actix_web::web::Bytes;
use anyhow::{Result, anyhow};
use crossbeam_channel::Receiver;
use image::{
    ExtendedColorType, ImageEncoder,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use rgbd_ingest::{ImageMessage, encodings};
use serde::Serialize;
use tracing::warn;
use vision::{OutputChannel, count_objects, pipeline::telemetry};

const MJPEG_QUALITY: u8 = 80;

/// Snapshot served by `/status`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PreviewStatus {
    pub stamp_ns: Option<i64>,
    pub frame_id: Option<String>,
    pub objects: Option<usize>,
    pub refined_objects: Option<usize>,
    /// Overlay frames received so far.
    pub frames: u64,
}

#[derive(Default)]
struct BoardState {
    png: HashMap<OutputChannel, Bytes>,
    overlay_jpeg: Option<Bytes>,
    status: PreviewStatus,
}

#[derive(Default)]
pub struct PreviewBoard {
    state: Mutex<BoardState>,
}

impl PreviewBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `msg` and make it the latest image of `channel`.
    pub fn update(&self, channel: OutputChannel, msg: &ImageMessage) -> Result<()> {
        let color_type = match msg.encoding.as_str() {
            encodings::MONO8 => ExtendedColorType::L8,
            encodings::RGB8 => ExtendedColorType::Rgb8,
            other => return Err(anyhow!("cannot preview {other} images")),
        };
        let mut png = Vec::new();
        PngEncoder::new(&mut png).write_image(&msg.data, msg.width, msg.height, color_type)?;

        let jpeg = if channel == OutputChannel::Overlay {
            let mut jpeg = Vec::new();
            JpegEncoder::new_with_quality(&mut jpeg, MJPEG_QUALITY).encode(
                &msg.data,
                msg.width,
                msg.height,
                color_type,
            )?;
            Some(Bytes::from(jpeg))
        } else {
            None
        };

        let objects = match channel {
            OutputChannel::Label | OutputChannel::LabelRefined => {
                let labels = image::GrayImage::from_raw(msg.width, msg.height, msg.data.clone())
                    .ok_or_else(|| anyhow!("label payload does not match its size"))?;
                Some(count_objects(&labels))
            }
            OutputChannel::Overlay | OutputChannel::OverlayRefined => None,
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.png.insert(channel, Bytes::from(png));
        state.status.stamp_ns = Some(msg.header.stamp_ns);
        state.status.frame_id = Some(msg.header.frame_id.clone());
        match channel {
            OutputChannel::Label => state.status.objects = objects,
            OutputChannel::LabelRefined => state.status.refined_objects = objects,
            OutputChannel::Overlay => {
                state.overlay_jpeg = jpeg;
                state.status.frames += 1;
            }
            OutputChannel::OverlayRefined => {}
        }
        Ok(())
    }

    pub fn png(&self, channel: OutputChannel) -> Option<Bytes> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.png.get(&channel).cloned()
    }

    pub fn overlay_jpeg(&self) -> Option<(u64, Bytes)> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .overlay_jpeg
            .clone()
            .map(|jpeg| (state.status.frames, jpeg))
    }

    pub fn status(&self) -> PreviewStatus {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.status.clone()
    }
}

/// Drain a channel sink into the board until the sink is dropped.
pub fn spawn_board_feeder(
    board: Arc<PreviewBoard>,
    rx: Receiver<(OutputChannel, ImageMessage)>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("seg-preview-feeder", move || {
        for (channel, msg) in rx.iter() {
            if let Err(err) = board.update(channel, &msg) {
                warn!("preview update for {} failed: {err:#}", channel.topic());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgbd_ingest::Header;

    fn label(stamp_ns: i64, data: Vec<u8>) -> ImageMessage {
        ImageMessage::new(Header::new(stamp_ns, "cam"), 2, 2, encodings::MONO8, data)
    }

    #[test]
    fn empty_board_has_nothing_to_serve() {
        let board = PreviewBoard::new();
        assert!(board.png(OutputChannel::Label).is_none());
        assert!(board.overlay_jpeg().is_none());
        assert_eq!(board.status(), PreviewStatus::default());
    }

    #[test]
    fn label_updates_track_object_counts() {
        let board = PreviewBoard::new();
        board
            .update(OutputChannel::Label, &label(10, vec![0, 1, 2, 2]))
            .unwrap();
        board
            .update(OutputChannel::LabelRefined, &label(10, vec![0, 1, 1, 1]))
            .unwrap();

        let status = board.status();
        assert_eq!(status.stamp_ns, Some(10));
        assert_eq!(status.frame_id.as_deref(), Some("cam"));
        assert_eq!(status.objects, Some(2));
        assert_eq!(status.refined_objects, Some(1));
        assert_eq!(status.frames, 0);

        let png = board.png(OutputChannel::Label).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().into_luma8();
        assert_eq!(decoded.into_raw(), vec![0, 1, 2, 2]);
    }

    #[test]
    fn overlay_updates_feed_the_mjpeg_stream() {
        let board = PreviewBoard::new();
        let overlay = ImageMessage::new(
            Header::new(5, "cam"),
            8,
            8,
            encodings::RGB8,
            vec![200; 8 * 8 * 3],
        );
        board.update(OutputChannel::Overlay, &overlay).unwrap();
        board.update(OutputChannel::Overlay, &overlay).unwrap();

        let (frames, jpeg) = board.overlay_jpeg().unwrap();
        assert_eq!(frames, 2);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn unknown_encodings_are_refused() {
        let board = PreviewBoard::new();
        let msg = ImageMessage::new(Header::default(), 1, 1, encodings::TYPE_32FC1, vec![0; 4]);
        assert!(board.update(OutputChannel::Overlay, &msg).is_err());
    }
}

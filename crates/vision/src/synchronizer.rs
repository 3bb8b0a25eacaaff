//! Producer side of the pipeline: pairs color and depth messages, converts
//! them to working resolution and replaces the shared frame slot.

use std::{sync::Arc, time::Duration};

use image::{ImageBuffer, Luma, RgbImage};
use rgbd_ingest::{ApproximateTimeSync, ImageMessage, SyncStats, encodings};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    frame::{DepthImage, FrameSlot, SensorFrame},
    pipeline::telemetry::LogThrottle,
    resample::{pad_to_multiple, resize_linear, resize_nearest, scaled_dims},
};

/// Millimetres per metre; `16UC1` depth is stored in millimetres.
pub const DEPTH_MM_PER_METRE: f32 = 1000.0;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("unsupported depth encoding {0:?}; expected 16UC1 or 32FC1")]
    UnsupportedDepthEncoding(String),
    #[error("unsupported color encoding {0:?}; expected rgb8, bgr8, rgba8 or bgra8")]
    UnsupportedColorEncoding(String),
    #[error("{stream} payload holds {actual} bytes, expected {expected} for {width}x{height}")]
    PayloadSize {
        stream: &'static str,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("color is {color_w}x{color_h} but depth is {depth_w}x{depth_h}")]
    DimensionMismatch {
        color_w: u32,
        color_h: u32,
        depth_w: u32,
        depth_h: u32,
    },
}

/// How paired images are brought to working resolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PreprocessOptions {
    pub im_scale: f64,
    pub pad_alignment: u32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            im_scale: 1.0,
            pad_alignment: 16,
        }
    }
}

impl PreprocessOptions {
    pub fn rescales(&self) -> bool {
        self.im_scale != 1.0
    }
}

fn expect_len(
    msg: &ImageMessage,
    stream: &'static str,
    bytes_per_pixel: usize,
) -> Result<(), FrameError> {
    let expected = msg.width as usize * msg.height as usize * bytes_per_pixel;
    if msg.data.len() != expected {
        return Err(FrameError::PayloadSize {
            stream,
            width: msg.width,
            height: msg.height,
            expected,
            actual: msg.data.len(),
        });
    }
    Ok(())
}

/// Decode a color message into RGB order, dropping any alpha channel.
pub fn decode_color(msg: &ImageMessage) -> Result<RgbImage, FrameError> {
    let (channels, order): (usize, [usize; 3]) = match msg.encoding.as_str() {
        encodings::RGB8 => (3, [0, 1, 2]),
        encodings::BGR8 => (3, [2, 1, 0]),
        encodings::RGBA8 => (4, [0, 1, 2]),
        encodings::BGRA8 => (4, [2, 1, 0]),
        other => return Err(FrameError::UnsupportedColorEncoding(other.to_string())),
    };
    expect_len(msg, "color", channels)?;

    let mut rgb = Vec::with_capacity(msg.width as usize * msg.height as usize * 3);
    for px in msg.data.chunks_exact(channels) {
        rgb.extend(order.iter().map(|&c| px[c]));
    }
    ImageBuffer::from_raw(msg.width, msg.height, rgb).ok_or(FrameError::PayloadSize {
        stream: "color",
        width: msg.width,
        height: msg.height,
        expected: msg.width as usize * msg.height as usize * 3,
        actual: msg.data.len(),
    })
}

/// Decode a depth message into metres.
///
/// `32FC1` is already metric; `16UC1` is millimetres and divided by 1000.
pub fn decode_depth(msg: &ImageMessage) -> Result<DepthImage, FrameError> {
    let metres: Vec<f32> = match msg.encoding.as_str() {
        encodings::TYPE_32FC1 => {
            expect_len(msg, "depth", 4)?;
            msg.data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        }
        encodings::TYPE_16UC1 => {
            expect_len(msg, "depth", 2)?;
            msg.data
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as f32 / DEPTH_MM_PER_METRE)
                .collect()
        }
        other => return Err(FrameError::UnsupportedDepthEncoding(other.to_string())),
    };
    let len = metres.len();
    ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(msg.width, msg.height, metres).ok_or(
        FrameError::PayloadSize {
            stream: "depth",
            width: msg.width,
            height: msg.height,
            expected: msg.width as usize * msg.height as usize,
            actual: len,
        },
    )
}

/// Convert a paired color/depth message into a working-resolution frame.
///
/// When `im_scale != 1` color is resized bilinearly, depth by nearest
/// neighbour, and both are padded to a multiple of `pad_alignment`.
pub fn prepare_frame(
    color: &ImageMessage,
    depth: &ImageMessage,
    options: &PreprocessOptions,
) -> Result<SensorFrame, FrameError> {
    // Depth first: an unsupported depth encoding drops the pair before any color work.
    let original_depth = decode_depth(depth)?;
    let original_color = decode_color(color)?;

    let (width, height) = original_color.dimensions();
    if original_depth.dimensions() != (width, height) {
        return Err(FrameError::DimensionMismatch {
            color_w: width,
            color_h: height,
            depth_w: original_depth.width(),
            depth_h: original_depth.height(),
        });
    }

    let (working_color, working_depth) = if options.rescales() {
        let (scaled_w, scaled_h) = scaled_dims(width, height, options.im_scale);
        let color = resize_linear(&original_color, scaled_w, scaled_h);
        let depth = resize_nearest(&original_depth, scaled_w, scaled_h);
        (
            pad_to_multiple(&color, options.pad_alignment),
            pad_to_multiple(&depth, options.pad_alignment),
        )
    } else {
        (original_color.clone(), original_depth.clone())
    };

    Ok(SensorFrame {
        color: working_color,
        depth: working_depth,
        original_color,
        original_depth,
        frame_id: color.header.frame_id.clone(),
        stamp_ns: color.header.stamp_ns,
        original_height: height,
        original_width: width,
        sequence: 0,
    })
}

/// Pairs the two streams and keeps the frame slot pointing at the newest pair.
pub struct FrameSynchronizer {
    sync: ApproximateTimeSync<ImageMessage, ImageMessage>,
    slot: Arc<FrameSlot>,
    options: PreprocessOptions,
    fallback_frame_id: String,
    throttle: LogThrottle,
    stored: u64,
    rejected: u64,
}

impl FrameSynchronizer {
    pub fn new(
        slot: Arc<FrameSlot>,
        options: PreprocessOptions,
        queue_size: usize,
        slop: Duration,
    ) -> Self {
        Self {
            sync: ApproximateTimeSync::new(queue_size, slop),
            slot,
            options,
            fallback_frame_id: String::new(),
            throttle: LogThrottle::new(Duration::from_secs(1)),
            stored: 0,
            rejected: 0,
        }
    }

    /// Frame id stamped on frames whose color header carries none.
    pub fn with_fallback_frame_id(mut self, frame_id: impl Into<String>) -> Self {
        self.fallback_frame_id = frame_id.into();
        self
    }

    pub fn on_color(&mut self, msg: ImageMessage) {
        metrics::counter!("seg_messages_received_total", "stream" => "color").increment(1);
        let pairs = self.sync.push_first(msg);
        self.store_pairs(pairs);
    }

    pub fn on_depth(&mut self, msg: ImageMessage) {
        metrics::counter!("seg_messages_received_total", "stream" => "depth").increment(1);
        let pairs = self.sync.push_second(msg);
        self.store_pairs(pairs);
    }

    /// Resolve whatever is still queued once both streams have ended.
    pub fn finish(&mut self) {
        let pairs = self.sync.flush();
        self.store_pairs(pairs);
        let stats = self.sync.stats();
        debug!(
            paired = stats.paired,
            dropped_color = stats.dropped_first,
            dropped_depth = stats.dropped_second,
            out_of_order = stats.out_of_order,
            stored = self.stored,
            rejected = self.rejected,
            "synchronizer drained"
        );
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Frames written to the slot so far.
    pub fn stored(&self) -> u64 {
        self.stored
    }

    /// Pairs dropped because they could not be converted.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn store_pairs(&mut self, pairs: Vec<(ImageMessage, ImageMessage)>) {
        for (color, depth) in pairs {
            let _pair_span = tracing::debug_span!(
                "ingest.pair",
                color_stamp = color.header.stamp_ns,
                depth_stamp = depth.header.stamp_ns
            )
            .entered();
            metrics::counter!("seg_pairs_total").increment(1);

            match prepare_frame(&color, &depth, &self.options) {
                Ok(mut frame) => {
                    if frame.frame_id.is_empty() {
                        frame.frame_id.clone_from(&self.fallback_frame_id);
                    }
                    self.slot.replace(frame);
                    self.stored += 1;
                }
                Err(err) => {
                    self.rejected += 1;
                    let reason = match err {
                        FrameError::UnsupportedDepthEncoding(_) => "depth_encoding",
                        FrameError::UnsupportedColorEncoding(_) => "color_encoding",
                        FrameError::PayloadSize { .. } => "payload_size",
                        FrameError::DimensionMismatch { .. } => "dimension_mismatch",
                    };
                    metrics::counter!("seg_pairs_rejected_total", "reason" => reason).increment(1);
                    if let Some(suppressed) = self.throttle.ready() {
                        warn!("dropping RGB-D pair: {err} ({suppressed} similar suppressed)");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgbd_ingest::Header;

    fn color_msg(width: u32, height: u32, encoding: &str, channels: usize) -> ImageMessage {
        let data = (0..width as usize * height as usize * channels)
            .map(|i| (i % 256) as u8)
            .collect();
        ImageMessage::new(Header::new(42, "rgb"), width, height, encoding, data)
    }

    fn depth_16(width: u32, height: u32, mm: u16) -> ImageMessage {
        let data = std::iter::repeat_n(mm.to_le_bytes(), (width * height) as usize)
            .flatten()
            .collect();
        ImageMessage::new(Header::new(40, "rgb"), width, height, encodings::TYPE_16UC1, data)
    }

    #[test]
    fn sixteen_bit_depth_is_converted_to_metres() {
        let depth = decode_depth(&depth_16(2, 2, 1250)).unwrap();
        assert!(depth.pixels().all(|p| (p.0[0] - 1.25).abs() < 1e-6));
    }

    #[test]
    fn float_depth_passes_through() {
        let data = [0.5f32, 1.0, f32::NAN, 2.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let msg = ImageMessage::new(Header::default(), 2, 2, encodings::TYPE_32FC1, data);
        let depth = decode_depth(&msg).unwrap();
        assert_eq!(depth.get_pixel(1, 0).0[0], 1.0);
        assert!(depth.get_pixel(0, 1).0[0].is_nan());
    }

    #[test]
    fn unknown_depth_encoding_is_rejected() {
        let msg = ImageMessage::new(Header::default(), 1, 1, encodings::TYPE_8UC1, vec![3]);
        assert_eq!(
            decode_depth(&msg).unwrap_err(),
            FrameError::UnsupportedDepthEncoding("8UC1".into())
        );
    }

    #[test]
    fn bgra_color_is_reordered_to_rgb() {
        let msg = ImageMessage::new(
            Header::default(),
            1,
            1,
            encodings::BGRA8,
            vec![10, 20, 30, 255],
        );
        assert_eq!(decode_color(&msg).unwrap().get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn short_payload_is_reported() {
        let mut msg = color_msg(4, 4, encodings::RGB8, 3);
        msg.data.pop();
        assert!(matches!(
            decode_color(&msg),
            Err(FrameError::PayloadSize { actual: 47, .. })
        ));
    }

    #[test]
    fn unit_scale_keeps_capture_resolution() {
        let frame = prepare_frame(
            &color_msg(30, 20, encodings::RGB8, 3),
            &depth_16(30, 20, 1000),
            &PreprocessOptions::default(),
        )
        .unwrap();
        assert_eq!(frame.working_size(), (30, 20));
        assert_eq!((frame.original_width, frame.original_height), (30, 20));
        assert_eq!(frame.stamp_ns, 42);
        assert_eq!(frame.frame_id, "rgb");
    }

    #[test]
    fn rescaled_frames_are_padded_to_alignment() {
        let options = PreprocessOptions {
            im_scale: 0.5,
            pad_alignment: 16,
        };
        let frame = prepare_frame(
            &color_msg(70, 50, encodings::BGR8, 3),
            &depth_16(70, 50, 2000),
            &options,
        )
        .unwrap();
        assert_eq!(frame.working_size(), (48, 32));
        assert_eq!(frame.depth.dimensions(), (48, 32));
        assert_eq!(frame.depth.get_pixel(34, 24).0[0], 2.0);
        assert_eq!(frame.depth.get_pixel(35, 0).0[0], 0.0);
        assert_eq!(frame.original_color.dimensions(), (70, 50));
        assert_eq!(frame.original_depth.dimensions(), (70, 50));
        assert_eq!((frame.original_width, frame.original_height), (70, 50));
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let err = prepare_frame(
            &color_msg(8, 8, encodings::RGB8, 3),
            &depth_16(4, 4, 1000),
            &PreprocessOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::DimensionMismatch { .. }));
    }
}

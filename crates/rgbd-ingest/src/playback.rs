//! Playback of recorded RGB-D sessions.
//!
//! A recording is a directory tree mirroring topic names: every topic owns a
//! directory of `<stamp_ns>.png` files and the camera-info topic is stored as
//! a single `<topic>.json` document.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use image::DynamicImage;
use tracing::{debug, warn};

use crate::types::{CameraInfo, Header, ImageMessage, IngestError, StreamKind, encodings};

/// Knobs for a single playback stream.
#[derive(Clone, Debug)]
pub struct PlaybackOptions {
    /// Sleep between messages so they arrive at their recorded rate.
    pub realtime: bool,
    /// Frame id used when stamping messages.
    pub frame_id: String,
    /// Capacity of the hand-off channel.
    pub channel_capacity: usize,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            realtime: true,
            frame_id: String::new(),
            channel_capacity: 2,
        }
    }
}

/// Directory holding the messages recorded for `topic`.
pub fn topic_dir(root: &Path, topic: &str) -> PathBuf {
    root.join(topic.trim_start_matches('/'))
}

/// Load the camera-info document recorded for `topic`.
pub fn load_camera_info(root: &Path, topic: &str) -> Result<CameraInfo, IngestError> {
    let path = root.join(format!("{}.json", topic.trim_start_matches('/')));
    let raw = fs::read_to_string(&path).map_err(|_| IngestError::Open { path: path.clone() })?;
    Ok(serde_json::from_str(&raw)?)
}

/// List recorded messages for a topic, oldest first.
pub fn list_recorded(dir: &Path) -> Result<Vec<(i64, PathBuf)>, IngestError> {
    if !dir.is_dir() {
        return Err(IngestError::Open {
            path: dir.to_path_buf(),
        });
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("png") {
            continue;
        }
        match parse_stamp(&path) {
            Some(stamp) => entries.push((stamp, path)),
            None => debug!("skipping {} (file name is not a stamp)", path.display()),
        }
    }
    entries.sort_by_key(|(stamp, _)| *stamp);
    Ok(entries)
}

/// Spawns a background thread replaying one recorded topic.
///
/// Messages are forwarded over the returned [`Receiver`] in stamp order. The
/// channel is closed once the recording is exhausted or the receiver is
/// dropped. A decode failure is forwarded as an `Err` and playback continues.
pub fn spawn_playback_reader(
    root: &Path,
    topic: &str,
    stream: StreamKind,
    options: PlaybackOptions,
) -> Result<Receiver<Result<ImageMessage, IngestError>>, IngestError> {
    let entries = list_recorded(&topic_dir(root, topic))?;
    let (tx, rx) = bounded(options.channel_capacity.max(1));
    let topic = topic.to_string();

    thread::Builder::new()
        .name(format!("playback-{}", stream.label()))
        .spawn(move || {
            let sent = playback_loop(entries, stream, &options, &tx);
            debug!("playback of {topic} finished after {sent} message(s)");
        })?;

    Ok(rx)
}

fn playback_loop(
    entries: Vec<(i64, PathBuf)>,
    stream: StreamKind,
    options: &PlaybackOptions,
    tx: &Sender<Result<ImageMessage, IngestError>>,
) -> usize {
    let started = Instant::now();
    let first_stamp = entries.first().map(|(stamp, _)| *stamp).unwrap_or_default();
    let mut sent = 0;

    for (stamp, path) in entries {
        if options.realtime {
            let offset = Duration::from_nanos(stamp.saturating_sub(first_stamp).max(0) as u64);
            if let Some(wait) = offset.checked_sub(started.elapsed()) {
                thread::sleep(wait);
            }
        }

        let message = decode_recorded(&path, stamp, stream, &options.frame_id);
        if let Err(err) = &message {
            warn!("{stream} playback: {err}");
        }
        if tx.send(message).is_err() {
            break;
        }
        sent += 1;
    }
    sent
}

/// Decode one recorded PNG into an image message.
///
/// The PNG color type decides the encoding tag. Depth recordings are expected
/// to be 16-bit millimetres; 8-bit depth is passed through as `8UC1` and left
/// for the consumer to reject.
pub fn decode_recorded(
    path: &Path,
    stamp_ns: i64,
    stream: StreamKind,
    frame_id: &str,
) -> Result<ImageMessage, IngestError> {
    let image = image::open(path)?;
    let (width, height) = (image.width(), image.height());

    let (encoding, data) = match (stream, image) {
        (StreamKind::Color, DynamicImage::ImageRgb8(buf)) => (encodings::RGB8, buf.into_raw()),
        (StreamKind::Color, DynamicImage::ImageRgba8(buf)) => (encodings::RGBA8, buf.into_raw()),
        (StreamKind::Color, other) => (encodings::RGB8, other.to_rgb8().into_raw()),
        (StreamKind::Depth, DynamicImage::ImageLuma16(buf)) => (
            encodings::TYPE_16UC1,
            buf.into_raw()
                .into_iter()
                .flat_map(u16::to_le_bytes)
                .collect(),
        ),
        (StreamKind::Depth, DynamicImage::ImageLuma8(buf)) => {
            (encodings::TYPE_8UC1, buf.into_raw())
        }
        (StreamKind::Depth, other) => {
            return Err(IngestError::Decode {
                path: path.to_path_buf(),
                reason: format!("depth must be single-channel, found {:?}", other.color()),
            });
        }
    };

    Ok(ImageMessage::new(
        Header::new(stamp_ns, frame_id),
        width,
        height,
        encoding,
        data,
    ))
}

fn parse_stamp(path: &Path) -> Option<i64> {
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    #[test]
    fn lists_only_stamped_pngs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let img = ImageBuffer::from_pixel(2, 2, Rgb([1u8, 2, 3]));
        for name in ["300.png", "100.png", "200.png", "notes.png"] {
            img.save(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("400.txt"), b"ignored").unwrap();

        let stamps: Vec<i64> = list_recorded(dir.path())
            .unwrap()
            .into_iter()
            .map(|(stamp, _)| stamp)
            .collect();
        assert_eq!(stamps, vec![100, 200, 300]);
    }

    #[test]
    fn sixteen_bit_depth_becomes_16uc1() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("5.png");
        ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(3, 2, Luma([1500]))
            .save(&path)
            .unwrap();

        let msg = decode_recorded(&path, 5, StreamKind::Depth, "cam").unwrap();
        assert_eq!(msg.encoding, encodings::TYPE_16UC1);
        assert_eq!((msg.width, msg.height), (3, 2));
        assert_eq!(msg.data.len(), 3 * 2 * 2);
        assert_eq!(u16::from_le_bytes([msg.data[0], msg.data[1]]), 1500);
        assert_eq!(msg.header, Header::new(5, "cam"));
    }

    #[test]
    fn eight_bit_depth_is_tagged_not_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("9.png");
        ImageBuffer::<Luma<u8>, Vec<u8>>::from_pixel(2, 2, Luma([7]))
            .save(&path)
            .unwrap();

        let msg = decode_recorded(&path, 9, StreamKind::Depth, "").unwrap();
        assert_eq!(msg.encoding, encodings::TYPE_8UC1);
    }

    #[test]
    fn camera_info_round_trips_from_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("camera/color")).unwrap();
        fs::write(
            dir.path().join("camera/color/camera_info.json"),
            r#"{"frame_id":"optical","width":64,"height":48,
                "K":[500.0,0.0,32.0,0.0,500.0,24.0,0.0,0.0,1.0]}"#,
        )
        .unwrap();

        let info = load_camera_info(dir.path(), "/camera/color/camera_info").unwrap();
        assert_eq!(info.header.frame_id, "optical");
        assert_eq!(info.header.stamp_ns, 0);
        assert_eq!(info.k[2], 32.0);
    }
}

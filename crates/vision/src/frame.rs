//! The single shared "latest frame" slot.
//!
//! The synchronizer replaces the slot on every successful pairing and the
//! dispatcher takes a reference-counted snapshot of whatever is current. The
//! lock only covers the pointer swap, so neither side ever waits on image
//! work done by the other, and a reader can never see a half-built frame.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use image::{ImageBuffer, Luma, RgbImage};

use crate::geometry::CameraIntrinsics;

/// Single-channel depth in metres.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A synchronized color + depth pair at working resolution.
#[derive(Clone, Debug)]
pub struct SensorFrame {
    /// Color resized and padded for the network.
    pub color: RgbImage,
    /// Depth resized and padded to match `color`.
    pub depth: DepthImage,
    /// Color as captured, used for visualization.
    pub original_color: RgbImage,
    /// Depth as captured (metres).
    pub original_depth: DepthImage,
    pub frame_id: String,
    pub stamp_ns: i64,
    /// Capture height before scaling and padding.
    pub original_height: u32,
    /// Capture width before scaling and padding.
    pub original_width: u32,
    /// Assigned by [`FrameSlot::replace`]; 0 until stored.
    pub sequence: u64,
}

impl SensorFrame {
    /// Working `(width, height)`.
    pub fn working_size(&self) -> (u32, u32) {
        self.color.dimensions()
    }
}

/// Holds at most one frame; every write replaces the previous one.
#[derive(Debug, Default)]
pub struct FrameSlot {
    current: Mutex<Option<Arc<SensorFrame>>>,
    replacements: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` as the current frame and return its sequence number.
    ///
    /// An unread previous frame is discarded.
    pub fn replace(&self, mut frame: SensorFrame) -> u64 {
        let sequence = self.replacements.fetch_add(1, Ordering::AcqRel) + 1;
        frame.sequence = sequence;
        let incoming = Arc::new(frame);
        let previous = {
            let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            guard.replace(incoming)
        };
        drop(previous);
        sequence
    }

    /// Snapshot of the current frame, if any has arrived yet.
    pub fn latest(&self) -> Option<Arc<SensorFrame>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total number of frames ever stored.
    pub fn replacements(&self) -> u64 {
        self.replacements.load(Ordering::Acquire)
    }
}

/// State shared by the producer (synchronizer) and the consumer (dispatcher).
///
/// Lives for as long as the pipeline runs.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub slot: Arc<FrameSlot>,
    /// Intrinsics already scaled to the working resolution.
    pub intrinsics: CameraIntrinsics,
    pub shutdown: Arc<AtomicBool>,
}

impl PipelineContext {
    pub fn new(intrinsics: CameraIntrinsics) -> Self {
        Self {
            slot: Arc::new(FrameSlot::new()),
            intrinsics,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

//! Sensor-side plumbing for RGB-D perception: the message types exchanged with
//! the transport, approximate-time pairing of the color and depth streams, and
//! a playback source that replays recorded sessions at their original rate.

pub mod playback;
pub mod sync;
pub mod types;

pub use playback::{PlaybackOptions, load_camera_info, spawn_playback_reader};
pub use sync::{ApproximateTimeSync, Stamped, SyncStats};
pub use types::{CameraInfo, Header, ImageMessage, IngestError, StreamKind, encodings};

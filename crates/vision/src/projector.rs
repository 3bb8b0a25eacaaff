//! Maps label maps from working resolution back to the capture resolution.

use ml_core::LabelMap;

use crate::resample::{crop_top_left, resize_nearest, scaled_dims};

/// Inverse of the scale-then-pad step applied by the synchronizer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projector {
    im_scale: f64,
}

impl Projector {
    pub fn new(im_scale: f64) -> Self {
        Self { im_scale }
    }

    pub fn im_scale(&self) -> f64 {
        self.im_scale
    }

    /// Bring `labels` back to `original_width × original_height`.
    ///
    /// With a unit scale the map is returned unchanged. Otherwise the padding
    /// margin is dropped, the remainder resized by nearest neighbour, and the
    /// result cropped top-left to the exact original size.
    pub fn project(&self, labels: &LabelMap, original_width: u32, original_height: u32) -> LabelMap {
        if self.im_scale == 1.0 {
            return labels.clone();
        }
        // The scaled content occupies the top-left region; the rest is padding.
        let (scaled_w, scaled_h) = scaled_dims(original_width, original_height, self.im_scale);
        let content = crop_top_left(labels, scaled_w, scaled_h);
        let restored = resize_nearest(&content, original_width, original_height);
        crop_top_left(&restored, original_width, original_height)
    }
}

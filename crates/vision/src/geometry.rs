//! Pinhole back-projection of depth maps.

use anyhow::{Result, bail};
use ndarray::Array3;
use rgbd_ingest::CameraInfo;

use crate::frame::DepthImage;

/// Per-pixel `(x, y, z)` coordinates, shaped `[H, W, 3]`.
pub type GeometryMap = Array3<f32>;

/// Focal lengths and principal point in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub px: f64,
    pub py: f64,
}

impl CameraIntrinsics {
    /// Read intrinsics out of a row-major 3×3 camera matrix.
    pub fn from_k(k: &[f64; 9]) -> Result<Self> {
        let intrinsics = Self {
            fx: k[0],
            fy: k[4],
            px: k[2],
            py: k[5],
        };
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            bail!(
                "camera matrix has non-positive focal length (fx={}, fy={})",
                intrinsics.fx,
                intrinsics.fy
            );
        }
        Ok(intrinsics)
    }

    pub fn from_camera_info(info: &CameraInfo) -> Result<Self> {
        Self::from_k(&info.k)
    }

    /// Intrinsics of the same camera after resizing its images by `scale`.
    pub fn scaled(self, scale: f64) -> Self {
        Self {
            fx: self.fx * scale,
            fy: self.fy * scale,
            px: self.px * scale,
            py: self.py * scale,
        }
    }
}

/// Back-project every depth pixel into camera coordinates.
///
/// `z` is the depth value itself; non-finite depth propagates unchanged.
pub fn backproject_depth(depth: &DepthImage, intrinsics: &CameraIntrinsics) -> GeometryMap {
    let (width, height) = depth.dimensions();
    let (fx, fy) = (intrinsics.fx as f32, intrinsics.fy as f32);
    let (px, py) = (intrinsics.px as f32, intrinsics.py as f32);

    let mut xyz = GeometryMap::zeros((height as usize, width as usize, 3));
    for (row, mut plane) in xyz.outer_iter_mut().enumerate() {
        for (col, mut point) in plane.outer_iter_mut().enumerate() {
            let z = depth.get_pixel(col as u32, row as u32).0[0];
            point[0] = (col as f32 - px) * z / fx;
            point[1] = (row as f32 - py) * z / fy;
            point[2] = z;
        }
    }
    xyz
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    const K: [f64; 9] = [100.0, 0.0, 8.0, 0.0, 50.0, 4.0, 0.0, 0.0, 1.0];

    #[test]
    fn constant_plane_backprojects_to_pinhole_coordinates() {
        let depth = DepthImage::from_pixel(16, 8, Luma([2.0]));
        let intrinsics = CameraIntrinsics::from_k(&K).unwrap();
        let xyz = backproject_depth(&depth, &intrinsics);

        assert_eq!(xyz.shape(), &[8, 16, 3]);
        for r in 0..8 {
            for c in 0..16 {
                let x = (c as f32 - 8.0) * 2.0 / 100.0;
                let y = (r as f32 - 4.0) * 2.0 / 50.0;
                assert!((xyz[[r, c, 0]] - x).abs() < 1e-6);
                assert!((xyz[[r, c, 1]] - y).abs() < 1e-6);
                assert_eq!(xyz[[r, c, 2]], 2.0);
            }
        }
        assert_eq!(xyz[[4, 8, 0]], 0.0);
        assert_eq!(xyz[[4, 8, 1]], 0.0);
    }

    #[test]
    fn non_finite_depth_propagates() {
        let mut depth = DepthImage::from_pixel(2, 2, Luma([1.0]));
        depth.put_pixel(1, 1, Luma([f32::NAN]));
        let xyz = backproject_depth(&depth, &CameraIntrinsics::from_k(&K).unwrap());
        assert!(xyz[[1, 1, 2]].is_nan());
        assert!(xyz[[1, 1, 0]].is_nan());
        assert!(xyz[[0, 0, 2]].is_finite());
    }

    #[test]
    fn scaling_multiplies_focal_and_principal_point() {
        let scaled = CameraIntrinsics::from_k(&K).unwrap().scaled(0.5);
        assert_eq!(
            scaled,
            CameraIntrinsics {
                fx: 50.0,
                fy: 25.0,
                px: 4.0,
                py: 2.0
            }
        );
    }

    #[test]
    fn rejects_degenerate_camera_matrix() {
        let mut k = K;
        k[0] = 0.0;
        assert!(CameraIntrinsics::from_k(&k).is_err());
    }
}

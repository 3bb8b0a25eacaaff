//! Label map rendering for human inspection.

use image::{Rgb, RgbImage};
use ml_core::LabelMap;

use crate::resample::resize_nearest;

const GOLDEN_ANGLE_DEG: f32 = 137.507_77;
const LIGHTEN: f32 = 0.4;
const ALPHA: f32 = 0.5;

/// Saturated color assigned to instance `id`; stable across runs.
pub fn label_color(id: u8) -> Rgb<u8> {
    let hue = (id as f32 * GOLDEN_ANGLE_DEG) % 360.0;
    hsv_to_rgb(hue, 0.85, 0.95)
}

/// `label_color` mixed towards white, used for region fills.
pub fn fill_color(id: u8) -> Rgb<u8> {
    let Rgb(base) = label_color(id);
    Rgb(base.map(|c| (c as f32 + (255.0 - c as f32) * LIGHTEN).round() as u8))
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Rgb<u8> {
    let chroma = value * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = value - chroma;
    let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}

/// Blend each labelled region over `color` and outline it.
///
/// Background pixels (label 0) are copied unchanged. A labelled pixel whose
/// 4-neighbour carries a different label is a boundary pixel and gets the
/// full label color.
pub fn render_overlay(color: &RgbImage, labels: &LabelMap) -> RgbImage {
    let (width, height) = color.dimensions();
    let resized;
    let labels = if labels.dimensions() == (width, height) {
        labels
    } else {
        resized = resize_nearest(labels, width, height);
        &resized
    };

    let label_at = |x: u32, y: u32| labels.get_pixel(x, y).0[0];
    let is_boundary = |x: u32, y: u32, id: u8| {
        (x > 0 && label_at(x - 1, y) != id)
            || (x + 1 < width && label_at(x + 1, y) != id)
            || (y > 0 && label_at(x, y - 1) != id)
            || (y + 1 < height && label_at(x, y + 1) != id)
    };

    let mut out = color.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let id = label_at(x, y);
        if id == 0 {
            continue;
        }
        if is_boundary(x, y, id) {
            *pixel = label_color(id);
            continue;
        }
        let Rgb(fill) = fill_color(id);
        for (channel, tint) in pixel.0.iter_mut().zip(fill) {
            *channel = ((1.0 - ALPHA) * *channel as f32 + ALPHA * tint as f32).round() as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn colors_are_deterministic_and_distinct() {
        assert_eq!(label_color(3), label_color(3));
        let colors: Vec<_> = (1..=12).map(label_color).collect();
        for (i, a) in colors.iter().enumerate() {
            for b in &colors[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn background_is_untouched() {
        let color = RgbImage::from_fn(8, 8, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 7]));
        let labels = LabelMap::new(8, 8);
        assert_eq!(render_overlay(&color, &labels), color);
    }

    #[test]
    fn regions_are_tinted_and_outlined() {
        let color = RgbImage::from_pixel(9, 9, Rgb([0, 0, 0]));
        let labels = LabelMap::from_fn(9, 9, |x, y| {
            Luma([(2..=6).contains(&x) as u8 * (2..=6).contains(&y) as u8])
        });
        let overlay = render_overlay(&color, &labels);

        assert_eq!(overlay.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(overlay.get_pixel(2, 4), &label_color(1));
        let Rgb(fill) = fill_color(1);
        let expected = Rgb(fill.map(|c| (c as f32 * 0.5).round() as u8));
        assert_eq!(overlay.get_pixel(4, 4), &expected);
    }
}

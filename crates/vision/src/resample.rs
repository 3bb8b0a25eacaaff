//! Resizing, padding and cropping between capture and working resolution.
//!
//! Color uses bilinear interpolation. Depth and labels use nearest-neighbour
//! so that no value is ever invented between two neighbouring pixels.

use image::{ImageBuffer, Pixel, RgbImage, imageops};

type Buffer<P> = ImageBuffer<P, Vec<<P as Pixel>::Subpixel>>;

/// Dimensions after resizing `(width, height)` by `scale`, never below 1 pixel.
pub fn scaled_dims(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let scale_one = |v: u32| ((v as f64 * scale).round() as u32).max(1);
    (scale_one(width), scale_one(height))
}

/// Smallest multiple of `alignment` that is `>= value`.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Bilinear resize for color images.
pub fn resize_linear(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, imageops::FilterType::Triangle)
}

/// Nearest-neighbour resize: output pixel `i` samples source `floor(i * src / dst)`.
pub fn resize_nearest<P: Pixel>(image: &Buffer<P>, width: u32, height: u32) -> Buffer<P> {
    let (src_w, src_h) = image.dimensions();
    if (src_w, src_h) == (width, height) {
        return image.clone();
    }
    let source_index = |dst: u32, dst_len: u32, src_len: u32| -> u32 {
        let idx = (dst as u64 * src_len as u64 / dst_len.max(1) as u64) as u32;
        idx.min(src_len.saturating_sub(1))
    };
    let columns: Vec<u32> = (0..width).map(|x| source_index(x, width, src_w)).collect();

    let mut out = Buffer::<P>::new(width, height);
    if src_w == 0 || src_h == 0 {
        return out;
    }
    for y in 0..height {
        let sy = source_index(y, height, src_h);
        for (x, &sx) in columns.iter().enumerate() {
            out.put_pixel(x as u32, y, *image.get_pixel(sx, sy));
        }
    }
    out
}

/// Zero-pad on the bottom and right so both sides are multiples of `alignment`.
pub fn pad_to_multiple<P: Pixel>(image: &Buffer<P>, alignment: u32) -> Buffer<P> {
    let (width, height) = image.dimensions();
    let (padded_w, padded_h) = (align_up(width, alignment), align_up(height, alignment));
    if (padded_w, padded_h) == (width, height) {
        return image.clone();
    }
    let mut out = Buffer::<P>::new(padded_w, padded_h);
    imageops::replace(&mut out, image, 0, 0);
    out
}

/// Keep the top-left `width × height` region, zero-filling if the source is smaller.
pub fn crop_top_left<P: Pixel>(image: &Buffer<P>, width: u32, height: u32) -> Buffer<P> {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    let mut out = Buffer::<P>::new(width, height);
    imageops::replace(&mut out, image, 0, 0);
    out
}

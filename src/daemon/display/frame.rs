use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

/// Lowest multiplier ever applied, so a brightness of 0 still shows something.
pub const MIN_BRIGHTNESS_FACTOR: f32 = 0.05;

pub fn brightness_factor(brightness: u8) -> f32 {
    (brightness as f32 / 100.0).max(MIN_BRIGHTNESS_FACTOR)
}

/// Normalizes any decoded image to an RGB frame of exactly `size`, dimmed to
/// `brightness` percent.
pub fn prepare(image: DynamicImage, size: (u32, u32), brightness: u8) -> RgbImage {
    let (width, height) = size;
    let rgb = image.into_rgb8();
    let mut frame = if rgb.dimensions() == size {
        rgb
    } else {
        imageops::resize(&rgb, width, height, FilterType::CatmullRom)
    };

    let factor = brightness_factor(brightness);
    if factor < 1.0 {
        for pixel in frame.pixels_mut() {
            for channel in pixel.0.iter_mut() {
                *channel = (*channel as f32 * factor).round().min(255.0) as u8;
            }
        }
    }
    frame
}

pub fn rotate(frame: &RgbImage, degrees: u16) -> RgbImage {
    match degrees {
        90 => imageops::rotate90(frame),
        180 => imageops::rotate180(frame),
        270 => imageops::rotate270(frame),
        _ => frame.clone(),
    }
}

/// Packs a frame as little-endian RGB565, the layout of 16bpp fbdev panels.
pub fn to_rgb565(frame: &RgbImage) -> Vec<u8> {
    let mut raw = Vec::with_capacity(frame.as_raw().len() / 3 * 2);
    for pixel in frame.pixels() {
        let [r, g, b] = pixel.0;
        let mut rgb565: u16 = (r as u16 & 0b1111_1000) << 8;
        rgb565 |= (g as u16 & 0b1111_1100) << 3;
        rgb565 |= (b as u16) >> 3;
        raw.extend(rgb565.to_le_bytes());
    }
    raw
}

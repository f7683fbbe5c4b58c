//! Per-camera image transforms
//!
//! Applied to every decoded frame in a fixed order: zoom (centre crop and
//! scale back), rotate, flip horizontally, flip vertically.

use super::traits::Image;
use serde::{Deserialize, Serialize};

pub const MIN_ZOOM: f32 = 1.0;
pub const MAX_ZOOM: f32 = 4.0;

/// Transform settings for one camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Transform {
    /// 1.0 = no zoom, 4.0 = quarter-size centre crop
    pub zoom: f32,
    /// Clockwise degrees
    pub rotation: u16,
    pub flip_h: bool,
    pub flip_v: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            rotation: 0,
            flip_h: false,
            flip_v: false,
        }
    }
}

impl Transform {
    /// Clamp zoom and wrap rotation into 0..360
    pub fn normalized(self) -> Self {
        let zoom = if self.zoom.is_finite() {
            self.zoom.clamp(MIN_ZOOM, MAX_ZOOM)
        } else {
            MIN_ZOOM
        };
        Self {
            zoom,
            rotation: self.rotation % 360,
            ..self
        }
    }

    pub fn is_identity(&self) -> bool {
        self.zoom <= MIN_ZOOM && self.rotation % 360 == 0 && !self.flip_h && !self.flip_v
    }

    /// Apply the pipeline to an image
    pub fn apply(&self, image: Image) -> Image {
        let t = self.normalized();
        if t.is_identity() {
            return image;
        }

        let mut image = image;
        if t.zoom > MIN_ZOOM {
            image = zoom(&image, t.zoom);
        }
        image = match t.rotation {
            0 => image,
            90 => rotate_90(&image),
            180 => rotate_180(&image),
            270 => rotate_270(&image),
            degrees => rotate_arbitrary(&image, degrees as f32),
        };
        if t.flip_h {
            image = flip_horizontal(&image);
        }
        if t.flip_v {
            image = flip_vertical(&image);
        }
        image
    }
}

fn zoom(image: &Image, zoom: f32) -> Image {
    let crop_w = ((image.width as f32 / zoom) as u32).max(1);
    let crop_h = ((image.height as f32 / zoom) as u32).max(1);
    let x0 = (image.width - crop_w) / 2;
    let y0 = (image.height - crop_h) / 2;

    let mut cropped = Vec::with_capacity((crop_w * crop_h * 3) as usize);
    for y in y0..y0 + crop_h {
        let start = ((y * image.width + x0) * 3) as usize;
        let end = start + (crop_w * 3) as usize;
        cropped.extend_from_slice(&image.pixels[start..end]);
    }
    resize(&Image::new(crop_w, crop_h, cropped), image.width, image.height)
}

/// Bilinear resize to `width` x `height`
pub fn resize(image: &Image, width: u32, height: u32) -> Image {
    if image.width == width && image.height == height {
        return image.clone();
    }
    if image.width == 0 || image.height == 0 || width == 0 || height == 0 {
        return Image::new(width, height, vec![0; (width * height * 3) as usize]);
    }

    let mut out = Vec::with_capacity((width * height * 3) as usize);
    let sx = image.width as f32 / width as f32;
    let sy = image.height as f32 / height as f32;
    let max_x = image.width - 1;
    let max_y = image.height - 1;

    for y in 0..height {
        let fy = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
        let y0 = (fy as u32).min(max_y);
        let y1 = (y0 + 1).min(max_y);
        let wy = fy - y0 as f32;
        for x in 0..width {
            let fx = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
            let x0 = (fx as u32).min(max_x);
            let x1 = (x0 + 1).min(max_x);
            let wx = fx - x0 as f32;

            let p00 = image.pixel(x0, y0);
            let p10 = image.pixel(x1, y0);
            let p01 = image.pixel(x0, y1);
            let p11 = image.pixel(x1, y1);
            for c in 0..3 {
                let top = p00[c] as f32 * (1.0 - wx) + p10[c] as f32 * wx;
                let bottom = p01[c] as f32 * (1.0 - wx) + p11[c] as f32 * wx;
                out.push((top * (1.0 - wy) + bottom * wy).round() as u8);
            }
        }
    }
    Image::new(width, height, out)
}

fn remap(src: &Image, width: u32, height: u32, map: impl Fn(u32, u32) -> (u32, u32)) -> Image {
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let (sx, sy) = map(x, y);
            out.extend_from_slice(&src.pixel(sx, sy));
        }
    }
    Image::new(width, height, out)
}

fn rotate_90(image: &Image) -> Image {
    let h = image.height;
    remap(image, image.height, image.width, |x, y| (y, h - 1 - x))
}

fn rotate_180(image: &Image) -> Image {
    let (w, h) = (image.width, image.height);
    remap(image, w, h, |x, y| (w - 1 - x, h - 1 - y))
}

fn rotate_270(image: &Image) -> Image {
    let w = image.width;
    remap(image, image.height, image.width, |x, y| (w - 1 - y, x))
}

/// Clockwise rotation about the centre keeping the original size; uncovered
/// corners are black.
fn rotate_arbitrary(image: &Image, degrees: f32) -> Image {
    let (w, h) = (image.width, image.height);
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;

    let mut out = vec![0u8; (w * h * 3) as usize];
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let src_x = (cos * dx + sin * dy + cx).round();
            let src_y = (-sin * dx + cos * dy + cy).round();
            if src_x < 0.0 || src_y < 0.0 || src_x >= w as f32 || src_y >= h as f32 {
                continue;
            }
            let p = image.pixel(src_x as u32, src_y as u32);
            let i = ((y * w + x) * 3) as usize;
            out[i..i + 3].copy_from_slice(&p);
        }
    }
    Image::new(w, h, out)
}

fn flip_horizontal(image: &Image) -> Image {
    let w = image.width;
    remap(image, w, image.height, |x, y| (w - 1 - x, y))
}

fn flip_vertical(image: &Image) -> Image {
    let h = image.height;
    remap(image, image.width, h, |x, y| (x, h - 1 - y))
}

//! CPU-side RGBA images: pass inputs for uploads and results of read-backs.

use std::path::Path;

use image::{Rgba, RgbaImage};

use crate::error::RenderError;

/// Linear RGBA image with one `[f32; 4]` per pixel, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelImage {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl PixelImage {
    /// Creates a transparent black image. Zero dimensions are clamped to 1.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, [0.0; 4])
    }

    pub fn filled(width: u32, height: u32, color: [f32; 4]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [f32; 4]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Dark vertical gradient with a handful of bright blocks, so a bloom
    /// chain has something above the high-pass threshold to work with.
    pub fn test_pattern(width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self::from_fn(width, height, |x, y| {
            let u = (x as f32 + 0.5) / w;
            let v = (y as f32 + 0.5) / h;
            let lit = [(0.25, 0.3), (0.7, 0.4), (0.5, 0.75)]
                .iter()
                .any(|(cx, cy)| (u - cx).abs() < 0.04 && (v - cy).abs() < 0.04);
            if lit {
                [1.0, 0.95, 0.8, 1.0]
            } else {
                [0.05 + 0.1 * v, 0.05, 0.1 + 0.1 * u, 1.0]
            }
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [[f32; 4]] {
        &mut self.pixels
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Returns the pixel at `(x, y)`, or `None` when out of bounds.
    pub fn get(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.pixels[self.index(x, y)])
    }

    /// No-op when out of bounds.
    pub fn set(&mut self, x: u32, y: u32, value: [f32; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let index = self.index(x, y);
        self.pixels[index] = value;
    }

    /// Reads a texel with coordinates clamped to the image edge.
    pub fn clamped(&self, x: i64, y: i64) -> [f32; 4] {
        let cx = x.clamp(0, i64::from(self.width) - 1) as u32;
        let cy = y.clamp(0, i64::from(self.height) - 1) as u32;
        self.pixels[self.index(cx, cy)]
    }

    /// Bilinear resample to `width` x `height`, sampling at texel centres
    /// with clamp-to-edge addressing.
    pub fn resampled(&self, width: u32, height: u32) -> PixelImage {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.width && height == self.height {
            return self.clone();
        }

        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        PixelImage::from_fn(width, height, |x, y| {
            let fx = (x as f32 + 0.5) * sx - 0.5;
            let fy = (y as f32 + 0.5) * sy - 0.5;
            let x0 = fx.floor();
            let y0 = fy.floor();
            let tx = fx - x0;
            let ty = fy - y0;
            let (x0, y0) = (x0 as i64, y0 as i64);

            let a = self.clamped(x0, y0);
            let b = self.clamped(x0 + 1, y0);
            let c = self.clamped(x0, y0 + 1);
            let d = self.clamped(x0 + 1, y0 + 1);
            let mut out = [0.0; 4];
            for channel in 0..4 {
                let top = a[channel] + (b[channel] - a[channel]) * tx;
                let bottom = c[channel] + (d[channel] - c[channel]) * tx;
                out[channel] = top + (bottom - top) * ty;
            }
            out
        })
    }

    /// Per-channel average over all pixels.
    pub fn mean(&self) -> [f32; 4] {
        let mut sum = [0.0f64; 4];
        for pixel in &self.pixels {
            for channel in 0..4 {
                sum[channel] += f64::from(pixel[channel]);
            }
        }
        let count = self.pixels.len() as f64;
        sum.map(|total| (total / count) as f32)
    }

    pub fn from_rgba8(image: &RgbaImage) -> Self {
        PixelImage::from_fn(image.width(), image.height(), |x, y| {
            let Rgba(channels) = *image.get_pixel(x, y);
            channels.map(|value| f32::from(value) / 255.0)
        })
    }

    pub fn to_rgba8(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            let pixel = self.pixels[self.index(x, y)];
            Rgba(pixel.map(|value| (value.clamp(0.0, 1.0) * 255.0).round() as u8))
        })
    }

    pub fn load(path: &Path) -> Result<Self, RenderError> {
        let decoded = image::open(path).map_err(|source| RenderError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_rgba8(&decoded.to_rgba8()))
    }

    pub fn save_png(&self, path: &Path) -> Result<(), RenderError> {
        self.to_rgba8()
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|source| RenderError::Image {
                path: path.to_path_buf(),
                source,
            })
    }
}

use std::fmt;

use crate::error::RenderError;

/// Storage format of an off-screen buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit normalised RGBA.
    Rgba8,
    /// Half-float RGBA, used for HDR intermediates.
    Rgba16Float,
    /// Full-float RGBA.
    Rgba32Float,
    /// Depth-only target; carries no colour.
    Depth32Float,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Depth32Float => 4,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }

    pub fn is_color(self) -> bool {
        !matches!(self, PixelFormat::Depth32Float)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgba8 => f.write_str("rgba8"),
            PixelFormat::Rgba16Float => f.write_str("rgba16f"),
            PixelFormat::Rgba32Float => f.write_str("rgba32f"),
            PixelFormat::Depth32Float => f.write_str("depth32f"),
        }
    }
}

/// Size of a buffer relative to the display resolution.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct BufferScale(f32);

impl BufferScale {
    pub const FULL: BufferScale = BufferScale(1.0);
    pub const HALF: BufferScale = BufferScale(0.5);
    pub const QUARTER: BufferScale = BufferScale(0.25);
    pub const ONE_8TH: BufferScale = BufferScale(0.125);
    pub const ONE_16TH: BufferScale = BufferScale(0.0625);

    /// Largest supersampling factor a buffer may request.
    pub const MAX: f32 = 4.0;

    pub fn new(factor: f32) -> Result<Self, RenderError> {
        if !factor.is_finite() || factor <= 0.0 || factor > Self::MAX {
            return Err(RenderError::InvalidScale { factor });
        }
        Ok(Self(factor))
    }

    pub fn factor(self) -> f32 {
        self.0
    }
}

impl fmt::Display for BufferScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Stable logical name of a pooled buffer, e.g. `engine:fbo.halfScaleBlurredBloom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey(String);

impl BufferKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for BufferKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Immutable description of a buffer a node reads or writes.
///
/// Nodes hold configs, never handles; the pool maps each config's key to the
/// handle that matches the current display resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    pub key: BufferKey,
    pub scale: BufferScale,
    pub format: PixelFormat,
    /// MSAA sample count; 1 means single-sampled.
    pub samples: u32,
}

impl BufferConfig {
    pub fn new(key: impl Into<BufferKey>, scale: BufferScale, format: PixelFormat) -> Self {
        Self {
            key: key.into(),
            scale,
            format,
            samples: 1,
        }
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn is_multisampled(&self) -> bool {
        self.samples > 1
    }
}

impl From<String> for BufferKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Current size of the display the frame graph renders for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayResolution {
    pub width: u32,
    pub height: u32,
}

impl DisplayResolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions of a buffer at `scale`, rounded and clamped to at least 1x1.
    pub fn scaled(self, scale: BufferScale) -> (u32, u32) {
        (
            scale_dimension(self.width, scale.factor()),
            scale_dimension(self.height, scale.factor()),
        )
    }
}

impl fmt::Display for DisplayResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn scale_dimension(extent: u32, factor: f32) -> u32 {
    let scaled = (f64::from(extent) * f64::from(factor)).round();
    if scaled < 1.0 {
        1
    } else if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    }
}

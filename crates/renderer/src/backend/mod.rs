//! Render-target backends.
//!
//! The pool and the nodes only talk to [`GpuBackend`]; pixels are shaded by
//! whichever implementation sits behind it. [`SoftwareBackend`] is always
//! available, the headless `wgpu` backend needs the `gpu` feature.

mod software;
#[cfg(feature = "gpu")]
mod headless;

use std::fmt;

use crate::blur::BlurKernel;
use crate::error::BackendError;
use crate::pixels::PixelImage;
use crate::types::PixelFormat;

pub use software::SoftwareBackend;
#[cfg(feature = "gpu")]
pub use headless::WgpuBackend;

/// Opaque identifier of a target allocated by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub(crate) u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub samples: u32,
}

impl TargetDesc {
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * self.format.bytes_per_pixel() as u64
            * u64::from(self.samples.max(1))
    }
}

/// Storage and pass execution for off-screen render targets.
///
/// Every pass reads its input with clamp-to-edge sampling and writes the whole
/// output target; input and output may differ in size, in which case the input
/// is resampled to the output's dimensions first. Targets are created zeroed.
pub trait GpuBackend: Send {
    fn name(&self) -> &'static str;

    fn supports(&self, format: PixelFormat, samples: u32) -> bool;

    fn allocate(&mut self, desc: &TargetDesc) -> Result<TargetId, BackendError>;

    /// Frees a target. Unknown ids are ignored.
    fn release(&mut self, target: TargetId);

    /// Writes `image` into `target`, resampling when the sizes differ.
    fn upload(&mut self, target: TargetId, image: &PixelImage) -> Result<(), BackendError>;

    /// Keeps pixels whose luminance exceeds `threshold` and blacks out the rest.
    fn high_pass(
        &mut self,
        input: TargetId,
        output: TargetId,
        threshold: f32,
    ) -> Result<(), BackendError>;

    /// Horizontal then vertical convolution of `input` into `output`.
    fn blur(
        &mut self,
        input: TargetId,
        output: TargetId,
        kernel: &BlurKernel,
    ) -> Result<(), BackendError>;

    fn read_back(&mut self, target: TargetId) -> Result<PixelImage, BackendError>;

    /// Number of passes or uploads that have written `target` since allocation.
    fn write_count(&self, target: TargetId) -> u64;

    fn allocated_bytes(&self) -> u64;
}

/// Relative luminance weights applied by the high-pass filter.
pub(crate) fn luminance(pixel: [f32; 4]) -> f32 {
    0.2126 * pixel[0] + 0.7152 * pixel[1] + 0.0722 * pixel[2]
}

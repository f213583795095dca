use std::collections::HashMap;

use half::f16;

use super::{luminance, GpuBackend, TargetDesc, TargetId};
use crate::blur::BlurKernel;
use crate::error::BackendError;
use crate::pixels::PixelImage;
use crate::types::PixelFormat;

struct SoftwareTarget {
    desc: TargetDesc,
    image: PixelImage,
    writes: u64,
}

/// CPU reference backend.
///
/// Stores every target as `f32` pixels and quantises after each write so that
/// reads observe the precision of the declared format. Only single-sampled
/// colour formats are supported.
pub struct SoftwareBackend {
    targets: HashMap<TargetId, SoftwareTarget>,
    next_id: u64,
    memory_limit: Option<u64>,
    allocated: u64,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
            next_id: 1,
            memory_limit: None,
            allocated: 0,
        }
    }

    /// Caps the total bytes of live targets; allocations past it fail with
    /// [`BackendError::OutOfMemory`].
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn target(&self, id: TargetId) -> Result<&SoftwareTarget, BackendError> {
        self.targets.get(&id).ok_or(BackendError::UnknownTarget(id))
    }

    fn store(&mut self, id: TargetId, image: PixelImage) -> Result<(), BackendError> {
        let target = self
            .targets
            .get_mut(&id)
            .ok_or(BackendError::UnknownTarget(id))?;
        let mut image = image.resampled(target.desc.width, target.desc.height);
        quantise(&mut image, target.desc.format);
        target.image = image;
        target.writes += 1;
        Ok(())
    }

    /// Input pixels resampled to the output's size, as a pass would sample them.
    fn sampled_input(&self, input: TargetId, output: TargetId) -> Result<PixelImage, BackendError> {
        let source = self.target(input)?;
        let destination = self.target(output)?;
        if input == output {
            return Err(BackendError::InvalidUse {
                target: output,
                operation: "pass",
                reason: "input and output must be different targets".into(),
            });
        }
        Ok(source
            .image
            .resampled(destination.desc.width, destination.desc.height))
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn supports(&self, format: PixelFormat, samples: u32) -> bool {
        format.is_color() && samples == 1
    }

    fn allocate(&mut self, desc: &TargetDesc) -> Result<TargetId, BackendError> {
        if !self.supports(desc.format, desc.samples) {
            return Err(BackendError::Device(format!(
                "cannot allocate {} target with {} samples",
                desc.format, desc.samples
            )));
        }

        let requested = desc.byte_size();
        if let Some(limit) = self.memory_limit {
            let available = limit.saturating_sub(self.allocated);
            if requested > available {
                return Err(BackendError::OutOfMemory {
                    label: desc.label.clone(),
                    requested,
                    available,
                });
            }
        }

        let id = TargetId(self.next_id);
        self.next_id += 1;
        self.allocated += requested;
        self.targets.insert(
            id,
            SoftwareTarget {
                desc: desc.clone(),
                image: PixelImage::new(desc.width, desc.height),
                writes: 0,
            },
        );
        tracing::trace!(target_id = %id, label = %desc.label, bytes = requested, "allocated software target");
        Ok(id)
    }

    fn release(&mut self, target: TargetId) {
        if let Some(removed) = self.targets.remove(&target) {
            self.allocated = self.allocated.saturating_sub(removed.desc.byte_size());
        }
    }

    fn upload(&mut self, target: TargetId, image: &PixelImage) -> Result<(), BackendError> {
        self.store(target, image.clone())
    }

    fn high_pass(
        &mut self,
        input: TargetId,
        output: TargetId,
        threshold: f32,
    ) -> Result<(), BackendError> {
        let mut image = self.sampled_input(input, output)?;
        for pixel in image.pixels_mut() {
            if luminance(*pixel) <= threshold {
                *pixel = [0.0, 0.0, 0.0, pixel[3]];
            }
        }
        self.store(output, image)
    }

    fn blur(
        &mut self,
        input: TargetId,
        output: TargetId,
        kernel: &BlurKernel,
    ) -> Result<(), BackendError> {
        let image = self.sampled_input(input, output)?;
        let horizontal = convolve(&image, kernel, (1, 0));
        let vertical = convolve(&horizontal, kernel, (0, 1));
        self.store(output, vertical)
    }

    fn read_back(&mut self, target: TargetId) -> Result<PixelImage, BackendError> {
        Ok(self.target(target)?.image.clone())
    }

    fn write_count(&self, target: TargetId) -> u64 {
        self.targets.get(&target).map_or(0, |target| target.writes)
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated
    }
}

fn convolve(image: &PixelImage, kernel: &BlurKernel, (dx, dy): (i64, i64)) -> PixelImage {
    let half_width = kernel.half_width() as i64;
    let weights = kernel.weights();
    PixelImage::from_fn(image.width(), image.height(), |x, y| {
        let mut sum = [0.0f32; 4];
        for offset in -half_width..=half_width {
            let weight = weights[offset.unsigned_abs() as usize];
            let sample = image.clamped(i64::from(x) + offset * dx, i64::from(y) + offset * dy);
            for channel in 0..4 {
                sum[channel] += sample[channel] * weight;
            }
        }
        sum
    })
}

fn quantise(image: &mut PixelImage, format: PixelFormat) {
    match format {
        PixelFormat::Rgba8 => {
            for pixel in image.pixels_mut() {
                *pixel = pixel.map(|value| (value.clamp(0.0, 1.0) * 255.0).round() / 255.0);
            }
        }
        PixelFormat::Rgba16Float => {
            for pixel in image.pixels_mut() {
                *pixel = pixel.map(|value| f16::from_f32(value).to_f32());
            }
        }
        PixelFormat::Rgba32Float | PixelFormat::Depth32Float => {}
    }
}

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use half::f16;
use wgpu::util::DeviceExt;

use super::{GpuBackend, TargetDesc, TargetId};
use crate::blur::BlurKernel;
use crate::error::BackendError;
use crate::pixels::PixelImage;
use crate::types::PixelFormat;

const WEIGHT_VEC4S: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PassParams {
    texel: [f32; 2],
    direction: [f32; 2],
    threshold: f32,
    half_width: u32,
    _pad: [u32; 2],
    weights: [[f32; 4]; WEIGHT_VEC4S],
}

impl PassParams {
    fn new(width: u32, height: u32) -> Self {
        Self {
            texel: [1.0 / width as f32, 1.0 / height as f32],
            direction: [0.0, 0.0],
            threshold: 0.0,
            half_width: 0,
            _pad: [0; 2],
            weights: [[0.0; 4]; WEIGHT_VEC4S],
        }
    }

    fn with_kernel(mut self, kernel: &BlurKernel, direction: [f32; 2]) -> Self {
        self.direction = direction;
        self.half_width = kernel.half_width() as u32;
        for (index, weight) in kernel.weights().iter().enumerate() {
            self.weights[index / 4][index % 4] = *weight;
        }
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum PassKind {
    HighPass,
    Blur,
}

impl PassKind {
    fn entry_point(self) -> &'static str {
        match self {
            PassKind::HighPass => "fs_high_pass",
            PassKind::Blur => "fs_blur",
        }
    }
}

struct GpuTarget {
    desc: TargetDesc,
    format: wgpu::TextureFormat,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    writes: u64,
}

/// Headless `wgpu` backend: one texture per target, full-screen WGSL passes.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    shader: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    pipelines: HashMap<(wgpu::TextureFormat, PassKind), wgpu::RenderPipeline>,
    scratch: HashMap<(u32, u32, wgpu::TextureFormat), (wgpu::Texture, wgpu::TextureView)>,
    targets: HashMap<TargetId, GpuTarget>,
    next_id: u64,
    allocated: u64,
}

impl WgpuBackend {
    pub fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| BackendError::Device(format!("failed to find a GPU adapter: {err}")))?;

        let info = adapter.get_info();
        tracing::debug!(name = %info.name, backend = ?info.backend, device_type = ?info.device_type, "selected GPU adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("frame graph device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| BackendError::Device(format!("failed to create GPU device: {err}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("frame graph passes"),
            source: wgpu::ShaderSource::Wgsl(include_str!("passes.wgsl").into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pass layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("pass pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            device,
            queue,
            adapter_name: info.name,
            shader,
            layout,
            pipeline_layout,
            sampler,
            pipelines: HashMap::new(),
            scratch: HashMap::new(),
            targets: HashMap::new(),
            next_id: 1,
            allocated: 0,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn target(&self, id: TargetId) -> Result<&GpuTarget, BackendError> {
        self.targets.get(&id).ok_or(BackendError::UnknownTarget(id))
    }

    fn create_texture(
        &self,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> Result<wgpu::Texture, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Device(format!(
                "failed to create texture '{label}': {error}"
            )));
        }
        Ok(texture)
    }

    fn pipeline(&mut self, format: wgpu::TextureFormat, kind: PassKind) -> &wgpu::RenderPipeline {
        let device = &self.device;
        let shader = &self.shader;
        let layout = &self.pipeline_layout;
        self.pipelines.entry((format, kind)).or_insert_with(|| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(kind.entry_point()),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: shader,
                    entry_point: Some(kind.entry_point()),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview: None,
                cache: None,
            })
        })
    }

    fn scratch_view(
        &mut self,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> Result<wgpu::TextureView, BackendError> {
        if let Some((_, view)) = self.scratch.get(&(width, height, format)) {
            return Ok(view.clone());
        }
        let texture = self.create_texture("blur scratch", width, height, format)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.scratch
            .insert((width, height, format), (texture, view.clone()));
        Ok(view)
    }

    fn run_pass(
        &mut self,
        kind: PassKind,
        source: &wgpu::TextureView,
        destination: &wgpu::TextureView,
        format: wgpu::TextureFormat,
        params: PassParams,
    ) {
        let uniforms = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("pass params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pass bind group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });

        let pipeline = self.pipeline(format, kind).clone();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kind.entry_point()),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(kind.entry_point()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: destination,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn pass_targets(
        &self,
        input: TargetId,
        output: TargetId,
    ) -> Result<(wgpu::TextureView, wgpu::TextureView, wgpu::TextureFormat, u32, u32), BackendError> {
        if input == output {
            return Err(BackendError::InvalidUse {
                target: output,
                operation: "pass",
                reason: "input and output must be different targets".into(),
            });
        }
        let source = self.target(input)?;
        let destination = self.target(output)?;
        Ok((
            source.view.clone(),
            destination.view.clone(),
            destination.format,
            destination.desc.width,
            destination.desc.height,
        ))
    }

    fn mark_written(&mut self, target: TargetId) {
        if let Some(target) = self.targets.get_mut(&target) {
            target.writes += 1;
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn supports(&self, format: PixelFormat, samples: u32) -> bool {
        samples == 1 && texture_format(format).is_some()
    }

    fn allocate(&mut self, desc: &TargetDesc) -> Result<TargetId, BackendError> {
        let format = match texture_format(desc.format) {
            Some(format) if desc.samples == 1 => format,
            _ => {
                return Err(BackendError::Device(format!(
                    "cannot allocate {} target with {} samples",
                    desc.format, desc.samples
                )))
            }
        };

        let texture = self.create_texture(&desc.label, desc.width, desc.height, format)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = TargetId(self.next_id);
        self.next_id += 1;
        self.allocated += desc.byte_size();
        self.targets.insert(
            id,
            GpuTarget {
                desc: desc.clone(),
                format,
                texture,
                view,
                writes: 0,
            },
        );
        Ok(id)
    }

    fn release(&mut self, target: TargetId) {
        if let Some(removed) = self.targets.remove(&target) {
            self.allocated = self.allocated.saturating_sub(removed.desc.byte_size());
            removed.texture.destroy();
        }
    }

    fn upload(&mut self, target: TargetId, image: &PixelImage) -> Result<(), BackendError> {
        let destination = self.target(target)?;
        let (width, height) = (destination.desc.width, destination.desc.height);
        let resampled = image.resampled(width, height);
        let bytes = encode(&resampled, destination.desc.format);
        let bytes_per_pixel = destination.desc.format.bytes_per_pixel() as u32;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &destination.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * bytes_per_pixel),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.mark_written(target);
        Ok(())
    }

    fn high_pass(
        &mut self,
        input: TargetId,
        output: TargetId,
        threshold: f32,
    ) -> Result<(), BackendError> {
        let (source, destination, format, width, height) = self.pass_targets(input, output)?;
        let mut params = PassParams::new(width, height);
        params.threshold = threshold;
        self.run_pass(PassKind::HighPass, &source, &destination, format, params);
        self.mark_written(output);
        Ok(())
    }

    fn blur(
        &mut self,
        input: TargetId,
        output: TargetId,
        kernel: &BlurKernel,
    ) -> Result<(), BackendError> {
        let (source, destination, format, width, height) = self.pass_targets(input, output)?;
        let scratch = self.scratch_view(width, height, format)?;
        let params = PassParams::new(width, height);
        self.run_pass(
            PassKind::Blur,
            &source,
            &scratch,
            format,
            params.with_kernel(kernel, [1.0, 0.0]),
        );
        self.run_pass(
            PassKind::Blur,
            &scratch,
            &destination,
            format,
            params.with_kernel(kernel, [0.0, 1.0]),
        );
        self.mark_written(output);
        Ok(())
    }

    fn read_back(&mut self, target: TargetId) -> Result<PixelImage, BackendError> {
        let source = self.target(target)?;
        let (width, height) = (source.desc.width, source.desc.height);
        let format = source.desc.format;
        let unpadded = width * format.bytes_per_pixel() as u32;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read back"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read back"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| BackendError::Device(format!("device poll failed: {err}")))?;
        rx.recv()
            .map_err(|_| BackendError::Device("read-back callback dropped".into()))?
            .map_err(|err| BackendError::Device(format!("failed to map read-back buffer: {err}")))?;

        let image = {
            let mapped = slice.get_mapped_range();
            let mut rows = Vec::with_capacity((unpadded * height) as usize);
            for row in mapped.chunks(padded as usize) {
                rows.extend_from_slice(&row[..unpadded as usize]);
            }
            decode(&rows, width, height, format)
        };
        buffer.unmap();
        Ok(image)
    }

    fn write_count(&self, target: TargetId) -> u64 {
        self.targets.get(&target).map_or(0, |target| target.writes)
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated
    }
}

fn texture_format(format: PixelFormat) -> Option<wgpu::TextureFormat> {
    match format {
        PixelFormat::Rgba8 => Some(wgpu::TextureFormat::Rgba8Unorm),
        PixelFormat::Rgba16Float => Some(wgpu::TextureFormat::Rgba16Float),
        // 32-bit float textures are not filterable without an optional feature.
        PixelFormat::Rgba32Float | PixelFormat::Depth32Float => None,
    }
}

fn encode(image: &PixelImage, format: PixelFormat) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(image.pixels().len() * format.bytes_per_pixel());
    for pixel in image.pixels() {
        for value in pixel {
            match format {
                PixelFormat::Rgba8 => bytes.push((value.clamp(0.0, 1.0) * 255.0).round() as u8),
                PixelFormat::Rgba16Float => {
                    bytes.extend_from_slice(&f16::from_f32(*value).to_bits().to_le_bytes())
                }
                PixelFormat::Rgba32Float | PixelFormat::Depth32Float => {
                    bytes.extend_from_slice(&value.to_le_bytes())
                }
            }
        }
    }
    bytes
}

fn decode(bytes: &[u8], width: u32, height: u32, format: PixelFormat) -> PixelImage {
    let mut image = PixelImage::new(width, height);
    let channel_size = format.bytes_per_pixel() / 4;
    for (pixel, chunk) in image
        .pixels_mut()
        .iter_mut()
        .zip(bytes.chunks_exact(format.bytes_per_pixel()))
    {
        for (channel, raw) in pixel.iter_mut().zip(chunk.chunks_exact(channel_size)) {
            *channel = match format {
                PixelFormat::Rgba8 => f32::from(raw[0]) / 255.0,
                PixelFormat::Rgba16Float => f16::from_bits(u16::from_le_bytes([raw[0], raw[1]])).to_f32(),
                PixelFormat::Rgba32Float | PixelFormat::Depth32Float => {
                    f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
                }
            };
        }
    }
    image
}

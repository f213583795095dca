use std::path::PathBuf;

use crate::backend::TargetId;
use crate::types::{BufferKey, PixelFormat};

/// Failures reported by a [`GpuBackend`](crate::backend::GpuBackend).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("out of memory allocating '{label}' ({requested} bytes requested, {available} available)")]
    OutOfMemory {
        label: String,
        requested: u64,
        available: u64,
    },
    #[error("unknown render target {0}")]
    UnknownTarget(TargetId),
    #[error("target {target} cannot be used for {operation}: {reason}")]
    InvalidUse {
        target: TargetId,
        operation: &'static str,
        reason: String,
    },
    #[error("device error: {0}")]
    Device(String),
}

/// Errors raised while building or running the frame graph.
///
/// Everything except [`RenderError::Pass`] is a configuration or resource
/// error surfaced while constructing the pipeline or resizing its buffers;
/// none of them are retried.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("invalid buffer scale {factor}; expected a finite factor in (0, 4]")]
    InvalidScale { factor: f32 },
    #[error("{backend} backend does not support {format} buffers with {samples} sample(s) (requested for '{key}')")]
    UnsupportedFormat {
        key: BufferKey,
        format: PixelFormat,
        samples: u32,
        backend: &'static str,
    },
    #[error("buffer '{key}' is already registered with a different descriptor")]
    ConflictingConfig { key: BufferKey },
    #[error("invalid blur radius {radius} for '{label}'; expected a finite value in (0, 63]")]
    InvalidRadius { label: String, radius: f32 },
    #[error("node label '{0}' is already used in this graph")]
    DuplicateNode(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("buffer '{0}' is not allocated")]
    UnknownBuffer(BufferKey),
    #[error("failed to allocate buffer '{key}': {source}")]
    Allocation {
        key: BufferKey,
        #[source]
        source: BackendError,
    },
    #[error("pass '{label}' failed: {source}")]
    Pass {
        label: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

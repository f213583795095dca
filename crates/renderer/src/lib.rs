//! Frame-graph node framework.
//!
//! Passes are [`RenderNode`]s registered once, in order, with a
//! [`FrameGraphBuilder`]. Each node declares the buffers it reads and writes
//! as [`BufferConfig`]s; the [`BufferPool`] turns those into render targets
//! sized relative to the display and rebuilds them when the display changes.
//! Whether a node runs in a given frame is decided by its [`ConditionGate`],
//! usually bound to a live setting from [`rendercfg::Settings`]. The overall
//! flow is:
//!
//! ```text
//!   Settings::set / SettingsRemote ──▶ listeners ──▶ ConditionGate (refresh)
//!                                                        │
//!   FrameGraph::render_frame ──▶ evaluate(snapshot) ──▶ task list ──▶ process()
//!                                                                  │
//!                                     BufferPool ──▶ GpuBackend ◀──┘
//! ```
//!
//! The bloom effect in [`bloom`] is built entirely out of these pieces: a
//! high-pass node followed by three [`BlurNode`]s at 1/2, 1/4 and 1/8 scale.

pub mod backend;
pub mod bloom;
pub mod blur;
mod error;
pub mod graph;
pub mod node;
pub mod pixels;
pub mod pool;
pub mod source;
mod types;

pub use backend::{GpuBackend, SoftwareBackend, TargetDesc, TargetId};
#[cfg(feature = "gpu")]
pub use backend::WgpuBackend;
pub use bloom::{BloomCascade, HighPassNode};
pub use blur::{BlurKernel, BlurNode};
pub use error::{BackendError, RenderError};
pub use graph::{FrameGraph, FrameGraphBuilder, FrameReport, PassTiming};
pub use node::{ActivationPolicy, ConditionGate, NodeDiagnostics, PassContext, RenderNode};
pub use pixels::PixelImage;
pub use pool::{BufferHandle, BufferPool};
pub use source::SceneSourceNode;
pub use types::{BufferConfig, BufferKey, BufferScale, DisplayResolution, PixelFormat};

/// Backends compiled into this build, by CLI name.
pub fn available_backends() -> &'static [&'static str] {
    if cfg!(feature = "gpu") {
        &["software", "gpu"]
    } else {
        &["software"]
    }
}

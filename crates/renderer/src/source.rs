use rendercfg::Settings;

use crate::error::RenderError;
use crate::node::{ConditionGate, PassContext, RenderNode};
use crate::pixels::PixelImage;
use crate::types::{BufferConfig, BufferScale, PixelFormat};

pub const SCENE_OPAQUE_FBO: &str = "engine:fbo.sceneOpaque";

/// Uploads a CPU image into the full-resolution scene colour buffer each
/// frame; it stands in for the scene renderer at the head of the graph.
pub struct SceneSourceNode {
    label: String,
    outputs: [BufferConfig; 1],
    image: PixelImage,
    gate: ConditionGate,
}

impl SceneSourceNode {
    pub fn new(image: PixelImage, format: PixelFormat) -> Self {
        Self {
            label: "engine:sceneSourceNode".to_string(),
            outputs: [scene_buffer(format)],
            image,
            gate: ConditionGate::new(),
        }
    }

    pub fn image(&self) -> &PixelImage {
        &self.image
    }

    pub fn set_image(&mut self, image: PixelImage) {
        self.image = image;
    }
}

/// Config of the buffer a [`SceneSourceNode`] writes.
pub fn scene_buffer(format: PixelFormat) -> BufferConfig {
    BufferConfig::new(SCENE_OPAQUE_FBO, BufferScale::FULL, format)
}

impl RenderNode for SceneSourceNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn inputs(&self) -> &[BufferConfig] {
        &[]
    }

    fn outputs(&self) -> &[BufferConfig] {
        &self.outputs
    }

    fn gate(&self) -> &ConditionGate {
        &self.gate
    }

    fn gate_mut(&mut self) -> &mut ConditionGate {
        &mut self.gate
    }

    fn setup_conditions(&mut self, _settings: &Settings) {}

    fn process(&mut self, ctx: &mut PassContext<'_>) -> Result<(), RenderError> {
        let output = ctx.target(&self.outputs[0].key)?;
        ctx.backend().upload(output, &self.image)?;
        Ok(())
    }
}

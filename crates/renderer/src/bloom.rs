//! Bloom: high-pass extraction followed by a three-stage blur cascade.
//!
//! The cascade runs the same fixed-radius blur at 1/2, 1/4 and 1/8 of the
//! display resolution, each stage reading the previous one. Blurring an
//! already downsampled image widens the effective footprint without widening
//! the kernel. Every stage shares the `bloom` setting as its only condition.

use rendercfg::{SettingKey, Settings};

use crate::blur::{BlurKernel, BlurNode};
use crate::error::RenderError;
use crate::node::{ActivationPolicy, ConditionGate, PassContext, RenderNode};
use crate::pixels::PixelImage;
use crate::source::{scene_buffer, SceneSourceNode};
use crate::types::{BufferConfig, BufferScale, PixelFormat};

pub const HIGH_PASS_FBO: &str = "engine:fbo.highPass";
pub const HALF_SCALE_FBO: &str = "engine:fbo.halfScaleBlurredBloom";
pub const QUARTER_SCALE_FBO: &str = "engine:fbo.quarterScaleBlurredBloom";
pub const ONE_8TH_SCALE_FBO: &str = "engine:fbo.oneEightScaleBlurredBloom";

/// Blur radius shared by every cascade stage.
pub const BLOOM_BLUR_RADIUS: f32 = 12.0;

/// Storage format for intermediate targets.
pub fn intermediate_format(hdr: bool) -> PixelFormat {
    if hdr {
        PixelFormat::Rgba16Float
    } else {
        PixelFormat::Rgba8
    }
}

pub fn high_pass_buffer(format: PixelFormat) -> BufferConfig {
    BufferConfig::new(HIGH_PASS_FBO, BufferScale::FULL, format)
}

/// Output configs of the three cascade stages, largest first.
pub fn cascade_buffers(format: PixelFormat) -> [BufferConfig; 3] {
    [
        BufferConfig::new(HALF_SCALE_FBO, BufferScale::HALF, format),
        BufferConfig::new(QUARTER_SCALE_FBO, BufferScale::QUARTER, format),
        BufferConfig::new(ONE_8TH_SCALE_FBO, BufferScale::ONE_8TH, format),
    ]
}

/// A bloom blur stage: [`BLOOM_BLUR_RADIUS`], gated on the `bloom` setting.
pub fn bloom_blur_node(label: impl Into<String>, input: BufferConfig, output: BufferConfig) -> BlurNode {
    BlurNode::with_kernel(
        label.into(),
        input,
        output,
        BlurKernel::from_radius(BLOOM_BLUR_RADIUS),
    )
    .with_policy(ActivationPolicy::Setting(SettingKey::Bloom))
}

/// The three chained blur stages of the bloom effect.
pub struct BloomCascade {
    stages: [BlurNode; 3],
}

impl BloomCascade {
    /// Chains half, quarter and one-eighth scale stages starting from `source`.
    pub fn new(source: BufferConfig, format: PixelFormat) -> Self {
        let [half, quarter, eighth] = cascade_buffers(format);
        Self {
            stages: [
                bloom_blur_node("engine:halfScaleBlurredBloomNode", source, half.clone()),
                bloom_blur_node("engine:quarterScaleBlurredBloomNode", half, quarter.clone()),
                bloom_blur_node("engine:one8thScaleBlurredBloomNode", quarter, eighth),
            ],
        }
    }

    pub fn stages(&self) -> &[BlurNode; 3] {
        &self.stages
    }

    pub fn into_nodes(self) -> [BlurNode; 3] {
        self.stages
    }
}

/// Keeps the pixels of the scene brighter than `bloom_high_pass_threshold`,
/// read from the frame's settings snapshot.
pub struct HighPassNode {
    label: String,
    inputs: [BufferConfig; 1],
    outputs: [BufferConfig; 1],
    gate: ConditionGate,
}

impl HighPassNode {
    pub fn new(input: BufferConfig, output: BufferConfig) -> Self {
        Self {
            label: "engine:highPassNode".to_string(),
            inputs: [input],
            outputs: [output],
            gate: ConditionGate::new(),
        }
    }
}

impl RenderNode for HighPassNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn inputs(&self) -> &[BufferConfig] {
        &self.inputs
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

    fn setup_conditions(&mut self, settings: &Settings) {
        ActivationPolicy::Setting(SettingKey::Bloom).apply(&mut self.gate, settings);
    }

    fn process(&mut self, ctx: &mut PassContext<'_>) -> Result<(), RenderError> {
        let threshold = ctx.config().bloom_high_pass_threshold;
        let input = ctx.target(&self.inputs[0].key)?;
        let output = ctx.target(&self.outputs[0].key)?;
        ctx.backend().high_pass(input, output, threshold)?;
        Ok(())
    }
}

/// Scene source, high pass and the blur cascade, in execution order.
pub fn bloom_pipeline(scene: PixelImage, format: PixelFormat) -> Vec<Box<dyn RenderNode>> {
    let mut nodes: Vec<Box<dyn RenderNode>> = vec![
        Box::new(SceneSourceNode::new(scene, format)),
        Box::new(HighPassNode::new(scene_buffer(format), high_pass_buffer(format))),
    ];
    for stage in BloomCascade::new(high_pass_buffer(format), format).into_nodes() {
        nodes.push(Box::new(stage));
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_stages_chain_at_shrinking_scales() {
        let cascade = BloomCascade::new(high_pass_buffer(PixelFormat::Rgba8), PixelFormat::Rgba8);
        let stages = cascade.stages();

        assert_eq!(stages[0].input().key.as_str(), HIGH_PASS_FBO);
        assert_eq!(stages[0].output().key.as_str(), HALF_SCALE_FBO);
        assert_eq!(stages[1].input(), stages[0].output());
        assert_eq!(stages[2].input(), stages[1].output());
        assert_eq!(stages[2].output().key.as_str(), ONE_8TH_SCALE_FBO);

        let scales: Vec<f32> = stages.iter().map(|stage| stage.output().scale.factor()).collect();
        assert_eq!(scales, vec![0.5, 0.25, 0.125]);
        for stage in stages {
            assert_eq!(stage.radius(), BLOOM_BLUR_RADIUS);
            assert_eq!(stage.policy(), ActivationPolicy::Setting(SettingKey::Bloom));
        }
    }

    #[test]
    fn pipeline_orders_source_high_pass_then_cascade() {
        let nodes = bloom_pipeline(PixelImage::new(4, 4), intermediate_format(true));
        let labels: Vec<&str> = nodes.iter().map(|node| node.label()).collect();
        assert_eq!(
            labels,
            vec![
                "engine:sceneSourceNode",
                "engine:highPassNode",
                "engine:halfScaleBlurredBloomNode",
                "engine:quarterScaleBlurredBloomNode",
                "engine:one8thScaleBlurredBloomNode",
            ]
        );
        assert_eq!(nodes[1].outputs()[0].format, PixelFormat::Rgba16Float);
    }
}

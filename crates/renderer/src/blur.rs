//! Generic two-axis separable blur pass.

use rendercfg::Settings;

use crate::error::RenderError;
use crate::node::{ActivationPolicy, ConditionGate, PassContext, RenderNode};
use crate::types::BufferConfig;

/// Symmetric 1-D Gaussian weights derived from a blur radius.
///
/// `weights()[0]` is the centre tap and `weights()[i]` applies to offsets
/// `+i` and `-i`; the full kernel sums to one.
#[derive(Debug, Clone, PartialEq)]
pub struct BlurKernel {
    radius: f32,
    weights: Vec<f32>,
}

impl BlurKernel {
    /// Largest number of taps on either side of the centre.
    pub const MAX_HALF_WIDTH: usize = 63;

    /// Builds the kernel for `radius` (in output texels). Callers validate the
    /// radius; non-positive values collapse to a single tap on each side.
    pub fn from_radius(radius: f32) -> Self {
        let half_width = (radius.ceil().max(1.0) as usize).min(Self::MAX_HALF_WIDTH);
        let sigma = (radius / 2.0).max(0.5);
        let denominator = 2.0 * sigma * sigma;

        let mut weights: Vec<f32> = (0..=half_width)
            .map(|offset| {
                let offset = offset as f32;
                (-(offset * offset) / denominator).exp()
            })
            .collect();
        let total = weights[0] + 2.0 * weights[1..].iter().sum::<f32>();
        for weight in &mut weights {
            *weight /= total;
        }

        Self { radius, weights }
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn half_width(&self) -> usize {
        self.weights.len() - 1
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }
}

/// Blurs one input buffer into one output buffer.
///
/// The radius must lie in `(0, BlurKernel::MAX_HALF_WIDTH]`, so a larger
/// radius always means a wider and more expensive kernel.
///
/// When the gate is closed the pass is skipped and the output keeps whatever
/// it held from the last frame that ran.
pub struct BlurNode {
    label: String,
    inputs: [BufferConfig; 1],
    outputs: [BufferConfig; 1],
    kernel: BlurKernel,
    policy: ActivationPolicy,
    gate: ConditionGate,
}

impl BlurNode {
    pub fn new(
        label: impl Into<String>,
        input: BufferConfig,
        output: BufferConfig,
        radius: f32,
    ) -> Result<Self, RenderError> {
        let label = label.into();
        if !radius.is_finite() || radius <= 0.0 || radius > BlurKernel::MAX_HALF_WIDTH as f32 {
            return Err(RenderError::InvalidRadius { label, radius });
        }
        Ok(Self::with_kernel(label, input, output, BlurKernel::from_radius(radius)))
    }

    pub(crate) fn with_kernel(
        label: String,
        input: BufferConfig,
        output: BufferConfig,
        kernel: BlurKernel,
    ) -> Self {
        Self {
            label,
            inputs: [input],
            outputs: [output],
            kernel,
            policy: ActivationPolicy::Always,
            gate: ConditionGate::new(),
        }
    }

    pub fn with_policy(mut self, policy: ActivationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn radius(&self) -> f32 {
        self.kernel.radius()
    }

    pub fn kernel(&self) -> &BlurKernel {
        &self.kernel
    }

    pub fn input(&self) -> &BufferConfig {
        &self.inputs[0]
    }

    pub fn output(&self) -> &BufferConfig {
        &self.outputs[0]
    }

    pub fn policy(&self) -> ActivationPolicy {
        self.policy
    }
}

impl RenderNode for BlurNode {
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
        self.policy.apply(&mut self.gate, settings);
    }

    fn process(&mut self, ctx: &mut PassContext<'_>) -> Result<(), RenderError> {
        let input = ctx.target(&self.inputs[0].key)?;
        let output = ctx.target(&self.outputs[0].key)?;
        ctx.backend().blur(input, output, &self.kernel)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferScale, PixelFormat};

    fn config(key: &str) -> BufferConfig {
        BufferConfig::new(key, BufferScale::HALF, PixelFormat::Rgba8)
    }

    #[test]
    fn kernel_is_normalised_and_decreasing() {
        for radius in [0.5, 1.0, 2.5, 12.0, 40.0] {
            let kernel = BlurKernel::from_radius(radius);
            let weights = kernel.weights();
            let total = weights[0] + 2.0 * weights[1..].iter().sum::<f32>();
            assert!((total - 1.0).abs() < 1e-5, "radius {radius} sums to {total}");
            assert!(weights.windows(2).all(|pair| pair[0] >= pair[1]));
        }
    }

    #[test]
    fn larger_radius_widens_the_footprint() {
        let narrow = BlurKernel::from_radius(2.0);
        let wide = BlurKernel::from_radius(12.0);
        assert_eq!(narrow.half_width(), 2);
        assert_eq!(wide.half_width(), 12);
        assert!(wide.weights()[0] < narrow.weights()[0]);
        assert_eq!(
            BlurKernel::from_radius(500.0).half_width(),
            BlurKernel::MAX_HALF_WIDTH
        );
    }

    #[test]
    fn rejects_radius_outside_the_kernel_range() {
        for radius in [0.0, -1.0, f32::NAN, f32::INFINITY, 63.5, 500.0] {
            let err = BlurNode::new("blur", config("in"), config("out"), radius).err();
            assert!(matches!(err, Some(RenderError::InvalidRadius { .. })));
        }
        let widest = BlurNode::new("blur", config("in"), config("out"), 63.0).unwrap();
        assert_eq!(widest.kernel().half_width(), BlurKernel::MAX_HALF_WIDTH);
    }

    #[test]
    fn node_exposes_its_wiring() {
        let node = BlurNode::new("blur", config("in"), config("out"), 4.0).unwrap();
        assert_eq!(node.label(), "blur");
        assert_eq!(node.inputs()[0].key.as_str(), "in");
        assert_eq!(node.outputs()[0].key.as_str(), "out");
        assert_eq!(node.policy(), ActivationPolicy::Always);
        assert!(!node.is_enabled());
    }
}

//! Fixed-order frame graph.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rendercfg::{RenderingConfig, Settings};

use crate::error::RenderError;
use crate::node::{NodeDiagnostics, PassContext, RenderNode};
use crate::pixels::PixelImage;
use crate::pool::BufferPool;
use crate::types::{BufferKey, DisplayResolution};

/// Collects nodes in execution order.
#[derive(Default)]
pub struct FrameGraphBuilder {
    nodes: Vec<Box<dyn RenderNode>>,
}

impl FrameGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<N>(&mut self, node: N) -> Result<&mut Self, RenderError>
    where
        N: RenderNode + 'static,
    {
        self.add_boxed(Box::new(node))
    }

    pub fn add_boxed(&mut self, node: Box<dyn RenderNode>) -> Result<&mut Self, RenderError> {
        if self.nodes.iter().any(|existing| existing.label() == node.label()) {
            return Err(RenderError::DuplicateNode(node.label().to_string()));
        }
        self.nodes.push(node);
        Ok(self)
    }

    pub fn extend(
        &mut self,
        nodes: impl IntoIterator<Item = Box<dyn RenderNode>>,
    ) -> Result<&mut Self, RenderError> {
        for node in nodes {
            self.add_boxed(node)?;
        }
        Ok(self)
    }

    /// Requests every declared buffer from `pool`, then binds each node's
    /// conditions to `settings`.
    ///
    /// Any configuration or allocation error aborts the build; buffers already
    /// requested are returned to the pool.
    pub fn build(self, mut pool: BufferPool, settings: Settings) -> Result<FrameGraph, RenderError> {
        let mut produced: HashSet<BufferKey> = HashSet::new();
        let mut requested: Vec<BufferKey> = Vec::new();

        for node in &self.nodes {
            for config in node.inputs() {
                if !produced.contains(&config.key) {
                    tracing::warn!(
                        node = node.label(),
                        buffer = %config.key,
                        "input is not written by any earlier node; it will read zeroed or stale data"
                    );
                }
            }

            for config in node.inputs().iter().chain(node.outputs()) {
                if let Err(error) = pool.get_or_create(config) {
                    for key in &requested {
                        pool.release(key);
                    }
                    return Err(error);
                }
                requested.push(config.key.clone());
            }

            for config in node.outputs() {
                produced.insert(config.key.clone());
            }
        }

        let snapshot = settings.snapshot();
        let mut slots = Vec::with_capacity(self.nodes.len());
        for mut node in self.nodes {
            node.setup_conditions(&settings);
            node.gate_mut().mark_configured();
            node.gate_mut().evaluate(&snapshot);
            slots.push(NodeSlot {
                node,
                enabled: false,
            });
        }

        tracing::info!(
            nodes = slots.len(),
            buffers = pool.len(),
            resolution = %pool.resolution(),
            backend = pool.backend().name(),
            "frame graph built"
        );

        Ok(FrameGraph {
            slots,
            task_list: Vec::new(),
            task_list_stale: true,
            pool,
            settings,
            snapshot,
            frame: 0,
        })
    }
}

struct NodeSlot {
    node: Box<dyn RenderNode>,
    enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassTiming {
    pub label: String,
    pub duration: Duration,
}

/// Outcome of one [`FrameGraph::render_frame`] call.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// Labels of the nodes that ran, in execution order.
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub timings: Vec<PassTiming>,
}

impl FrameReport {
    pub fn total_duration(&self) -> Duration {
        self.timings.iter().map(|timing| timing.duration).sum()
    }
}

/// Nodes in build order plus the buffers and settings they run against.
pub struct FrameGraph {
    slots: Vec<NodeSlot>,
    task_list: Vec<usize>,
    task_list_stale: bool,
    pool: BufferPool,
    settings: Settings,
    snapshot: RenderingConfig,
    frame: u64,
}

impl FrameGraph {
    pub fn builder() -> FrameGraphBuilder {
        FrameGraphBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.node.label())
    }

    pub fn node(&self, label: &str) -> Option<&dyn RenderNode> {
        self.slots
            .iter()
            .find(|slot| slot.node.label() == label)
            .map(|slot| slot.node.as_ref())
    }

    /// Runs one frame.
    ///
    /// Queued remote setting changes are applied first. If any node asked for
    /// a refresh, every gate is re-evaluated against one settings snapshot, so
    /// nodes bound to the same setting always agree within a frame. Enabled
    /// nodes execute in build order. The first failing pass aborts the frame.
    pub fn render_frame(&mut self) -> Result<FrameReport, RenderError> {
        self.settings.apply_pending();
        self.refresh_task_list();

        let frame = self.frame;
        let mut report = FrameReport {
            frame,
            ..FrameReport::default()
        };

        let mut ctx = PassContext::new(&mut self.pool, &self.settings, &self.snapshot, frame);
        for &index in &self.task_list {
            let node = &mut self.slots[index].node;
            let started = Instant::now();
            node.process(&mut ctx).map_err(|error| match error {
                RenderError::Backend(source) => RenderError::Pass {
                    label: node.label().to_string(),
                    source,
                },
                other => other,
            })?;
            let duration = started.elapsed();
            tracing::trace!(node = node.label(), frame, ?duration, "pass executed");
            report.executed.push(node.label().to_string());
            report.timings.push(PassTiming {
                label: node.label().to_string(),
                duration,
            });
        }

        report.skipped = self
            .slots
            .iter()
            .filter(|slot| !slot.enabled)
            .map(|slot| slot.node.label().to_string())
            .collect();
        self.frame += 1;
        Ok(report)
    }

    fn refresh_task_list(&mut self) {
        // Flags are taken before the snapshot; a change landing after this
        // point leaves its flag set for the next frame.
        let mut requested = self.task_list_stale;
        for slot in &self.slots {
            requested |= slot.node.gate().take_refresh_request();
        }
        self.snapshot = self.settings.snapshot();

        if !requested {
            return;
        }

        let mut changed = self.task_list_stale;
        for slot in &mut self.slots {
            slot.node.gate_mut().evaluate(&self.snapshot);
            let enabled = slot.node.is_enabled();
            if enabled != slot.enabled {
                slot.enabled = enabled;
                changed = true;
            }
        }

        if !changed {
            return;
        }

        self.task_list = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.enabled)
            .map(|(index, _)| index)
            .collect();
        self.task_list_stale = false;
        tracing::debug!(
            frame = self.frame,
            enabled = self.task_list.len(),
            total = self.slots.len(),
            "rebuilt task list"
        );
    }

    pub fn resize(&mut self, resolution: DisplayResolution) -> Result<bool, RenderError> {
        self.pool.resize(resolution)
    }

    /// Sets the explicit enable flag of the node labelled `label`.
    pub fn set_node_enabled(&mut self, label: &str, enabled: bool) -> Result<(), RenderError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.node.label() == label)
            .ok_or_else(|| RenderError::UnknownNode(label.to_string()))?;
        slot.node.gate_mut().set_enabled(enabled);
        Ok(())
    }

    pub fn diagnostics(&self) -> Vec<NodeDiagnostics> {
        self.slots.iter().map(|slot| slot.node.diagnostics()).collect()
    }

    pub fn read_buffer(&mut self, key: &BufferKey) -> Result<PixelImage, RenderError> {
        self.pool.read(key)
    }

    pub fn write_count(&self, key: &BufferKey) -> u64 {
        self.pool.write_count(key)
    }

    /// Tears the graph down: cancels node subscriptions and returns every
    /// buffer the nodes requested.
    pub fn shutdown(mut self) -> BufferPool {
        for slot in &mut self.slots {
            slot.node.gate_mut().release();
            for config in slot.node.inputs().iter().chain(slot.node.outputs()) {
                self.pool.release(&config.key);
            }
        }
        tracing::debug!(remaining = self.pool.len(), "frame graph shut down");
        self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::blur::BlurNode;
    use crate::node::ConditionGate;
    use crate::types::{BufferConfig, BufferScale, PixelFormat};
    use rendercfg::{SettingKey, SettingValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pool() -> BufferPool {
        BufferPool::new(
            Box::new(SoftwareBackend::new()),
            DisplayResolution::new(64, 32),
        )
    }

    fn blur(label: &str, input: &str, output: &str) -> BlurNode {
        BlurNode::new(
            label,
            BufferConfig::new(input, BufferScale::FULL, PixelFormat::Rgba8),
            BufferConfig::new(output, BufferScale::HALF, PixelFormat::Rgba8),
            2.0,
        )
        .unwrap()
    }

    struct CountingNode {
        gate: ConditionGate,
        evaluations: Arc<AtomicUsize>,
    }

    impl RenderNode for CountingNode {
        fn label(&self) -> &str {
            "counting"
        }

        fn inputs(&self) -> &[BufferConfig] {
            &[]
        }

        fn outputs(&self) -> &[BufferConfig] {
            &[]
        }

        fn gate(&self) -> &ConditionGate {
            &self.gate
        }

        fn gate_mut(&mut self) -> &mut ConditionGate {
            &mut self.gate
        }

        fn setup_conditions(&mut self, settings: &Settings) {
            self.gate.watch(settings, SettingKey::Bloom);
            let evaluations = Arc::clone(&self.evaluations);
            self.gate.requires_condition(move |config| {
                evaluations.fetch_add(1, Ordering::SeqCst);
                config.bloom
            });
        }

        fn process(&mut self, _ctx: &mut PassContext<'_>) -> Result<(), RenderError> {
            Ok(())
        }
    }

    #[test]
    fn gates_are_only_re_evaluated_after_a_watched_change() {
        let settings = Settings::default();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let mut builder = FrameGraph::builder();
        builder
            .add(CountingNode {
                gate: ConditionGate::new(),
                evaluations: Arc::clone(&evaluations),
            })
            .unwrap();
        let mut graph = builder.build(pool(), settings.clone()).unwrap();
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            assert_eq!(graph.render_frame().unwrap().executed, vec!["counting"]);
        }
        assert_eq!(evaluations.load(Ordering::SeqCst), 2);

        settings
            .set(SettingKey::BloomHighPassThreshold, SettingValue::Float(0.1))
            .unwrap();
        graph.render_frame().unwrap();
        assert_eq!(evaluations.load(Ordering::SeqCst), 2);

        settings
            .set(SettingKey::Bloom, SettingValue::Bool(false))
            .unwrap();
        let report = graph.render_frame().unwrap();
        assert_eq!(evaluations.load(Ordering::SeqCst), 3);
        assert_eq!(report.skipped, vec!["counting"]);
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut builder = FrameGraph::builder();
        builder.add(blur("a", "in", "out")).unwrap();
        assert!(matches!(
            builder.add(blur("a", "in", "other")),
            Err(RenderError::DuplicateNode(_))
        ));
    }

    #[test]
    fn set_node_enabled_skips_and_restores_a_node() {
        let mut builder = FrameGraph::builder();
        builder.add(blur("a", "in", "out")).unwrap();
        let mut graph = builder.build(pool(), Settings::default()).unwrap();

        assert_eq!(graph.render_frame().unwrap().executed, vec!["a"]);

        graph.set_node_enabled("a", false).unwrap();
        let report = graph.render_frame().unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(report.skipped, vec!["a"]);

        graph.set_node_enabled("a", true).unwrap();
        assert_eq!(graph.render_frame().unwrap().executed, vec!["a"]);
        assert!(matches!(
            graph.set_node_enabled("missing", true),
            Err(RenderError::UnknownNode(_))
        ));
    }

    #[test]
    fn failed_build_returns_requested_buffers() {
        let mut builder = FrameGraph::builder();
        builder.add(blur("a", "in", "out")).unwrap();
        builder
            .add(
                BlurNode::new(
                    "b",
                    BufferConfig::new("out", BufferScale::QUARTER, PixelFormat::Rgba8),
                    BufferConfig::new("final", BufferScale::QUARTER, PixelFormat::Rgba8),
                    1.0,
                )
                .unwrap(),
            )
            .unwrap();
        let err = builder.build(pool(), Settings::default()).err();
        assert!(matches!(err, Some(RenderError::ConflictingConfig { .. })));
    }

    #[test]
    fn shutdown_releases_buffers_and_subscriptions() {
        let settings = Settings::default();
        let mut builder = FrameGraph::builder();
        builder
            .extend(crate::bloom::bloom_pipeline(
                PixelImage::new(8, 8),
                PixelFormat::Rgba8,
            ))
            .unwrap();
        let graph = builder.build(pool(), settings.clone()).unwrap();
        assert!(settings.listener_count(rendercfg::SettingKey::Bloom) > 0);

        let pool = graph.shutdown();
        assert!(pool.is_empty());
        assert_eq!(pool.backend().allocated_bytes(), 0);
        assert_eq!(settings.listener_count(rendercfg::SettingKey::Bloom), 0);
    }
}

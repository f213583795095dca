use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rendercfg::{ListenerError, RenderingConfig, SettingKey, SettingValue, Settings};
use renderer::bloom::{
    self, HALF_SCALE_FBO, HIGH_PASS_FBO, ONE_8TH_SCALE_FBO, QUARTER_SCALE_FBO,
};
use renderer::source::SCENE_OPAQUE_FBO;
use renderer::{
    BufferConfig, BufferKey, BufferPool, ConditionGate, DisplayResolution, FrameGraph, PassContext,
    PixelFormat, PixelImage, RenderError, RenderNode, SoftwareBackend,
};

const HALF_NODE: &str = "engine:halfScaleBlurredBloomNode";
const QUARTER_NODE: &str = "engine:quarterScaleBlurredBloomNode";
const EIGHTH_NODE: &str = "engine:one8thScaleBlurredBloomNode";

fn cascade_keys() -> [BufferKey; 3] {
    [
        BufferKey::new(HALF_SCALE_FBO),
        BufferKey::new(QUARTER_SCALE_FBO),
        BufferKey::new(ONE_8TH_SCALE_FBO),
    ]
}

fn build_graph(settings: &Settings, width: u32, height: u32) -> FrameGraph {
    let pool = BufferPool::new(
        Box::new(SoftwareBackend::new()),
        DisplayResolution::new(width, height),
    );
    let mut builder = FrameGraph::builder();
    builder
        .extend(bloom::bloom_pipeline(
            PixelImage::test_pattern(width, height),
            PixelFormat::Rgba16Float,
        ))
        .unwrap();
    builder.build(pool, settings.clone()).unwrap()
}

fn settings_with_bloom(enabled: bool) -> Settings {
    Settings::new(RenderingConfig {
        bloom: enabled,
        ..RenderingConfig::default()
    })
}

#[test]
fn enabled_cascade_runs_half_quarter_eighth_in_order() {
    let settings = settings_with_bloom(true);
    let mut graph = build_graph(&settings, 128, 64);

    let report = graph.render_frame().unwrap();
    assert_eq!(
        report.executed,
        vec![
            "engine:sceneSourceNode",
            "engine:highPassNode",
            HALF_NODE,
            QUARTER_NODE,
            EIGHTH_NODE,
        ]
    );
    assert!(report.skipped.is_empty());
    assert_eq!(report.timings.len(), 5);

    for key in cascade_keys() {
        assert_eq!(graph.write_count(&key), 1, "{key} written once");
    }

    let eighth = graph.read_buffer(&BufferKey::new(ONE_8TH_SCALE_FBO)).unwrap();
    assert_eq!((eighth.width(), eighth.height()), (16, 8));
    assert!(eighth.mean()[0] > 0.0, "bright pixels reach the last stage");
}

#[test]
fn disabled_bloom_performs_no_cascade_writes() {
    let settings = settings_with_bloom(false);
    let mut graph = build_graph(&settings, 128, 64);

    let report = graph.render_frame().unwrap();
    assert_eq!(report.executed, vec!["engine:sceneSourceNode"]);
    assert_eq!(report.skipped.len(), 4);

    assert_eq!(graph.write_count(&BufferKey::new(SCENE_OPAQUE_FBO)), 1);
    assert_eq!(graph.write_count(&BufferKey::new(HIGH_PASS_FBO)), 0);
    for key in cascade_keys() {
        assert_eq!(graph.write_count(&key), 0);
    }
}

#[test]
fn disabled_stages_keep_their_last_output() {
    let settings = settings_with_bloom(true);
    let mut graph = build_graph(&settings, 128, 64);
    graph.render_frame().unwrap();

    let before: Vec<PixelImage> = cascade_keys()
        .iter()
        .map(|key| graph.read_buffer(key).unwrap())
        .collect();

    settings
        .set(SettingKey::Bloom, SettingValue::Bool(false))
        .unwrap();
    for _ in 0..5 {
        let report = graph.render_frame().unwrap();
        assert_eq!(report.executed.len(), 1);
    }

    for (key, previous) in cascade_keys().iter().zip(&before) {
        assert_eq!(&graph.read_buffer(key).unwrap(), previous);
        assert_eq!(graph.write_count(key), 1);
    }
}

#[test]
fn only_the_last_toggle_before_a_frame_counts() {
    let settings = settings_with_bloom(false);
    let mut graph = build_graph(&settings, 64, 64);
    graph.render_frame().unwrap();

    let remote = settings.remote();
    remote.set(SettingKey::Bloom, SettingValue::Bool(true));
    remote.set(SettingKey::Bloom, SettingValue::Bool(false));
    remote.set(SettingKey::Bloom, SettingValue::Bool(true));
    let report = graph.render_frame().unwrap();
    assert_eq!(report.executed.len(), 5);

    settings
        .set(SettingKey::Bloom, SettingValue::Bool(false))
        .unwrap();
    settings
        .set(SettingKey::Bloom, SettingValue::Bool(true))
        .unwrap();
    settings
        .set(SettingKey::Bloom, SettingValue::Bool(false))
        .unwrap();
    let report = graph.render_frame().unwrap();
    assert_eq!(report.executed, vec!["engine:sceneSourceNode"]);
    assert!(graph
        .diagnostics()
        .iter()
        .filter(|node| node.label != "engine:sceneSourceNode")
        .all(|node| !node.enabled));
}

#[test]
fn failing_listener_does_not_block_node_gates() {
    let settings = settings_with_bloom(true);
    let _failing = settings.subscribe(SettingKey::Bloom, |_| Err(ListenerError::new("broken")));
    let mut graph = build_graph(&settings, 64, 32);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _counting = settings.subscribe(SettingKey::Bloom, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    settings
        .set(SettingKey::Bloom, SettingValue::Bool(false))
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(graph.render_frame().unwrap().executed.len(), 1);
}

#[test]
fn resize_recreates_buffers_at_the_new_resolution() {
    let settings = settings_with_bloom(true);
    let mut graph = build_graph(&settings, 128, 64);
    graph.render_frame().unwrap();
    let old_half = graph
        .pool()
        .handle(&BufferKey::new(HALF_SCALE_FBO))
        .unwrap();

    assert!(graph.resize(DisplayResolution::new(1001, 3)).unwrap());
    assert!(!old_half.is_valid());

    let expected = [(501, 2), (250, 1), (125, 1)];
    for (key, (width, height)) in cascade_keys().iter().zip(expected) {
        let handle = graph.pool().handle(key).unwrap();
        assert!(handle.is_valid());
        assert_eq!((handle.width(), handle.height()), (width, height));
        assert_eq!(graph.write_count(key), 0);
    }

    graph.render_frame().unwrap();
    let half = graph.read_buffer(&BufferKey::new(HALF_SCALE_FBO)).unwrap();
    assert_eq!((half.width(), half.height()), (501, 2));
}

#[test]
fn partially_disabled_cascade_reads_stale_upstream_output() {
    let settings = settings_with_bloom(true);
    let mut graph = build_graph(&settings, 128, 64);
    graph.render_frame().unwrap();

    graph.set_node_enabled(QUARTER_NODE, false).unwrap();
    let report = graph.render_frame().unwrap();
    assert!(!report.executed.iter().any(|label| label == QUARTER_NODE));
    assert!(report.executed.iter().any(|label| label == EIGHTH_NODE));

    assert_eq!(graph.write_count(&BufferKey::new(QUARTER_SCALE_FBO)), 1);
    assert_eq!(graph.write_count(&BufferKey::new(ONE_8TH_SCALE_FBO)), 2);
}

#[test]
fn high_pass_threshold_is_read_live() {
    let settings = settings_with_bloom(true);
    let mut graph = build_graph(&settings, 64, 32);

    settings
        .set(SettingKey::BloomHighPassThreshold, SettingValue::Float(5.0))
        .unwrap();
    graph.render_frame().unwrap();
    let high_pass = graph.read_buffer(&BufferKey::new(HIGH_PASS_FBO)).unwrap();
    assert!(high_pass.mean()[..3].iter().all(|channel| *channel == 0.0));

    settings
        .set(SettingKey::BloomHighPassThreshold, SettingValue::Float(0.0))
        .unwrap();
    graph.render_frame().unwrap();
    let high_pass = graph.read_buffer(&BufferKey::new(HIGH_PASS_FBO)).unwrap();
    assert!(high_pass.mean()[0] > 0.0);
}

#[test]
fn allocation_failure_aborts_the_build() {
    let pool = BufferPool::new(
        Box::new(SoftwareBackend::new().with_memory_limit(1024)),
        DisplayResolution::new(128, 64),
    );
    let mut builder = FrameGraph::builder();
    builder
        .extend(bloom::bloom_pipeline(
            PixelImage::new(1, 1),
            PixelFormat::Rgba16Float,
        ))
        .unwrap();
    let err = builder.build(pool, Settings::default()).err();
    assert!(matches!(err, Some(RenderError::Allocation { .. })));
}

/// Turns bloom off from inside its own condition, the first time the gates
/// are evaluated.
struct BloomSwitchNode {
    gate: ConditionGate,
    fired: Arc<AtomicBool>,
}

impl RenderNode for BloomSwitchNode {
    fn label(&self) -> &str {
        "bloomSwitch"
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
        let settings = settings.clone();
        let fired = Arc::clone(&self.fired);
        self.gate.requires_condition(move |_| {
            if !fired.swap(true, Ordering::SeqCst) {
                settings
                    .set(SettingKey::Bloom, SettingValue::Bool(false))
                    .unwrap();
            }
            true
        });
    }

    fn process(&mut self, _ctx: &mut PassContext<'_>) -> Result<(), RenderError> {
        Ok(())
    }
}

#[test]
fn cascade_stages_agree_when_bloom_changes_during_evaluation() {
    let settings = settings_with_bloom(true);
    let pool = BufferPool::new(
        Box::new(SoftwareBackend::new()),
        DisplayResolution::new(64, 32),
    );
    let mut nodes = bloom::bloom_pipeline(PixelImage::test_pattern(64, 32), PixelFormat::Rgba8);
    let half = nodes
        .iter()
        .position(|node| node.label() == HALF_NODE)
        .unwrap();
    nodes.insert(
        half + 1,
        Box::new(BloomSwitchNode {
            gate: ConditionGate::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }),
    );
    let mut builder = FrameGraph::builder();
    builder.extend(nodes).unwrap();
    let mut graph = builder.build(pool, settings.clone()).unwrap();

    // The switch fires while the gates are evaluated at build time.
    assert!(!settings.bool(SettingKey::Bloom));
    let first = graph.render_frame().unwrap();
    let ran: Vec<bool> = [HALF_NODE, QUARTER_NODE, EIGHTH_NODE]
        .iter()
        .map(|label| first.executed.iter().any(|executed| executed == label))
        .collect();
    assert!(ran.iter().all(|stage| *stage == ran[0]), "{:?}", first.executed);
    assert!(!ran[0]);

    settings
        .set(SettingKey::Bloom, SettingValue::Bool(true))
        .unwrap();
    let second = graph.render_frame().unwrap();
    assert_eq!(
        second.executed,
        vec![
            "engine:sceneSourceNode",
            "engine:highPassNode",
            HALF_NODE,
            "bloomSwitch",
            QUARTER_NODE,
            EIGHTH_NODE,
        ]
    );
}

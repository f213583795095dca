//! Render node contract and the condition gate that decides participation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rendercfg::{RenderingConfig, SettingKey, Settings, Subscription};

use crate::backend::{GpuBackend, TargetId};
use crate::error::RenderError;
use crate::pool::BufferPool;
use crate::types::{BufferConfig, BufferKey};

type Condition = Box<dyn Fn(&RenderingConfig) -> bool + Send + Sync>;

/// Enable/disable decision for one node.
///
/// A node participates in a frame when it has been configured, has not been
/// explicitly disabled and every registered condition held at the last
/// [`ConditionGate::evaluate`]. Conditions only see the settings snapshot they
/// are evaluated against.
pub struct ConditionGate {
    conditions: Vec<Condition>,
    conditions_hold: bool,
    explicitly_enabled: bool,
    configured: bool,
    subscriptions: Vec<Subscription>,
    refresh: Arc<AtomicBool>,
}

impl ConditionGate {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
            conditions_hold: true,
            explicitly_enabled: true,
            configured: false,
            subscriptions: Vec::new(),
            refresh: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adds a predicate; the gate reports disabled until the next evaluation.
    pub fn requires_condition<F>(&mut self, condition: F)
    where
        F: Fn(&RenderingConfig) -> bool + Send + Sync + 'static,
    {
        self.conditions.push(Box::new(condition));
        self.conditions_hold = false;
        self.refresh.store(true, Ordering::Release);
    }

    /// Subscribes to `key` so that a change requests re-evaluation.
    /// The subscription lives as long as the gate.
    pub fn watch(&mut self, settings: &Settings, key: SettingKey) {
        let refresh = Arc::clone(&self.refresh);
        let subscription = settings.subscribe(key, move |_| {
            refresh.store(true, Ordering::Release);
            Ok(())
        });
        self.subscriptions.push(subscription);
    }

    pub fn mark_configured(&mut self) {
        self.configured = true;
        self.refresh.store(true, Ordering::Release);
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Re-runs every condition against `snapshot` and returns the new decision.
    pub fn evaluate(&mut self, snapshot: &RenderingConfig) -> bool {
        self.conditions_hold = self.conditions.iter().all(|condition| condition(snapshot));
        self.is_enabled()
    }

    pub fn is_enabled(&self) -> bool {
        self.configured && self.explicitly_enabled && self.conditions_hold
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.explicitly_enabled != enabled {
            self.explicitly_enabled = enabled;
            self.refresh.store(true, Ordering::Release);
        }
    }

    pub fn is_explicitly_enabled(&self) -> bool {
        self.explicitly_enabled
    }

    /// Returns and clears the pending refresh request.
    pub fn take_refresh_request(&self) -> bool {
        self.refresh.swap(false, Ordering::AcqRel)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Cancels every subscription and drops all conditions; the gate reports
    /// disabled afterwards.
    pub fn release(&mut self) {
        self.subscriptions.clear();
        self.conditions.clear();
        self.configured = false;
    }
}

impl Default for ConditionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionGate")
            .field("conditions", &self.conditions.len())
            .field("conditions_hold", &self.conditions_hold)
            .field("explicitly_enabled", &self.explicitly_enabled)
            .field("configured", &self.configured)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// How a node binds its gate during `setup_conditions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationPolicy {
    Always,
    /// Enabled while the boolean setting is true.
    Setting(SettingKey),
}

impl ActivationPolicy {
    pub fn apply(self, gate: &mut ConditionGate, settings: &Settings) {
        match self {
            ActivationPolicy::Always => {}
            ActivationPolicy::Setting(key) => {
                gate.watch(settings, key);
                gate.requires_condition(move |config| config.get(key).as_bool().unwrap_or(false));
            }
        }
    }
}

/// Access a node gets while executing its pass.
pub struct PassContext<'a> {
    pool: &'a mut BufferPool,
    settings: &'a Settings,
    config: &'a RenderingConfig,
    frame: u64,
}

impl<'a> PassContext<'a> {
    pub(crate) fn new(
        pool: &'a mut BufferPool,
        settings: &'a Settings,
        config: &'a RenderingConfig,
        frame: u64,
    ) -> Self {
        Self {
            pool,
            settings,
            config,
            frame,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn settings(&self) -> &Settings {
        self.settings
    }

    /// Settings as of the start of this frame.
    pub fn config(&self) -> &RenderingConfig {
        self.config
    }

    /// Backend target currently bound to `key`.
    pub fn target(&self, key: &BufferKey) -> Result<TargetId, RenderError> {
        self.pool.target(key)
    }

    pub fn backend(&mut self) -> &mut dyn GpuBackend {
        self.pool.backend_mut()
    }
}

/// One pass of the frame graph.
///
/// Nodes declare the buffers they read and write as [`BufferConfig`]s and
/// resolve them to targets through the [`PassContext`] at execution time, so a
/// resize never leaves a node holding a stale handle.
pub trait RenderNode: Send {
    fn label(&self) -> &str;

    fn inputs(&self) -> &[BufferConfig];

    fn outputs(&self) -> &[BufferConfig];

    fn gate(&self) -> &ConditionGate;

    fn gate_mut(&mut self) -> &mut ConditionGate;

    /// Called once after construction, before the first frame.
    fn setup_conditions(&mut self, settings: &Settings);

    fn process(&mut self, ctx: &mut PassContext<'_>) -> Result<(), RenderError>;

    fn is_enabled(&self) -> bool {
        self.gate().is_enabled()
    }

    fn diagnostics(&self) -> NodeDiagnostics {
        NodeDiagnostics {
            label: self.label().to_string(),
            inputs: self.inputs().iter().map(|config| config.key.clone()).collect(),
            outputs: self.outputs().iter().map(|config| config.key.clone()).collect(),
            enabled: self.is_enabled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDiagnostics {
    pub label: String,
    pub inputs: Vec<BufferKey>,
    pub outputs: Vec<BufferKey>,
    pub enabled: bool,
}

impl fmt::Display for NodeDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |keys: &[BufferKey]| {
            keys.iter()
                .map(BufferKey::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "{} [{}] inputs: [{}] outputs: [{}]",
            self.label,
            if self.enabled { "enabled" } else { "disabled" },
            join(&self.inputs),
            join(&self.outputs)
        )
    }
}

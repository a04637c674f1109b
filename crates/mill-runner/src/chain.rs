//! Composition of lifecycle modules around the base task.
//!
//! Every layer implements [`TaskBehavior`]. A [`Layer`] pairs one module with
//! the layer it wraps, so a hook runs its own logic and calls `next` to reach
//! the inner layers. The first declared module is the outermost layer: its
//! pre-delegation logic runs first and its post-delegation logic runs last.

use crate::services::{ExecutionReport, Services};
use crate::task::Task;
use anyhow::Result;
use mill_core::Phase;
use mill_descriptor::Descriptor;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;

pub const BASE_LAYER: &str = "base";

/// Which view of the descriptor a caller wants. Modules may hand out a
/// patched duplicate for some views (extra inputs, injected choices, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorView {
    Form,
    Phase(Phase),
}

impl From<Phase> for DescriptorView {
    fn from(phase: Phase) -> Self {
        Self::Phase(phase)
    }
}

/// Per-call state shared by all layers of one phase dispatch.
pub struct PhaseContext<'a> {
    pub phase: Phase,
    pub descriptor: Arc<Descriptor>,
    pub services: &'a Services,
    trail: RefCell<Vec<String>>,
    base_reached: Cell<bool>,
}

impl<'a> PhaseContext<'a> {
    pub fn new(phase: Phase, descriptor: Arc<Descriptor>, services: &'a Services) -> Self {
        Self {
            phase,
            descriptor,
            services,
            trail: RefCell::new(Vec::new()),
            base_reached: Cell::new(false),
        }
    }

    pub fn base_reached(&self) -> bool {
        self.base_reached.get()
    }

    pub(crate) fn mark_base_reached(&self) {
        self.base_reached.set(true);
    }

    fn enter(&self, layer: &str) {
        self.trail.borrow_mut().push(layer.to_string());
    }

    /// Layers entered during this call, outermost first.
    pub fn trail(&self) -> Vec<String> {
        self.trail.borrow().clone()
    }
}

/// Context attached to an error by the layer it originated in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFault {
    pub layer: String,
}

impl fmt::Display for LayerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer '{}' failed", self.layer)
    }
}

pub fn attribute(err: anyhow::Error, layer: &str) -> anyhow::Error {
    if err.downcast_ref::<LayerFault>().is_some() {
        return err;
    }
    err.context(LayerFault {
        layer: layer.to_string(),
    })
}

pub fn fault_layer(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<LayerFault>().map(|f| f.layer.as_str())
}

pub trait TaskBehavior: Send + Sync {
    fn layer_name(&self) -> &str;

    fn descriptor_for(
        &self,
        view: DescriptorView,
        task: &Task,
        services: &Services,
    ) -> Result<Arc<Descriptor>>;

    fn before_form(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<String>;

    fn after_form(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<String>;

    fn final_task_list(&self, task: &Task, cx: &PhaseContext<'_>) -> Result<Vec<Task>>;

    fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<bool>;

    fn build_commands(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<Vec<String>>;

    fn save_results(
        &self,
        task: &mut Task,
        report: &ExecutionReport,
        cx: &PhaseContext<'_>,
    ) -> Result<bool>;
}

/// An optional behavior extension. Every hook defaults to delegating to
/// `next` unchanged; a module overrides only the phases it cares about.
pub trait LifecycleModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn descriptor_for(
        &self,
        view: DescriptorView,
        task: &Task,
        services: &Services,
        next: &dyn TaskBehavior,
    ) -> Result<Arc<Descriptor>> {
        next.descriptor_for(view, task, services)
    }

    fn before_form(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<String> {
        next.before_form(task, cx)
    }

    fn after_form(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<String> {
        next.after_form(task, cx)
    }

    fn final_task_list(
        &self,
        task: &Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<Vec<Task>> {
        next.final_task_list(task, cx)
    }

    fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>, next: &dyn TaskBehavior) -> Result<bool> {
        next.setup(task, cx)
    }

    fn build_commands(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<Vec<String>> {
        next.build_commands(task, cx)
    }

    fn save_results(
        &self,
        task: &mut Task,
        report: &ExecutionReport,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<bool> {
        next.save_results(task, report, cx)
    }
}

/// A module bound to its position in a tool's chain.
#[derive(Clone)]
pub struct ModuleBinding {
    pub name: String,
    pub module: Arc<dyn LifecycleModule>,
}

impl ModuleBinding {
    pub fn new(name: impl Into<String>, module: Arc<dyn LifecycleModule>) -> Self {
        Self {
            name: name.into(),
            module,
        }
    }
}

impl fmt::Debug for ModuleBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBinding")
            .field("name", &self.name)
            .finish()
    }
}

pub struct Layer {
    module: Arc<dyn LifecycleModule>,
    inner: Box<dyn TaskBehavior>,
}

impl TaskBehavior for Layer {
    fn layer_name(&self) -> &str {
        self.module.name()
    }

    fn descriptor_for(
        &self,
        view: DescriptorView,
        task: &Task,
        services: &Services,
    ) -> Result<Arc<Descriptor>> {
        self.module
            .descriptor_for(view, task, services, self.inner.as_ref())
            .map_err(|err| attribute(err, self.module.name()))
    }

    fn before_form(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<String> {
        cx.enter(self.module.name());
        self.module
            .before_form(task, cx, self.inner.as_ref())
            .map_err(|err| attribute(err, self.module.name()))
    }

    fn after_form(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<String> {
        cx.enter(self.module.name());
        self.module
            .after_form(task, cx, self.inner.as_ref())
            .map_err(|err| attribute(err, self.module.name()))
    }

    fn final_task_list(&self, task: &Task, cx: &PhaseContext<'_>) -> Result<Vec<Task>> {
        cx.enter(self.module.name());
        self.module
            .final_task_list(task, cx, self.inner.as_ref())
            .map_err(|err| attribute(err, self.module.name()))
    }

    fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<bool> {
        cx.enter(self.module.name());
        self.module
            .setup(task, cx, self.inner.as_ref())
            .map_err(|err| attribute(err, self.module.name()))
    }

    fn build_commands(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<Vec<String>> {
        cx.enter(self.module.name());
        self.module
            .build_commands(task, cx, self.inner.as_ref())
            .map_err(|err| attribute(err, self.module.name()))
    }

    fn save_results(
        &self,
        task: &mut Task,
        report: &ExecutionReport,
        cx: &PhaseContext<'_>,
    ) -> Result<bool> {
        cx.enter(self.module.name());
        self.module
            .save_results(task, report, cx, self.inner.as_ref())
            .map_err(|err| attribute(err, self.module.name()))
    }
}

/// The base task wrapped by every bound module.
pub struct ComposedTask {
    outer: Box<dyn TaskBehavior>,
    layers: Vec<String>,
}

impl ComposedTask {
    pub fn outer(&self) -> &dyn TaskBehavior {
        self.outer.as_ref()
    }

    /// Layer names from outermost to the base.
    pub fn layers(&self) -> &[String] {
        &self.layers
    }
}

/// Wraps `base` with `bindings`; `bindings[0]` ends up outermost.
pub fn build_chain(base: Box<dyn TaskBehavior>, bindings: &[ModuleBinding]) -> ComposedTask {
    let mut layers: Vec<String> = bindings.iter().map(|b| b.name.clone()).collect();
    layers.push(base.layer_name().to_string());
    let outer = bindings.iter().rev().fold(base, |inner, binding| {
        Box::new(Layer {
            module: binding.module.clone(),
            inner,
        }) as Box<dyn TaskBehavior>
    });
    ComposedTask { outer, layers }
}

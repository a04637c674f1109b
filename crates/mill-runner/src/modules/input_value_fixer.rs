use super::config_map;
use crate::chain::{DescriptorView, LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::Services;
use crate::task::Task;
use anyhow::Result;
use mill_core::{EngineError, Phase};
use mill_descriptor::{is_truthy, Descriptor, InputType};
use serde_json::{Map, Value};
use std::sync::Arc;

const NAME: &str = "InputValueFixer";

/// Pins inputs to administrator-chosen values. The form never shows them and
/// the fixed values are merged back into the invocation before validation.
/// A null value (or a false flag) removes the input from the invocation.
pub struct InputValueFixer {
    fixed: Map<String, Value>,
    removed: Vec<String>,
}

impl InputValueFixer {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let fixed = config_map(NAME, config)?.clone();
        let mut removed = Vec::new();
        for (input_id, value) in &fixed {
            let input = descriptor.input_by_id(input_id)?;
            if value.is_null() || (input.kind == InputType::Flag && !is_truthy(value)) {
                removed.push(input_id.clone());
            }
        }
        Ok(Self { fixed, removed })
    }

    fn without_fixed_inputs(&self, descriptor: &Descriptor) -> Result<Descriptor> {
        let mut patched = descriptor.duplicate_for_patch();
        for group in &mut patched.groups {
            let assigned = group
                .members
                .iter()
                .any(|m| self.fixed.contains_key(m) && !self.removed.contains(m));
            if group.mutually_exclusive && assigned {
                group.mutually_exclusive = false;
                group.one_is_required = false;
            }
        }
        for input_id in self.fixed.keys() {
            if patched.has_input(input_id) {
                patched.remove_input(input_id)?;
            }
        }
        Ok(patched)
    }
}

impl LifecycleModule for InputValueFixer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn descriptor_for(
        &self,
        view: DescriptorView,
        task: &Task,
        services: &Services,
        next: &dyn TaskBehavior,
    ) -> Result<Arc<Descriptor>> {
        let inner = next.descriptor_for(view, task, services)?;
        match view {
            DescriptorView::Form | DescriptorView::Phase(Phase::BeforeForm) => {
                Ok(Arc::new(self.without_fixed_inputs(&inner)?))
            }
            _ => Ok(inner),
        }
    }

    fn after_form(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<String> {
        for (input_id, value) in &self.fixed {
            if self.removed.contains(input_id) {
                task.invocation.remove(input_id);
            } else {
                task.invocation.insert(input_id.clone(), value.clone());
            }
        }
        next.after_form(task, cx)
    }
}

use super::{config_str, malformed};
use crate::chain::{DescriptorView, LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::Services;
use crate::task::Task;
use anyhow::Result;
use mill_core::{EngineError, Phase};
use mill_descriptor::{Descriptor, InputType};
use serde_json::Value;
use std::sync::Arc;

const NAME: &str = "InputValueFanOut";

/// Lets the user pick several values for one input and launches one task
/// per picked value. The form view accepts a list for the input; each
/// launched task gets a single value back in the input's declared shape.
pub struct InputValueFanOut {
    input_id: String,
}

impl InputValueFanOut {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let input_id = config_str(NAME, config, "input id")?;
        let input = descriptor.input_by_id(input_id)?;
        if input.kind == InputType::Flag {
            return Err(malformed(NAME, format!("cannot fan out on flag {}", input_id)));
        }
        Ok(Self {
            input_id: input_id.to_string(),
        })
    }
}

impl LifecycleModule for InputValueFanOut {
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
        let multi_valued = matches!(
            view,
            DescriptorView::Form | DescriptorView::Phase(Phase::AfterForm)
        );
        if !multi_valued || inner.input_by_id(&self.input_id)?.list {
            return Ok(inner);
        }
        let mut patched = inner.duplicate_for_patch();
        let input = patched.input_by_id_mut(&self.input_id)?;
        input.list = true;
        input.min_list_entries = None;
        input.max_list_entries = None;
        Ok(Arc::new(patched))
    }

    fn final_task_list(
        &self,
        task: &Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<Vec<Task>> {
        let values = task.invocation.values_of(&self.input_id);
        let declared_list = task.descriptor.input_by_id(&self.input_id)?.list;
        if values.len() <= 1 {
            let mut single = task.clone();
            if let (false, [value]) = (declared_list, values.as_slice()) {
                single.invocation.insert(self.input_id.clone(), value.clone());
            }
            return next.final_task_list(&single, cx);
        }
        let bound: Vec<Value> = values
            .into_iter()
            .map(|value| {
                if declared_list {
                    Value::Array(vec![value])
                } else {
                    value
                }
            })
            .collect();
        let mut tasks = Vec::new();
        for sibling in task.fan_out(&self.input_id, &bound) {
            tasks.extend(next.final_task_list(&sibling, cx)?);
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_rig;
    use crate::modules::testing::compose;
    use mill_descriptor::Invocation;
    use serde_json::json;

    fn descriptor() -> Descriptor {
        Descriptor::from_value(json!({
            "name": "sweep",
            "command-line": "sweep [CHOICE] [SEED]",
            "inputs": [
                {"id": "choice", "type": "String", "value-key": "[CHOICE]",
                 "value-choices": ["a", "b", "c"]},
                {"id": "seed", "type": "Number", "integer": true, "value-key": "[SEED]"}
            ],
            "output-files": []
        }))
        .expect("descriptor")
    }

    #[test]
    fn each_selected_value_gets_its_own_task() {
        let descriptor = descriptor();
        let module = InputValueFanOut::from_config(&descriptor, &json!("choice")).expect("module");
        let chain = compose(Arc::new(module));
        let rig = test_rig();
        let task = Task::new(
            "task_9",
            Arc::new(descriptor),
            Invocation::from_value(json!({"choice": ["a", "b", "c"], "seed": 7}))
                .expect("invocation"),
        );

        let form = chain
            .outer()
            .descriptor_for(DescriptorView::Form, &task, &rig.services)
            .expect("form");
        assert!(form.input_by_id("choice").expect("choice").list);
        assert!(!task.descriptor.input_by_id("choice").expect("choice").list);

        let cx = PhaseContext::new(Phase::Invoke, task.descriptor.clone(), &rig.services);
        let tasks = chain.outer().final_task_list(&task, &cx).expect("tasks");
        assert_eq!(tasks.len(), 3);
        for (sibling, expected) in tasks.iter().zip(["a", "b", "c"]) {
            assert_eq!(sibling.invocation.get("choice"), Some(&json!(expected)));
            assert_eq!(sibling.invocation.get("seed"), Some(&json!(7)));
        }
        assert_eq!(task.invocation.get("choice"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn a_single_value_is_unwrapped_for_scalar_inputs() {
        let descriptor = descriptor();
        let module = InputValueFanOut::from_config(&descriptor, &json!("choice")).expect("module");
        let chain = compose(Arc::new(module));
        let rig = test_rig();
        let task = Task::new(
            "task_10",
            Arc::new(descriptor),
            Invocation::from_value(json!({"choice": ["b"], "seed": 1})).expect("invocation"),
        );
        let cx = PhaseContext::new(Phase::Invoke, task.descriptor.clone(), &rig.services);
        let tasks = chain.outer().final_task_list(&task, &cx).expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "task_10");
        assert_eq!(tasks[0].invocation.get("choice"), Some(&json!("b")));
    }

    #[test]
    fn flags_cannot_be_fanned_out() {
        let descriptor = Descriptor::from_value(json!({
            "name": "x",
            "command-line": "x [V]",
            "inputs": [{"id": "verbose", "type": "Flag", "command-line-flag": "-v", "value-key": "[V]"}],
            "output-files": []
        }))
        .expect("descriptor");
        let err = match InputValueFanOut::from_config(&descriptor, &json!("verbose")) {
            Ok(_) => panic!("flag fan-out should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("cannot fan out on flag verbose"));
    }
}

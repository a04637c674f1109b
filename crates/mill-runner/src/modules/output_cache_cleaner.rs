use super::config_strings;
use crate::chain::{DescriptorView, LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::{ExecutionReport, Services};
use crate::task::Task;
use anyhow::Result;
use mill_core::{EngineError, Phase};
use mill_descriptor::{is_truthy, Descriptor, Input, InputType};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const NAME: &str = "OutputCacheCleaner";
pub const OUTPUT_CACHE_CLEANER_FLAG: &str = "enable-output-cache-cleaner";
const MODULE_OPTIONS_GROUP: &str = "module-options";

/// Erases the local cache of saved outputs after a successful save, unless
/// the user turned it off through the injected option.
pub struct OutputCacheCleaner {
    outputs: Vec<String>,
}

impl OutputCacheCleaner {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let outputs = config_strings(NAME, config)?;
        for output_id in &outputs {
            descriptor.output_by_id(output_id)?;
        }
        Ok(Self { outputs })
    }

    fn with_option(&self, descriptor: &Descriptor) -> Result<Descriptor> {
        let mut patched = descriptor.duplicate_for_patch();
        let mut flag = Input::new(
            OUTPUT_CACHE_CLEANER_FLAG,
            "Enable output cache cleaning",
            InputType::Flag,
        );
        flag.description = Some(
            "If set, the cached content of produced outputs is erased when the task completes successfully."
                .to_string(),
        );
        flag.default_value = Some(Value::Bool(true));
        patched.add_input(flag)?;
        patched
            .group_entry(MODULE_OPTIONS_GROUP, "Module options")
            .members
            .push(OUTPUT_CACHE_CLEANER_FLAG.to_string());
        Ok(patched)
    }
}

impl LifecycleModule for OutputCacheCleaner {
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
            DescriptorView::Form
            | DescriptorView::Phase(Phase::BeforeForm)
            | DescriptorView::Phase(Phase::AfterForm) => Ok(Arc::new(self.with_option(&inner)?)),
            _ => Ok(inner),
        }
    }

    fn after_form(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<String> {
        let message = next.after_form(task, cx)?;
        if !task.params_errors.is_empty() {
            return Ok(message);
        }
        let enabled = task
            .invocation
            .remove(OUTPUT_CACHE_CLEANER_FLAG)
            .map(|value| is_truthy(&value))
            .unwrap_or(true);
        task.context.output_cache_cleaning = Some(enabled);
        Ok(message)
    }

    fn save_results(
        &self,
        task: &mut Task,
        report: &ExecutionReport,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<bool> {
        if !next.save_results(task, report, cx)? {
            return Ok(false);
        }
        if task.context.output_cache_cleaning == Some(false) {
            return Ok(true);
        }
        for output_id in &self.outputs {
            let saved = task
                .context
                .saved_outputs
                .get(output_id)
                .cloned()
                .unwrap_or_default();
            for id in saved {
                cx.services.cache.erase(id)?;
                info!(task = %task.id, file = %id, module = NAME, "erased output cache");
                task.addlog(format!("erased cached content of output {} (file {})", output_id, id));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{test_rig, TempDirGuard};
    use crate::modules::testing::compose;
    use mill_core::ensure_dir;
    use mill_descriptor::Invocation;
    use serde_json::json;
    use std::fs;

    fn descriptor() -> Descriptor {
        Descriptor::from_value(json!({
            "name": "render",
            "command-line": "render > [OUT]",
            "inputs": [],
            "output-files": [{"id": "image", "value-key": "[OUT]", "path-template": "out.png"}]
        }))
        .expect("descriptor")
    }

    #[test]
    fn option_is_injected_into_form_views_only() {
        let descriptor = descriptor();
        let module = OutputCacheCleaner::from_config(&descriptor, &json!(["image"])).expect("module");
        let chain = compose(Arc::new(module));
        let rig = test_rig();
        let task = Task::new("t", Arc::new(descriptor), Invocation::new());

        let form = chain
            .outer()
            .descriptor_for(DescriptorView::Form, &task, &rig.services)
            .expect("form");
        let flag = form.input_by_id(OUTPUT_CACHE_CLEANER_FLAG).expect("flag");
        assert_eq!(flag.default_value, Some(json!(true)));
        assert_eq!(
            form.group_by_id(MODULE_OPTIONS_GROUP).expect("group").members,
            vec![OUTPUT_CACHE_CLEANER_FLAG]
        );
        let setup_view = chain
            .outer()
            .descriptor_for(DescriptorView::Phase(Phase::Setup), &task, &rig.services)
            .expect("setup view");
        assert!(!setup_view.has_input(OUTPUT_CACHE_CLEANER_FLAG));
    }

    #[test]
    fn saved_outputs_are_erased_unless_disabled() {
        for (flag, expect_erased) in [(json!(true), true), (json!(false), false)] {
            let descriptor = descriptor();
            let module =
                OutputCacheCleaner::from_config(&descriptor, &json!(["image"])).expect("module");
            let chain = compose(Arc::new(module));
            let rig = test_rig();
            let root = TempDirGuard::new("mill_occ");
            let mut task = Task::new(
                "t",
                Arc::new(descriptor),
                Invocation::from_value(json!({ OUTPUT_CACHE_CLEANER_FLAG: flag })).expect("inv"),
            );
            task.work_dir = Some(root.path.join("t"));

            let view = chain
                .outer()
                .descriptor_for(DescriptorView::Phase(Phase::AfterForm), &task, &rig.services)
                .expect("view");
            let cx = PhaseContext::new(Phase::AfterForm, view, &rig.services);
            chain.outer().after_form(&mut task, &cx).expect("after_form");
            assert!(task.params_errors.is_empty(), "{}", task.params_errors);
            assert!(!task.invocation.contains(OUTPUT_CACHE_CLEANER_FLAG));

            let work_dir = task.work_dir.clone().expect("work dir");
            ensure_dir(&work_dir).expect("work dir");
            fs::write(work_dir.join("out.png"), b"png").expect("output");
            let cx = PhaseContext::new(Phase::SaveResults, task.descriptor.clone(), &rig.services);
            let saved = chain
                .outer()
                .save_results(&mut task, &ExecutionReport::exited(0), &cx)
                .expect("save");
            assert!(saved);
            assert_eq!(!rig.cache.erased().is_empty(), expect_erased);
        }
    }
}

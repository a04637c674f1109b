use super::{config_map, malformed, require_file_input};
use crate::chain::{DescriptorView, LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::Services;
use crate::task::Task;
use anyhow::Result;
use mill_core::{normalize_relative_path, EngineError};
use mill_descriptor::Descriptor;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const NAME: &str = "InputSubdirMaker";

/// Places the files of selected inputs under a fixed subdirectory of the
/// work directory: `{input_id: subdir}` (or `{input_id: [subdir]}`).
pub struct InputSubdirMaker {
    subdirs: Vec<(String, PathBuf)>,
}

impl InputSubdirMaker {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let mut subdirs = Vec::new();
        for (input_id, entry) in config_map(NAME, config)? {
            require_file_input(NAME, descriptor, input_id)?;
            let raw = match entry {
                Value::String(dir) => dir.as_str(),
                Value::Array(parts) => parts.first().and_then(Value::as_str).ok_or_else(|| {
                    malformed(NAME, format!("input {} needs a directory name", input_id))
                })?,
                _ => {
                    return Err(malformed(
                        NAME,
                        format!("input {} needs a directory name", input_id),
                    ))
                }
            };
            subdirs.push((input_id.clone(), normalize_relative_path(raw)?));
        }
        Ok(Self { subdirs })
    }

    fn place(&self, task: &mut Task) {
        for (input_id, subdir) in &self.subdirs {
            task.context
                .input_subdirs
                .insert(input_id.clone(), subdir.clone());
        }
    }
}

impl LifecycleModule for InputSubdirMaker {
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
        if view != DescriptorView::Form {
            return Ok(inner);
        }
        let mut patched = inner.duplicate_for_patch();
        for (input_id, subdir) in &self.subdirs {
            let input = patched.input_by_id_mut(input_id)?;
            let note = format!(
                "This input is placed in the folder {}, which is used on the command line.",
                subdir.display()
            );
            input.description = Some(match input.description.take() {
                Some(text) if !text.is_empty() => format!("{}\n{}", text, note),
                _ => note,
            });
        }
        Ok(Arc::new(patched))
    }

    fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>, next: &dyn TaskBehavior) -> Result<bool> {
        self.place(task);
        task.addlog("placing inputs in their subdirectories");
        next.setup(task, cx)
    }

    fn build_commands(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<Vec<String>> {
        self.place(task);
        next.build_commands(task, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_types::FileType;
    use crate::memory::{test_rig, TempDirGuard};
    use crate::modules::testing::compose;
    use crate::services::FileId;
    use mill_core::Phase;
    use mill_descriptor::Invocation;
    use serde_json::json;

    #[test]
    fn inputs_land_in_their_subdir_and_tokens_follow() {
        let descriptor = Descriptor::from_value(json!({
            "name": "bids-app",
            "command-line": "run [DATASET] [SUBJECT]",
            "inputs": [
                {"id": "dataset", "type": "File", "value-key": "[DATASET]"},
                {"id": "subject", "type": "String", "value-key": "[SUBJECT]"}
            ],
            "output-files": []
        }))
        .expect("descriptor");
        let module =
            InputSubdirMaker::from_config(&descriptor, &json!({"dataset": ["bids"]})).expect("module");
        let chain = compose(Arc::new(module));
        let rig = test_rig();
        rig.store.add_file(FileId(5), "ds001", FileType::FileCollection);
        let root = TempDirGuard::new("mill_subdir");
        let mut task = Task::new(
            "t",
            Arc::new(descriptor),
            Invocation::from_value(json!({"dataset": 5, "subject": "01"})).expect("invocation"),
        );
        task.work_dir = Some(root.path.join("t"));

        let cx = PhaseContext::new(Phase::Setup, task.descriptor.clone(), &rig.services);
        assert!(chain.outer().setup(&mut task, &cx).expect("setup"));
        assert!(root.path.join("t").join("bids").join("ds001").is_dir());

        let cx = PhaseContext::new(Phase::BuildCommands, task.descriptor.clone(), &rig.services);
        let commands = chain.outer().build_commands(&mut task, &cx).expect("commands");
        assert_eq!(commands, vec!["run bids/ds001 01"]);

        let form = chain
            .outer()
            .descriptor_for(DescriptorView::Form, &task, &rig.services)
            .expect("form");
        let note = form.input_by_id("dataset").expect("input").description.clone();
        assert!(note.expect("description").contains("folder bids"));
    }

    #[test]
    fn escaping_subdirs_are_rejected() {
        let descriptor = Descriptor::from_value(json!({
            "name": "x",
            "command-line": "x [IN]",
            "inputs": [{"id": "in", "type": "File", "value-key": "[IN]"}],
            "output-files": []
        }))
        .expect("descriptor");
        assert!(matches!(
            InputSubdirMaker::from_config(&descriptor, &json!({"in": "../up"})),
            Err(EngineError::UnsafePath { .. })
        ));
    }
}

use super::{compile, config_str, malformed};
use crate::chain::{DescriptorView, LifecycleModule, PhaseContext, TaskBehavior};
use crate::file_types::FileType;
use crate::services::Services;
use crate::task::Task;
use anyhow::Result;
use mill_core::{EngineError, Phase};
use mill_descriptor::Descriptor;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

const NAME: &str = "CollectionBasenamesListMaker";

/// Offers, as the choices of an input, a value extracted from the names of
/// the entries of the one selected collection of a given type. Configured as
/// `[input_id, TypeName, regex]`; capture group 1 of the regex is the value.
/// Selecting several values launches one task per value.
pub struct CollectionBasenamesListMaker {
    input_id: String,
    collection_type: FileType,
    regex: Regex,
}

impl CollectionBasenamesListMaker {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let parts = match config.as_array() {
            Some(parts) if parts.len() == 3 => parts,
            _ => return Err(malformed(NAME, "expected [input_id, TypeName, regex]")),
        };
        let input_id = config_str(NAME, &parts[0], "input id")?;
        descriptor.input_by_id(input_id)?;
        let type_name = config_str(NAME, &parts[1], "file type")?;
        let collection_type = FileType::from_name(type_name)
            .filter(|ty| ty.is_a(FileType::FileCollection))
            .ok_or_else(|| {
                malformed(NAME, format!("'{}' is not a collection type", type_name))
            })?;
        let regex = compile(NAME, config_str(NAME, &parts[2], "regex")?)?;
        if regex.captures_len() < 2 {
            return Err(malformed(NAME, "the regex needs a capture group"));
        }
        Ok(Self {
            input_id: input_id.to_string(),
            collection_type,
            regex,
        })
    }

    fn choices(&self, task: &Task, services: &Services) -> Result<Option<Vec<Value>>> {
        let mut collections = Vec::new();
        for id in &task.interface_files {
            if let Some(record) = services.files.find(*id)? {
                if record.file_type.is_a(self.collection_type) {
                    collections.push(record.id);
                }
            }
        }
        let [collection] = collections.as_slice() else {
            return Ok(None);
        };
        let entries = services.collection_entries(*collection)?;
        let mut choices: Vec<Value> = Vec::new();
        for entry in entries.iter() {
            let basename = Path::new(entry)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let Some(value) = self
                .regex
                .captures(&basename)
                .and_then(|caps| caps.get(1))
                .map(|m| Value::String(m.as_str().to_string()))
            else {
                continue;
            };
            if !choices.contains(&value) {
                choices.push(value);
            }
        }
        Ok(Some(choices))
    }
}

impl LifecycleModule for CollectionBasenamesListMaker {
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
        let wants_choices = matches!(
            view,
            DescriptorView::Form | DescriptorView::Phase(Phase::AfterForm)
        );
        if !wants_choices {
            return Ok(inner);
        }
        let Some(choices) = self.choices(task, services)? else {
            return Ok(inner);
        };
        let mut patched = inner.duplicate_for_patch();
        patched.input_by_id_mut(&self.input_id)?.value_choices = Some(choices);
        Ok(Arc::new(patched))
    }

    fn final_task_list(
        &self,
        task: &Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<Vec<Task>> {
        let values = task.invocation.values_of(&self.input_id);
        if values.len() <= 1 {
            return next.final_task_list(task, cx);
        }
        let singletons: Vec<Value> = values.into_iter().map(|v| Value::Array(vec![v])).collect();
        let mut tasks = Vec::new();
        for sibling in task.fan_out(&self.input_id, &singletons) {
            tasks.extend(next.final_task_list(&sibling, cx)?);
        }
        Ok(tasks)
    }
}

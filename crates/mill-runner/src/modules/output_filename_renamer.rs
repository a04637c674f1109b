//! Lets users name an output through a pattern such as
//! `{1}_{date}_brainmask.nii`. Placeholders are filled at setup from the
//! clock, the task id, and the alphanumeric runs of a selected input's name.

use super::{compile, config_map, config_str, is_legal_file_name, malformed, require_file_input};
use crate::chain::{DescriptorView, LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::{ExecutionReport, FileId, Services};
use crate::task::Task;
use anyhow::Result;
use chrono::{DateTime, Utc};
use mill_core::{EngineError, Phase};
use mill_descriptor::{Descriptor, InputType};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const NAME: &str = "OutputFilenameRenamer";

struct Rename {
    name_input: String,
    file_input: String,
}

/// Configured as `{name_input_id: file_input_id}`. The name input holds the
/// pattern; the file input supplies the numbered placeholders.
pub struct OutputFilenameRenamer {
    renames: Vec<Rename>,
    placeholder: Regex,
}

impl OutputFilenameRenamer {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let mut renames = Vec::new();
        for (name_input, file_input) in config_map(NAME, config)? {
            if descriptor.input_by_id(name_input)?.kind != InputType::String {
                return Err(malformed(
                    NAME,
                    format!("input {} is not a String input", name_input),
                ));
            }
            let file_input = config_str(NAME, file_input, "file input id")?;
            require_file_input(NAME, descriptor, file_input)?;
            renames.push(Rename {
                name_input: name_input.clone(),
                file_input: file_input.to_string(),
            });
        }
        Ok(Self {
            renames,
            placeholder: compile(NAME, r"\{([A-Za-z0-9_]+)\}")?,
        })
    }

    fn with_explanations(&self, descriptor: &Descriptor) -> Result<Descriptor> {
        let mut patched = descriptor.duplicate_for_patch();
        for rename in &self.renames {
            let file_label = patched.input_by_id(&rename.file_input)?.display_name().to_string();
            let input = patched.input_by_id_mut(&rename.name_input)?;
            let mut text = input
                .description
                .take()
                .map(|d| format!("{}\n\n", d.trim_end()))
                .unwrap_or_default();
            text.push_str(&explanation(&file_label));
            input.description = Some(text);
        }
        Ok(patched)
    }

    fn render(&self, pattern: &str, input_name: &str, task_id: &str, now: DateTime<Utc>) -> String {
        let mut keywords: BTreeMap<String, String> = BTreeMap::new();
        keywords.insert("date".to_string(), now.format("%Y-%m-%d").to_string());
        keywords.insert("time".to_string(), now.format("%H:%M:%S").to_string());
        keywords.insert("task_id".to_string(), task_id.to_string());
        let parts = input_name
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty());
        for (index, part) in parts.enumerate() {
            keywords.insert((index + 1).to_string(), part.to_string());
        }
        self.placeholder
            .replace_all(pattern, |caps: &Captures<'_>| match keywords.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

fn explanation(file_label: &str) -> String {
    format!(
        "The name can contain placeholders filled in when the task is set up: \
         {{date}} (2020-12-31), {{time}} (12:23:45), {{task_id}}, and {{1}}, {{2}}, ... \
         for the alphanumeric parts of the file selected in \"{}\". \
         For hello_123-b626.mnc, {{1}} is hello, {{2}} is 123, {{3}} is b626 and {{4}} is mnc. \
         When launching several tasks at once, make sure each one produces a distinct name.",
        file_label
    )
}

/// Stands in for an input name while checking a pattern: `1-2-...-100`.
fn sample_input_name() -> String {
    (1..=100).map(|n| n.to_string()).collect::<Vec<_>>().join("-")
}

impl LifecycleModule for OutputFilenameRenamer {
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
                Ok(Arc::new(self.with_explanations(&inner)?))
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
        let message = next.after_form(task, cx)?;
        let sample = sample_input_name();
        for rename in &self.renames {
            let pattern = task
                .invocation
                .get(&rename.name_input)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let rendered = self.render(&pattern, &sample, &task.id, cx.services.now());
            if !is_legal_file_name(&rendered) {
                task.params_errors.add(
                    &rename.name_input,
                    "is not a pattern that generates a proper output file name",
                );
            } else if rendered.contains(['{', '}']) {
                task.params_errors.add(
                    &rename.name_input,
                    "is a pattern that seems to have unreplaced components",
                );
            }
        }
        Ok(message)
    }

    fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>, next: &dyn TaskBehavior) -> Result<bool> {
        for rename in &self.renames {
            let Some(pattern) = task
                .invocation
                .get(&rename.name_input)
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                continue;
            };
            let Some(id) = task
                .invocation
                .values_of(&rename.file_input)
                .first()
                .and_then(FileId::from_value)
            else {
                continue;
            };
            let record = cx.services.file(id)?;
            let name = self.render(&pattern, &record.name, &task.id, cx.services.now());
            if name != pattern {
                task.addlog(format!("generating output name: \"{}\" -> \"{}\"", pattern, name));
                task.invocation
                    .insert(rename.name_input.clone(), Value::String(name));
            }
        }
        next.setup(task, cx)
    }

    fn save_results(
        &self,
        task: &mut Task,
        report: &ExecutionReport,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<bool> {
        for rename in &self.renames {
            let Some(name) = task
                .invocation
                .get(&rename.name_input)
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                continue;
            };
            let value_key = cx.descriptor.input_by_id(&rename.name_input)?.value_key.clone();
            let named = cx
                .descriptor
                .output_files
                .iter()
                .filter(|output| Some(&output.path_template) == value_key.as_ref());
            for output in named {
                task.context
                    .output_names
                    .insert(output.id.clone(), name.clone());
            }
        }
        next.save_results(task, report, cx)
    }
}

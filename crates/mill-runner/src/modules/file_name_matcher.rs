use super::{compile, config_map, config_str, require_file_input};
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::file_types::FileType;
use crate::services::FileId;
use crate::task::Task;
use anyhow::Result;
use mill_core::EngineError;
use mill_descriptor::Descriptor;
use regex::Regex;
use serde_json::Value;

const NAME: &str = "FileNameMatcher";

/// Requires the names of the files selected for an input to match a regex.
/// File lists are exempt since their name says nothing about their content.
pub struct FileNameMatcher {
    rules: Vec<(String, Regex)>,
}

impl FileNameMatcher {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let mut rules = Vec::new();
        for (input_id, pattern) in config_map(NAME, config)? {
            require_file_input(NAME, descriptor, input_id)?;
            let pattern = config_str(NAME, pattern, "regex")?;
            rules.push((input_id.clone(), compile(NAME, pattern)?));
        }
        Ok(Self { rules })
    }
}

impl LifecycleModule for FileNameMatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn after_form(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<String> {
        for (input_id, regex) in &self.rules {
            let mut all_match = true;
            for value in task.invocation.values_of(input_id) {
                let Some(id) = FileId::from_value(&value) else {
                    continue;
                };
                let Some(record) = cx.services.files.find(id)? else {
                    continue;
                };
                if !record.file_type.is_a(FileType::FileList) && !regex.is_match(&record.name) {
                    all_match = false;
                }
            }
            if !all_match {
                task.params_errors.add(
                    input_id,
                    format!("does not have a proper name (should match {})", regex.as_str()),
                );
            }
        }
        next.after_form(task, cx)
    }
}

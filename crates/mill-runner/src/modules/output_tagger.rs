use super::{config_map, config_strings};
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::ExecutionReport;
use crate::task::Task;
use anyhow::Result;
use mill_core::EngineError;
use mill_descriptor::Descriptor;
use serde_json::Value;

const NAME: &str = "OutputTagger";

/// Tags the files saved for each configured output: `{output_id: [tag, ...]}`.
pub struct OutputTagger {
    tags: Vec<(String, Vec<String>)>,
}

impl OutputTagger {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let mut tags = Vec::new();
        for (output_id, names) in config_map(NAME, config)? {
            descriptor.output_by_id(output_id)?;
            tags.push((output_id.clone(), config_strings(NAME, names)?));
        }
        Ok(Self { tags })
    }
}

impl LifecycleModule for OutputTagger {
    fn name(&self) -> &'static str {
        NAME
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
        for (output_id, tags) in &self.tags {
            if tags.is_empty() {
                continue;
            }
            let saved = task
                .context
                .saved_outputs
                .get(output_id)
                .cloned()
                .unwrap_or_default();
            for id in saved {
                cx.services.files.tag(id, tags)?;
                task.addlog(format!("tagged file {} with {}", id, tags.join(", ")));
            }
        }
        Ok(true)
    }
}

use super::{config_map, config_str, malformed};
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::file_types::FileType;
use crate::services::ExecutionReport;
use crate::task::Task;
use anyhow::Result;
use mill_core::EngineError;
use mill_descriptor::Descriptor;
use serde_json::Value;

const NAME: &str = "OutputFileTypeSetter";

/// Overrides the file type guessed for an output: `{output_id: TypeName}`.
pub struct OutputFileTypeSetter {
    types: Vec<(String, FileType)>,
}

impl OutputFileTypeSetter {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let mut types = Vec::new();
        for (output_id, name) in config_map(NAME, config)? {
            descriptor.output_by_id(output_id)?;
            let name = config_str(NAME, name, "file type")?;
            let file_type = FileType::from_name(name).ok_or_else(|| {
                malformed(
                    NAME,
                    format!(
                        "unknown file type '{}' (supported: {})",
                        name,
                        FileType::supported_names().join(", ")
                    ),
                )
            })?;
            types.push((output_id.clone(), file_type));
        }
        Ok(Self { types })
    }
}

impl LifecycleModule for OutputFileTypeSetter {
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
        for (output_id, file_type) in &self.types {
            task.context.output_types.insert(output_id.clone(), *file_type);
        }
        next.save_results(task, report, cx)
    }
}

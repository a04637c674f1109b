use super::{config_strings, is_legal_file_name};
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::task::Task;
use anyhow::Result;
use mill_core::EngineError;
use mill_descriptor::Descriptor;
use serde_json::Value;

const NAME: &str = "FileNameVerifier";
const MESSAGE: &str =
    "is not a proper name for a file or directory; start with a letter or digit and avoid special symbols";

/// Rejects string inputs whose values will become file names the store
/// would refuse. Configured as a list of input ids.
pub struct FileNameVerifier {
    input_ids: Vec<String>,
}

impl FileNameVerifier {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let input_ids = config_strings(NAME, config)?;
        for input_id in &input_ids {
            descriptor.input_by_id(input_id)?;
        }
        Ok(Self { input_ids })
    }
}

impl LifecycleModule for FileNameVerifier {
    fn name(&self) -> &'static str {
        NAME
    }

    fn after_form(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<String> {
        for input_id in &self.input_ids {
            let offending = task
                .invocation
                .values_of(input_id)
                .iter()
                .filter_map(Value::as_str)
                .filter(|value| !value.trim().is_empty())
                .any(|value| !is_legal_file_name(value));
            if offending {
                task.params_errors.add(input_id, MESSAGE);
            }
        }
        next.after_form(task, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_services;
    use crate::modules::testing::compose;
    use mill_core::Phase;
    use mill_descriptor::Invocation;
    use serde_json::json;
    use std::sync::Arc;

    fn descriptor() -> Descriptor {
        Descriptor::from_value(json!({
            "name": "convert",
            "command-line": "convert [PREFIX] [NAMES]",
            "inputs": [
                {"id": "prefix", "type": "String", "value-key": "[PREFIX]", "optional": true},
                {"id": "names", "type": "String", "list": true, "value-key": "[NAMES]"}
            ],
            "output-files": []
        }))
        .expect("descriptor")
    }

    fn run(invocation: Value) -> Task {
        let descriptor = descriptor();
        let module = FileNameVerifier::from_config(&descriptor, &json!(["prefix", "names"]))
            .expect("module");
        let chain = compose(Arc::new(module));
        let services = test_services();
        let mut task = Task::new(
            "t",
            Arc::new(descriptor),
            Invocation::from_value(invocation).expect("invocation"),
        );
        let cx = PhaseContext::new(Phase::AfterForm, task.descriptor.clone(), &services);
        chain.outer().after_form(&mut task, &cx).expect("after_form");
        task
    }

    #[test]
    fn every_value_must_be_a_legal_name() {
        let task = run(json!({"prefix": "sub01_T1", "names": ["a.nii.gz", "run-2"]}));
        assert!(task.params_errors.is_empty());

        let task = run(json!({"prefix": "../etc", "names": ["ok", "with space"]}));
        assert_eq!(task.params_errors.messages_for("prefix").count(), 1);
        assert_eq!(task.params_errors.messages_for("names").count(), 1);
    }

    #[test]
    fn blank_values_are_left_to_the_form_rules() {
        let task = run(json!({"prefix": "", "names": ["x"]}));
        assert!(!task.params_errors.messages_for("prefix").any(|m| m == MESSAGE));
    }

    #[test]
    fn legal_names_start_with_an_alphanumeric() {
        assert!(is_legal_file_name("a"));
        assert!(is_legal_file_name("9_lives{1}.txt"));
        assert!(!is_legal_file_name(""));
        assert!(!is_legal_file_name("-flag"));
        assert!(!is_legal_file_name(".hidden"));
        assert!(!is_legal_file_name("dir/file"));
        assert!(!is_legal_file_name("tab\there"));
    }
}

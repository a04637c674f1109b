use super::{compile, config_map, config_str, malformed};
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::task::Task;
use anyhow::Result;
use mill_core::EngineError;
use mill_descriptor::Descriptor;
use regex::Regex;
use serde_json::Value;

const NAME: &str = "InputRegexChecker";
const DEFAULT_MESSAGE: &str = "contains invalid characters";

struct Check {
    input_id: String,
    regex: Regex,
    message: String,
}

/// Checks string inputs against an anchored regex once the rest of the chain
/// has validated the form. Configured as `{input_id: [regex, message?]}`.
pub struct InputRegexChecker {
    checks: Vec<Check>,
}

impl InputRegexChecker {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let mut checks = Vec::new();
        for (input_id, entry) in config_map(NAME, config)? {
            descriptor.input_by_id(input_id)?;
            let (pattern, message) = match entry {
                Value::String(pattern) => (pattern.as_str(), None),
                Value::Array(parts) if !parts.is_empty() && parts.len() <= 2 => (
                    config_str(NAME, &parts[0], "regex")?,
                    parts
                        .get(1)
                        .map(|m| config_str(NAME, m, "message"))
                        .transpose()?,
                ),
                _ => {
                    return Err(malformed(
                        NAME,
                        format!("input {} needs [regex, message?]", input_id),
                    ))
                }
            };
            checks.push(Check {
                input_id: input_id.clone(),
                regex: compile(NAME, &format!(r"\A(?:{})\z", pattern))?,
                message: message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or(DEFAULT_MESSAGE)
                    .to_string(),
            });
        }
        Ok(Self { checks })
    }
}

impl LifecycleModule for InputRegexChecker {
    fn name(&self) -> &'static str {
        NAME
    }

    fn after_form(
        &self,
        task: &mut Task,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<String> {
        let message = next.after_form(task, cx)?;
        for check in &self.checks {
            let offending = task
                .invocation
                .values_of(&check.input_id)
                .iter()
                .filter_map(Value::as_str)
                .any(|value| !check.regex.is_match(value));
            if offending {
                task.params_errors.add(&check.input_id, &check.message);
            }
        }
        Ok(message)
    }
}

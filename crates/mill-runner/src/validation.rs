//! Form validation of an invocation against a descriptor. Every violation is
//! recorded under the id of the offending input (or group) and checking
//! continues, so the caller sees the whole set at once.

use crate::services::{FileId, FileStore};
use anyhow::Result;
use mill_core::ValidationErrors;
use mill_descriptor::{Descriptor, Input, InputType, Invocation};
use serde_json::Value;
use std::collections::BTreeSet;

pub fn validate_invocation(
    descriptor: &Descriptor,
    invocation: &Invocation,
    files: &dyn FileStore,
    errors: &mut ValidationErrors,
) -> Result<()> {
    let mut taken_names = BTreeSet::new();

    for input in &descriptor.inputs {
        if !invocation.is_active(&input.id) {
            if !input.optional && input.default_value.is_none() && input.kind != InputType::Flag {
                errors.add(&input.id, "is required");
            }
            continue;
        }
        check_shape(input, invocation, errors);
        for value in invocation.values_of(&input.id) {
            check_value(input, &value, files, &mut taken_names, errors)?;
        }
        if input.value_choices.is_some() {
            check_choices(input, invocation, errors);
        }
        if input.kind == InputType::Number {
            check_number(input, invocation, errors);
        }
    }

    let expected: BTreeSet<&str> = descriptor.inputs.iter().map(|i| i.id.as_str()).collect();
    let unexpected: Vec<&str> = invocation
        .keys()
        .filter(|key| !expected.contains(key))
        .collect();
    for key in unexpected {
        errors.add(key, "is not a parameter of this tool");
    }

    check_dependencies(descriptor, invocation, errors);
    check_groups(descriptor, invocation, errors);
    Ok(())
}

fn check_shape(input: &Input, invocation: &Invocation, errors: &mut ValidationErrors) {
    let Some(value) = invocation.get(&input.id) else {
        return;
    };
    match (input.list, value) {
        (true, Value::Array(items)) => {
            if let Some(min) = input.min_list_entries {
                if items.len() < min {
                    errors.add(&input.id, format!("must contain at least {} values", min));
                }
            }
            if let Some(max) = input.max_list_entries {
                if items.len() > max {
                    errors.add(&input.id, format!("must contain no more than {} values", max));
                }
            }
        }
        (true, _) => errors.add(&input.id, "must be a list"),
        (false, Value::Array(_)) => errors.add(&input.id, "must be a single value"),
        (false, _) => {}
    }
}

fn check_value(
    input: &Input,
    value: &Value,
    files: &dyn FileStore,
    taken_names: &mut BTreeSet<String>,
    errors: &mut ValidationErrors,
) -> Result<()> {
    match input.kind {
        InputType::Number => match number_of(value) {
            Some(_) => {}
            None if is_blank(value) => errors.add(&input.id, "value missing"),
            None => errors.add(&input.id, format!("not a number ({})", display(value))),
        },
        InputType::String => match value {
            Value::String(s) if s.trim().is_empty() => errors.add(&input.id, "is blank"),
            Value::String(s) if s.contains('\n') || s.contains('\r') => {
                errors.add(&input.id, "cannot contain newlines")
            }
            Value::String(_) | Value::Number(_) => {}
            other => errors.add(&input.id, format!("not a string ({})", display(other))),
        },
        InputType::Flag => {
            if flag_of(value).is_none() {
                errors.add(&input.id, format!("not true or false ({})", display(value)));
            }
        }
        InputType::File => {
            let Some(id) = FileId::from_value(value) else {
                errors.add(&input.id, "invalid or missing file id");
                return Ok(());
            };
            let Some(record) = files.find(id)? else {
                errors.add(&input.id, format!("cannot find file (id {})", id));
                return Ok(());
            };
            if !taken_names.insert(record.name.clone()) {
                errors.add(&input.id, format!("file name already in use ({})", record.name));
            }
        }
    }
    Ok(())
}

fn check_choices(input: &Input, invocation: &Invocation, errors: &mut ValidationErrors) {
    let Some(choices) = &input.value_choices else {
        return;
    };
    let allowed: BTreeSet<String> = choices.iter().map(display).collect();
    let all_allowed = invocation
        .values_of(&input.id)
        .iter()
        .all(|value| allowed.contains(&display(value)));
    if !all_allowed {
        errors.add(&input.id, "was not given an acceptable value");
    }
}

fn check_number(input: &Input, invocation: &Invocation, errors: &mut ValidationErrors) {
    let values: Vec<f64> = invocation
        .values_of(&input.id)
        .iter()
        .filter_map(number_of)
        .collect();

    if let Some(min) = input.minimum {
        let (ok, clusive) = if input.exclusive_minimum {
            (values.iter().all(|v| *v > min), "exclusive")
        } else {
            (values.iter().all(|v| *v >= min), "inclusive")
        };
        if !ok {
            errors.add(&input.id, format!("violates {} minimum value {}", clusive, min));
        }
    }
    if let Some(max) = input.maximum {
        let (ok, clusive) = if input.exclusive_maximum {
            (values.iter().all(|v| *v < max), "exclusive")
        } else {
            (values.iter().all(|v| *v <= max), "inclusive")
        };
        if !ok {
            errors.add(&input.id, format!("violates {} maximum value {}", clusive, max));
        }
    }
    if input.integer && !values.iter().all(|v| v.fract() == 0.0) {
        errors.add(&input.id, "must be an integer");
    }
}

fn check_dependencies(
    descriptor: &Descriptor,
    invocation: &Invocation,
    errors: &mut ValidationErrors,
) {
    for input in &descriptor.inputs {
        if !invocation.is_active(&input.id) {
            continue;
        }
        for disabled in &input.disables_inputs {
            if invocation.is_active(disabled) {
                errors.add(disabled, format!("is disabled by {}", input.display_name()));
            }
        }
        for required in &input.requires_inputs {
            if !invocation.is_active(required) {
                errors.add(required, format!("is required for {}", input.display_name()));
            }
        }
    }
}

fn check_groups(descriptor: &Descriptor, invocation: &Invocation, errors: &mut ValidationErrors) {
    for group in &descriptor.groups {
        let set = group
            .members
            .iter()
            .filter(|member| invocation.is_active(member))
            .count();
        if group.mutually_exclusive && set > 1 {
            errors.add(&group.id, "can have at most one parameter set");
        }
        if group.one_is_required && set == 0 {
            errors.add(&group.id, "needs at least one parameter set");
        }
        if group.all_or_none && set != 0 && set != group.members.len() {
            errors.add(&group.id, "needs all or none of its parameters set");
        }
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn flag_of(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "off" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.trim().is_empty())
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_types::FileType;
    use crate::memory::MemoryFileStore;
    use serde_json::json;

    fn descriptor() -> Descriptor {
        Descriptor::from_value(json!({
            "name": "smooth",
            "command-line": "smooth [IN] [FWHM] [MODE] [LABELS] [VERBOSE] [QUIET]",
            "inputs": [
                {"id": "in", "type": "File", "value-key": "[IN]"},
                {"id": "fwhm", "type": "Number", "value-key": "[FWHM]",
                 "minimum": 0, "exclusive-minimum": true, "maximum": 10},
                {"id": "mode", "type": "String", "value-key": "[MODE]", "optional": true,
                 "value-choices": ["fast", "exact"]},
                {"id": "labels", "type": "Number", "list": true, "integer": true,
                 "value-key": "[LABELS]", "optional": true, "max-list-entries": 2},
                {"id": "verbose", "type": "Flag", "value-key": "[VERBOSE]",
                 "command-line-flag": "-v", "optional": true, "disables-inputs": ["quiet"]},
                {"id": "quiet", "type": "Flag", "value-key": "[QUIET]",
                 "command-line-flag": "-q", "optional": true}
            ],
            "output-files": [],
            "groups": [
                {"id": "verbosity", "name": "Verbosity", "members": ["verbose", "quiet"],
                 "one-is-required": true}
            ]
        }))
        .expect("descriptor")
    }

    fn store() -> MemoryFileStore {
        let store = MemoryFileStore::new();
        store.add_file(FileId(3), "brain.nii", FileType::ImageFile);
        store
    }

    fn validate(invocation: Value) -> ValidationErrors {
        let invocation = Invocation::from_value(invocation).expect("invocation");
        let mut errors = ValidationErrors::new();
        validate_invocation(&descriptor(), &invocation, &store(), &mut errors).expect("validate");
        errors
    }

    #[test]
    fn valid_invocation_has_no_errors() {
        let errors = validate(json!({"in": 3, "fwhm": 2.5, "mode": "fast", "verbose": true}));
        assert!(errors.is_empty(), "unexpected errors: {}", errors);
    }

    #[test]
    fn all_violations_are_reported_together_by_input_id() {
        let errors = validate(json!({
            "in": 99,
            "fwhm": 0,
            "mode": "slow",
            "labels": [1, 2.5, 3],
            "verbose": true,
            "quiet": "yes",
            "bogus": 1
        }));
        assert!(errors.has("in"));
        assert!(errors
            .messages_for("fwhm")
            .any(|m| m == "violates exclusive minimum value 0"));
        assert!(errors.has("mode"));
        let labels: Vec<&str> = errors.messages_for("labels").collect();
        assert!(labels.contains(&"must contain no more than 2 values"));
        assert!(labels.contains(&"must be an integer"));
        assert!(errors.messages_for("quiet").any(|m| m.starts_with("is disabled by")));
        assert!(errors.has("bogus"));
    }

    #[test]
    fn missing_required_inputs_and_empty_groups_are_flagged() {
        let errors = validate(json!({}));
        assert!(errors.messages_for("in").any(|m| m == "is required"));
        assert!(errors.messages_for("fwhm").any(|m| m == "is required"));
        assert!(errors.has("verbosity"));
        assert!(!errors.has("mode"));
    }

    #[test]
    fn list_shape_is_enforced() {
        let errors = validate(json!({"in": 3, "fwhm": 1, "labels": 4, "quiet": true}));
        assert!(errors.messages_for("labels").any(|m| m == "must be a list"));
        let errors = validate(json!({"in": [3], "fwhm": 1, "quiet": true}));
        assert!(errors.messages_for("in").any(|m| m == "must be a single value"));
    }
}

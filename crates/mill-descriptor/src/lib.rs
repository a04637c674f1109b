//! Tool descriptors: the declarative document describing a tool's inputs,
//! outputs, command template and integrator module configuration.

use mill_core::{canonical_json_digest, EngineError, IdKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

mod invocation;
pub mod substitution;

pub use invocation::Invocation;
pub use substitution::{
    apply_path_substitutions, apply_substitutions, build_path_values, build_substitution_map,
    is_token, is_truthy, SubstitutionMap, TOKEN_PATTERN,
};

pub const CUSTOM_MODULES_KEY: &str = "integrator-modules";
pub const CUSTOM_IGNORE_EXIT_STATUS_KEY: &str = "ignore-exit-status";
pub const CUSTOM_IGNORE_OUTPUTS_KEY: &str = "ignore-outputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
    File,
    String,
    Number,
    Flag,
}

impl InputType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "File",
            Self::String => "String",
            Self::Number => "Number",
            Self::Flag => "Flag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Input {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub list: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_choices: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line_flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line_flag_separator: Option<String>,
    #[serde(default)]
    pub integer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub exclusive_minimum: bool,
    #[serde(default)]
    pub exclusive_maximum: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_list_entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_list_entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disables_inputs: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Input {
    /// A bare input of the given type; used by modules that inject inputs
    /// into a patched descriptor.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: InputType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            description: None,
            optional: false,
            list: false,
            list_separator: None,
            value_key: None,
            value_choices: None,
            default_value: None,
            command_line_flag: None,
            command_line_flag_separator: None,
            integer: false,
            minimum: None,
            maximum: None,
            exclusive_minimum: false,
            exclusive_maximum: false,
            min_list_entries: None,
            max_list_entries: None,
            requires_inputs: Vec::new(),
            disables_inputs: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Output {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub list: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line_flag: Option<String>,
    pub path_template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_template_stripped_extensions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub mutually_exclusive: bool,
    #[serde(default)]
    pub one_is_required: bool,
    #[serde(default)]
    pub all_or_none: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Descriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command_line: String,
    pub inputs: Vec<Input>,
    #[serde(alias = "outputs")]
    pub output_files: Vec<Output>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    digest: String,
}

pub fn load_descriptor(document: &str) -> Result<Descriptor, EngineError> {
    let value: Value = serde_json::from_str(document)
        .map_err(|err| EngineError::MalformedDescriptor(format!("invalid json: {}", err)))?;
    Descriptor::from_value(value)
}

pub fn load_descriptor_file(path: &Path) -> Result<Descriptor, EngineError> {
    let document = fs::read_to_string(path).map_err(|err| {
        EngineError::MalformedDescriptor(format!("cannot read {}: {}", path.display(), err))
    })?;
    load_descriptor(&document).map_err(|err| match err {
        EngineError::MalformedDescriptor(msg) => {
            EngineError::MalformedDescriptor(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

impl Descriptor {
    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        let violations =
            mill_schemas::schema_violations(mill_schemas::DESCRIPTOR_SCHEMA, &value)
                .map_err(|err| EngineError::MalformedDescriptor(err.to_string()))?;
        if !violations.is_empty() {
            return Err(EngineError::MalformedDescriptor(violations.join("; ")));
        }
        let digest = canonical_json_digest(&value);
        let mut descriptor: Descriptor = serde_json::from_value(value)
            .map_err(|err| EngineError::MalformedDescriptor(err.to_string()))?;
        descriptor.check_integrity()?;
        descriptor.digest = digest;
        Ok(descriptor)
    }

    fn check_integrity(&self) -> Result<(), EngineError> {
        let malformed = |msg: String| Err(EngineError::MalformedDescriptor(msg));

        let mut input_ids = BTreeSet::new();
        for input in &self.inputs {
            if !input_ids.insert(input.id.as_str()) {
                return malformed(format!("duplicate input id '{}'", input.id));
            }
        }
        let mut output_ids = BTreeSet::new();
        for output in &self.output_files {
            if !output_ids.insert(output.id.as_str()) {
                return malformed(format!("duplicate output id '{}'", output.id));
            }
        }

        let mut value_keys = BTreeSet::new();
        let declared_keys = self
            .inputs
            .iter()
            .map(|i| (i.id.as_str(), i.value_key.as_deref()))
            .chain(
                self.output_files
                    .iter()
                    .map(|o| (o.id.as_str(), o.value_key.as_deref())),
            );
        for (id, key) in declared_keys {
            let Some(key) = key else { continue };
            if !is_token(key)? {
                return malformed(format!(
                    "value-key '{}' of '{}' is not a bracketed token",
                    key, id
                ));
            }
            if !value_keys.insert(key) {
                return malformed(format!("value-key '{}' is declared twice", key));
            }
        }

        for input in &self.inputs {
            for other in input.requires_inputs.iter().chain(&input.disables_inputs) {
                if !input_ids.contains(other.as_str()) {
                    return malformed(format!(
                        "input '{}' references unknown input '{}'",
                        input.id, other
                    ));
                }
            }
        }

        let mut group_ids = BTreeSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.id.as_str()) {
                return malformed(format!("duplicate group id '{}'", group.id));
            }
            for member in &group.members {
                if !input_ids.contains(member.as_str()) {
                    return malformed(format!(
                        "group '{}' references unknown input '{}'",
                        group.id, member
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// sha256 of the canonical form of the document this descriptor was loaded from.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn qualified_name(&self) -> String {
        match &self.tool_version {
            Some(version) => format!("{}@{}", self.name, version),
            None => self.name.clone(),
        }
    }

    pub fn input_by_id(&self, id: &str) -> Result<&Input, EngineError> {
        self.inputs
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| unknown_id(IdKind::Input, id))
    }

    pub fn output_by_id(&self, id: &str) -> Result<&Output, EngineError> {
        self.output_files
            .iter()
            .find(|o| o.id == id)
            .ok_or_else(|| unknown_id(IdKind::Output, id))
    }

    pub fn group_by_id(&self, id: &str) -> Result<&Group, EngineError> {
        self.groups
            .iter()
            .find(|g| g.id == id)
            .ok_or_else(|| unknown_id(IdKind::Group, id))
    }

    pub fn has_input(&self, id: &str) -> bool {
        self.inputs.iter().any(|i| i.id == id)
    }

    pub fn file_inputs(&self) -> impl Iterator<Item = &Input> {
        self.inputs.iter().filter(|i| i.kind == InputType::File)
    }

    /// The only file input, when there is exactly one and it is a required
    /// single value. Tasks for such tools can be launched once per selected file.
    pub fn sole_mandatory_file_input(&self) -> Option<&Input> {
        let mut files = self.file_inputs();
        let first = files.next()?;
        if files.next().is_some() || first.optional || first.list {
            return None;
        }
        Some(first)
    }

    pub fn integrator_modules(&self) -> Option<&Map<String, Value>> {
        self.custom.get(CUSTOM_MODULES_KEY).and_then(Value::as_object)
    }

    /// Module names in the order they are declared in the document.
    pub fn module_names(&self) -> Vec<&str> {
        self.integrator_modules()
            .map(|modules| modules.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Raw configuration of an integrator module; `None` when the tool does not use it.
    pub fn custom_module_info(&self, name: &str) -> Option<&Value> {
        self.integrator_modules().and_then(|modules| modules.get(name))
    }

    pub fn ignore_exit_status(&self) -> bool {
        self.custom
            .get(CUSTOM_IGNORE_EXIT_STATUS_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn ignored_outputs(&self) -> Vec<&str> {
        self.custom
            .get(CUSTOM_IGNORE_OUTPUTS_KEY)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// A deep, independent copy for a caller that needs a modified view.
    /// The canonical descriptor is shared behind an `Arc` and never changes.
    pub fn duplicate_for_patch(&self) -> Descriptor {
        self.clone()
    }

    pub fn input_by_id_mut(&mut self, id: &str) -> Result<&mut Input, EngineError> {
        self.inputs
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| unknown_id(IdKind::Input, id))
    }

    pub fn add_input(&mut self, input: Input) -> Result<(), EngineError> {
        if self.has_input(&input.id) {
            return Err(EngineError::MalformedDescriptor(format!(
                "duplicate input id '{}'",
                input.id
            )));
        }
        self.inputs.push(input);
        Ok(())
    }

    /// Drops an input together with every group membership and
    /// requires/disables reference to it. Groups left empty are removed.
    pub fn remove_input(&mut self, id: &str) -> Result<Input, EngineError> {
        let position = self
            .inputs
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| unknown_id(IdKind::Input, id))?;
        let removed = self.inputs.remove(position);
        for input in &mut self.inputs {
            input.requires_inputs.retain(|other| other != id);
            input.disables_inputs.retain(|other| other != id);
        }
        for group in &mut self.groups {
            group.members.retain(|member| member != id);
            if group.members.len() < 2 {
                group.mutually_exclusive = false;
            }
        }
        self.groups.retain(|g| !g.members.is_empty());
        Ok(removed)
    }

    /// Returns the group with `id`, creating an empty one when absent.
    pub fn group_entry(&mut self, id: &str, name: &str) -> &mut Group {
        let position = match self.groups.iter().position(|g| g.id == id) {
            Some(position) => position,
            None => {
                self.groups.push(Group {
                    id: id.to_string(),
                    name: name.to_string(),
                    members: Vec::new(),
                    mutually_exclusive: false,
                    one_is_required: false,
                    all_or_none: false,
                    extra: Map::new(),
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[position]
    }
}

fn unknown_id(kind: IdKind, id: &str) -> EngineError {
    EngineError::UnknownId {
        kind,
        id: id.to_string(),
    }
}

//! Expansion of bracketed tokens (`[NAME]`) in command and path templates.
//!
//! Expansion is a single pass over the template: a value that itself looks
//! like a token is emitted verbatim and never expanded again. No shell quoting
//! is applied here.

use crate::{Descriptor, Input, InputType, Invocation};
use mill_core::{normalize_relative_path, EngineError};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const TOKEN_PATTERN: &str = r"\[[A-Za-z_][A-Za-z0-9_\-]*\]";

const DEFAULT_LIST_SEPARATOR: &str = " ";
const DEFAULT_FLAG_SEPARATOR: &str = " ";

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn token_regex() -> Result<&'static Regex, EngineError> {
    if let Some(re) = TOKEN_RE.get() {
        return Ok(re);
    }
    let re = Regex::new(TOKEN_PATTERN).map_err(|err| {
        EngineError::MalformedDescriptor(format!("token pattern does not compile: {}", err))
    })?;
    Ok(TOKEN_RE.get_or_init(|| re))
}

/// True when `candidate` is exactly one token, e.g. `[OUTPUT_DIR]`.
pub fn is_token(candidate: &str) -> Result<bool, EngineError> {
    Ok(token_regex()?
        .find(candidate)
        .map(|m| m.start() == 0 && m.end() == candidate.len())
        .unwrap_or(false))
}

/// Token → expanded text. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionMap {
    entries: BTreeMap<String, String>,
}

impl SubstitutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(token.into(), value.into());
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries.get(token).map(String::as_str)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Builds the map used to expand the command line: inputs render with their
/// command-line flags, outputs render as their (path-checked) path template.
pub fn build_substitution_map(
    descriptor: &Descriptor,
    invocation: &Invocation,
) -> Result<SubstitutionMap, EngineError> {
    let mut map = SubstitutionMap::new();
    for input in &descriptor.inputs {
        let Some(key) = &input.value_key else { continue };
        if let Some(text) = command_form(input, invocation) {
            map.insert(key.clone(), text);
        }
    }
    for output in &descriptor.output_files {
        let Some(key) = &output.value_key else { continue };
        let values =
            build_path_values(descriptor, invocation, &output.path_template_stripped_extensions);
        let path = apply_path_substitutions(&output.path_template, &values)?;
        let path = path.to_string_lossy().to_string();
        let text = match &output.command_line_flag {
            Some(flag) => format!("{}{}{}", flag, DEFAULT_FLAG_SEPARATOR, path),
            None => path,
        };
        map.insert(key.clone(), text);
    }
    Ok(map)
}

/// Builds the map used for path templates: raw input values without flags,
/// each string value stripped of the first matching extension in `strip`.
pub fn build_path_values(
    descriptor: &Descriptor,
    invocation: &Invocation,
    strip: &[String],
) -> SubstitutionMap {
    let mut map = SubstitutionMap::new();
    for input in &descriptor.inputs {
        let Some(key) = &input.value_key else { continue };
        match input_value(input, invocation).and_then(|v| render_value(v, input, strip)) {
            Some(text) => map.insert(key.clone(), text),
            None if input.optional => map.insert(key.clone(), ""),
            None => {}
        }
    }
    map
}

/// Replaces every token in `pattern`. A token missing from `map` fails with
/// [`EngineError::UnresolvedToken`]; it is never copied through literally.
pub fn apply_substitutions(pattern: &str, map: &SubstitutionMap) -> Result<String, EngineError> {
    let re = token_regex()?;
    let mut missing: Option<String> = None;
    let expanded = re.replace_all(pattern, |caps: &Captures<'_>| {
        let token = &caps[0];
        match map.get(token) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| token.to_string());
                String::new()
            }
        }
    });
    if let Some(token) = missing {
        return Err(EngineError::UnresolvedToken {
            token,
            pattern: pattern.to_string(),
        });
    }
    Ok(expanded.into_owned())
}

/// [`apply_substitutions`] for a template naming a path inside the work directory.
pub fn apply_path_substitutions(
    pattern: &str,
    map: &SubstitutionMap,
) -> Result<PathBuf, EngineError> {
    let expanded = apply_substitutions(pattern, map)?;
    normalize_relative_path(&expanded)
}

fn input_value<'a>(input: &'a Input, invocation: &'a Invocation) -> Option<&'a Value> {
    invocation
        .get(&input.id)
        .or(input.default_value.as_ref())
        .filter(|v| !v.is_null())
}

fn command_form(input: &Input, invocation: &Invocation) -> Option<String> {
    let Some(value) = input_value(input, invocation) else {
        return input.optional.then(String::new);
    };
    if input.kind == InputType::Flag {
        return Some(if is_truthy(value) {
            input.command_line_flag.clone().unwrap_or_default()
        } else {
            String::new()
        });
    }
    let Some(rendered) = render_value(value, input, &[]) else {
        return input.optional.then(String::new);
    };
    match &input.command_line_flag {
        Some(flag) => {
            let separator = input
                .command_line_flag_separator
                .as_deref()
                .unwrap_or(DEFAULT_FLAG_SEPARATOR);
            Some(format!("{}{}{}", flag, separator, rendered))
        }
        None => Some(rendered),
    }
}

fn render_value(value: &Value, input: &Input, strip: &[String]) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let separator = input
                .list_separator
                .as_deref()
                .unwrap_or(DEFAULT_LIST_SEPARATOR);
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| render_scalar(item, strip))
                .collect();
            Some(parts.join(separator))
        }
        other => render_scalar(other, strip),
    }
}

fn render_scalar(value: &Value, strip: &[String]) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(strip_extension(s, strip).to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn strip_extension<'a>(value: &'a str, strip: &[String]) -> &'a str {
    strip
        .iter()
        .find_map(|ext| value.strip_suffix(ext.as_str()))
        .unwrap_or(value)
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "yes" | "y" | "on" | "1"
        ),
        _ => false,
    }
}

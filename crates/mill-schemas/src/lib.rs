use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

pub const DESCRIPTOR_SCHEMA: &str = "descriptor.schema.json";

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

static COMPILED: OnceLock<Mutex<BTreeMap<String, &'static JSONSchema>>> = OnceLock::new();

pub fn schema_names() -> Vec<String> {
    let mut names: Vec<String> = SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect();
    names.sort();
    names
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Schemas added after the last build are still picked up from the source tree.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|err| anyhow!("schema {} does not compile: {}", name, err))?;
    Ok(compiled)
}

/// Compiles a bundled schema on first use; later calls share that copy.
pub fn compiled_schema(name: &str) -> Result<&'static JSONSchema> {
    let cache = COMPILED.get_or_init(|| Mutex::new(BTreeMap::new()));
    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(schema) = cache.get(name) {
        return Ok(*schema);
    }
    let schema: &'static JSONSchema = Box::leak(Box::new(compile_schema(name)?));
    cache.insert(name.to_string(), schema);
    Ok(schema)
}

/// Validates `document` against a bundled schema and returns one message per
/// violation (`<json pointer>: <reason>`); an empty list means the document conforms.
pub fn schema_violations(name: &str, document: &Value) -> Result<Vec<String>> {
    let schema = compiled_schema(name)?;
    let violations = match schema.validate(document) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|err| {
                let pointer = err.instance_path.to_string();
                if pointer.is_empty() {
                    err.to_string()
                } else {
                    format!("{}: {}", pointer, err)
                }
            })
            .collect(),
    };
    Ok(violations)
}

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The concrete input values for one task run, keyed by input id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Invocation(Map<String, Value>);

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(anyhow!(
                "invocation must be a json object keyed by input id (got: {})",
                other
            )),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The value for `id`; an explicit `null` counts as absent.
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.0.get(id).filter(|v| !v.is_null())
    }

    pub fn insert(&mut self, id: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(id.into(), value)
    }

    pub fn remove(&mut self, id: &str) -> Option<Value> {
        self.0.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// False for absent values, `null` and `false`.
    pub fn is_active(&self, id: &str) -> bool {
        !matches!(self.get(id), None | Some(Value::Bool(false)))
    }

    /// The value(s) for `id` as a list: a list value as-is, a scalar as a
    /// one-element list, an absent value as an empty list.
    pub fn values_of(&self, id: &str) -> Vec<Value> {
        match self.get(id) {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
            Some(other) => vec![other.clone()],
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Invocation {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

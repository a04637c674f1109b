use crate::Phase;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Input,
    Output,
    Group,
}

impl IdKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("no {kind} found with id '{id}'")]
    UnknownId { kind: IdKind, id: String },

    #[error("unknown integrator module '{name}'; supported: {}", .supported.join(", "))]
    UnknownModule { name: String, supported: Vec<String> },

    #[error("unresolved token {token} in '{pattern}'")]
    UnresolvedToken { token: String, pattern: String },

    #[error("unsafe path '{path}': {reason}")]
    UnsafePath { path: String, reason: String },

    #[error("invalid parameters: {0}")]
    Validation(ValidationErrors),

    #[error("{phase} failed in layer '{layer}': {cause:#}")]
    PhaseFailure {
        phase: Phase,
        layer: String,
        cause: anyhow::Error,
    },

    #[error("execution failed: {detail}")]
    ExecutionFailure { status: Option<i32>, detail: String },

    #[error("task {task} cannot enter {to} from state {from}")]
    InvalidTransition {
        task: String,
        from: String,
        to: Phase,
    },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedDescriptor(_) => "malformed_descriptor",
            Self::UnknownId { .. } => "unknown_id",
            Self::UnknownModule { .. } => "unknown_module",
            Self::UnresolvedToken { .. } => "unresolved_token",
            Self::UnsafePath { .. } => "unsafe_path",
            Self::Validation(_) => "validation_failure",
            Self::PhaseFailure { .. } => "phase_failure",
            Self::ExecutionFailure { .. } => "execution_failure",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// The engine error a phase failure was raised from, if a hook failed
    /// with one (an unresolved token, an unsafe path, ...).
    pub fn underlying(&self) -> Option<&EngineError> {
        match self {
            Self::PhaseFailure { cause, .. } => cause.downcast_ref::<EngineError>(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub input_id: String,
    pub message: String,
}

/// Validation problems keyed by input (or group) id, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    entries: Vec<ValidationFailure>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, input_id: impl Into<String>, message: impl Into<String>) {
        let failure = ValidationFailure {
            input_id: input_id.into(),
            message: message.into(),
        };
        if !self.entries.contains(&failure) {
            self.entries.push(failure);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationFailure> {
        self.entries.iter()
    }

    pub fn has(&self, input_id: &str) -> bool {
        self.entries.iter().any(|e| e.input_id == input_id)
    }

    pub fn messages_for<'a>(&'a self, input_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.input_id == input_id)
            .map(|e| e.message.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}: {}", e.input_id, e.message))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

use crate::file_types::FileType;
use crate::services::{Clock, FileId, SystemClock};
use chrono::{DateTime, Utc};
use mill_core::{Phase, ValidationErrors};
use mill_descriptor::{Descriptor, Invocation};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn next_task_id() -> String {
    format!(
        "task_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        TASK_SEQ.fetch_add(1, Ordering::SeqCst)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub phase: Phase,
    pub layer: Option<String>,
    pub reason: String,
}

/// Where a task is in its lifecycle. Each phase state means that phase has
/// completed; `Completed` follows a successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Created,
    BeforeForm,
    AfterForm,
    Invoke,
    Setup,
    BuildCommands,
    Completed,
    Failed(TaskFailure),
}

impl TaskState {
    pub fn after(phase: Phase) -> TaskState {
        match phase {
            Phase::BeforeForm => Self::BeforeForm,
            Phase::AfterForm => Self::AfterForm,
            Phase::Invoke => Self::Invoke,
            Phase::Setup => Self::Setup,
            Phase::BuildCommands => Self::BuildCommands,
            Phase::SaveResults => Self::Completed,
        }
    }

    /// The state a task must be in before `phase` may run.
    pub fn required_for(phase: Phase) -> TaskState {
        match phase.previous() {
            Some(prev) => Self::after(prev),
            None => Self::Created,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::BeforeForm => "before_form",
            Self::AfterForm => "after_form",
            Self::Invoke => "invoke",
            Self::Setup => "setup",
            Self::BuildCommands => "build_commands",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values handed from one phase to a later one. Written and cleared by
/// modules and the base task only; the dispatcher never touches them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskContext {
    pub setup_timestamp: Option<DateTime<Utc>>,
    pub unsynced_inputs: Vec<FileId>,
    pub input_subdirs: BTreeMap<String, PathBuf>,
    pub output_types: BTreeMap<String, FileType>,
    /// Names that replace the task-unique name of an output's saved files.
    pub output_names: BTreeMap<String, String>,
    pub saved_outputs: BTreeMap<String, Vec<FileId>>,
    pub output_cache_cleaning: Option<bool>,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskLogLine {
    pub at: DateTime<Utc>,
    pub phase: Option<Phase>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskLog {
    lines: Vec<TaskLogLine>,
    #[serde(skip)]
    flushed: usize,
}

impl TaskLog {
    pub fn lines(&self) -> &[TaskLogLine] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.message.contains(needle))
    }

    /// Lines not yet handed to the log sink; marks them as handed over.
    pub fn take_unflushed(&mut self) -> Vec<TaskLogLine> {
        let pending = self.lines[self.flushed..].to_vec();
        self.flushed = self.lines.len();
        pending
    }

    fn push(&mut self, at: DateTime<Utc>, phase: Option<Phase>, message: String) {
        self.lines.push(TaskLogLine {
            at,
            phase,
            message,
        });
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub descriptor: Arc<Descriptor>,
    pub invocation: Invocation,
    pub interface_files: Vec<FileId>,
    pub state: TaskState,
    pub context: TaskContext,
    pub params_errors: ValidationErrors,
    pub work_dir: Option<PathBuf>,
    pub log: TaskLog,
    pub(crate) active_phase: Option<Phase>,
    clock: Arc<dyn Clock>,
}

impl Task {
    pub fn new(id: impl Into<String>, descriptor: Arc<Descriptor>, invocation: Invocation) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            descriptor,
            invocation,
            interface_files: Vec::new(),
            state: TaskState::Created,
            context: TaskContext::default(),
            params_errors: ValidationErrors::new(),
            work_dir: None,
            log: TaskLog::default(),
            active_phase: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Log lines are stamped by `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_interface_files(mut self, files: Vec<FileId>) -> Self {
        self.interface_files = files;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn addlog(&mut self, message: impl Into<String>) {
        let phase = self.active_phase;
        let at = self.clock.now();
        self.log.push(at, phase, message.into());
    }

    pub fn tool_name(&self) -> String {
        self.descriptor.qualified_name()
    }

    /// One sibling per value: each gets `input_id` bound to that value, its
    /// own id and an annotated description; everything else is copied.
    pub fn fan_out(&self, input_id: &str, values: &[Value]) -> Vec<Task> {
        values
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                let mut sibling = self.clone();
                sibling.id = format!("{}.{}", self.id, idx + 1);
                sibling.invocation.insert(input_id, value.clone());
                sibling.description = format!(
                    "{}\n\nRun with value: {}, for input {}.",
                    self.description,
                    display_value(value),
                    input_id
                )
                .trim()
                .to_string();
                sibling.log = TaskLog::default();
                sibling.addlog(format!("created from {} by fan-out on {}", self.id, input_id));
                sibling
            })
            .collect()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.len() == 1 => display_value(&items[0]),
        other => other.to_string(),
    }
}

//! Drives a task through its phases over a tool's module chain.
//!
//! Phases run strictly in order (`TaskState::required_for`). Every phase
//! dispatch builds a fresh [`PhaseContext`], runs the composed hook, forwards
//! new task log lines to the log sink and leaves the task either in the
//! state after that phase or in `Failed`.

use crate::catalog::ToolIntegration;
use crate::chain::{attribute, fault_layer, DescriptorView, PhaseContext, TaskBehavior, BASE_LAYER};
use crate::config::EngineConfig;
use crate::services::{ExecutionBackend, ExecutionReport, FileId, Services};
use crate::sink::TaskLogRecord;
use crate::task::{next_task_id, Task, TaskFailure, TaskState};
use anyhow::{anyhow, Result};
use mill_core::{canonical_json_digest, EngineError, Phase};
use mill_descriptor::{Descriptor, Invocation};
use mill_provenance::{task_attestation, write_attestation, AttestationInput};
use std::sync::Arc;

pub struct PhaseDispatcher {
    services: Services,
    config: EngineConfig,
}

impl PhaseDispatcher {
    pub fn new(services: Services, config: EngineConfig) -> Self {
        Self { services, config }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn new_task(
        &self,
        tool: &ToolIntegration,
        invocation: Invocation,
        interface_files: Vec<FileId>,
    ) -> Task {
        Task::new(next_task_id(), tool.descriptor.clone(), invocation)
            .with_interface_files(interface_files)
            .with_clock(self.services.clock.clone())
    }

    /// The descriptor the user fills a form from, as patched by the chain.
    pub fn descriptor_for_form(
        &self,
        tool: &ToolIntegration,
        task: &Task,
    ) -> Result<Arc<Descriptor>, EngineError> {
        tool.chain
            .outer()
            .descriptor_for(DescriptorView::Form, task, &self.services)
            .map_err(|err| EngineError::PhaseFailure {
                phase: Phase::BeforeForm,
                layer: fault_layer(&err).unwrap_or(BASE_LAYER).to_string(),
                cause: err,
            })
    }

    pub fn before_form(&self, tool: &ToolIntegration, task: &mut Task) -> Result<String, EngineError> {
        self.in_phase(task, Phase::BeforeForm, |task| {
            self.run_chain(tool, task, Phase::BeforeForm, |outer, task, cx| {
                outer.before_form(task, cx)
            })
        })
    }

    /// Validation problems registered by any layer fail the task once the
    /// whole chain has run.
    pub fn after_form(&self, tool: &ToolIntegration, task: &mut Task) -> Result<String, EngineError> {
        self.in_phase(task, Phase::AfterForm, |task| {
            task.params_errors.clear();
            let message = self.run_chain(tool, task, Phase::AfterForm, |outer, task, cx| {
                outer.after_form(task, cx)
            })?;
            if !task.params_errors.is_empty() {
                let errors = task.params_errors.clone();
                self.reject(task, Phase::AfterForm, None, format!("invalid parameters: {}", errors));
                return Err(EngineError::Validation(errors));
            }
            Ok(message)
        })
    }

    /// The final task list. Fan-out siblings come back in the `Invoke` state.
    pub fn invoke(&self, tool: &ToolIntegration, task: &mut Task) -> Result<Vec<Task>, EngineError> {
        self.in_phase(task, Phase::Invoke, |task| {
            let mut tasks = self.run_chain(tool, task, Phase::Invoke, |outer, task, cx| {
                outer.final_task_list(task, cx)
            })?;
            for produced in &mut tasks {
                produced.state = TaskState::Invoke;
                produced.active_phase = None;
            }
            task.addlog(format!("final task list has {} task(s)", tasks.len()));
            tracing::info!(task = %task.id, tasks = tasks.len(), "final task list");
            Ok(tasks)
        })
    }

    pub fn setup(&self, tool: &ToolIntegration, task: &mut Task) -> Result<(), EngineError> {
        self.in_phase(task, Phase::Setup, |task| {
            if task.work_dir.is_none() {
                task.work_dir = Some(self.config.work_root.join(&task.id));
            }
            let ready = self.run_chain(tool, task, Phase::Setup, |outer, task, cx| {
                outer.setup(task, cx)
            })?;
            if !ready {
                return Err(self.fail(task, Phase::Setup, anyhow!("setup reported failure")));
            }
            Ok(())
        })
    }

    pub fn build_commands(
        &self,
        tool: &ToolIntegration,
        task: &mut Task,
    ) -> Result<Vec<String>, EngineError> {
        self.in_phase(task, Phase::BuildCommands, |task| {
            let commands = self.run_chain(tool, task, Phase::BuildCommands, |outer, task, cx| {
                outer.build_commands(task, cx)
            })?;
            task.context.commands = commands.clone();
            Ok(commands)
        })
    }

    pub fn save_results(
        &self,
        tool: &ToolIntegration,
        task: &mut Task,
        report: &ExecutionReport,
    ) -> Result<(), EngineError> {
        self.in_phase(task, Phase::SaveResults, |task| {
            let saved = self.run_chain(tool, task, Phase::SaveResults, |outer, task, cx| {
                outer.save_results(task, report, cx)
            })?;
            if !saved {
                let detail = if !report.succeeded() && !task.descriptor.ignore_exit_status() {
                    match report.exit_status {
                        Some(code) => format!("command exited with status {}", code),
                        None => "command did not report an exit status".to_string(),
                    }
                } else {
                    "required outputs were not saved".to_string()
                };
                self.reject(task, Phase::SaveResults, None, detail.clone());
                return Err(EngineError::ExecutionFailure {
                    status: report.exit_status,
                    detail,
                });
            }
            if self.config.write_attestation {
                self.attest(tool, task, report);
            }
            Ok(())
        })
    }

    /// Setup, command generation, the backend run and result saving.
    pub fn run_execution(
        &self,
        tool: &ToolIntegration,
        task: &mut Task,
        backend: &dyn ExecutionBackend,
    ) -> Result<ExecutionReport, EngineError> {
        self.setup(tool, task)?;
        let commands = self.build_commands(tool, task)?;
        let work_dir = task
            .work_dir
            .clone()
            .unwrap_or_else(|| self.config.work_root.join(&task.id));
        let report = match backend.execute(&commands, &work_dir) {
            Ok(report) => report,
            Err(err) => {
                let detail = format!("{:#}", err);
                self.reject(task, Phase::SaveResults, None, format!("execution failed: {}", detail));
                self.flush_log(task);
                return Err(EngineError::ExecutionFailure {
                    status: None,
                    detail,
                });
            }
        };
        task.addlog(match report.exit_status {
            Some(code) => format!("execution finished with status {}", code),
            None => "execution finished without an exit status".to_string(),
        });
        self.save_results(tool, task, &report)?;
        Ok(report)
    }

    fn in_phase<T>(
        &self,
        task: &mut Task,
        phase: Phase,
        body: impl FnOnce(&mut Task) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let required = TaskState::required_for(phase);
        if task.state != required {
            return Err(EngineError::InvalidTransition {
                task: task.id.clone(),
                from: task.state.to_string(),
                to: phase,
            });
        }
        let span = tracing::info_span!("phase", task = %task.id, phase = %phase);
        let _entered = span.enter();

        task.active_phase = Some(phase);
        let result = body(task);
        match &result {
            Ok(_) => {
                task.state = TaskState::after(phase);
                tracing::debug!(state = %task.state, "phase completed");
            }
            Err(err) if !task.state.is_failed() => {
                self.reject(task, phase, None, err.to_string());
            }
            Err(_) => {}
        }
        task.active_phase = None;
        self.flush_log(task);
        result
    }

    fn run_chain<T>(
        &self,
        tool: &ToolIntegration,
        task: &mut Task,
        phase: Phase,
        hook: impl FnOnce(&dyn TaskBehavior, &mut Task, &PhaseContext<'_>) -> Result<T>,
    ) -> Result<T, EngineError> {
        self.call_hooks(tool, task, phase, hook)
            .map_err(|err| self.fail(task, phase, err))
    }

    fn call_hooks<T>(
        &self,
        tool: &ToolIntegration,
        task: &mut Task,
        phase: Phase,
        hook: impl FnOnce(&dyn TaskBehavior, &mut Task, &PhaseContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let outer = tool.chain.outer();
        let descriptor = outer.descriptor_for(phase.into(), task, &self.services)?;
        let cx = PhaseContext::new(phase, descriptor, &self.services);
        let value = hook(outer, task, &cx)?;
        let form_phase = matches!(phase, Phase::BeforeForm | Phase::AfterForm);
        if form_phase && !cx.base_reached() {
            let layer = cx
                .trail()
                .last()
                .cloned()
                .unwrap_or_else(|| BASE_LAYER.to_string());
            return Err(attribute(
                anyhow!("{} stopped the phase before the base task ran", layer),
                &layer,
            ));
        }
        Ok(value)
    }

    fn fail(&self, task: &mut Task, phase: Phase, err: anyhow::Error) -> EngineError {
        let layer = fault_layer(&err).unwrap_or(BASE_LAYER).to_string();
        let reason = format!("{:#}", err);
        tracing::warn!(task = %task.id, phase = %phase, layer = %layer, error = %reason, "phase failed");
        self.reject(task, phase, Some(layer.clone()), reason);
        EngineError::PhaseFailure {
            phase,
            layer,
            cause: err,
        }
    }

    fn reject(&self, task: &mut Task, phase: Phase, layer: Option<String>, reason: String) {
        task.addlog(format!("{} failed: {}", phase, reason));
        task.state = TaskState::Failed(TaskFailure {
            phase,
            layer,
            reason,
        });
    }

    fn attest(&self, tool: &ToolIntegration, task: &mut Task, report: &ExecutionReport) {
        let Some(work_dir) = task.work_dir.clone() else {
            tracing::warn!(task = %task.id, "no work directory, skipping attestation");
            return;
        };
        let tool_name = tool.name();
        let invocation_digest = canonical_json_digest(&task.invocation.clone().into_value());
        let log_lines: Vec<String> = task.log.lines().iter().map(|l| l.message.clone()).collect();
        let payload = task_attestation(&AttestationInput {
            task_id: &task.id,
            tool: &tool_name,
            descriptor_digest: tool.descriptor.digest(),
            invocation_digest: &invocation_digest,
            modules: tool.layers(),
            commands: &task.context.commands,
            log_lines: &log_lines,
            exit_status: report.exit_status,
            completed_at: self.services.now(),
        });
        match write_attestation(&work_dir, &payload) {
            Ok(path) => task.addlog(format!("attestation written to {}", path.display())),
            Err(err) => {
                let detail = format!("{:#}", err);
                tracing::warn!(task = %task.id, error = %detail, "failed to write attestation");
            }
        }
    }

    /// Hands new log lines to the sink. A sink failure never fails the task.
    fn flush_log(&self, task: &mut Task) {
        let tool = task.tool_name();
        for line in task.log.take_unflushed() {
            let record = TaskLogRecord {
                task_id: task.id.clone(),
                tool: tool.clone(),
                at: line.at,
                phase: line.phase,
                message: line.message,
            };
            if let Err(err) = self.services.sink.append(&record) {
                tracing::warn!(task = %task.id, error = %err, "failed to forward task log line");
            }
        }
    }
}

//! The innermost layer of every chain: the irreducible default behavior of
//! each phase for a descriptor-driven tool.

use crate::chain::{attribute, DescriptorView, PhaseContext, TaskBehavior, BASE_LAYER};
use crate::file_types::FileType;
use crate::services::{ExecutionReport, FileId, OutputRegistration, Services};
use crate::task::Task;
use crate::validation::validate_invocation;
use anyhow::{anyhow, bail, Context, Result};
use mill_core::{
    atomic_write_json_pretty, ensure_dir, normalize_relative_path, path_is_within,
    DESCRIPTOR_FILE, INVOCATION_FILE,
};
use mill_descriptor::{
    apply_path_substitutions, apply_substitutions, build_path_values, build_substitution_map,
    Descriptor, Invocation,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
pub struct BaseTask;

fn own<T>(result: Result<T>) -> Result<T> {
    result.map_err(|err| attribute(err, BASE_LAYER))
}

impl TaskBehavior for BaseTask {
    fn layer_name(&self) -> &str {
        BASE_LAYER
    }

    fn descriptor_for(
        &self,
        _view: DescriptorView,
        task: &Task,
        _services: &Services,
    ) -> Result<Arc<Descriptor>> {
        Ok(task.descriptor.clone())
    }

    fn before_form(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<String> {
        cx.mark_base_reached();
        own(check_interface_files(&cx.descriptor, task))
    }

    fn after_form(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<String> {
        cx.mark_base_reached();
        let mut checked = task.invocation.clone();
        if let Some(input) = cx.descriptor.sole_mandatory_file_input() {
            if !checked.is_active(&input.id) {
                if let Some(first) = task.interface_files.first() {
                    checked.insert(input.id.clone(), first.to_value());
                }
            }
        }
        own(validate_invocation(
            &cx.descriptor,
            &checked,
            cx.services.files.as_ref(),
            &mut task.params_errors,
        ))?;
        Ok(String::new())
    }

    fn final_task_list(&self, task: &Task, cx: &PhaseContext<'_>) -> Result<Vec<Task>> {
        let Some(input) = cx.descriptor.sole_mandatory_file_input() else {
            return Ok(vec![task.clone()]);
        };
        if task.invocation.is_active(&input.id) || task.interface_files.is_empty() {
            return Ok(vec![task.clone()]);
        }
        if let [only] = task.interface_files.as_slice() {
            let mut single = task.clone();
            single.invocation.insert(input.id.clone(), only.to_value());
            return Ok(vec![single]);
        }
        let values: Vec<Value> = task.interface_files.iter().map(|f| f.to_value()).collect();
        let mut siblings = task.fan_out(&input.id, &values);
        for (sibling, file) in siblings.iter_mut().zip(&task.interface_files) {
            sibling.interface_files = vec![*file];
        }
        Ok(siblings)
    }

    fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<bool> {
        cx.mark_base_reached();
        own(materialize_inputs(task, cx))?;
        Ok(true)
    }

    fn build_commands(&self, task: &mut Task, cx: &PhaseContext<'_>) -> Result<Vec<String>> {
        cx.mark_base_reached();
        own(render_commands(task, cx))
    }

    fn save_results(
        &self,
        task: &mut Task,
        report: &ExecutionReport,
        cx: &PhaseContext<'_>,
    ) -> Result<bool> {
        cx.mark_base_reached();
        own(collect_outputs(task, report, cx))
    }
}

fn check_interface_files(descriptor: &Descriptor, task: &Task) -> Result<String> {
    let selected = task.interface_files.len();
    let required = descriptor.file_inputs().filter(|i| !i.optional).count();
    let optional = descriptor.file_inputs().filter(|i| i.optional).count();
    let listed = descriptor.file_inputs().any(|i| i.list);

    if descriptor.sole_mandatory_file_input().is_some() && selected >= 1 {
        return Ok(String::new());
    }
    if selected < required || (!listed && selected > required + optional) {
        let inputs: Vec<String> = descriptor
            .file_inputs()
            .map(|i| {
                format!(
                    "{} ({})",
                    i.display_name(),
                    if i.optional { "optional" } else { "required" }
                )
            })
            .collect();
        bail!(
            "this task requires {} mandatory file(s) and {} optional file(s), {} selected: {}",
            required,
            optional,
            selected,
            inputs.join(", ")
        );
    }
    Ok(String::new())
}

pub(crate) fn require_work_dir(task: &Task) -> Result<PathBuf> {
    task.work_dir
        .clone()
        .ok_or_else(|| anyhow!("task {} has no work directory", task.id))
}

/// Where a file input lands, relative to the work directory.
fn input_relative_path(task: &Task, input_id: &str, file_name: &str) -> Result<PathBuf> {
    let raw = match task.context.input_subdirs.get(input_id) {
        Some(subdir) => subdir.join(file_name),
        None => PathBuf::from(file_name),
    };
    Ok(normalize_relative_path(&raw.to_string_lossy())?)
}

fn materialize_inputs(task: &mut Task, cx: &PhaseContext<'_>) -> Result<()> {
    let work_dir = require_work_dir(task)?;
    ensure_dir(&work_dir)?;
    for input in cx.descriptor.file_inputs() {
        for value in task.invocation.values_of(&input.id) {
            let id = FileId::from_value(&value)
                .ok_or_else(|| anyhow!("input {} holds an invalid file id", input.id))?;
            let record = cx.services.file(id)?;
            let relative = input_relative_path(task, &input.id, &record.name)?;
            cx.services
                .cache
                .materialize(&record, &work_dir.join(&relative))
                .with_context(|| format!("failed to materialize file {} ({})", id, record.name))?;
            task.addlog(format!(
                "materialized {} (id {}) at {}",
                record.name,
                id,
                relative.display()
            ));
        }
    }
    task.addlog(format!(
        "descriptor {} digest {}",
        cx.descriptor.qualified_name(),
        cx.descriptor.digest()
    ));
    Ok(())
}

/// The invocation with every file id replaced by its path in the work dir.
pub(crate) fn rendered_invocation(
    descriptor: &Descriptor,
    task: &Task,
    services: &Services,
) -> Result<Invocation> {
    let mut rendered = task.invocation.clone();
    for input in descriptor.file_inputs() {
        let Some(value) = task.invocation.get(&input.id) else {
            continue;
        };
        let render = |value: &Value| -> Result<Value> {
            let id = FileId::from_value(value)
                .ok_or_else(|| anyhow!("input {} holds an invalid file id", input.id))?;
            let record = services.file(id)?;
            let path = input_relative_path(task, &input.id, &record.name)?;
            Ok(Value::String(path.to_string_lossy().to_string()))
        };
        let replaced = match value {
            Value::Array(items) => Value::Array(items.iter().map(render).collect::<Result<_>>()?),
            single => render(single)?,
        };
        rendered.insert(input.id.clone(), replaced);
    }
    Ok(rendered)
}

fn render_commands(task: &mut Task, cx: &PhaseContext<'_>) -> Result<Vec<String>> {
    let work_dir = require_work_dir(task)?;
    let rendered = rendered_invocation(&cx.descriptor, task, cx.services)?;
    let map = build_substitution_map(&cx.descriptor, &rendered)?;
    let command = apply_substitutions(&cx.descriptor.command_line, &map)?;
    let command = command.split_whitespace().collect::<Vec<_>>().join(" ");

    ensure_dir(&work_dir)?;
    atomic_write_json_pretty(
        &work_dir.join(INVOCATION_FILE),
        &task.invocation.clone().into_value(),
    )?;
    atomic_write_json_pretty(&work_dir.join(DESCRIPTOR_FILE), &cx.descriptor.to_value())?;

    task.addlog(format!("command: {}", command));
    task.context.commands = vec![command];
    Ok(task.context.commands.clone())
}

fn collect_outputs(task: &mut Task, report: &ExecutionReport, cx: &PhaseContext<'_>) -> Result<bool> {
    let descriptor = cx.descriptor.clone();
    if !report.succeeded() {
        let status = report
            .exit_status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if descriptor.ignore_exit_status() {
            task.addlog(format!("ignoring exit status {}", status));
        } else {
            task.addlog(format!("command failed with exit status {}", status));
            return Ok(false);
        }
    }

    let work_dir = require_work_dir(task)?;
    let rendered = rendered_invocation(&descriptor, task, cx.services)?;
    let ignored = descriptor.ignored_outputs();
    let mut all_saved = true;

    for output in &descriptor.output_files {
        if ignored.contains(&output.id.as_str()) {
            continue;
        }
        let values =
            build_path_values(&descriptor, &rendered, &output.path_template_stripped_extensions);
        let relative = apply_path_substitutions(&output.path_template, &values)?;
        let matches = glob_in(&work_dir, &relative)?;
        if matches.is_empty() {
            if output.optional {
                task.addlog(format!("optional output {} not found, skipping", output.id));
            } else {
                task.addlog(format!(
                    "output {} not found at {}",
                    output.id,
                    relative.display()
                ));
                all_saved = false;
            }
            continue;
        }
        for path in matches {
            let id = register(task, &output.id, &path, cx.services)?;
            task.context
                .saved_outputs
                .entry(output.id.clone())
                .or_default()
                .push(id);
        }
    }
    Ok(all_saved)
}

pub(crate) fn glob_in(work_dir: &Path, relative: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&work_dir.to_string_lossy()),
        relative.to_string_lossy()
    );
    let mut found = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("bad output pattern {}", pattern))? {
        let path = entry?;
        if path_is_within(work_dir, &path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn register(task: &mut Task, output_id: &str, path: &Path, services: &Services) -> Result<FileId> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("output path {} has no file name", path.display()))?;
    let name = match task.context.output_names.get(output_id) {
        Some(forced) => forced.clone(),
        None => task_unique_name(&file_name, &task.id),
    };
    let suggested = FileType::suggest(&name, path.is_dir());
    // An override only applies within the same top-level kind.
    let file_type = match task.context.output_types.get(output_id) {
        Some(wanted) if wanted.top_level() == suggested.top_level() => *wanted,
        _ => suggested,
    };
    let id = services.files.register_output(&OutputRegistration {
        task_id: &task.id,
        output_id,
        name: name.clone(),
        path: path.to_path_buf(),
        file_type,
    })?;
    task.addlog(format!(
        "saved output {} as {} ({}, id {})",
        output_id, name, file_type, id
    ));
    Ok(id)
}

/// `result.tar.gz` for task `t7` becomes `result-t7.tar.gz`.
fn task_unique_name(file_name: &str, task_id: &str) -> String {
    match file_name.split_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, task_id, ext),
        _ => format!("{}-{}", file_name, task_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fault_layer;
    use crate::memory::{test_rig, TempDirGuard, TestRig};
    use mill_core::Phase;
    use serde_json::json;
    use std::fs;

    fn descriptor() -> Arc<Descriptor> {
        Arc::new(
            Descriptor::from_value(json!({
                "name": "smooth",
                "tool-version": "2.0",
                "command-line": "smooth [IN] [FWHM] [OUT]",
                "inputs": [
                    {"id": "in", "type": "File", "value-key": "[IN]"},
                    {"id": "fwhm", "type": "Number", "value-key": "[FWHM]",
                     "command-line-flag": "--fwhm"}
                ],
                "output-files": [
                    {"id": "out", "value-key": "[OUT]", "path-template": "[IN]_smooth.nii",
                     "path-template-stripped-extensions": [".nii"]},
                    {"id": "report", "path-template": "report.txt", "optional": true}
                ]
            }))
            .expect("descriptor"),
        )
    }

    fn task(rig: &TestRig, root: &TempDirGuard, invocation: Value) -> Task {
        rig.store.add_file(FileId(3), "brain.nii", FileType::ImageFile);
        rig.store.add_file(FileId(4), "other.nii", FileType::ImageFile);
        let mut task = Task::new(
            "t1",
            descriptor(),
            Invocation::from_value(invocation).expect("invocation"),
        );
        task.work_dir = Some(root.path.join("t1"));
        task
    }

    fn cx<'a>(phase: Phase, task: &Task, rig: &'a TestRig) -> PhaseContext<'a> {
        PhaseContext::new(phase, task.descriptor.clone(), &rig.services)
    }

    #[test]
    fn before_form_rejects_missing_files() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_base_before");
        let mut task = task(&rig, &root, json!({}));
        let phase_cx = cx(Phase::BeforeForm, &task, &rig);
        let err = match BaseTask.before_form(&mut task, &phase_cx) {
            Ok(_) => panic!("no files selected should fail"),
            Err(err) => err,
        };
        assert_eq!(fault_layer(&err), Some(BASE_LAYER));
        assert!(format!("{:#}", err).contains("requires 1 mandatory file(s)"));

        task.interface_files = vec![FileId(3), FileId(4)];
        let phase_cx = cx(Phase::BeforeForm, &task, &rig);
        BaseTask
            .before_form(&mut task, &phase_cx)
            .expect("several files fan out over the sole file input");
    }

    #[test]
    fn final_task_list_fans_out_over_selected_files() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_base_fanout");
        let task = task(&rig, &root, json!({"fwhm": 2}))
            .with_interface_files(vec![FileId(3), FileId(4)]);
        let tasks = BaseTask
            .final_task_list(&task, &cx(Phase::Invoke, &task, &rig))
            .expect("task list");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].invocation.get("in"), Some(&json!(3)));
        assert_eq!(tasks[1].invocation.get("in"), Some(&json!(4)));
        assert_eq!(tasks[1].interface_files, vec![FileId(4)]);
    }

    #[test]
    fn setup_and_build_commands_render_file_paths_and_flags() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_base_commands");
        let mut task = task(&rig, &root, json!({"in": 3, "fwhm": 2}));
        let phase_cx = cx(Phase::Setup, &task, &rig);
        let ok = BaseTask.setup(&mut task, &phase_cx).expect("setup");
        assert!(ok);
        let work_dir = task.work_dir.clone().expect("work dir");
        assert!(work_dir.join("brain.nii").exists());

        let phase_cx = cx(Phase::BuildCommands, &task, &rig);
        let commands = BaseTask
            .build_commands(&mut task, &phase_cx)
            .expect("commands");
        assert_eq!(commands, vec!["smooth brain.nii --fwhm 2 brain_smooth.nii"]);
        assert!(work_dir.join(INVOCATION_FILE).exists());
        assert!(work_dir.join(DESCRIPTOR_FILE).exists());
    }

    #[test]
    fn save_results_registers_outputs_under_task_unique_names() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_base_save");
        let mut task = task(&rig, &root, json!({"in": 3, "fwhm": 2}));
        let work_dir = task.work_dir.clone().expect("work dir");
        ensure_dir(&work_dir).expect("work dir");
        fs::write(work_dir.join("brain_smooth.nii"), b"data").expect("output");

        let phase_cx = cx(Phase::SaveResults, &task, &rig);
        let saved = BaseTask
            .save_results(&mut task, &ExecutionReport::exited(0), &phase_cx)
            .expect("save");
        assert!(saved);
        let outputs = rig.store.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "brain_smooth-t1.nii");
        assert_eq!(outputs[0].file_type, FileType::ImageFile);
        assert_eq!(task.context.saved_outputs["out"], vec![outputs[0].id]);
        assert!(task.log.contains("optional output report not found"));
    }

    #[test]
    fn save_results_fails_on_nonzero_exit_or_missing_required_output() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_base_fail");
        let mut task = task(&rig, &root, json!({"in": 3, "fwhm": 2}));
        let phase_cx = cx(Phase::SaveResults, &task, &rig);
        let saved = BaseTask
            .save_results(&mut task, &ExecutionReport::exited(2), &phase_cx)
            .expect("save");
        assert!(!saved);
        assert!(task.log.contains("exit status 2"));

        ensure_dir(task.work_dir.as_ref().expect("work dir")).expect("work dir");
        let phase_cx = cx(Phase::SaveResults, &task, &rig);
        let saved = BaseTask
            .save_results(&mut task, &ExecutionReport::exited(0), &phase_cx)
            .expect("save");
        assert!(!saved);
        assert!(rig.store.outputs().is_empty());
    }

    #[test]
    fn unique_names_keep_the_full_extension() {
        assert_eq!(task_unique_name("result.tar.gz", "t7"), "result-t7.tar.gz");
        assert_eq!(task_unique_name("outdir", "t7"), "outdir-t7");
        assert_eq!(task_unique_name(".hidden", "t7"), ".hidden-t7");
    }
}

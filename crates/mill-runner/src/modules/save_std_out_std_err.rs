use super::malformed;
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::file_types::FileType;
use crate::services::{ExecutionReport, OutputRegistration};
use crate::task::Task;
use anyhow::Result;
use mill_core::{normalize_relative_path, EngineError};
use mill_descriptor::Descriptor;
use serde_json::Value;
use std::path::{Path, PathBuf};

const NAME: &str = "SaveStdOutStdErr";

/// Once the outputs are saved, registers the captured standard output and
/// error of the run as log files. The configuration is a folder the logs are
/// filed under (a relative path, or null for none).
pub struct SaveStdOutStdErr {
    folder: Option<PathBuf>,
}

impl SaveStdOutStdErr {
    pub fn from_config(_descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let folder = match config {
            Value::Null => None,
            Value::String(folder) if folder.trim().is_empty() => None,
            Value::String(folder) => Some(normalize_relative_path(folder)?),
            other => {
                return Err(malformed(
                    NAME,
                    format!("expected a folder name, got {}", other),
                ))
            }
        };
        Ok(Self { folder })
    }

    fn save_stream(
        &self,
        stream: &str,
        path: &Path,
        task: &mut Task,
        cx: &PhaseContext<'_>,
    ) -> Result<bool> {
        if !path.is_file() {
            task.addlog(format!("captured {} not found at {}", stream, path.display()));
            return Ok(false);
        }
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().trim_start_matches('.').to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{}-{}.log", stream, task.id));
        let name = match &self.folder {
            Some(folder) => folder.join(&base).to_string_lossy().to_string(),
            None => base,
        };
        let id = cx.services.files.register_output(&OutputRegistration {
            task_id: &task.id,
            output_id: stream,
            name: name.clone(),
            path: path.to_path_buf(),
            file_type: FileType::LogFile,
        })?;
        task.addlog(format!("saved {} as {} (id {})", stream, name, id));
        Ok(true)
    }
}

impl LifecycleModule for SaveStdOutStdErr {
    fn name(&self) -> &'static str {
        NAME
    }

    fn save_results(
        &self,
        task: &mut Task,
        report: &ExecutionReport,
        cx: &PhaseContext<'_>,
        next: &dyn TaskBehavior,
    ) -> Result<bool> {
        if !next.save_results(task, report, cx)? {
            return Ok(false);
        }
        let mut all_saved = true;
        for (stream, path) in [("stdout", &report.stdout), ("stderr", &report.stderr)] {
            match path {
                Some(path) => all_saved &= self.save_stream(stream, path, task, cx)?,
                None => task.addlog(format!("the backend captured no {}", stream)),
            }
        }
        Ok(all_saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{test_rig, TempDirGuard};
    use crate::modules::testing::compose;
    use mill_core::{ensure_dir, Phase};
    use mill_descriptor::Invocation;
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;

    fn descriptor() -> Descriptor {
        Descriptor::from_value(json!({
            "name": "recon",
            "command-line": "recon",
            "inputs": [],
            "output-files": [{"id": "stats", "path-template": "stats.txt"}]
        }))
        .expect("descriptor")
    }

    fn task(root: &TempDirGuard) -> (Task, PathBuf) {
        let mut task = Task::new("t3", Arc::new(descriptor()), Invocation::new());
        task.work_dir = Some(root.path.join("t3"));
        let work_dir = task.work_dir.clone().expect("work dir");
        ensure_dir(&work_dir).expect("work dir");
        (task, work_dir)
    }

    #[test]
    fn logs_are_saved_after_the_outputs() {
        let module =
            SaveStdOutStdErr::from_config(&descriptor(), &json!("logs/recon")).expect("module");
        let chain = compose(Arc::new(module));
        let rig = test_rig();
        let root = TempDirGuard::new("mill_std_logs");
        let (mut task, work_dir) = task(&root);
        fs::write(work_dir.join("stats.txt"), b"ok").expect("output");
        fs::write(work_dir.join(".out-t3.log"), b"hello").expect("stdout");
        fs::write(work_dir.join(".err-t3.log"), b"").expect("stderr");
        let report = ExecutionReport::exited(0)
            .with_streams(work_dir.join(".out-t3.log"), work_dir.join(".err-t3.log"));

        let cx = PhaseContext::new(Phase::SaveResults, task.descriptor.clone(), &rig.services);
        assert!(chain.outer().save_results(&mut task, &report, &cx).expect("save"));
        let outputs = rig.store.outputs();
        let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["stats-t3.txt", "logs/recon/out-t3.log", "logs/recon/err-t3.log"]
        );
        assert_eq!(outputs[1].file_type, FileType::LogFile);
        assert_eq!(outputs[1].output_id, "stdout");
    }

    #[test]
    fn a_failed_save_skips_the_logs_and_a_missing_log_fails() {
        let module = SaveStdOutStdErr::from_config(&descriptor(), &Value::Null).expect("module");
        let chain = compose(Arc::new(module));
        let rig = test_rig();
        let root = TempDirGuard::new("mill_std_logs_fail");
        let (mut task, work_dir) = task(&root);
        fs::write(work_dir.join("out.log"), b"").expect("stdout");
        let report = ExecutionReport::exited(0)
            .with_streams(work_dir.join("out.log"), work_dir.join("missing.log"));

        let cx = PhaseContext::new(Phase::SaveResults, task.descriptor.clone(), &rig.services);
        assert!(!chain.outer().save_results(&mut task, &report, &cx).expect("save"));
        assert!(rig.store.outputs().is_empty());

        fs::write(work_dir.join("stats.txt"), b"ok").expect("output");
        let cx = PhaseContext::new(Phase::SaveResults, task.descriptor.clone(), &rig.services);
        assert!(!chain.outer().save_results(&mut task, &report, &cx).expect("save"));
        let names: Vec<String> = rig.store.outputs().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["stats-t3.txt", "out.log"]);
        assert!(task.log.contains("captured stderr not found"));
    }

    #[test]
    fn folders_must_stay_relative() {
        assert!(matches!(
            SaveStdOutStdErr::from_config(&descriptor(), &json!("../elsewhere")),
            Err(EngineError::UnsafePath { .. })
        ));
        assert!(matches!(
            SaveStdOutStdErr::from_config(&descriptor(), &json!(["logs"])),
            Err(EngineError::MalformedDescriptor(_))
        ));
    }
}

use super::config_strings;
use crate::base::{glob_in, rendered_invocation, require_work_dir};
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::ExecutionReport;
use crate::task::Task;
use anyhow::{Context, Result};
use mill_core::EngineError;
use mill_descriptor::{apply_path_substitutions, build_path_values, Descriptor};
use serde_json::Value;
use std::fs;

const NAME: &str = "PostProcessingCleaner";

/// Deletes scratch files from the work directory once results are saved.
/// Patterns may use input tokens and glob wildcards; an expansion that is
/// empty, absolute or escapes the work directory fails the save.
pub struct PostProcessingCleaner {
    patterns: Vec<String>,
}

impl PostProcessingCleaner {
    pub fn from_config(_descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        Ok(Self {
            patterns: config_strings(NAME, config)?,
        })
    }
}

impl LifecycleModule for PostProcessingCleaner {
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
        let work_dir = require_work_dir(task)?;
        let rendered = rendered_invocation(&cx.descriptor, task, cx.services)?;
        let values = build_path_values(&cx.descriptor, &rendered, &[]);
        for pattern in &self.patterns {
            let relative = apply_path_substitutions(pattern, &values)?;
            let paths = glob_in(&work_dir, &relative)?;
            if paths.is_empty() {
                task.addlog(format!("no cleanup required for pattern '{}'", pattern));
                continue;
            }
            for path in paths {
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                removed.with_context(|| format!("failed to clean up {}", path.display()))?;
                task.addlog(format!("cleaned up '{}' in work directory", path.display()));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fault_layer;
    use crate::memory::{test_rig, TempDirGuard};
    use crate::modules::testing::compose;
    use mill_core::{ensure_dir, Phase};
    use mill_descriptor::Invocation;
    use serde_json::json;
    use std::sync::Arc;

    fn run(patterns: Value, label: &str) -> (TempDirGuard, Task, Result<bool>) {
        let descriptor = Descriptor::from_value(json!({
            "name": "fit",
            "command-line": "fit [PREFIX]",
            "inputs": [{"id": "prefix", "type": "String", "value-key": "[PREFIX]"}],
            "output-files": []
        }))
        .expect("descriptor");
        let module = PostProcessingCleaner::from_config(&descriptor, &patterns).expect("module");
        let chain = compose(Arc::new(module));
        let rig = test_rig();
        let root = TempDirGuard::new(label);
        let mut task = Task::new(
            "t",
            Arc::new(descriptor),
            Invocation::from_value(json!({"prefix": "run1"})).expect("invocation"),
        );
        let work_dir = root.path.join("t");
        ensure_dir(&work_dir.join("run1_tmp")).expect("scratch dir");
        fs::write(work_dir.join("run1_a.tmp"), b"x").expect("scratch");
        fs::write(work_dir.join("keep.txt"), b"x").expect("keep");
        task.work_dir = Some(work_dir);
        let cx = PhaseContext::new(Phase::SaveResults, task.descriptor.clone(), &rig.services);
        let result = chain
            .outer()
            .save_results(&mut task, &ExecutionReport::exited(0), &cx);
        (root, task, result)
    }

    #[test]
    fn matching_paths_are_removed() {
        let (root, task, result) = run(json!(["[PREFIX]_*.tmp", "[PREFIX]_tmp"]), "mill_ppc_ok");
        assert!(result.expect("save"));
        let work_dir = root.path.join("t");
        assert!(!work_dir.join("run1_a.tmp").exists());
        assert!(!work_dir.join("run1_tmp").exists());
        assert!(work_dir.join("keep.txt").exists());
        assert!(task.log.contains("cleaned up"));
    }

    #[test]
    fn escaping_patterns_fail_the_save() {
        let (root, _task, result) = run(json!(["../*"]), "mill_ppc_escape");
        let err = match result {
            Ok(_) => panic!("escaping pattern should fail"),
            Err(err) => err,
        };
        assert_eq!(fault_layer(&err), Some(NAME));
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnsafePath { .. })
        ));
        assert!(root.path.join("t").join("keep.txt").exists());
    }
}

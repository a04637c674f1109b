//! Erases the cache entries of input files a task pulled in itself, once the
//! task's results are saved.
//!
//! Setup records which configured inputs were not already synchronized in the
//! shared cache and the setup timestamp `T0`, both before the inner layers
//! materialize anything. At save time an entry is erased only when its last
//! access is strictly older than `T0`. An access at or after `T0` means some
//! other task may be reading the entry, so it is left alone. No lock is taken
//! across tasks: ambiguity always resolves to keeping the entry.

use super::{config_strings, require_file_input};
use crate::chain::{LifecycleModule, PhaseContext, TaskBehavior};
use crate::services::{ExecutionReport, FileId, SyncStatus};
use crate::task::Task;
use anyhow::Result;
use mill_core::EngineError;
use mill_descriptor::Descriptor;
use serde_json::Value;
use tracing::{debug, info};

const NAME: &str = "InputCacheCleaner";

pub struct InputCacheCleaner {
    inputs: Vec<String>,
}

impl InputCacheCleaner {
    pub fn from_config(descriptor: &Descriptor, config: &Value) -> Result<Self, EngineError> {
        let inputs = config_strings(NAME, config)?;
        for input_id in &inputs {
            require_file_input(NAME, descriptor, input_id)?;
        }
        Ok(Self { inputs })
    }

    fn configured_files(&self, task: &Task) -> Vec<FileId> {
        let mut files = Vec::new();
        for input_id in &self.inputs {
            for value in task.invocation.values_of(input_id) {
                if let Some(id) = FileId::from_value(&value) {
                    if !files.contains(&id) {
                        files.push(id);
                    }
                }
            }
        }
        files
    }
}

impl LifecycleModule for InputCacheCleaner {
    fn name(&self) -> &'static str {
        NAME
    }

    fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>, next: &dyn TaskBehavior) -> Result<bool> {
        let mut unsynced = Vec::new();
        for id in self.configured_files(task) {
            let synced = matches!(
                cx.services.cache.entry(id)?,
                Some(entry) if entry.status == SyncStatus::InSync
            );
            if !synced {
                unsynced.push(id);
            }
        }
        task.context.unsynced_inputs = unsynced;
        task.context.setup_timestamp = Some(cx.services.now());
        next.setup(task, cx)
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
        let Some(setup_time) = task.context.setup_timestamp else {
            task.addlog("no setup timestamp recorded, input cache left untouched");
            return Ok(true);
        };

        for id in task.context.unsynced_inputs.clone() {
            let last_access = cx
                .services
                .cache
                .entry(id)?
                .and_then(|entry| entry.accessed_at);
            let Some(last_access) = last_access else {
                debug!(task = %task.id, file = %id, "input never cached, nothing to erase");
                continue;
            };
            if last_access >= setup_time {
                task.addlog(format!(
                    "cache of input file {} accessed at {} since setup, not erased",
                    id, last_access
                ));
                continue;
            }
            cx.services.cache.erase(id)?;
            info!(task = %task.id, file = %id, module = NAME, "erased input cache");
            task.addlog(format!("erased cache of input file {}", id));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseTask;
    use crate::chain::{build_chain, ModuleBinding};
    use crate::file_types::FileType;
    use crate::memory::{test_rig, MemoryCache, TempDirGuard, TestRig};
    use crate::services::ManualClock;
    use crate::modules::testing::compose;
    use chrono::{DateTime, Duration, Utc};
    use mill_core::{ensure_dir, Phase};
    use mill_descriptor::Invocation;
    use serde_json::json;
    use std::sync::Arc;

    const F: FileId = FileId(7);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp")
    }

    fn descriptor() -> Descriptor {
        Descriptor::from_value(json!({
            "name": "stats",
            "command-line": "stats [IN]",
            "inputs": [{"id": "in", "type": "File", "value-key": "[IN]"}],
            "output-files": [],
            "custom": {"integrator-modules": {"InputCacheCleaner": ["in"]}}
        }))
        .expect("descriptor")
    }

    fn prepared(rig: &TestRig, root: &TempDirGuard) -> (crate::chain::ComposedTask, Task) {
        let descriptor = descriptor();
        let module = InputCacheCleaner::from_config(
            &descriptor,
            descriptor.custom_module_info(NAME).expect("config"),
        )
        .expect("module");
        rig.store.add_file(F, "scan.csv", FileType::CsvFile);
        let mut task = Task::new(
            "t",
            Arc::new(descriptor),
            Invocation::from_value(json!({"in": 7})).expect("invocation"),
        );
        task.work_dir = Some(root.path.join("t"));
        (compose(Arc::new(module)), task)
    }

    fn setup(chain: &crate::chain::ComposedTask, task: &mut Task, rig: &TestRig) {
        let cx = PhaseContext::new(Phase::Setup, task.descriptor.clone(), &rig.services);
        assert!(chain.outer().setup(task, &cx).expect("setup"));
    }

    fn save(chain: &crate::chain::ComposedTask, task: &mut Task, rig: &TestRig, code: i32) -> bool {
        ensure_dir(task.work_dir.as_ref().expect("work dir")).expect("work dir");
        let cx = PhaseContext::new(Phase::SaveResults, task.descriptor.clone(), &rig.services);
        chain
            .outer()
            .save_results(task, &ExecutionReport::exited(code), &cx)
            .expect("save")
    }

    #[test]
    fn setup_records_unsynced_inputs_and_timestamp() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_icc_setup");
        let (chain, mut task) = prepared(&rig, &root);
        rig.clock.set(at(100));
        setup(&chain, &mut task, &rig);
        assert_eq!(task.context.unsynced_inputs, vec![F]);
        assert_eq!(task.context.setup_timestamp, Some(at(100)));
    }

    #[test]
    fn already_synced_inputs_are_never_candidates() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_icc_synced");
        let (chain, mut task) = prepared(&rig, &root);
        rig.cache.set_entry(F, SyncStatus::InSync, Some(at(10)));
        rig.clock.set(at(100));
        setup(&chain, &mut task, &rig);
        assert!(task.context.unsynced_inputs.is_empty());
        rig.cache.set_entry(F, SyncStatus::InSync, Some(at(50)));
        assert!(save(&chain, &mut task, &rig, 0));
        assert!(rig.cache.erased().is_empty());
    }

    #[test]
    fn eviction_follows_the_access_time_rule() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_icc_rule");
        let (chain, mut task) = prepared(&rig, &root);
        rig.clock.set(at(100));
        setup(&chain, &mut task, &rig);

        // Never accessed: nothing to evict.
        rig.cache.set_entry(F, SyncStatus::InSync, None);
        assert!(save(&chain, &mut task, &rig, 0));
        assert!(rig.cache.erased().is_empty());

        // Touched by another task after T0.
        rig.cache.set_entry(F, SyncStatus::InSync, Some(at(150)));
        assert!(save(&chain, &mut task, &rig, 0));
        assert!(rig.cache.erased().is_empty());

        // A tie counts as in use.
        rig.cache.set_entry(F, SyncStatus::InSync, Some(at(100)));
        assert!(save(&chain, &mut task, &rig, 0));
        assert!(rig.cache.erased().is_empty());

        rig.cache.set_entry(F, SyncStatus::InSync, Some(at(99)));
        assert!(save(&chain, &mut task, &rig, 0));
        assert_eq!(rig.cache.erased(), vec![F]);
        assert!(task.log.contains("erased cache of input file 7"));
    }

    #[test]
    fn failed_saves_never_evict() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_icc_failed");
        let (chain, mut task) = prepared(&rig, &root);
        rig.clock.set(at(100));
        setup(&chain, &mut task, &rig);
        rig.cache.set_entry(F, SyncStatus::InSync, Some(at(50)));
        assert!(!save(&chain, &mut task, &rig, 1));
        assert!(rig.cache.erased().is_empty());
    }

    #[test]
    fn missing_setup_timestamp_skips_cleanup() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_icc_no_t0");
        let (chain, mut task) = prepared(&rig, &root);
        task.context.unsynced_inputs = vec![F];
        rig.cache.set_entry(F, SyncStatus::InSync, Some(at(50)));
        rig.clock.advance(Duration::seconds(10));
        assert!(save(&chain, &mut task, &rig, 0));
        assert!(rig.cache.erased().is_empty());
        assert!(task.log.contains("no setup timestamp"));
    }

    /// Stands in for another task reading the cached input while this one
    /// is still inside setup.
    struct ConcurrentReader {
        cache: Arc<MemoryCache>,
        clock: Arc<ManualClock>,
    }

    impl LifecycleModule for ConcurrentReader {
        fn name(&self) -> &'static str {
            "ConcurrentReader"
        }

        fn setup(&self, task: &mut Task, cx: &PhaseContext<'_>, next: &dyn TaskBehavior) -> Result<bool> {
            let ready = next.setup(task, cx)?;
            self.cache.set_entry(F, SyncStatus::InSync, Some(at(105)));
            self.clock.set(at(110));
            Ok(ready)
        }
    }

    #[test]
    fn an_access_during_setup_keeps_the_entry() {
        let rig = test_rig();
        let root = TempDirGuard::new("mill_icc_during_setup");
        let (_, mut task) = prepared(&rig, &root);
        let descriptor = descriptor();
        let cleaner = InputCacheCleaner::from_config(
            &descriptor,
            descriptor.custom_module_info(NAME).expect("config"),
        )
        .expect("module");
        let reader = ConcurrentReader {
            cache: rig.cache.clone(),
            clock: rig.clock.clone(),
        };
        let chain = build_chain(
            Box::new(BaseTask),
            &[
                ModuleBinding::new(NAME, Arc::new(cleaner)),
                ModuleBinding::new("ConcurrentReader", Arc::new(reader)),
            ],
        );

        rig.clock.set(at(100));
        setup(&chain, &mut task, &rig);
        assert_eq!(task.context.setup_timestamp, Some(at(100)));
        assert!(save(&chain, &mut task, &rig, 0));
        assert!(rig.cache.erased().is_empty());
        assert!(task.log.contains("accessed at"));
    }
}

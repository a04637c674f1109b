//! Descriptor-driven task lifecycle engine.
//!
//! A tool is registered once ([`ToolCatalog`]): its descriptor is loaded, the
//! lifecycle modules it declares are resolved and wrapped around the
//! [`BaseTask`]. The [`PhaseDispatcher`] then drives each task through
//! before-form, after-form, invoke, setup, command building and result
//! saving over that chain.

mod base;
mod cache_aside;
mod catalog;
mod chain;
mod config;
mod dispatch;
mod file_types;
mod memory;
pub mod modules;
mod registry;
mod services;
mod sink;
mod task;
mod validation;

pub use base::BaseTask;
pub use cache_aside::CacheAside;
pub use catalog::{ToolCatalog, ToolIntegration};
pub use chain::{
    attribute, build_chain, fault_layer, ComposedTask, DescriptorView, LayerFault,
    LifecycleModule, ModuleBinding, PhaseContext, TaskBehavior, BASE_LAYER,
};
pub use config::{
    EngineConfig, MILL_LISTING_GRACE_SECS_ENV, MILL_LISTING_TTL_SECS_ENV, MILL_TASK_LOG_ENV,
    MILL_WORK_ROOT_ENV, MILL_WRITE_ATTESTATION_ENV,
};
pub use dispatch::PhaseDispatcher;
pub use file_types::FileType;
pub use memory::{ManifestFile, MemoryCache, MemoryFileStore, RegisteredOutput};
pub use registry::{
    module_catalog, module_registry_entry, resolve_modules, supported_modules, ModuleEntry,
    ModuleFactory,
};
pub use services::{
    CacheEntry, CacheService, Clock, DiscardLogSink, ExecutionBackend, ExecutionReport, FileId,
    FileRecord, FileStore, LogSink, ManualClock, OutputRegistration, Services, SyncStatus,
    SystemClock,
};
pub use sink::{JsonlTaskLogSink, TaskLogRecord};
pub use task::{next_task_id, Task, TaskContext, TaskFailure, TaskLog, TaskLogLine, TaskState};
pub use validation::validate_invocation;

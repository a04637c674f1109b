//! The closed catalog of lifecycle modules a descriptor can name.

use crate::chain::{LifecycleModule, ModuleBinding};
use crate::modules::{
    CollectionBasenamesListMaker, FileNameMatcher, FileNameVerifier, InputCacheCleaner,
    InputRegexChecker, InputSubdirMaker, InputValueFanOut, InputValueFixer, OutputCacheCleaner,
    OutputFileTypeSetter, OutputFilenameRenamer, OutputTagger, PostProcessingCleaner,
    SaveStdOutStdErr,
};
use mill_core::EngineError;
use mill_descriptor::Descriptor;
use serde_json::Value;
use std::sync::Arc;

pub type ModuleFactory = fn(&Descriptor, &Value) -> Result<Arc<dyn LifecycleModule>, EngineError>;

pub struct ModuleEntry {
    pub name: &'static str,
    pub summary: &'static str,
    pub build: ModuleFactory,
}

fn shared<M: LifecycleModule + 'static>(
    module: Result<M, EngineError>,
) -> Result<Arc<dyn LifecycleModule>, EngineError> {
    module.map(|m| Arc::new(m) as Arc<dyn LifecycleModule>)
}

const MODULES: &[ModuleEntry] = &[
    ModuleEntry {
        name: "InputRegexChecker",
        summary: "rejects string inputs whose values do not match a regex",
        build: |d, c| shared(InputRegexChecker::from_config(d, c)),
    },
    ModuleEntry {
        name: "FileNameMatcher",
        summary: "rejects selected files whose names do not match a regex",
        build: |d, c| shared(FileNameMatcher::from_config(d, c)),
    },
    ModuleEntry {
        name: "InputValueFixer",
        summary: "hides inputs from the form and forces their values",
        build: |d, c| shared(InputValueFixer::from_config(d, c)),
    },
    ModuleEntry {
        name: "InputCacheCleaner",
        summary: "evicts input files pulled into the cache only for this task",
        build: |d, c| shared(InputCacheCleaner::from_config(d, c)),
    },
    ModuleEntry {
        name: "OutputCacheCleaner",
        summary: "evicts saved outputs from the cache unless the user opts out",
        build: |d, c| shared(OutputCacheCleaner::from_config(d, c)),
    },
    ModuleEntry {
        name: "OutputTagger",
        summary: "tags saved output files",
        build: |d, c| shared(OutputTagger::from_config(d, c)),
    },
    ModuleEntry {
        name: "PostProcessingCleaner",
        summary: "deletes scratch files from the work directory after saving",
        build: |d, c| shared(PostProcessingCleaner::from_config(d, c)),
    },
    ModuleEntry {
        name: "InputSubdirMaker",
        summary: "places input files in a subdirectory of the work directory",
        build: |d, c| shared(InputSubdirMaker::from_config(d, c)),
    },
    ModuleEntry {
        name: "OutputFileTypeSetter",
        summary: "overrides the file type of saved outputs",
        build: |d, c| shared(OutputFileTypeSetter::from_config(d, c)),
    },
    ModuleEntry {
        name: "CollectionBasenamesListMaker",
        summary: "offers choices taken from the entries of a selected collection",
        build: |d, c| shared(CollectionBasenamesListMaker::from_config(d, c)),
    },
    ModuleEntry {
        name: "InputValueFanOut",
        summary: "launches one task per selected value of an input",
        build: |d, c| shared(InputValueFanOut::from_config(d, c)),
    },
    ModuleEntry {
        name: "FileNameVerifier",
        summary: "rejects string inputs that are not legal file names",
        build: |d, c| shared(FileNameVerifier::from_config(d, c)),
    },
    ModuleEntry {
        name: "OutputFilenameRenamer",
        summary: "names an output from a pattern filled in at setup",
        build: |d, c| shared(OutputFilenameRenamer::from_config(d, c)),
    },
    ModuleEntry {
        name: "SaveStdOutStdErr",
        summary: "saves the captured standard output and error as log files",
        build: |d, c| shared(SaveStdOutStdErr::from_config(d, c)),
    },
];

pub fn module_catalog() -> &'static [ModuleEntry] {
    MODULES
}

pub fn supported_modules() -> Vec<String> {
    MODULES.iter().map(|m| m.name.to_string()).collect()
}

pub fn module_registry_entry(name: &str) -> Result<&'static ModuleEntry, EngineError> {
    MODULES
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| EngineError::UnknownModule {
            name: name.to_string(),
            supported: supported_modules(),
        })
}

/// Builds one binding per module the descriptor declares, in declaration
/// order. Every module configuration is checked here.
pub fn resolve_modules(descriptor: &Descriptor) -> Result<Vec<ModuleBinding>, EngineError> {
    let Some(declared) = descriptor.integrator_modules() else {
        return Ok(Vec::new());
    };
    let mut bindings = Vec::with_capacity(declared.len());
    for (name, config) in declared {
        let entry = module_registry_entry(name)?;
        let module = (entry.build)(descriptor, config)?;
        tracing::debug!(tool = %descriptor.qualified_name(), module = entry.name, "bound module");
        bindings.push(ModuleBinding::new(entry.name, module));
    }
    Ok(bindings)
}

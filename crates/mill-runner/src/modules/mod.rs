//! Lifecycle modules a descriptor may declare under
//! `custom.integrator-modules`. Each one parses its own configuration when
//! the chain is built, so a bad configuration fails before any task runs.

mod collection_basenames;
mod file_name_matcher;
mod file_name_verifier;
mod input_cache_cleaner;
mod input_regex_checker;
mod input_subdir_maker;
mod input_value_fan_out;
mod input_value_fixer;
mod output_cache_cleaner;
mod output_file_type_setter;
mod output_filename_renamer;
mod output_tagger;
mod post_processing_cleaner;
mod save_std_out_std_err;

pub use collection_basenames::CollectionBasenamesListMaker;
pub use file_name_matcher::FileNameMatcher;
pub use file_name_verifier::FileNameVerifier;
pub use input_cache_cleaner::InputCacheCleaner;
pub use input_regex_checker::InputRegexChecker;
pub use input_subdir_maker::InputSubdirMaker;
pub use input_value_fan_out::InputValueFanOut;
pub use input_value_fixer::InputValueFixer;
pub use output_cache_cleaner::{OutputCacheCleaner, OUTPUT_CACHE_CLEANER_FLAG};
pub use output_file_type_setter::OutputFileTypeSetter;
pub use output_filename_renamer::OutputFilenameRenamer;
pub use output_tagger::OutputTagger;
pub use post_processing_cleaner::PostProcessingCleaner;
pub use save_std_out_std_err::SaveStdOutStdErr;

use mill_core::EngineError;
use mill_descriptor::{Descriptor, InputType};
use regex::Regex;
use serde_json::{Map, Value};

fn malformed(module: &str, detail: impl AsRef<str>) -> EngineError {
    EngineError::MalformedDescriptor(format!(
        "configuration of module {}: {}",
        module,
        detail.as_ref()
    ))
}

fn config_map<'a>(module: &str, config: &'a Value) -> Result<&'a Map<String, Value>, EngineError> {
    config
        .as_object()
        .ok_or_else(|| malformed(module, "expected a mapping"))
}

fn config_strings(module: &str, config: &Value) -> Result<Vec<String>, EngineError> {
    let items = config
        .as_array()
        .ok_or_else(|| malformed(module, "expected a list"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed(module, format!("expected a string, got {}", item)))
        })
        .collect()
}

fn config_str<'a>(module: &str, value: &'a Value, what: &str) -> Result<&'a str, EngineError> {
    value
        .as_str()
        .ok_or_else(|| malformed(module, format!("{} must be a string", what)))
}

fn compile(module: &str, pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(pattern).map_err(|err| malformed(module, format!("bad regex {}: {}", pattern, err)))
}

fn require_file_input(
    module: &str,
    descriptor: &Descriptor,
    input_id: &str,
) -> Result<(), EngineError> {
    let input = descriptor.input_by_id(input_id)?;
    if input.kind != InputType::File {
        return Err(malformed(
            module,
            format!("input {} is not a File input", input_id),
        ));
    }
    Ok(())
}

const FILE_NAME_PUNCTUATION: &str = "_~!@#%^&*()-+=:[]{}|<>,.?";

/// A name the file store accepts: it starts with an ASCII letter or digit and
/// continues with letters, digits or a small set of punctuation. No slashes,
/// no whitespace.
pub(crate) fn is_legal_file_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || FILE_NAME_PUNCTUATION.contains(c))
}

#[cfg(test)]
pub(crate) mod testing {
    //! A tiny harness driving one module over the real base task.

    use crate::base::BaseTask;
    use crate::chain::{build_chain, ComposedTask, LifecycleModule, ModuleBinding};
    use std::sync::Arc;

    pub fn compose(module: Arc<dyn LifecycleModule>) -> ComposedTask {
        let name = module.name();
        build_chain(Box::new(BaseTask), &[ModuleBinding::new(name, module)])
    }
}
